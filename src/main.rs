use log::*;
use service::config::Config;
use service::logging::Logger;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to initialize logger: {e}");
    }

    info!("Starting up SSE relay in {} mode", config.runtime_env());

    let services = match service::init_services(config).await {
        Ok(services) => services,
        Err(e) => {
            error!("Failed to initialize services: {e}");
            return ExitCode::FAILURE;
        }
    };

    let app_state = services.app_state.clone();
    let shutdown = app_state.shutdown.clone();
    let background = services.spawn_background();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for shutdown signal: {e}");
                return;
            }
            info!("Received shutdown signal, closing open streams");
            shutdown.cancel();
        }
    });

    let served = web::init_server(app_state).await;

    // The server may also stop on its own (e.g. the port is taken); make
    // sure the background loops follow it down.
    shutdown.cancel();
    background.shutdown().await;

    match served {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
