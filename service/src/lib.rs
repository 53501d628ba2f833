use config::Config;
use log::*;
use sse::options::StreamOptions;
use sse::{
    Backplane, ConnectionRegistry, DistributedRegistry, FanOutPublisher, HeartbeatService,
    LocalRegistry, Publisher, RedisRelay, ServerId,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod logging;

// Service-level state shared with every request handler.
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub server_id: ServerId,
    pub stream_options: StreamOptions,
    pub registry: Arc<dyn ConnectionRegistry>,
    pub publisher: Arc<dyn Publisher>,
    /// Cancelled once when the process begins shutting down. Open streams
    /// end and in-flight publishes abort when it fires.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Single-instance state over an in-process registry, no background tasks.
    pub fn new(config: Config, stream_options: StreamOptions) -> Self {
        let registry: Arc<dyn ConnectionRegistry> = Arc::new(LocalRegistry::new());
        let publisher = Arc::new(FanOutPublisher::new(registry.clone()));
        Self {
            config,
            server_id: ServerId::new(),
            stream_options,
            registry,
            publisher,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Everything `main` needs: request state plus the background loops.
pub struct Services {
    pub app_state: AppState,
    heartbeat: HeartbeatService,
    distributed: Option<Arc<DistributedRegistry>>,
    backplane: Option<Arc<Backplane>>,
}

/// Build the registry, publisher and background services described by `config`.
///
/// Configuration errors and an unreachable Redis are returned; the caller is
/// expected to abort startup.
pub async fn init_services(config: Config) -> Result<Services, sse::Error> {
    let server_id = ServerId::new();
    let stream_options = config.stream_options()?;

    info!(
        "Server {server_id}: retry={:?}, heartbeat={:?}, write_timeout={:?}, buffer={}",
        stream_options.retry_interval,
        stream_options.heartbeat_interval,
        stream_options.write_timeout,
        stream_options.buffer,
    );

    let (registry, distributed) = match config.distributed_options()? {
        Some(options) => {
            info!(
                "Distributed registry: prefix={}, ttl={:?}, refresh={:?}",
                options.key_prefix, options.connection_ttl, options.refresh_interval
            );
            let registry =
                Arc::new(DistributedRegistry::connect(server_id.clone(), &options).await?);
            (registry.clone() as Arc<dyn ConnectionRegistry>, Some(registry))
        }
        None => {
            info!("No Redis URL configured, running as a single instance");
            (Arc::new(LocalRegistry::new()) as Arc<dyn ConnectionRegistry>, None)
        }
    };

    let local_publisher: Arc<dyn Publisher> = Arc::new(FanOutPublisher::new(registry.clone()));

    let backplane = match config.redis_url() {
        Some(url) if distributed.is_some() && config.backplane_enabled => {
            let relay = RedisRelay::new(url).await?;
            Some(Arc::new(Backplane::new(
                server_id.clone(),
                local_publisher.clone(),
                Arc::new(relay),
                config.backplane_options(),
            )))
        }
        _ => None,
    };

    let publisher: Arc<dyn Publisher> = match &backplane {
        Some(backplane) => backplane.clone() as Arc<dyn Publisher>,
        None => local_publisher,
    };

    let heartbeat = HeartbeatService::new(registry.clone(), stream_options.heartbeat_interval);

    Ok(Services {
        app_state: AppState {
            config,
            server_id,
            stream_options,
            registry,
            publisher,
            shutdown: CancellationToken::new(),
        },
        heartbeat,
        distributed,
        backplane,
    })
}

impl Services {
    /// Start the heartbeat, TTL refresh and backplane subscription loops.
    /// Each stops when the state's shutdown token is cancelled.
    pub fn spawn_background(self) -> BackgroundTasks {
        let shutdown = self.app_state.shutdown.clone();
        let mut handles = vec![self.heartbeat.spawn(shutdown.child_token())];

        if let Some(distributed) = &self.distributed {
            handles.push(distributed.clone().spawn_ttl_refresh(shutdown.child_token()));
        }
        if let Some(backplane) = self.backplane {
            handles.push(backplane.spawn_subscriber(shutdown.child_token()));
        }

        BackgroundTasks {
            handles,
            distributed: self.distributed,
        }
    }
}

/// Handles of the running background loops.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
    distributed: Option<Arc<DistributedRegistry>>,
}

impl BackgroundTasks {
    /// Wait for every loop to stop, then release this server's remote records.
    pub async fn shutdown(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {e}");
            }
        }
        if let Some(distributed) = self.distributed {
            distributed.unregister_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn test_init_services_without_redis_runs_single_instance() {
        let services = init_services(Config::parse_from(["sse-server"]))
            .await
            .unwrap();
        assert!(services.distributed.is_none());
        assert!(services.backplane.is_none());
        assert_eq!(services.app_state.registry.count().await, 0);

        let shutdown = services.app_state.shutdown.clone();
        let background = services.spawn_background();
        shutdown.cancel();
        background.shutdown().await;
    }

    #[tokio::test]
    async fn test_init_services_rejects_invalid_stream_options() {
        let config = Config::parse_from(["sse-server", "--heartbeat-interval-secs", "0"]);
        assert!(init_services(config).await.is_err());
    }
}
