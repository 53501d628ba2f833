use axum::http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method};
use log::*;
use service::AppState;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

mod controller;
mod error;
pub mod extractors;
mod params;
mod router;
mod sse;

pub use extractors::client_identity::{ClientIdResolver, HeaderOrQueryResolver};

/// Serve the HTTP surface until the state's shutdown token is cancelled.
/// Clients are identified by `X-Client-Id` header or `client_id` query param.
pub async fn init_server(app_state: AppState) -> std::io::Result<()> {
    init_server_with_resolver(app_state, Arc::new(HeaderOrQueryResolver)).await
}

/// Like `init_server`, with an application-supplied client identity policy
/// (e.g. one that reads an authenticated session).
pub async fn init_server_with_resolver(
    app_state: AppState,
    resolver: Arc<dyn ClientIdResolver>,
) -> std::io::Result<()> {
    let interface = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let server_url = format!("{interface}:{}", app_state.config.port);
    let listener = tokio::net::TcpListener::bind(&server_url).await?;

    info!(
        "Server {} listening for connections on http://{server_url}",
        app_state.server_id
    );

    let shutdown = app_state.shutdown.clone();
    let cors = cors_layer(&app_state.config.allowed_origins);
    let app = router::define_routes(app_state, resolver).layer(cors);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {origin}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            ACCEPT,
            CACHE_CONTROL,
            CONTENT_TYPE,
            HeaderName::from_static(extractors::client_identity::CLIENT_ID_HEADER),
            HeaderName::from_static("last-event-id"),
        ])
        .allow_origin(AllowOrigin::list(origins))
}
