use crate::controller::{connection_controller, event_controller, health_check_controller};
use crate::extractors::client_identity::ClientIdResolver;
use crate::sse::handler;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use service::AppState;
use std::sync::Arc;

pub fn define_routes(app_state: AppState, resolver: Arc<dyn ClientIdResolver>) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(sse_routes(app_state.clone(), resolver))
        .merge(event_routes(app_state.clone()))
        .merge(connection_routes(app_state))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn sse_routes(app_state: AppState, resolver: Arc<dyn ClientIdResolver>) -> Router {
    Router::new()
        .route("/sse", get(handler::sse_handler))
        .layer(Extension(resolver))
        .with_state(app_state)
}

fn event_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/events", post(event_controller::publish))
        .route("/events/:client_id", post(event_controller::publish_to))
        .with_state(app_state)
}

fn connection_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/connections/count", get(connection_controller::count))
        .with_state(app_state)
}
