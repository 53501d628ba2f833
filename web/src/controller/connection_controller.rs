use crate::controller::ApiResponse;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use service::AppState;
use sse::ConnectionRegistry;

/// GET the number of open streams. Cluster-wide when a distributed registry
/// is configured, otherwise this server only.
pub async fn count(State(app_state): State<AppState>) -> impl IntoResponse {
    let count = app_state.registry.count().await;

    Json(ApiResponse::new(
        StatusCode::OK.into(),
        json!({
            "count": count,
            "server_id": app_state.server_id.as_str(),
        }),
    ))
}
