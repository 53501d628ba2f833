use crate::controller::ApiResponse;
use crate::error::Error;
use crate::params::event::PublishParams;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use log::*;
use service::AppState;
use sse::Publisher;

/// POST an event to every connected client, on every server.
///
/// Responds 202 once local delivery has been attempted and the event handed
/// to the backplane; individual broken connections do not fail the request.
pub async fn publish(
    State(app_state): State<AppState>,
    Json(params): Json<PublishParams>,
) -> Result<impl IntoResponse, Error> {
    debug!("POST broadcast event {:?} (id: {:?})", params.event, params.id);

    app_state
        .publisher
        .publish(
            &params.event,
            &params.data,
            params.id.as_deref(),
            &app_state.shutdown,
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::<()>::no_content(StatusCode::ACCEPTED.into())),
    ))
}

/// POST an event to every connection of one client, wherever it is connected.
pub async fn publish_to(
    State(app_state): State<AppState>,
    Path(client_id): Path<String>,
    Json(params): Json<PublishParams>,
) -> Result<impl IntoResponse, Error> {
    debug!(
        "POST event {:?} to client {client_id} (id: {:?})",
        params.event, params.id
    );

    app_state
        .publisher
        .publish_to(
            &client_id,
            &params.event,
            &params.data,
            params.id.as_deref(),
            &app_state.shutdown,
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::<()>::no_content(StatusCode::ACCEPTED.into())),
    ))
}
