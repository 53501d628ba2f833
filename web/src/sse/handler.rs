use crate::error::Error;
use crate::extractors::client_identity::ClientIdentity;
use async_stream::stream;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use log::*;
use service::AppState;
use sse::connection::ConnectionWriter;
use sse::{protocol, ClientConnection, ConnectionRegistry, StreamWriter};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Opens a long-lived event stream for the resolved client.
///
/// The retry hint is queued before the connection is registered, so it is
/// always the first frame on the wire. The connection leaves the registry
/// when the response body is dropped, which is how axum reports a client
/// disconnect.
pub(crate) async fn sse_handler(
    State(app_state): State<AppState>,
    ClientIdentity(client_id): ClientIdentity,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let options = &app_state.stream_options;
    let (writer, mut rx) = StreamWriter::channel(options.buffer, options.write_timeout);
    writer
        .write(&protocol::format_retry(options.retry_interval))
        .await?;

    let terminated = writer.terminated();
    let connection = Arc::new(ClientConnection::new(client_id, last_event_id, writer));
    app_state
        .registry
        .add(connection.clone(), &CancellationToken::new())
        .await?;

    debug!(
        "Opened SSE connection {} for client {} (last event id: {:?})",
        connection.connection_id(),
        connection.client_id(),
        connection.last_event_id()
    );

    let guard = ConnectionGuard {
        registry: app_state.registry.clone(),
        connection,
    };
    let shutdown = app_state.shutdown.clone();

    let frames = stream! {
        let _guard = guard;
        loop {
            // A disposed writer ends the stream even if a sender is still
            // alive, so a pruned client sees EOF and reconnects.
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                _ = terminated.cancelled() => None,
                frame = rx.recv() => frame,
            };
            match next {
                Some(frame) => yield Ok::<String, Infallible>(frame),
                None => break,
            }
        }
    };

    let mut response = Response::new(Body::from_stream(frames));
    for (name, value) in protocol::STREAM_HEADERS {
        response
            .headers_mut()
            .insert(name, HeaderValue::from_static(value));
    }
    Ok(response)
}

/// Unregisters and closes its connection when the response stream goes away,
/// whether the client hung up, the writer was disposed or the server is
/// shutting down.
struct ConnectionGuard {
    registry: Arc<dyn ConnectionRegistry>,
    connection: Arc<ClientConnection>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connection.close();

        let registry = self.registry.clone();
        let connection_id = self.connection.connection_id().clone();
        debug!("SSE connection {connection_id} closed, cleaning up");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = registry.remove(&connection_id).await {
                        warn!("Failed to unregister connection {connection_id}: {e}");
                    }
                });
            }
            Err(_) => warn!("No runtime to unregister connection {connection_id}"),
        }
    }
}
