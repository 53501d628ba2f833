use crate::connection::ClientConnection;
use crate::error::Error;
use crate::protocol;
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use futures::future::join_all;
use log::*;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Delivers events to connected clients.
///
/// Per-connection failures never reach the caller: `Ok(())` means the
/// delivery attempt finished, `Err` is only ever a cancellation.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Send to every connection.
    async fn publish(
        &self,
        event_name: &str,
        payload: &Value,
        event_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;

    /// Send to every connection of one logical client.
    async fn publish_to(
        &self,
        client_id: &str,
        event_name: &str,
        payload: &Value,
        event_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;
}

/// Formats each event once and writes it concurrently to every target.
pub struct FanOutPublisher {
    registry: Arc<dyn ConnectionRegistry>,
}

impl FanOutPublisher {
    pub fn new(registry: Arc<dyn ConnectionRegistry>) -> Self {
        Self { registry }
    }

    async fn deliver(
        &self,
        targets: Vec<Arc<ClientConnection>>,
        frame: String,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }

        let targets: Vec<_> = targets.into_iter().filter(|c| c.is_live()).collect();
        if targets.is_empty() {
            return Ok(());
        }

        let writes = targets.iter().map(|connection| {
            let frame = frame.as_str();
            async move { (connection, connection.send(frame, cancel).await) }
        });

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            results = join_all(writes) => results,
        };

        let mut failed = Vec::new();
        for (connection, result) in results {
            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        "Failed to send event to connection {}: {e}. Connection will be cleaned up.",
                        connection.connection_id()
                    );
                    failed.push(connection);
                }
            }
        }

        trace!(
            "Delivered frame to {} of {} connection(s)",
            targets.len() - failed.len(),
            targets.len()
        );

        for connection in failed {
            if let Err(e) = self.registry.remove(connection.connection_id()).await {
                warn!(
                    "Failed to prune connection {}: {e}",
                    connection.connection_id()
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for FanOutPublisher {
    async fn publish(
        &self,
        event_name: &str,
        payload: &Value,
        event_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let frame = protocol::format_event(event_name, payload, event_id);
        let targets = self.registry.get_all();
        debug!(
            "Broadcasting event {event_name} to {} connection(s)",
            targets.len()
        );
        self.deliver(targets, frame, cancel).await
    }

    async fn publish_to(
        &self,
        client_id: &str,
        event_name: &str,
        payload: &Value,
        event_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let frame = protocol::format_event(event_name, payload, event_id);
        let targets = self.registry.get_by_client_id(client_id);
        debug!(
            "Sending event {event_name} to client {client_id} ({} connection(s))",
            targets.len()
        );
        self.deliver(targets, frame, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{connection, RecordingWriter};
    use crate::connection::ConnectionId;
    use crate::registry::LocalRegistry;
    use serde_json::json;

    async fn registry_with(
        entries: &[(&str, &str, Arc<RecordingWriter>)],
    ) -> Arc<LocalRegistry> {
        let registry = Arc::new(LocalRegistry::new());
        for (id, client, writer) in entries {
            registry
                .add(connection(id, client, writer.clone()), &CancellationToken::new())
                .await
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_publish_to_empty_registry_succeeds() {
        let publisher = FanOutPublisher::new(Arc::new(LocalRegistry::new()));
        publisher
            .publish("x", &json!({}), None, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_to_reaches_every_connection_of_the_client_only() {
        let c1 = Arc::new(RecordingWriter::default());
        let c2 = Arc::new(RecordingWriter::default());
        let c3 = Arc::new(RecordingWriter::default());
        let registry = registry_with(&[
            ("c1", "u1", c1.clone()),
            ("c2", "u1", c2.clone()),
            ("c3", "u2", c3.clone()),
        ])
        .await;
        let publisher = FanOutPublisher::new(registry);

        publisher
            .publish_to("u1", "x", &json!({"v": 1}), None, &CancellationToken::new())
            .await
            .unwrap();

        for writer in [&c1, &c2] {
            let frames = writer.frames();
            assert_eq!(frames.len(), 1);
            assert!(frames[0].contains("event: x"));
            assert!(frames[0].contains("\"v\":1"));
        }
        assert!(c3.frames().is_empty());
    }

    #[tokio::test]
    async fn test_failing_connections_do_not_affect_siblings() {
        let writers: Vec<Arc<RecordingWriter>> = (0..6)
            .map(|i| {
                if i % 2 == 1 {
                    RecordingWriter::failing()
                } else {
                    Arc::new(RecordingWriter::default())
                }
            })
            .collect();
        let entries: Vec<(String, Arc<RecordingWriter>)> = writers
            .iter()
            .enumerate()
            .map(|(i, w)| (format!("c{i}"), w.clone()))
            .collect();
        let borrowed: Vec<(&str, &str, Arc<RecordingWriter>)> = entries
            .iter()
            .map(|(id, w)| (id.as_str(), "u", w.clone()))
            .collect();
        let registry = registry_with(&borrowed).await;
        let publisher = FanOutPublisher::new(registry.clone());

        publisher
            .publish("n.e", &json!({"ok": true}), Some("1"), &CancellationToken::new())
            .await
            .unwrap();

        for (i, writer) in writers.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(writer.frames().len(), 1, "connection c{i}");
            }
        }
        // Failed connections are pruned
        assert_eq!(registry.count().await, 3);
        assert!(!registry.contains(&ConnectionId::from("c1")));
    }

    #[tokio::test]
    async fn test_dead_connections_are_skipped() {
        let writer = Arc::new(RecordingWriter::default());
        let registry = registry_with(&[("c1", "u1", writer.clone())]).await;
        registry.get_all()[0].mark_dead();

        FanOutPublisher::new(registry)
            .publish("x", &json!(1), None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(writer.frames().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_is_surfaced() {
        let writer = Arc::new(RecordingWriter::default());
        let registry = registry_with(&[("c1", "u1", writer.clone())]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = FanOutPublisher::new(registry)
            .publish("x", &json!(1), None, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(writer.frames().is_empty());
    }
}
