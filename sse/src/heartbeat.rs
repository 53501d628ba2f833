//! Liveness sweep. Heartbeat comments keep idle proxies from closing streams
//! and are the only way to notice a transport that died without a
//! disconnect notification.

use crate::connection::ConnectionId;
use crate::protocol;
use crate::registry::ConnectionRegistry;
use futures::future::join_all;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct HeartbeatService {
    registry: Arc<dyn ConnectionRegistry>,
    interval: Duration,
}

impl HeartbeatService {
    pub fn new(registry: Arc<dyn ConnectionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Heartbeat every registered connection, then evict every connection
    /// that was already dead or whose heartbeat failed. Returns the number
    /// of evicted connections.
    pub async fn sweep(&self, cancel: &CancellationToken) -> usize {
        let connections = self.registry.get_all();
        if connections.is_empty() {
            return 0;
        }

        let frame = protocol::format_heartbeat();
        let beats = connections.iter().map(|connection| async move {
            if !connection.is_live() {
                return Some(connection.connection_id().clone());
            }
            match connection.send(frame, cancel).await {
                Ok(()) => None,
                Err(e) if e.is_cancelled() => None,
                Err(e) => {
                    debug!(
                        "Heartbeat to connection {} failed: {e}",
                        connection.connection_id()
                    );
                    Some(connection.connection_id().clone())
                }
            }
        });

        let dead: Vec<ConnectionId> = join_all(beats).await.into_iter().flatten().collect();

        for connection_id in &dead {
            if let Err(e) = self.registry.remove(connection_id).await {
                warn!("Failed to evict dead connection {connection_id}: {e}");
            }
        }

        if !dead.is_empty() {
            info!(
                "Heartbeat sweep evicted {} of {} connection(s)",
                dead.len(),
                connections.len()
            );
        }
        dead.len()
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            info!("Heartbeat running every {:?}", self.interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep(&shutdown).await;
                    }
                }
            }

            debug!("Heartbeat stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{connection, RecordingWriter};
    use crate::registry::LocalRegistry;

    #[tokio::test]
    async fn test_sweep_evicts_only_failing_connections() {
        let registry = Arc::new(LocalRegistry::new());
        let mut writers = Vec::new();
        for i in 1..=5 {
            let writer = if i == 3 {
                RecordingWriter::failing()
            } else {
                Arc::new(RecordingWriter::default())
            };
            registry
                .add(
                    connection(&format!("c{i}"), "u", writer.clone()),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            writers.push(writer);
        }

        let heartbeat = HeartbeatService::new(registry.clone(), Duration::from_secs(30));
        let evicted = heartbeat.sweep(&CancellationToken::new()).await;

        assert_eq!(evicted, 1);
        assert_eq!(registry.count().await, 4);
        assert!(!registry.contains(&ConnectionId::from("c3")));
        for (i, writer) in writers.iter().enumerate() {
            if i != 2 {
                assert_eq!(writer.frames(), vec![": heartbeat\n\n".to_string()]);
            }
        }
    }

    #[tokio::test]
    async fn test_sweep_evicts_connections_already_marked_dead() {
        let registry = Arc::new(LocalRegistry::new());
        let writer = Arc::new(RecordingWriter::default());
        let conn = connection("c1", "u", writer.clone());
        registry
            .add(conn.clone(), &CancellationToken::new())
            .await
            .unwrap();
        conn.mark_dead();

        let evicted = HeartbeatService::new(registry.clone(), Duration::from_secs(30))
            .sweep(&CancellationToken::new())
            .await;

        assert_eq!(evicted, 1);
        assert!(registry.is_empty());
        assert!(writer.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_beats_on_each_interval() {
        let registry = Arc::new(LocalRegistry::new());
        let writer = Arc::new(RecordingWriter::default());
        registry
            .add(connection("c1", "u", writer.clone()), &CancellationToken::new())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle =
            HeartbeatService::new(registry, Duration::from_secs(10)).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(writer.frames().len(), 2);
    }
}
