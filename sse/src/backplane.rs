//! Cross-server relay so that events reach connections owned by other
//! processes behind the same load balancer.
//!
//! Every publish goes out on the shared broadcast channel with the target
//! client (if any) inside the envelope. There is no ownership directory:
//! each subscriber checks its own registry for matching connections.
//!
//! # Delivery order
//!
//! 1. Local delivery through the wrapped publisher, awaited in full.
//! 2. Relay publish, best effort. A relay outage is logged and swallowed.
//!
//! Receivers drop messages carrying their own server id, since step 1
//! already covered those connections.

use crate::connection::ServerId;
use crate::error::{relay_error, Error, RelayErrorKind};
use crate::options::BackplaneOptions;
use crate::publisher::Publisher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use log::*;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RESUBSCRIBE_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Envelope carried over the relay. `payload` is the event body already
/// encoded as JSON text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackplaneMessage {
    pub source_server_id: String,
    /// `None` means broadcast to every connection.
    pub target_client_id: Option<String>,
    pub event_name: String,
    pub payload: String,
    pub event_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BackplaneMessage {
    pub fn new(
        source_server_id: &ServerId,
        target_client_id: Option<&str>,
        event_name: &str,
        payload: &Value,
        event_id: Option<&str>,
    ) -> Self {
        Self {
            source_server_id: source_server_id.to_string(),
            target_client_id: target_client_id.map(str::to_string),
            event_name: event_name.to_string(),
            payload: payload.to_string(),
            event_id: event_id.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

pub type RelayStream = BoxStream<'static, Result<String, Error>>;

/// Pub/sub transport underneath the backplane.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn publish(&self, channel: &str, message: String) -> Result<(), Error>;

    /// Stream of raw messages from any of `channels`. The stream ends when
    /// the underlying subscription is lost.
    async fn subscribe(&self, channels: Vec<String>) -> Result<RelayStream, Error>;
}

/// Redis pub/sub relay.
pub struct RedisRelay {
    client: Client,
    conn: ConnectionManager,
}

impl RedisRelay {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!("Connected to Redis backplane at {url}");

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Relay for RedisRelay {
    async fn publish(&self, channel: &str, message: String) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(channel, message)
            .await
            .map_err(|e| relay_error(RelayErrorKind::Publish, Box::new(e)))?;

        trace!("Relayed message on {channel} to {receivers} subscriber(s)");
        Ok(())
    }

    async fn subscribe(&self, channels: Vec<String>) -> Result<RelayStream, Error> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| relay_error(RelayErrorKind::Subscribe, Box::new(e)))?;

        for channel in &channels {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| relay_error(RelayErrorKind::Subscribe, Box::new(e)))?;
        }

        let stream = pubsub.into_on_message().map(|msg| {
            msg.get_payload::<String>()
                .map_err(|e| relay_error(RelayErrorKind::Malformed, Box::new(e)))
        });
        Ok(stream.boxed())
    }
}

/// In-process relay over a tokio broadcast channel. Backplanes sharing one
/// `MemoryRelay` behave like servers sharing one Redis.
#[derive(Clone)]
pub struct MemoryRelay {
    sender: broadcast::Sender<(String, String)>,
}

impl MemoryRelay {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn publish(&self, channel: &str, message: String) -> Result<(), Error> {
        // No subscribers is not an error, same as Redis PUBLISH
        let _ = self.sender.send((channel.to_string(), message));
        Ok(())
    }

    async fn subscribe(&self, channels: Vec<String>) -> Result<RelayStream, Error> {
        let receiver = self.sender.subscribe();
        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let channels = channels.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((channel, message)) if channels.contains(&channel) => {
                            return Some((Ok(message), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let err = relay_error(
                                RelayErrorKind::Subscribe,
                                format!("subscriber lagged, {skipped} message(s) dropped").into(),
                            );
                            return Some((Err(err), receiver));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Publisher decorator adding cross-server relay to local delivery.
pub struct Backplane {
    server_id: ServerId,
    local: Arc<dyn Publisher>,
    relay: Arc<dyn Relay>,
    options: BackplaneOptions,
}

impl Backplane {
    pub fn new(
        server_id: ServerId,
        local: Arc<dyn Publisher>,
        relay: Arc<dyn Relay>,
        options: BackplaneOptions,
    ) -> Self {
        Self {
            server_id,
            local,
            relay,
            options,
        }
    }

    /// Channels this server listens on.
    pub fn channels(&self) -> Vec<String> {
        vec![
            self.options.broadcast_channel(),
            self.options.server_channel(self.server_id.as_str()),
        ]
    }

    /// Best-effort second step of every publish.
    async fn relay(
        &self,
        target_client_id: Option<&str>,
        event_name: &str,
        payload: &Value,
        event_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let message =
            BackplaneMessage::new(&self.server_id, target_client_id, event_name, payload, event_id);
        let encoded = match serde_json::to_string(&message) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode backplane message for {event_name}: {e}");
                return Ok(());
            }
        };

        let channel = self.options.broadcast_channel();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            result = self.relay.publish(&channel, encoded) => {
                if let Err(e) = result {
                    warn!(
                        "Backplane publish of {event_name} failed, local delivery already completed: {e}"
                    );
                }
            }
        }
        Ok(())
    }

    /// Decode one relayed message and deliver it to this server's own
    /// connections. Self-originated messages are dropped.
    pub async fn handle_message(&self, raw: &str, cancel: &CancellationToken) -> Result<(), Error> {
        let message: BackplaneMessage = serde_json::from_str(raw)?;

        if message.source_server_id == self.server_id.as_str() {
            trace!("Ignoring self-originated backplane message {}", message.event_name);
            return Ok(());
        }

        let payload: Value = serde_json::from_str(&message.payload)?;
        let event_id = message.event_id.as_deref();

        debug!(
            "Delivering relayed event {} from server {}",
            message.event_name, message.source_server_id
        );

        match message.target_client_id.as_deref() {
            Some(client_id) => {
                self.local
                    .publish_to(client_id, &message.event_name, &payload, event_id, cancel)
                    .await
            }
            None => {
                self.local
                    .publish(&message.event_name, &payload, event_id, cancel)
                    .await
            }
        }
    }

    /// Subscription loop: runs until `shutdown` fires, resubscribing with
    /// exponential backoff whenever the relay connection is lost.
    pub fn spawn_subscriber(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let channels = self.channels();
            let mut backoff = RESUBSCRIBE_BACKOFF_INITIAL;

            'subscription: loop {
                let subscribed = tokio::select! {
                    _ = shutdown.cancelled() => break 'subscription,
                    subscribed = self.relay.subscribe(channels.clone()) => subscribed,
                };

                let mut stream = match subscribed {
                    Ok(stream) => {
                        info!("Backplane subscribed to {}", channels.join(", "));
                        backoff = RESUBSCRIBE_BACKOFF_INITIAL;
                        stream
                    }
                    Err(e) => {
                        warn!("Backplane subscription failed, retrying in {backoff:?}: {e}");
                        tokio::select! {
                            _ = shutdown.cancelled() => break 'subscription,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
                        continue 'subscription;
                    }
                };

                loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => break 'subscription,
                        next = stream.next() => next,
                    };

                    match next {
                        Some(Ok(raw)) => match self.handle_message(&raw, &shutdown).await {
                            Ok(()) => {}
                            Err(e) if e.is_cancelled() => break 'subscription,
                            Err(e) => warn!("Failed to handle backplane message: {e}"),
                        },
                        Some(Err(e)) => warn!("Backplane receive error: {e}"),
                        None => {
                            warn!("Backplane subscription ended, resubscribing");
                            continue 'subscription;
                        }
                    }
                }
            }

            debug!("Backplane subscriber stopped");
        })
    }
}

#[async_trait]
impl Publisher for Backplane {
    async fn publish(
        &self,
        event_name: &str,
        payload: &Value,
        event_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.local.publish(event_name, payload, event_id, cancel).await?;
        self.relay(None, event_name, payload, event_id, cancel).await
    }

    async fn publish_to(
        &self,
        client_id: &str,
        event_name: &str,
        payload: &Value,
        event_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.local
            .publish_to(client_id, event_name, payload, event_id, cancel)
            .await?;
        self.relay(Some(client_id), event_name, payload, event_id, cancel)
            .await
    }
}
