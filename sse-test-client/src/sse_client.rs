use anyhow::Result;
use eventsource_client::{self as es, Client, ReconnectOptions};
use futures_util::stream::StreamExt;
use log::*;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Event name used for frames whose `data` is not valid JSON.
pub const PARSE_ERROR_EVENT: &str = "error";

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub data: Value,
    pub timestamp: Instant,
}

impl Event {
    /// A `data` payload that fails to parse becomes an error event carrying
    /// the raw text, so the stream itself stays up.
    fn parse(event_type: String, raw: &str) -> Self {
        let (event_type, data) = match serde_json::from_str(raw) {
            Ok(data) => (event_type, data),
            Err(e) => (
                PARSE_ERROR_EVENT.to_string(),
                json!({ "event": event_type, "raw": raw, "error": e.to_string() }),
            ),
        };
        Self {
            event_type,
            data,
            timestamp: Instant::now(),
        }
    }
}

pub struct Connection {
    pub label: String,
    pub client_id: String,
    event_rx: mpsc::UnboundedReceiver<Event>,
    handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Open a stream as `client_id`. The underlying client reconnects on its
    /// own with exponential backoff (1s doubling up to 30s).
    pub async fn establish(base_url: &str, client_id: &str, label: String) -> Result<Self> {
        let url = format!("{}/sse", base_url);
        let (tx, rx) = mpsc::unbounded_channel();

        let client = es::ClientBuilder::for_url(&url)?
            .header("X-Client-Id", client_id)?
            .reconnect(
                ReconnectOptions::reconnect(true)
                    .retry_initial(false)
                    .delay(Duration::from_secs(1))
                    .backoff_factor(2)
                    .delay_max(Duration::from_secs(30))
                    .build(),
            )
            .build();

        let stream_label = label.clone();
        let handle = tokio::spawn(async move {
            let mut stream = client.stream();

            loop {
                match stream.next().await {
                    Some(Ok(es::SSE::Event(event))) => {
                        let parsed = Event::parse(event.event_type, &event.data);
                        if parsed.event_type == PARSE_ERROR_EVENT {
                            warn!("Malformed event data for {}: {}", stream_label, parsed.data);
                        }
                        if tx.send(parsed).is_err() {
                            debug!("SSE receiver dropped for {}", stream_label);
                            break;
                        }
                    }
                    Some(Ok(es::SSE::Comment(comment))) => {
                        trace!("Comment for {}: {}", stream_label, comment);
                    }
                    Some(Err(e)) => {
                        warn!("SSE error for {}: {}", stream_label, e);
                    }
                    None => {
                        debug!("SSE stream ended for {}", stream_label);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            label,
            client_id: client_id.to_string(),
            event_rx: rx,
            handle,
        })
    }

    pub async fn wait_for_event(&mut self, event_type: &str, timeout: Duration) -> Result<Event> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("Timeout waiting for event: {}", event_type);
            }

            match tokio::time::timeout(remaining, self.event_rx.recv()).await {
                Ok(Some(event)) if event.event_type == event_type => {
                    return Ok(event);
                }
                Ok(Some(_)) => {
                    // Wrong event type, keep waiting
                    continue;
                }
                Ok(None) => {
                    anyhow::bail!("SSE connection closed");
                }
                Err(_) => {
                    anyhow::bail!("Timeout waiting for event: {}", event_type);
                }
            }
        }
    }

    /// True if no `event_type` event arrives within `window`.
    pub async fn expect_silence(&mut self, event_type: &str, window: Duration) -> bool {
        self.wait_for_event(event_type, window).await.is_err()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_data_is_parsed() {
        let event = Event::parse("task.completed".to_string(), r#"{"taskId":"T1"}"#);
        assert_eq!(event.event_type, "task.completed");
        assert_eq!(event.data, json!({"taskId": "T1"}));
    }

    #[test]
    fn test_malformed_data_becomes_error_event() {
        let event = Event::parse("task.completed".to_string(), "{not json");
        assert_eq!(event.event_type, PARSE_ERROR_EVENT);
        assert_eq!(event.data["event"], "task.completed");
        assert_eq!(event.data["raw"], "{not json");
    }
}
