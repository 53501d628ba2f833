//! Server-Sent Events (SSE) infrastructure spanning multiple server processes.
//!
//! This crate owns everything between "application code wants to push an
//! event" and "bytes are queued on a client's stream". The HTTP side (accepting
//! streams, resolving who the client is) lives in the `web` crate.
//!
//! # Architecture
//!
//! - **Registry**: `ConnectionRegistry` tracks the connections this process
//!   owns. `LocalRegistry` is a pair of DashMap indices; `DistributedRegistry`
//!   wraps it with Redis-backed records (TTL'd) and a global counter.
//! - **Publisher**: `FanOutPublisher` formats an event once and writes it to
//!   every target concurrently. One broken connection never fails a publish.
//! - **Backplane**: `Backplane` decorates a publisher. Local delivery first,
//!   then a best-effort relay over Redis pub/sub so other servers can deliver
//!   to the connections they own.
//! - **Liveness**: `HeartbeatService` sweeps all connections with comment
//!   frames and evicts the dead; `DistributedRegistry::spawn_ttl_refresh`
//!   keeps remote records from expiring while their connections live.
//!
//! # Delivery semantics
//!
//! - Per connection, frames are strictly ordered and never interleaved.
//! - No ordering across connections or across servers.
//! - At most once per server via the backplane; self-originated relay
//!   messages are dropped.
//! - Ephemeral: `Last-Event-ID` is recorded on the connection, never replayed.
//!
//! # Example: publishing
//!
//! ```rust,ignore
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! app_state
//!     .publisher
//!     .publish_to("user-42", "task.completed", &json!({"taskId": "T1"}), Some("evt_7"), &CancellationToken::new())
//!     .await?;
//! ```
//!
//! # Modules
//!
//! - `protocol`: wire framing for events, heartbeats and retry hints
//! - `connection`: ids, `ClientConnection`, the `ConnectionWriter` seam and `StreamWriter`
//! - `registry`: the registry contract and the in-process implementation
//! - `distributed`: Redis-backed registry and its `ConnectionStore` seam
//! - `publisher`: fan-out delivery
//! - `backplane`: cross-server relay
//! - `heartbeat`: liveness sweep
//! - `options`: validated tunables
//! - `error`: error types

pub mod backplane;
pub mod connection;
pub mod distributed;
pub mod error;
pub mod heartbeat;
pub mod options;
pub mod protocol;
pub mod publisher;
pub mod registry;

pub use backplane::{Backplane, BackplaneMessage, MemoryRelay, RedisRelay, Relay};
pub use connection::{ClientConnection, ClientId, ConnectionId, ServerId, StreamWriter};
pub use distributed::{DistributedRegistry, RedisConnectionStore};
pub use error::Error;
pub use heartbeat::HeartbeatService;
pub use publisher::{FanOutPublisher, Publisher};
pub use registry::{ConnectionRegistry, LocalRegistry};
