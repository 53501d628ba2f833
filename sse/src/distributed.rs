//! Registry variant that keeps a remote, TTL-bounded record of every
//! connection so the whole deployment can be counted and stale entries from
//! crashed servers expire on their own.
//!
//! Only connections this process physically owns ever enter the local map;
//! reaching connections held elsewhere is the backplane's job.

use crate::connection::{ClientConnection, ConnectionId, ServerId};
use crate::error::Error;
use crate::options::DistributedOptions;
use crate::registry::{ConnectionRegistry, LocalRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::*;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Metadata written to the remote store for one connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionRecord {
    pub server_id: ServerId,
    pub client_id: String,
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub last_event_id: Option<String>,
}

impl ConnectionRecord {
    pub fn new(server_id: &ServerId, connection: &ClientConnection) -> Self {
        Self {
            server_id: server_id.clone(),
            client_id: connection.client_id().clone(),
            connection_id: connection.connection_id().clone(),
            connected_at: connection.connected_at(),
            last_event_id: connection.last_event_id().map(str::to_string),
        }
    }
}

/// Remote key/value + set + counter store behind the distributed registry.
///
/// `register` and `unregister` must each apply their three mutations
/// (record, per-server set, global counter) atomically.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn register(&self, record: &ConnectionRecord, ttl: Duration) -> Result<(), Error>;

    async fn unregister(
        &self,
        server_id: &ServerId,
        connection_id: &ConnectionId,
    ) -> Result<(), Error>;

    /// Connections across all servers, floored at zero.
    async fn global_count(&self) -> Result<usize, Error>;

    /// Extend the expiry of the given records and of the server's set.
    async fn refresh(
        &self,
        server_id: &ServerId,
        connection_ids: Vec<ConnectionId>,
        ttl: Duration,
    ) -> Result<(), Error>;
}

/// Redis implementation of ConnectionStore.
///
/// Key format:
/// - `{prefix}:connection:{connection_id}` hash of connection metadata
/// - `{prefix}:server:{server_id}:connections` set of owned connection ids
/// - `{prefix}:connections:count` global counter
pub struct RedisConnectionStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisConnectionStore {
    /// Create a new Redis connection store.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `key_prefix` - Prefix for all keys
    pub async fn new(url: &str, key_prefix: &str) -> Result<Self, Error> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Connected to Redis for connection tracking at {url}");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn connection_key(&self, connection_id: &ConnectionId) -> String {
        format!("{}:connection:{}", self.key_prefix, connection_id)
    }

    fn server_key(&self, server_id: &ServerId) -> String {
        format!("{}:server:{}:connections", self.key_prefix, server_id)
    }

    fn count_key(&self) -> String {
        format!("{}:connections:count", self.key_prefix)
    }
}

/// Expiry in milliseconds, so sub-second parts of the TTL are honoured.
fn ttl_millis(ttl: Duration) -> i64 {
    ttl.as_millis().clamp(1, i64::MAX as u128) as i64
}

/// The counter is not tied to record expiry and can drift, even below
/// zero; callers only ever see a non-negative count.
fn floor_count(raw: Option<i64>) -> usize {
    raw.unwrap_or(0).max(0) as usize
}

#[async_trait]
impl ConnectionStore for RedisConnectionStore {
    async fn register(&self, record: &ConnectionRecord, ttl: Duration) -> Result<(), Error> {
        let connection_key = self.connection_key(&record.connection_id);
        let server_key = self.server_key(&record.server_id);
        let ttl = ttl_millis(ttl);
        let fields = [
            ("serverId", record.server_id.to_string()),
            ("clientId", record.client_id.clone()),
            ("connectionId", record.connection_id.to_string()),
            ("connectedAt", record.connected_at.to_rfc3339()),
            ("lastEventId", record.last_event_id.clone().unwrap_or_default()),
        ];
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&connection_key, &fields)
            .ignore()
            .pexpire(&connection_key, ttl)
            .ignore()
            .sadd(&server_key, record.connection_id.as_str())
            .ignore()
            .pexpire(&server_key, ttl)
            .ignore()
            .incr(self.count_key(), 1)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(
            "Stored connection {} for client {} in Redis",
            record.connection_id, record.client_id
        );
        Ok(())
    }

    async fn unregister(
        &self,
        server_id: &ServerId,
        connection_id: &ConnectionId,
    ) -> Result<(), Error> {
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .del(self.connection_key(connection_id))
            .ignore()
            .srem(self.server_key(server_id), connection_id.as_str())
            .ignore()
            .decr(self.count_key(), 1)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!("Removed connection {connection_id} from Redis");
        Ok(())
    }

    async fn global_count(&self) -> Result<usize, Error> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = conn.get(self.count_key()).await?;
        Ok(floor_count(count))
    }

    async fn refresh(
        &self,
        server_id: &ServerId,
        connection_ids: Vec<ConnectionId>,
        ttl: Duration,
    ) -> Result<(), Error> {
        let ttl = ttl_millis(ttl);
        let mut pipe = redis::pipe();
        for connection_id in &connection_ids {
            pipe.pexpire(self.connection_key(connection_id), ttl).ignore();
        }
        pipe.pexpire(self.server_key(server_id), ttl).ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        trace!(
            "Refreshed TTL on {} connection record(s) for server {server_id}",
            connection_ids.len()
        );
        Ok(())
    }
}

/// Local write-ownership map with remote-visible accounting.
pub struct DistributedRegistry {
    server_id: ServerId,
    local: LocalRegistry,
    store: Arc<dyn ConnectionStore>,
    connection_ttl: Duration,
    refresh_interval: Duration,
}

impl DistributedRegistry {
    /// Fails with a configuration error unless `refresh_interval < connection_ttl`.
    pub fn new(
        server_id: ServerId,
        store: Arc<dyn ConnectionStore>,
        options: &DistributedOptions,
    ) -> Result<Self, Error> {
        let options = options.clone().validate()?;
        Ok(Self {
            server_id,
            local: LocalRegistry::new(),
            store,
            connection_ttl: options.connection_ttl,
            refresh_interval: options.refresh_interval,
        })
    }

    /// Connect to Redis and build the registry.
    pub async fn connect(server_id: ServerId, options: &DistributedOptions) -> Result<Self, Error> {
        let options = options.clone().validate()?;
        let store = RedisConnectionStore::new(&options.redis_url, &options.key_prefix).await?;
        Self::new(server_id, Arc::new(store), &options)
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    /// Extend the remote expiry of every owned connection record.
    pub async fn refresh_ttl(&self) -> Result<(), Error> {
        let connection_ids = self.local.connection_ids();
        self.store
            .refresh(&self.server_id, connection_ids, self.connection_ttl)
            .await
    }

    /// Run `refresh_ttl` every `refresh_interval` until `shutdown` fires.
    pub fn spawn_ttl_refresh(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; records were just written.
            ticker.tick().await;

            info!(
                "TTL refresh running every {:?} (ttl {:?})",
                self.refresh_interval, self.connection_ttl
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh_ttl().await {
                            warn!("Failed to refresh connection TTLs: {e}");
                        }
                    }
                }
            }

            debug!("TTL refresh stopped");
        })
    }

    /// Unregister every owned connection; used on graceful shutdown so the
    /// global count does not wait for TTL expiry.
    pub async fn unregister_all(&self) {
        for connection_id in self.local.connection_ids() {
            if let Err(e) = self.remove(&connection_id).await {
                warn!("Failed to unregister connection {connection_id} on shutdown: {e}");
            }
        }
    }
}

#[async_trait]
impl ConnectionRegistry for DistributedRegistry {
    async fn add(
        &self,
        connection: Arc<ClientConnection>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let record = ConnectionRecord::new(&self.server_id, &connection);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            result = self.store.register(&record, self.connection_ttl) => {
                if let Err(e) = result {
                    error!(
                        "Failed to register connection {} in the distributed store: {e}",
                        record.connection_id
                    );
                    return Err(e);
                }
            }
        }

        self.local.insert(connection);
        debug!(
            "Registered connection {} for client {} on server {}",
            record.connection_id, record.client_id, self.server_id
        );
        Ok(())
    }

    async fn remove(&self, connection_id: &ConnectionId) -> Result<(), Error> {
        // Local entry goes first and unconditionally
        if self.local.take(connection_id).is_none() {
            return Ok(());
        }

        self.store
            .unregister(&self.server_id, connection_id)
            .await
            .inspect_err(|e| {
                warn!("Connection {connection_id} removed locally but not from the distributed store: {e}")
            })
    }

    fn get_all(&self) -> Vec<Arc<ClientConnection>> {
        self.local.snapshot()
    }

    fn get_by_client_id(&self, client_id: &str) -> Vec<Arc<ClientConnection>> {
        self.local.snapshot_for(client_id)
    }

    async fn count(&self) -> usize {
        match self.store.global_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!("Falling back to local connection count: {e}");
                self.local.len()
            }
        }
    }
}
