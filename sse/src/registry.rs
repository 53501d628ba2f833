use crate::connection::{ClientConnection, ClientId, ConnectionId};
use crate::error::Error;
use async_trait::async_trait;
use dashmap::DashMap;
use log::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Tracks which live connections this process owns.
///
/// Reads return snapshots: concurrent `add`/`remove` calls never change a
/// `Vec` that has already been handed out.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn add(
        &self,
        connection: Arc<ClientConnection>,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;

    /// Removing an unknown id is a no-op. Implementations always drop the
    /// local entry, even when they go on to report an error.
    async fn remove(&self, connection_id: &ConnectionId) -> Result<(), Error>;

    fn get_all(&self) -> Vec<Arc<ClientConnection>>;

    fn get_by_client_id(&self, client_id: &str) -> Vec<Arc<ClientConnection>>;

    async fn count(&self) -> usize;
}

/// In-process connection registry with dual indices
pub struct LocalRegistry {
    /// Primary storage: lookup by connection_id for registration/cleanup
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,

    /// Secondary index: lookup by client_id for targeted delivery
    client_index: DashMap<ClientId, HashSet<ConnectionId>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            client_index: DashMap::new(),
        }
    }

    pub fn insert(&self, connection: Arc<ClientConnection>) {
        let connection_id = connection.connection_id().clone();
        let client_id = connection.client_id().clone();

        // Insert into primary storage
        if let Some(previous) = self
            .connections
            .insert(connection_id.clone(), connection)
        {
            if previous.client_id() != &client_id {
                self.unindex(previous.client_id(), &connection_id);
            }
        }

        // Update secondary index
        self.client_index
            .entry(client_id.clone())
            .or_default()
            .insert(connection_id.clone());

        // A `take` that ran between the two steps found no index entry to
        // clear; drop the one just added.
        if !self.connections.contains_key(&connection_id) {
            self.unindex(&client_id, &connection_id);
        }
    }

    /// Remove from both indices, returning the entry if it was present.
    pub fn take(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let (_, connection) = self.connections.remove(connection_id)?;
        self.unindex(connection.client_id(), connection_id);
        Some(connection)
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    pub fn snapshot_for(&self, client_id: &str) -> Vec<Arc<ClientConnection>> {
        let connection_ids: Vec<ConnectionId> = match self.client_index.get(client_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };

        connection_ids
            .iter()
            .filter_map(|id| self.connections.get(id).map(|e| e.value().clone()))
            .filter(|connection| connection.client_id() == client_id)
            .collect()
    }

    fn unindex(&self, client_id: &ClientId, connection_id: &ConnectionId) {
        if let Some(mut entry) = self.client_index.get_mut(client_id) {
            entry.remove(connection_id);
        }
        // Clean up empty client entries; checked under the shard lock so a
        // concurrent insert for the same client is never lost.
        self.client_index
            .remove_if(client_id, |_, ids| ids.is_empty());
    }
}

impl Default for LocalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionRegistry for LocalRegistry {
    async fn add(
        &self,
        connection: Arc<ClientConnection>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        debug!(
            "Registering connection {} for client {}",
            connection.connection_id(),
            connection.client_id()
        );
        self.insert(connection);
        Ok(())
    }

    async fn remove(&self, connection_id: &ConnectionId) -> Result<(), Error> {
        if self.take(connection_id).is_some() {
            debug!("Unregistered connection {connection_id}");
        }
        Ok(())
    }

    fn get_all(&self) -> Vec<Arc<ClientConnection>> {
        self.snapshot()
    }

    fn get_by_client_id(&self, client_id: &str) -> Vec<Arc<ClientConnection>> {
        self.snapshot_for(client_id)
    }

    async fn count(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{connection, RecordingWriter};

    fn conn(id: &str, client: &str) -> Arc<ClientConnection> {
        connection(id, client, Arc::new(RecordingWriter::default()))
    }

    fn ids(connections: &[Arc<ClientConnection>]) -> Vec<String> {
        let mut ids: Vec<String> = connections
            .iter()
            .map(|c| c.connection_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_count_tracks_adds_minus_removes() {
        let registry = LocalRegistry::new();
        let cancel = CancellationToken::new();

        for i in 0..10 {
            registry
                .add(conn(&format!("c{i}"), "u"), &cancel)
                .await
                .unwrap();
        }
        for i in 0..4 {
            registry
                .remove(&ConnectionId::from(format!("c{i}").as_str()))
                .await
                .unwrap();
        }

        assert_eq!(registry.count().await, 6);
    }

    #[tokio::test]
    async fn test_removing_unknown_id_is_a_noop() {
        let registry = LocalRegistry::new();
        let cancel = CancellationToken::new();
        registry.add(conn("c1", "u1"), &cancel).await.unwrap();

        registry.remove(&ConnectionId::from("nope")).await.unwrap();
        registry.remove(&ConnectionId::from("c1")).await.unwrap();
        registry.remove(&ConnectionId::from("c1")).await.unwrap();

        assert_eq!(registry.count().await, 0);
        assert!(registry.client_index.is_empty());
    }

    #[tokio::test]
    async fn test_get_by_client_id_returns_exactly_that_clients_connections() {
        let registry = LocalRegistry::new();
        let cancel = CancellationToken::new();
        registry.add(conn("c1", "u1"), &cancel).await.unwrap();
        registry.add(conn("c2", "u1"), &cancel).await.unwrap();
        registry.add(conn("c3", "u2"), &cancel).await.unwrap();

        assert_eq!(ids(&registry.get_by_client_id("u1")), vec!["c1", "c2"]);
        assert_eq!(ids(&registry.get_by_client_id("u2")), vec!["c3"]);
        assert!(registry.get_by_client_id("u3").is_empty());
    }

    #[tokio::test]
    async fn test_readding_an_id_under_a_new_client_moves_the_index() {
        let registry = LocalRegistry::new();
        let cancel = CancellationToken::new();
        registry.add(conn("c1", "u1"), &cancel).await.unwrap();
        registry.add(conn("c1", "u2"), &cancel).await.unwrap();

        assert_eq!(registry.count().await, 1);
        assert!(registry.get_by_client_id("u1").is_empty());
        assert_eq!(ids(&registry.get_by_client_id("u2")), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_snapshots_are_not_affected_by_later_mutation() {
        let registry = LocalRegistry::new();
        let cancel = CancellationToken::new();
        registry.add(conn("c1", "u1"), &cancel).await.unwrap();

        let snapshot = registry.get_all();
        registry.remove(&ConnectionId::from("c1")).await.unwrap();
        registry.add(conn("c2", "u1"), &cancel).await.unwrap();

        assert_eq!(ids(&snapshot), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_add_honors_cancellation() {
        let registry = LocalRegistry::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = registry.add(conn("c1", "u1"), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_and_remove_keep_indices_consistent() {
        let registry = Arc::new(LocalRegistry::new());
        let mut handles = Vec::new();

        for task in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                for i in 0..100 {
                    let id = format!("t{task}-c{i}");
                    registry
                        .add(conn(&id, &format!("u{}", i % 3)), &cancel)
                        .await
                        .unwrap();
                    if i % 2 == 0 {
                        registry.remove(&ConnectionId::from(id.as_str())).await.unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.count().await, 8 * 50);
        let by_client: usize = (0..3)
            .map(|u| registry.get_by_client_id(&format!("u{u}")).len())
            .sum();
        assert_eq!(by_client, 8 * 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_insert_and_take_leave_no_orphaned_index_entries() {
        let registry = Arc::new(LocalRegistry::new());
        let mut handles = Vec::new();

        for task in 0..4 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..500 {
                    let id = ConnectionId::from(format!("c{}", round % 8).as_str());
                    if task % 2 == 0 {
                        registry.insert(conn(id.as_str(), "u1"));
                    } else {
                        registry.take(&id);
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for id in registry.connection_ids() {
            registry.take(&id);
        }
        assert!(registry.is_empty());
        assert!(registry.client_index.is_empty());
        assert!(registry.get_by_client_id("u1").is_empty());
    }
}
