//! Connection registry: which clients are attached to which document.
//!
//! ```text
//!   document_id ──► client_id ──► Arc<Connection> ──► outbound queue
//!   "doc-1"         "A"           conn(A)             [e1, e2, …]
//!                   "B"           conn(B)             [e1, …]
//!   "doc-2"         "C"           conn(C)             []
//! ```
//!
//! One `RwLock` guards the whole map. Broadcasts take the read lock and
//! only ever `try_send`, so a slow client costs a dropped message rather
//! than a blocked room. Register and unregister take the write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connection::{Connection, Enqueue};

/// Snapshot of registry health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub delivered: u64,
    pub dropped: u64,
    pub active_documents: usize,
    pub active_connections: usize,
}

/// What a single broadcast achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

/// Lock-free counters updated from the broadcast path.
#[derive(Debug, Default)]
struct AtomicRegistryStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

type DocumentMap = HashMap<String, HashMap<String, Arc<Connection>>>;

/// Maps document ids to their live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    documents: RwLock<DocumentMap>,
    stats: AtomicRegistryStats,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the other clients of its document.
    pub async fn register(&self, conn: Arc<Connection>) -> Vec<String> {
        self.register_with(conn, |_, _| {}).await
    }

    /// Register a connection and run `greet` while the write lock is held.
    ///
    /// No broadcast can reach the new connection until `greet` returns,
    /// so anything it enqueues is ahead of all room traffic.
    pub async fn register_with<F>(&self, conn: Arc<Connection>, greet: F) -> Vec<String>
    where
        F: FnOnce(&Connection, &[String]),
    {
        let mut documents = self.documents.write().await;

        // A client id lives under one document at a time.
        let mut moved = Vec::new();
        documents.retain(|document_id, clients| {
            if document_id == conn.document_id() {
                return true;
            }
            if let Some(stale) = clients.remove(conn.client_id()) {
                moved.push(stale);
            }
            !clients.is_empty()
        });
        for stale in moved {
            log::info!(
                "client {} moved from document {} to {}, closing old connection",
                stale.client_id(),
                stale.document_id(),
                conn.document_id()
            );
            stale.close_queue();
        }

        let clients = documents.entry(conn.document_id().to_owned()).or_default();

        let peers: Vec<String> = clients
            .keys()
            .filter(|id| id.as_str() != conn.client_id())
            .cloned()
            .collect();

        if let Some(previous) = clients.insert(conn.client_id().to_owned(), conn.clone()) {
            if !Arc::ptr_eq(&previous, &conn) {
                log::info!(
                    "client {} re-registered on document {}, previous connection superseded",
                    conn.client_id(),
                    conn.document_id()
                );
            }
        }
        conn.mark_registered();
        greet(&conn, &peers);
        peers
    }

    /// Remove a connection if it is still the registered one.
    ///
    /// Idempotent. A connection that has been superseded by a newer one
    /// with the same client id leaves the newer entry in place.
    pub async fn unregister(&self, conn: &Arc<Connection>) -> bool {
        let mut documents = self.documents.write().await;
        let Some(clients) = documents.get_mut(conn.document_id()) else {
            return false;
        };

        let is_current = clients
            .get(conn.client_id())
            .is_some_and(|current| Arc::ptr_eq(current, conn));
        if !is_current {
            return false;
        }

        clients.remove(conn.client_id());
        if clients.is_empty() {
            documents.remove(conn.document_id());
        }
        true
    }

    /// Enqueue `payload` on every connection of `document_id` except
    /// `exclude`. Never blocks and never fails.
    pub async fn broadcast(
        &self,
        document_id: &str,
        payload: Arc<str>,
        exclude: Option<&str>,
    ) -> BroadcastOutcome {
        let documents = self.documents.read().await;
        let Some(clients) = documents.get(document_id) else {
            return BroadcastOutcome::default();
        };

        let mut outcome = BroadcastOutcome::default();
        for (client_id, conn) in clients {
            if exclude == Some(client_id.as_str()) {
                continue;
            }
            match conn.try_send(payload.clone()) {
                Enqueue::Queued => outcome.delivered += 1,
                Enqueue::Full => {
                    outcome.dropped += 1;
                    log::warn!(
                        "outbound queue full for client {client_id} on document {document_id}, message dropped"
                    );
                }
                Enqueue::Closed => {
                    outcome.dropped += 1;
                    log::warn!(
                        "outbound queue closed for client {client_id} on document {document_id}, message dropped"
                    );
                }
            }
        }

        self.stats
            .delivered
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.stats
            .dropped
            .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        outcome
    }

    /// Client ids currently attached to `document_id`.
    pub async fn list_client_ids(&self, document_id: &str) -> Vec<String> {
        self.documents
            .read()
            .await
            .get(document_id)
            .map(|clients| clients.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn connection(&self, document_id: &str, client_id: &str) -> Option<Arc<Connection>> {
        self.documents
            .read()
            .await
            .get(document_id)
            .and_then(|clients| clients.get(client_id))
            .cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.documents.read().await.values().map(HashMap::len).sum()
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Close the outbound queue of every registered connection.
    pub async fn close_all(&self) {
        let documents = self.documents.read().await;
        for conn in documents.values().flat_map(HashMap::values) {
            conn.close_queue();
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let documents = self.documents.read().await;
        RegistryStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            active_documents: documents.len(),
            active_connections: documents.values().map(HashMap::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use tokio::sync::mpsc;

    fn conn(doc: &str, client: &str, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
        Connection::new(doc, client, capacity)
    }

    fn sorted(mut ids: Vec<String>) -> Vec<String> {
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_register_returns_peers() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = conn("doc-1", "A", 8);
        let (b, _rb) = conn("doc-1", "B", 8);

        assert!(registry.register(a.clone()).await.is_empty());
        assert_eq!(registry.register(b).await, vec!["A".to_string()]);
        assert_eq!(a.state(), ConnectionState::Registered);
        assert_eq!(sorted(registry.list_client_ids("doc-1").await), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_documents_are_isolated() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = conn("doc-1", "A", 8);
        let (c, mut rc) = conn("doc-2", "C", 8);
        registry.register(a).await;
        assert!(registry.register(c).await.is_empty());

        let outcome = registry.broadcast("doc-1", Arc::from("x"), None).await;
        assert_eq!(outcome.delivered, 1);
        assert!(rc.try_recv().is_err());
        assert_eq!(registry.document_count().await, 2);
    }

    #[tokio::test]
    async fn test_unregister_removes_empty_document() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = conn("doc-1", "A", 8);
        let (b, _rb) = conn("doc-1", "B", 8);
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        assert!(registry.unregister(&a).await);
        assert!(!registry.unregister(&a).await, "idempotent");
        assert_eq!(registry.list_client_ids("doc-1").await, vec!["B".to_string()]);

        assert!(registry.unregister(&b).await);
        assert_eq!(registry.document_count().await, 0);
        assert!(registry.list_client_ids("doc-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_unknown_document() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = conn("nowhere", "A", 8);
        assert!(!registry.unregister(&a).await);
    }

    #[tokio::test]
    async fn test_superseded_connection_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        let (old, _ro) = conn("doc-1", "A", 8);
        let (new, _rn) = conn("doc-1", "A", 8);
        registry.register(old.clone()).await;
        assert!(registry.register(new.clone()).await.is_empty());

        assert!(!registry.unregister(&old).await);
        let current = registry.connection("doc-1", "A").await.unwrap();
        assert!(Arc::ptr_eq(&current, &new));
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_origin() {
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = conn("doc-1", "A", 8);
        let (b, mut rb) = conn("doc-1", "B", 8);
        let (c, mut rc) = conn("doc-1", "C", 8);
        for conn in [a, b, c] {
            registry.register(conn).await;
        }

        let outcome = registry.broadcast("doc-1", Arc::from("edit"), Some("A")).await;
        assert_eq!(outcome, BroadcastOutcome { delivered: 2, dropped: 0 });
        assert!(ra.try_recv().is_err());
        assert_eq!(&*rb.recv().await.unwrap(), "edit");
        assert_eq!(&*rc.recv().await.unwrap(), "edit");
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_document() {
        let registry = ConnectionRegistry::new();
        let outcome = registry.broadcast("ghost", Arc::from("x"), None).await;
        assert_eq!(outcome, BroadcastOutcome::default());
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_that_client() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = conn("doc-1", "A", 8);
        let (b, mut rb) = conn("doc-1", "B", 8);
        let (c, _rc) = conn("doc-1", "C", 1);
        registry.register(a).await;
        registry.register(b).await;
        registry.register(c.clone()).await;

        assert!(c.try_send(Arc::from("filler")).is_queued());

        let outcome = registry.broadcast("doc-1", Arc::from("edit"), Some("A")).await;
        assert_eq!(outcome, BroadcastOutcome { delivered: 1, dropped: 1 });
        assert_eq!(&*rb.recv().await.unwrap(), "edit");
        assert_eq!(c.drop_count(), 1);

        let stats = registry.stats().await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.active_connections, 3);
        assert_eq!(stats.active_documents, 1);
    }

    #[tokio::test]
    async fn test_register_with_greets_before_broadcast() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _ra) = conn("doc-1", "A", 8);
        let (b, mut rb) = conn("doc-1", "B", 8);
        registry.register(a).await;

        let peers = registry
            .register_with(b, |conn, peers| {
                for peer in peers {
                    conn.try_send(Arc::from(format!("hello {peer}")));
                }
            })
            .await;
        assert_eq!(peers, vec!["A".to_string()]);

        registry.broadcast("doc-1", Arc::from("edit"), Some("A")).await;
        assert_eq!(&*rb.recv().await.unwrap(), "hello A");
        assert_eq!(&*rb.recv().await.unwrap(), "edit");
    }

    #[tokio::test]
    async fn test_close_all_closes_queues() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = conn("doc-1", "A", 8);
        let (b, _rb) = conn("doc-2", "B", 8);
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        registry.close_all().await;
        assert!(a.is_queue_closed());
        assert!(b.is_queue_closed());

        let outcome = registry.broadcast("doc-1", Arc::from("x"), None).await;
        assert_eq!(outcome.dropped, 1);
    }

    #[tokio::test]
    async fn test_register_unregister_sequence_leaves_nothing_behind() {
        let registry = ConnectionRegistry::new();
        let mut handles = Vec::new();
        for doc in 0..5 {
            for client in 0..4 {
                let (c, rx) = conn(&format!("doc-{doc}"), &format!("d{doc}-c{client}"), 4);
                registry.register(c.clone()).await;
                handles.push((c, rx));
            }
        }
        assert_eq!(registry.connection_count().await, 20);
        assert_eq!(registry.document_count().await, 5);

        for (c, _rx) in &handles {
            assert!(registry.unregister(c).await);
        }
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.document_count().await, 0);
    }

    #[tokio::test]
    async fn test_client_moves_between_documents() {
        let registry = ConnectionRegistry::new();
        let (first, _r1) = conn("doc-1", "A", 8);
        let (b, _rb) = conn("doc-1", "B", 8);
        let (second, _r2) = conn("doc-2", "A", 8);
        registry.register(first.clone()).await;
        registry.register(b).await;

        assert!(registry.register(second.clone()).await.is_empty());
        assert_eq!(registry.list_client_ids("doc-1").await, vec!["B".to_string()]);
        assert_eq!(registry.list_client_ids("doc-2").await, vec!["A".to_string()]);
        assert!(first.is_queue_closed());
        assert!(!second.is_queue_closed());

        // The old connection's teardown must not touch the new entry.
        assert!(!registry.unregister(&first).await);
        assert_eq!(registry.connection_count().await, 2);

        let (moved_b, _r3) = conn("doc-3", "B", 8);
        registry.register(moved_b).await;
        assert!(registry.list_client_ids("doc-1").await.is_empty());
        assert_eq!(registry.document_count().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn() {
        const TASKS: usize = 12;
        const ROUNDS: usize = 50;
        let registry = Arc::new(ConnectionRegistry::new());

        let mut tasks = Vec::new();
        for i in 0..TASKS {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let document_id = format!("doc-{}", i % 4);
                let client_id = format!("c{i}");
                let own_prefix = format!("{client_id}:");
                let stays = i % 4 != 3;

                let mut kept = None;
                for round in 0..ROUNDS {
                    let (c, mut rx) = conn(&document_id, &client_id, 1024);
                    registry.register(c.clone()).await;
                    registry
                        .broadcast(&document_id, Arc::from(format!("{client_id}:{round}")), Some(&client_id))
                        .await;
                    tokio::task::yield_now().await;

                    while let Ok(message) = rx.try_recv() {
                        assert!(
                            !message.starts_with(&own_prefix),
                            "{client_id} received its own broadcast {message}"
                        );
                    }

                    if stays && round == ROUNDS - 1 {
                        kept = Some((c, rx));
                    } else {
                        assert!(registry.unregister(&c).await);
                    }
                }
                kept
            }));
        }

        let mut survivors = Vec::new();
        for task in tasks {
            if let Some(kept) = task.await.unwrap() {
                survivors.push(kept);
            }
        }

        assert_eq!(survivors.len(), 9);
        assert_eq!(registry.document_count().await, 3);
        assert_eq!(registry.connection_count().await, 9);
        assert_eq!(sorted(registry.list_client_ids("doc-0").await), vec!["c0", "c4", "c8"]);
        assert_eq!(sorted(registry.list_client_ids("doc-1").await), vec!["c1", "c5", "c9"]);
        assert_eq!(sorted(registry.list_client_ids("doc-2").await), vec!["c10", "c2", "c6"]);
        assert!(registry.list_client_ids("doc-3").await.is_empty());
    }
}
