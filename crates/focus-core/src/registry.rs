//! Connection registry.
//!
//! The single authoritative view of live connections. One read-write lock
//! guards the map: `add`/`remove` take it exclusively, lookups and
//! snapshots take it shared, and no network write ever happens while it is
//! held. Visitors run on a point-in-time snapshot.

use focus_protocol::Identity;
use focus_transport::{ConnectionId, ConnectionSink};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The connection handle is already registered.
    #[error("Duplicate connection: {0}")]
    DuplicateConnection(ConnectionId),
}

/// A registered connection.
///
/// Cloning is cheap; clones share the sink, activity marker and eviction
/// signal with the entry held by the registry.
#[derive(Clone)]
pub struct ConnectionEntry {
    id: ConnectionId,
    identity: Identity,
    sink: Arc<dyn ConnectionSink>,
    last_activity: Arc<Mutex<Instant>>,
    evicted: Arc<Notify>,
    seq: u64,
}

impl ConnectionEntry {
    fn new(id: ConnectionId, identity: Identity, sink: Arc<dyn ConnectionSink>, seq: u64) -> Self {
        Self {
            id,
            identity,
            sink,
            last_activity: Arc::new(Mutex::new(Instant::now())),
            evicted: Arc::new(Notify::new()),
            seq,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn ConnectionSink> {
        &self.sink
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Signal the owning read loop that this entry was evicted.
    ///
    /// The signal is latched, so it is seen even if the loop is not
    /// currently waiting.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    /// Resolves once [`ConnectionEntry::evict`] has been called.
    pub fn evicted(&self) -> Notified<'_> {
        self.evicted.notified()
    }
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Outcome of a [`ConnectionRegistry::for_each`] pass.
#[derive(Debug)]
pub struct VisitReport<E> {
    /// Number of entries in the snapshot.
    pub visited: usize,
    /// Entries whose visitor failed, with the failure.
    pub failures: Vec<(ConnectionEntry, E)>,
}

impl<E> VisitReport<E> {
    /// Number of entries whose visitor succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.visited - self.failures.len()
    }
}

/// The set of currently open connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    next_seq: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateConnection`] if the handle is
    /// already present.
    pub fn add(
        &self,
        id: ConnectionId,
        identity: Identity,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<ConnectionEntry, RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = ConnectionEntry::new(id.clone(), identity, sink, seq);
        entries.insert(id, entry.clone());

        debug!(
            connection = %entry.id,
            identity = %entry.identity,
            total = entries.len(),
            "Registered connection"
        );
        Ok(entry)
    }

    /// Unregister a connection. Removing an absent handle is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(id);
        if removed.is_some() {
            debug!(connection = %id, total = entries.len(), "Unregistered connection");
        } else {
            trace!(connection = %id, "Remove of unknown connection ignored");
        }
        removed
    }

    /// Point-in-time copy of every entry.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Run `visitor` concurrently on a snapshot of every entry.
    ///
    /// Failures are collected per entry; one failing or slow visitor never
    /// prevents the others from running.
    pub async fn for_each<F, Fut, E>(&self, visitor: F) -> VisitReport<E>
    where
        F: Fn(ConnectionEntry) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let snapshot = self.snapshot();
        let visited = snapshot.len();

        let results = join_all(snapshot.into_iter().map(|entry| {
            let visit = visitor(entry.clone());
            async move { (entry, visit.await) }
        }))
        .await;

        let failures = results
            .into_iter()
            .filter_map(|(entry, result)| result.err().map(|e| (entry, e)))
            .collect();

        VisitReport { visited, failures }
    }

    /// Find the connection addressed for direct delivery to `identity`.
    ///
    /// An identity may hold several connections; the earliest registered
    /// one that is still open is returned.
    #[must_use]
    pub fn find_by_identity(&self, identity: &Identity) -> Option<ConnectionEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| &entry.identity == identity)
            .min_by_key(|entry| entry.seq)
            .cloned()
    }

    /// Look up a connection by handle.
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Number of open connections held by `identity`.
    #[must_use]
    pub fn count_for(&self, identity: &Identity) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| &entry.identity == identity)
            .count()
    }

    /// Distinct identities with at least one open connection.
    #[must_use]
    pub fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.identity.clone())
            .collect();
        identities.sort();
        identities.dedup();
        identities
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use focus_transport::memory::{self, MemoryPeer};
    use focus_transport::{Outbound, TransportError};
    use std::sync::atomic::AtomicUsize;

    fn sink() -> (Arc<dyn ConnectionSink>, MemoryPeer) {
        let (sink, _stream, peer) = memory::pair();
        (sink, peer)
    }

    #[test]
    fn test_add_then_remove_restores_size() {
        let registry = ConnectionRegistry::new();
        let (existing, _p0) = sink();
        registry
            .add("conn-0".into(), Identity::new("u0"), existing)
            .unwrap();
        let before = registry.len();

        let (s, _p1) = sink();
        let id = ConnectionId::from("conn-1");
        registry.add(id.clone(), Identity::new("u1"), s).unwrap();
        assert_eq!(registry.len(), before + 1);
        assert!(registry.contains(&id));

        assert!(registry.remove(&id).is_some());
        assert_eq!(registry.len(), before);
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        assert!(registry.remove(&"never-added".into()).is_none());
        assert!(registry.is_empty());

        let (s, _p) = sink();
        let id = ConnectionId::from("conn-1");
        registry.add(id.clone(), Identity::new("u1"), s).unwrap();
        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let registry = ConnectionRegistry::new();
        let (s1, _p1) = sink();
        let (s2, _p2) = sink();
        registry.add("conn-1".into(), Identity::new("u1"), s1).unwrap();

        assert!(matches!(
            registry.add("conn-1".into(), Identity::new("u2"), s2),
            Err(RegistryError::DuplicateConnection(_))
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(&"conn-1".into()).unwrap().identity(),
            &Identity::new("u1")
        );
    }

    #[test]
    fn test_find_by_identity_prefers_earliest() {
        let registry = ConnectionRegistry::new();
        let (s1, _p1) = sink();
        let (s2, _p2) = sink();
        let (s3, _p3) = sink();
        registry.add("conn-a".into(), Identity::new("u1"), s1).unwrap();
        registry.add("conn-b".into(), Identity::new("u2"), s2).unwrap();
        registry.add("conn-c".into(), Identity::new("u1"), s3).unwrap();

        let found = registry.find_by_identity(&Identity::new("u1")).unwrap();
        assert_eq!(found.id().as_str(), "conn-a");
        assert_eq!(registry.count_for(&Identity::new("u1")), 2);
        assert!(registry.find_by_identity(&Identity::new("nobody")).is_none());

        registry.remove(&"conn-a".into());
        let found = registry.find_by_identity(&Identity::new("u1")).unwrap();
        assert_eq!(found.id().as_str(), "conn-c");
        assert_eq!(
            registry.identities(),
            vec![Identity::new("u1"), Identity::new("u2")]
        );
    }

    #[tokio::test]
    async fn test_for_each_reports_failures_per_entry() {
        let registry = ConnectionRegistry::new();
        let (good, mut good_peer) = sink();
        let (bad, bad_peer) = sink();
        bad_peer.fail_writes();
        registry.add("good".into(), Identity::new("u1"), good).unwrap();
        registry.add("bad".into(), Identity::new("u2"), bad).unwrap();

        let report = registry
            .for_each(|entry| async move { entry.sink().send(Outbound::text("hi")).await })
            .await;

        assert_eq!(report.visited, 2);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0.id().as_str(), "bad");
        assert!(matches!(report.failures[0].1, TransportError::SendFailed(_)));
        assert_eq!(good_peer.recv_text().await.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_for_each_runs_on_snapshot() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (s1, _p1) = sink();
        let (s2, _p2) = sink();
        registry.add("conn-1".into(), Identity::new("u1"), s1).unwrap();
        registry.add("conn-2".into(), Identity::new("u2"), s2).unwrap();

        let visits = AtomicUsize::new(0);
        let report = registry
            .for_each(|entry| {
                // Mutating the registry mid-pass must not deadlock or skip entries.
                registry.remove(entry.id());
                visits.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), ()>(()) }
            })
            .await;

        assert_eq!(report.visited, 2);
        assert_eq!(visits.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_add_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (s, _stream, _peer) = memory::pair();
                let id = ConnectionId::new(format!("conn-{i}"));
                registry.add(id.clone(), Identity::new(format!("u{}", i % 4)), s).unwrap();
                tokio::task::yield_now().await;
                if i % 2 == 0 {
                    registry.remove(&id);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), 16);
        assert_eq!(registry.identities().len(), 2);
    }

    #[tokio::test]
    async fn test_eviction_signal_is_latched() {
        let registry = ConnectionRegistry::new();
        let (s, _p) = sink();
        let entry = registry.add("conn-1".into(), Identity::new("u1"), s).unwrap();

        entry.evict();
        tokio::time::timeout(Duration::from_secs(1), entry.evicted())
            .await
            .expect("eviction signal lost");
    }
}
