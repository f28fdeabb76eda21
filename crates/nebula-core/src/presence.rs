//! Presence tracking across gateway instances.
//!
//! A connection is online while its presence record exists in the store.
//! Records are written on connect, refreshed on every heartbeat and expire on
//! their own after the TTL. The online counter next to them is a fast,
//! driftable approximation; a full enumeration of records is the source of
//! truth and is only paid for when the counter is missing or unusable.
//!
//! The tracker also keeps the set of connections held by this process. When
//! the store fails a write, the tracker switches to degraded mode and
//! snapshots fall back to that local set if the store still cannot answer.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::store::{PresenceStore, StoreError};

/// Default presence record TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Presence errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The store failed during a connect, disconnect, or heartbeat.
    #[error("Presence store unavailable during {op}: {source}")]
    StoreUnavailable {
        /// Operation that failed.
        op: &'static str,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// Both the counter read and the reconciliation scan failed.
    #[error("{0}")]
    Snapshot(#[source] StoreError),
}

/// Where a snapshot's number came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    /// The online counter.
    Counter,
    /// A full enumeration of presence records.
    Reconciled,
    /// This process's own connections (store unavailable).
    Local,
}

/// Point-in-time online count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresenceSnapshot {
    /// Number of online connections.
    pub online: u64,
    /// How `online` was obtained.
    #[serde(skip)]
    pub source: SnapshotSource,
}

/// Local bookkeeping for one connection held by this process.
#[derive(Debug, Clone, Copy, Default)]
struct LocalEntry {
    /// The counter was incremented for this connection.
    counted: bool,
}

/// Presence adapter used by the gateway.
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    instance_id: String,
    ttl: Duration,
    local: DashMap<String, LocalEntry>,
    degraded: AtomicBool,
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("store", &self.store.name())
            .field("instance_id", &self.instance_id)
            .field("ttl", &self.ttl)
            .field("local", &self.local.len())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl PresenceTracker {
    /// Create a tracker writing records owned by `instance_id`.
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>, instance_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            ttl,
            local: DashMap::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Register a new connection.
    ///
    /// The connection is always tracked locally, even if the store fails.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::StoreUnavailable`] if the record or the
    /// counter could not be written.
    pub async fn on_connect(&self, connection_id: &str) -> Result<(), PresenceError> {
        self.local
            .insert(connection_id.to_string(), LocalEntry::default());

        self.store
            .record(connection_id, &self.instance_id, self.ttl)
            .await
            .map_err(|e| self.degrade("connect", e))?;

        self.store
            .increment()
            .await
            .map_err(|e| self.degrade("connect", e))?;

        if let Some(mut entry) = self.local.get_mut(connection_id) {
            entry.counted = true;
        }

        trace!(connection = %connection_id, "Presence recorded");
        Ok(())
    }

    /// Unregister a connection.
    ///
    /// The counter is only decremented for connections it was incremented
    /// for.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::StoreUnavailable`] if the store could not
    /// be updated.
    pub async fn on_disconnect(&self, connection_id: &str) -> Result<(), PresenceError> {
        let counted = self
            .local
            .remove(connection_id)
            .map_or(false, |(_, entry)| entry.counted);

        self.store
            .remove(connection_id)
            .await
            .map_err(|e| self.degrade("disconnect", e))?;

        if counted {
            self.store
                .decrement()
                .await
                .map_err(|e| self.degrade("disconnect", e))?;
        }

        trace!(connection = %connection_id, "Presence removed");
        Ok(())
    }

    /// Refresh the TTL of a connection's record. The counter is untouched.
    ///
    /// Heartbeats for connections this process no longer holds are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::StoreUnavailable`] if the record could not
    /// be refreshed.
    pub async fn heartbeat(&self, connection_id: &str) -> Result<(), PresenceError> {
        if !self.local.contains_key(connection_id) {
            debug!(connection = %connection_id, "Heartbeat for unknown connection ignored");
            return Ok(());
        }

        self.store
            .record(connection_id, &self.instance_id, self.ttl)
            .await
            .map_err(|e| self.degrade("heartbeat", e))
    }

    /// Current online count.
    ///
    /// Reads the counter; if it is absent, unparseable, or negative, or the
    /// read fails, enumerates every live record instead. In degraded mode a
    /// store failure falls back to the local connection count.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::Snapshot`] if both the counter read and the
    /// enumeration fail and the tracker is not degraded.
    pub async fn snapshot(&self) -> Result<PresenceSnapshot, PresenceError> {
        match self.store_snapshot().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) if self.is_degraded() => {
                warn!(error = %e, "Snapshot from store failed, serving local presence");
                Ok(PresenceSnapshot {
                    online: self.local_count() as u64,
                    source: SnapshotSource::Local,
                })
            }
            Err(e) => Err(PresenceError::Snapshot(e)),
        }
    }

    async fn store_snapshot(&self) -> Result<PresenceSnapshot, StoreError> {
        let counter = match self.store.read().await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "Counter read failed, reconciling");
                None
            }
        };

        if let Some(online) = counter.as_deref().and_then(parse_counter) {
            return Ok(PresenceSnapshot {
                online,
                source: SnapshotSource::Counter,
            });
        }

        let live = self.store.enumerate().await?;
        debug!(online = live.len(), raw_counter = ?counter, "Presence reconciled");
        Ok(PresenceSnapshot {
            online: live.len() as u64,
            source: SnapshotSource::Reconciled,
        })
    }

    fn degrade(&self, op: &'static str, source: StoreError) -> PresenceError {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(op, error = %source, "Presence store failed, tracking presence locally");
        }
        PresenceError::StoreUnavailable { op, source }
    }

    /// Whether a store write has failed since startup.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Number of connections held by this process.
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    /// Whether this process holds `connection_id`.
    #[must_use]
    pub fn is_local(&self, connection_id: &str) -> bool {
        self.local.contains_key(connection_id)
    }

    /// The instance id written into presence records.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Record TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }
}

fn parse_counter(raw: &str) -> Option<u64> {
    raw.trim().parse::<i64>().ok().and_then(|n| u64::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{FlakyStore, UnreachableStore};
    use crate::store::{KeySpace, MemoryPresenceStore};

    fn memory_tracker() -> (Arc<MemoryPresenceStore>, PresenceTracker) {
        let store = Arc::new(MemoryPresenceStore::new(KeySpace::new("test")));
        let tracker = PresenceTracker::new(store.clone(), "node-1", DEFAULT_TTL);
        (store, tracker)
    }

    #[tokio::test]
    async fn test_snapshot_tracks_connects_minus_disconnects() {
        let (_, tracker) = memory_tracker();
        let mut expected = 0u64;

        for round in 0..5u64 {
            for i in 0..(round + 3) {
                tracker.on_connect(&format!("c{round}-{i}")).await.unwrap();
                expected += 1;
            }
            for i in 0..round {
                tracker.on_disconnect(&format!("c{round}-{i}")).await.unwrap();
                expected -= 1;
            }
            assert_eq!(tracker.snapshot().await.unwrap().online, expected);
        }
    }

    #[tokio::test]
    async fn test_single_instance_scenario() {
        let (_, tracker) = memory_tracker();

        tracker.on_connect("A").await.unwrap();
        tracker.on_connect("B").await.unwrap();
        assert_eq!(tracker.snapshot().await.unwrap().online, 2);

        tracker.on_disconnect("A").await.unwrap();
        assert_eq!(tracker.snapshot().await.unwrap().online, 1);
    }

    #[tokio::test]
    async fn test_counter_trusted_until_absent() {
        let (store, tracker) = memory_tracker();
        tracker.on_connect("a").await.unwrap();
        tracker.on_connect("b").await.unwrap();

        store.set_raw(store.keys().count_key(), "5");
        let snapshot = tracker.snapshot().await.unwrap();
        assert_eq!(snapshot.online, 5);
        assert_eq!(snapshot.source, SnapshotSource::Counter);

        store.delete_raw(&store.keys().count_key());
        let snapshot = tracker.snapshot().await.unwrap();
        assert_eq!(snapshot.online, 2);
        assert_eq!(snapshot.source, SnapshotSource::Reconciled);
    }

    #[tokio::test]
    async fn test_unusable_counter_is_reconciled() {
        let (store, tracker) = memory_tracker();
        tracker.on_connect("a").await.unwrap();

        store.set_raw(store.keys().count_key(), "garbage");
        assert_eq!(tracker.snapshot().await.unwrap().online, 1);

        store.set_raw(store.keys().count_key(), "-3");
        assert_eq!(tracker.snapshot().await.unwrap().online, 1);
    }

    #[tokio::test]
    async fn test_store_down_falls_back_to_local() {
        let tracker = PresenceTracker::new(Arc::new(UnreachableStore), "node-1", DEFAULT_TTL);

        assert!(matches!(
            tracker.on_connect("a").await,
            Err(PresenceError::StoreUnavailable { op: "connect", .. })
        ));
        let _ = tracker.on_connect("b").await;
        let _ = tracker.on_disconnect("a").await;

        assert!(tracker.is_degraded());
        let snapshot = tracker.snapshot().await.unwrap();
        assert_eq!(snapshot.online, 1);
        assert_eq!(snapshot.source, SnapshotSource::Local);
    }

    #[tokio::test]
    async fn test_heartbeat_failure_degrades() {
        let store = Arc::new(FlakyStore::new());
        let tracker = PresenceTracker::new(store.clone(), "node-1", DEFAULT_TTL);
        tracker.on_connect("a").await.unwrap();
        assert!(!tracker.is_degraded());

        store.set_down(true);
        assert!(matches!(
            tracker.heartbeat("a").await,
            Err(PresenceError::StoreUnavailable { op: "heartbeat", .. })
        ));
        assert!(tracker.is_degraded());

        let snapshot = tracker.snapshot().await.unwrap();
        assert_eq!(snapshot.online, 1);
        assert_eq!(snapshot.source, SnapshotSource::Local);
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_surfaced() {
        let tracker = PresenceTracker::new(Arc::new(UnreachableStore), "node-1", DEFAULT_TTL);

        let err = tracker.snapshot().await.unwrap_err();
        assert!(matches!(err, PresenceError::Snapshot(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_heartbeat_leaves_counter_alone() {
        let (store, tracker) = memory_tracker();
        tracker.on_connect("a").await.unwrap();

        tracker.heartbeat("a").await.unwrap();
        tracker.heartbeat("a").await.unwrap();
        assert_eq!(store.get_raw(&store.keys().count_key()).as_deref(), Some("1"));
        assert_eq!(
            store.get_raw(&store.keys().socket_key("a")).as_deref(),
            Some("node-1")
        );
    }

    #[tokio::test]
    async fn test_heartbeat_after_disconnect_does_not_resurrect() {
        let (store, tracker) = memory_tracker();
        tracker.on_connect("a").await.unwrap();
        tracker.on_disconnect("a").await.unwrap();

        tracker.heartbeat("a").await.unwrap();
        assert!(store.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_without_heartbeat() {
        let (store, tracker) = memory_tracker();
        tracker.on_connect("quiet").await.unwrap();
        tracker.on_connect("chatty").await.unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(10)).await;
            tracker.heartbeat("chatty").await.unwrap();
        }

        // The counter still says 2; the scan only sees the refreshed record.
        assert_eq!(tracker.snapshot().await.unwrap().online, 2);
        store.delete_raw(&store.keys().count_key());
        assert_eq!(tracker.snapshot().await.unwrap().online, 1);
    }
}
