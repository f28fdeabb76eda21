//! In-process presence store.
//!
//! Emulates the shared store's key semantics (expiring string values and an
//! integer counter) with a [`DashMap`], so a single gateway instance behaves
//! exactly like one member of a cluster. Expired entries are ignored on read
//! and purged lazily.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::{KeySpace, PresenceStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-memory presence store.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    keys: KeySpace,
    entries: DashMap<String, Entry>,
}

impl MemoryPresenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(keys: KeySpace) -> Self {
        Self {
            keys,
            entries: DashMap::new(),
        }
    }

    /// The key space this store writes under.
    #[must_use]
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Read a raw key, ignoring expired entries.
    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_live(now) {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.entries.remove_if(key, |_, e| !e.is_live(now));
            None
        }
    }

    /// Write a raw key without expiry.
    pub fn set_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at: None,
            },
        );
    }

    /// Delete a raw key. Returns `true` if a live entry was removed.
    pub fn delete_raw(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now))
    }

    /// Remaining time to live of a key, `None` if absent or persistent.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        entry
            .expires_at
            .filter(|at| now < *at)
            .map(|at| at.duration_since(now))
    }

    fn add_to_counter(&self, delta: i64) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(self.keys.count_key())
            .or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: None,
            });

        let current = if entry.is_live(now) {
            entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::Command("value is not an integer".to_string()))?
        } else {
            0
        };

        let next = current + delta;
        entry.value = next.to_string();
        entry.expires_at = None;
        Ok(next)
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_shared(&self) -> bool {
        false
    }

    async fn record(
        &self,
        connection_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = self.keys.socket_key(connection_id);
        trace!(key = %key, ttl_secs = ttl.as_secs(), "Recording presence");
        self.entries.insert(
            key,
            Entry {
                value: owner.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, connection_id: &str) -> Result<(), StoreError> {
        self.entries.remove(&self.keys.socket_key(connection_id));
        Ok(())
    }

    async fn increment(&self) -> Result<i64, StoreError> {
        self.add_to_counter(1)
    }

    async fn decrement(&self) -> Result<i64, StoreError> {
        self.add_to_counter(-1)
    }

    async fn read(&self) -> Result<Option<String>, StoreError> {
        Ok(self.get_raw(&self.keys.count_key()))
    }

    async fn enumerate(&self) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));

        Ok(self
            .entries
            .iter()
            .filter_map(|e| self.keys.connection_id(e.key()).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryPresenceStore {
        MemoryPresenceStore::new(KeySpace::new("t"))
    }

    #[tokio::test]
    async fn test_record_and_enumerate() {
        let store = store();
        store.record("a", "node-1", Duration::from_secs(30)).await.unwrap();
        store.record("b", "node-1", Duration::from_secs(30)).await.unwrap();

        let mut ids = store.enumerate().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.get_raw("t:sockets:a").as_deref(), Some("node-1"));

        store.remove("a").await.unwrap();
        assert_eq!(store.enumerate().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_counter_ops() {
        let store = store();
        assert_eq!(store.read().await.unwrap(), None);
        assert_eq!(store.increment().await.unwrap(), 1);
        assert_eq!(store.increment().await.unwrap(), 2);
        assert_eq!(store.decrement().await.unwrap(), 1);
        assert_eq!(store.read().await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_counter_rejects_garbage() {
        let store = store();
        store.set_raw("t:count", "not-a-number");
        assert!(matches!(
            store.increment().await,
            Err(StoreError::Command(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_expire() {
        let store = store();
        store.record("a", "node-1", Duration::from_secs(30)).await.unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(store.enumerate().await.unwrap().len(), 1);
        assert_eq!(store.ttl("t:sockets:a"), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.enumerate().await.unwrap().is_empty());
        assert_eq!(store.get_raw("t:sockets:a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerecord_refreshes_ttl() {
        let store = store();
        store.record("a", "n", Duration::from_secs(30)).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        store.record("a", "n", Duration::from_secs(30)).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(store.enumerate().await.unwrap(), vec!["a"]);
    }
}
