//! Redis-backed presence store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{mask_url, KeySpace, PresenceStore, StoreError};

/// Keys requested per SCAN page during reconciliation.
const SCAN_PAGE_SIZE: usize = 100;

/// Presence store shared by every gateway instance through Redis.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    keys: KeySpace,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisPresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPresenceStore")
            .field("keys", &self.keys)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisPresenceStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server cannot be
    /// reached within `op_timeout`.
    pub async fn connect(
        url: &str,
        keys: KeySpace,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        info!(url = %mask_url(url), "Connecting presence store to Redis");

        let client = Client::open(url).map_err(map_err)?;
        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout("connect"))?
            .map_err(map_err)?;

        info!(prefix = %keys.prefix(), "Presence store connected");
        Ok(Self {
            conn,
            keys,
            op_timeout,
        })
    }

    /// Run a command with the configured timeout.
    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(map_err),
            Err(_) => Err(StoreError::Timeout(op)),
        }
    }
}

fn map_err(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Unavailable(e.to_string())
    } else if e.is_timeout() {
        StoreError::Timeout("redis")
    } else {
        StoreError::Command(e.to_string())
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_shared(&self) -> bool {
        true
    }

    async fn record(
        &self,
        connection_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = self.keys.socket_key(connection_id);
        let mut conn = self.conn.clone();
        // SETEX needs at least one second.
        let seconds = ttl.as_secs().max(1);
        self.run("record", conn.set_ex(key, owner, seconds))
            .await
    }

    async fn remove(&self, connection_id: &str) -> Result<(), StoreError> {
        let key = self.keys.socket_key(connection_id);
        let mut conn = self.conn.clone();
        self.run("remove", conn.del(key)).await
    }

    async fn increment(&self) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        self.run("increment", conn.incr(self.keys.count_key(), 1))
            .await
    }

    async fn decrement(&self) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        self.run("decrement", conn.decr(self.keys.count_key(), 1))
            .await
    }

    async fn read(&self) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.run("read", conn.get(self.keys.count_key()))
            .await
    }

    async fn enumerate(&self) -> Result<Vec<String>, StoreError> {
        let pattern = self.keys.socket_pattern();
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut ids = Vec::new();
        let mut pages = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .run(
                    "enumerate",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_PAGE_SIZE)
                        .query_async(&mut conn),
                )
                .await?;

            pages += 1;
            ids.extend(
                keys.iter()
                    .filter_map(|k| self.keys.connection_id(k))
                    .map(str::to_string),
            );

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once.
        ids.sort_unstable();
        ids.dedup();

        debug!(pattern = %pattern, pages, live = ids.len(), "Reconciled presence records");
        Ok(ids)
    }
}
