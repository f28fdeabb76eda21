//! Scale-out broadcast between gateway instances.
//!
//! Room emits and remote membership changes travel as JSON [`Envelope`]s on
//! a pub/sub channel. The adapter is best-effort: when it cannot be built,
//! [`connect`] hands back a [`NoopBroadcast`] and the gateway keeps serving
//! its own clients.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventSink, GatewayEvent};
use crate::store::mask_url;

/// Inbound envelopes buffered per subscriber before it lags.
const INBOUND_CAPACITY: usize = 1024;

/// Longest wait between resubscribe attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Broadcast errors.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The transport could not be reached.
    #[error("Broadcast transport unavailable: {0}")]
    Unavailable(String),

    /// The transport did not answer the named operation in time.
    #[error("Broadcast {0} timed out")]
    Timeout(&'static str),

    /// Envelope could not be encoded.
    #[error("Envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A message relayed between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Instance id of the publisher.
    pub origin: String,
    /// What to apply on the receiving side.
    #[serde(flatten)]
    pub message: Remote,
}

/// Envelope payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Remote {
    /// Deliver an event to every member of a room.
    Emit {
        /// Target room.
        room: String,
        /// Event name.
        event: String,
        /// Event arguments.
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Add a connection to a room.
    Join {
        /// Connection id.
        connection_id: String,
        /// Room name.
        room: String,
    },
    /// Remove a connection from a room.
    Leave {
        /// Connection id.
        connection_id: String,
        /// Room name.
        room: String,
    },
}

impl Envelope {
    /// Create an envelope.
    #[must_use]
    pub fn new(origin: impl Into<String>, message: Remote) -> Self {
        Self {
            origin: origin.into(),
            message,
        }
    }
}

/// Relay for envelopes between instances.
#[async_trait]
pub trait BroadcastAdapter: Send + Sync {
    /// Adapter name (e.g., "redis", "noop").
    fn name(&self) -> &'static str;

    /// Publish an envelope to every instance, including this one.
    async fn publish(&self, envelope: &Envelope) -> Result<(), BroadcastError>;

    /// Receive envelopes published by any instance.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

/// Adapter used in single-instance mode. Publishes go nowhere.
#[derive(Debug)]
pub struct NoopBroadcast {
    inbound: broadcast::Sender<Envelope>,
}

impl NoopBroadcast {
    /// Create a no-op adapter.
    #[must_use]
    pub fn new() -> Self {
        let (inbound, _) = broadcast::channel(1);
        Self { inbound }
    }
}

impl Default for NoopBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastAdapter for NoopBroadcast {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn publish(&self, _envelope: &Envelope) -> Result<(), BroadcastError> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }
}

/// In-process bus shared by several gateways in one process.
///
/// Every adapter cloned from the same bus sees every envelope.
#[derive(Debug, Clone)]
pub struct LocalBroadcast {
    bus: broadcast::Sender<Envelope>,
}

impl LocalBroadcast {
    /// Create a new bus.
    #[must_use]
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(INBOUND_CAPACITY);
        Self { bus }
    }
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastAdapter for LocalBroadcast {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), BroadcastError> {
        // No receivers is not an error; nobody else is listening yet.
        let _ = self.bus.send(envelope.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.bus.subscribe()
    }
}

/// Adapter relaying envelopes through Redis pub/sub.
pub struct RedisBroadcast {
    conn: ConnectionManager,
    channel: String,
    op_timeout: Duration,
    inbound: broadcast::Sender<Envelope>,
    listener: JoinHandle<()>,
}

impl std::fmt::Debug for RedisBroadcast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroadcast")
            .field("channel", &self.channel)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisBroadcast {
    /// Connect the publisher and subscribe to `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if either connection cannot be established within
    /// `op_timeout`.
    pub async fn connect(
        url: &str,
        channel: impl Into<String>,
        op_timeout: Duration,
    ) -> Result<Self, BroadcastError> {
        let channel = channel.into();
        info!(url = %mask_url(url), channel = %channel, "Connecting broadcast adapter to Redis");

        let client = Client::open(url).map_err(|e| BroadcastError::Unavailable(e.to_string()))?;
        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| BroadcastError::Timeout("connect"))?
            .map_err(|e| BroadcastError::Unavailable(e.to_string()))?;

        // Subscribe once up front so an unreachable server fails construction.
        let pubsub = tokio::time::timeout(op_timeout, subscribe(&client, &channel))
            .await
            .map_err(|_| BroadcastError::Timeout("subscribe"))??;

        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let listener = tokio::spawn(listen(client, channel.clone(), pubsub, inbound.clone()));

        info!(channel = %channel, "Broadcast adapter connected");
        Ok(Self {
            conn,
            channel,
            op_timeout,
            inbound,
            listener,
        })
    }
}

impl Drop for RedisBroadcast {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn subscribe(client: &Client, channel: &str) -> Result<redis::aio::PubSub, BroadcastError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| BroadcastError::Unavailable(e.to_string()))?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| BroadcastError::Unavailable(e.to_string()))?;
    Ok(pubsub)
}

/// Forward messages from the subscription, resubscribing with exponential
/// backoff whenever the stream ends.
async fn listen(
    client: Client,
    channel: String,
    pubsub: redis::aio::PubSub,
    inbound: broadcast::Sender<Envelope>,
) {
    let mut pubsub = Some(pubsub);
    let mut backoff = Duration::from_millis(500);

    loop {
        let current = match pubsub.take() {
            Some(p) => p,
            None => match subscribe(&client, &channel).await {
                Ok(p) => {
                    info!(channel = %channel, "Broadcast subscription restored");
                    backoff = Duration::from_millis(500);
                    p
                }
                Err(e) => {
                    warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Broadcast resubscribe failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            },
        };

        let mut messages = current.into_on_message();
        while let Some(msg) = messages.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Dropping non-text broadcast payload");
                    continue;
                }
            };
            match serde_json::from_str::<Envelope>(&payload) {
                Ok(envelope) => {
                    // No receivers just means the gateway has not started yet.
                    let _ = inbound.send(envelope);
                }
                Err(e) => warn!(error = %e, "Dropping malformed broadcast envelope"),
            }
        }

        warn!(channel = %channel, "Broadcast subscription ended, resubscribing");
    }
}

#[async_trait]
impl BroadcastAdapter for RedisBroadcast {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), BroadcastError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = tokio::time::timeout(
            self.op_timeout,
            conn.publish(&self.channel, payload),
        )
        .await
        .map_err(|_| BroadcastError::Timeout("publish"))?
        .map_err(|e| BroadcastError::Unavailable(e.to_string()))?;

        debug!(channel = %self.channel, receivers, "Envelope published");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }
}

/// Build the broadcast adapter for the given configuration.
///
/// Without a `redis_url` this is a [`NoopBroadcast`]. If the Redis adapter
/// cannot be built, an [`GatewayEvent::AdapterInitFailed`] is emitted and a
/// [`NoopBroadcast`] is returned instead.
pub async fn connect(
    redis_url: Option<&str>,
    channel: &str,
    op_timeout: Duration,
    sink: &dyn EventSink,
) -> Arc<dyn BroadcastAdapter> {
    let Some(url) = redis_url else {
        info!("No broadcast transport configured, running single-instance");
        return Arc::new(NoopBroadcast::new());
    };

    match RedisBroadcast::connect(url, channel, op_timeout).await {
        Ok(adapter) => Arc::new(adapter),
        Err(e) => {
            sink.emit(&GatewayEvent::AdapterInitFailed {
                adapter: "redis",
                error: e.to_string(),
            });
            Arc::new(NoopBroadcast::new())
        }
    }
}
