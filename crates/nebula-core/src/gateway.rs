//! Connection gateway.
//!
//! A [`Gateway`] owns everything a process needs to serve connections: the
//! presence tracker, the schema registry, the room registry, the scale-out
//! adapter and the event sink. Transports call [`Gateway::connect`] once per
//! accepted connection and feed the resulting [`Session`] every inbound
//! frame; replies are queued on the connection's outbox.
//!
//! ```text
//! frame ──▶ Session ──▶ limiter ──▶ validator ──▶ handler ──▶ outbox(es)
//!                                                    │
//!                                                    ▼
//!                                            BroadcastAdapter ──▶ other instances
//! ```

use async_trait::async_trait;
use nebula_protocol::{codes, Frame, PING_EVENT};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastAdapter, Envelope, NoopBroadcast, Remote};
use crate::events::{DisconnectReason, EventSink, GatewayEvent, TracingSink};
use crate::limiter::{RateLimitConfig, RateLimiter};
use crate::presence::{PresenceError, PresenceSnapshot, PresenceTracker, DEFAULT_TTL};
use crate::rooms::{validate_room_name, Outbox, RoomError, RoomRegistry, DEFAULT_MAX_ROOMS_PER_CONNECTION};
use crate::store::PresenceStore;
use crate::validator::{SchemaRegistry, MAX_EVENT_NAME_LENGTH};

/// Built-in event joining a room.
pub const JOIN_EVENT: &str = "join";

/// Built-in event leaving a room.
pub const LEAVE_EVENT: &str = "leave";

/// Built-in event emitting to a room.
pub const EMIT_EVENT: &str = "emit";

/// Default connection limit.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100_000;

/// Default client ping interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-connection, per-event rate limit.
    pub rate_limit: RateLimitConfig,
    /// Presence record TTL.
    pub presence_ttl: Duration,
    /// Maximum concurrent connections on this instance.
    pub max_connections: usize,
    /// Maximum rooms a connection may join.
    pub max_rooms_per_connection: usize,
    /// Ping interval advertised to clients.
    pub heartbeat_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            presence_ttl: DEFAULT_TTL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_rooms_per_connection: DEFAULT_MAX_ROOMS_PER_CONNECTION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Gateway errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The connection limit was reached.
    #[error("Connection limit reached ({0})")]
    AtCapacity(usize),

    /// The gateway is stopping.
    #[error("Gateway is shutting down")]
    ShuttingDown,
}

/// Error returned by an application handler.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, presence being recorded.
    Connecting,
    /// Accepting events.
    Open,
    /// Presence being released.
    Closing,
    /// Terminal.
    Closed,
}

/// What happened to an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Passed the limiter and validator and was handled.
    Delivered,
    /// Dropped by the rate limiter.
    RateLimited,
    /// Dropped by the validator, or not an event frame.
    Invalid(String),
    /// The handler rejected the event.
    Failed(String),
    /// The session is no longer open.
    Ignored,
}

/// What a handler sees of the gateway while handling one event.
pub struct EventContext<'a> {
    gateway: &'a Gateway,
    connection_id: &'a str,
    event: &'a str,
}

impl<'a> EventContext<'a> {
    /// Connection that sent the event.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.connection_id
    }

    /// Name of the event being handled.
    #[must_use]
    pub fn event(&self) -> &str {
        self.event
    }

    /// Queue a frame for the sending connection.
    pub fn reply(&self, frame: Frame) -> bool {
        self.gateway.send_to(self.connection_id, frame)
    }

    /// The gateway, for room operations and cross-connection sends.
    #[must_use]
    pub fn gateway(&self) -> &Gateway {
        self.gateway
    }
}

/// Application handler for a custom event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event that passed rate limiting and validation.
    async fn handle(&self, ctx: &EventContext<'_>, args: Vec<Value>) -> Result<(), HandlerError>;
}

/// Generate an instance id unique across restarts on a host.
#[must_use]
pub fn generate_instance_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("{}-{:x}", std::process::id(), nanos)
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    store: Arc<dyn PresenceStore>,
    instance_id: Option<String>,
    config: GatewayConfig,
    schemas: SchemaRegistry,
    broadcast: Arc<dyn BroadcastAdapter>,
    sink: Arc<dyn EventSink>,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl GatewayBuilder {
    /// Use a fixed instance id instead of a generated one.
    #[must_use]
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the schema registry. Defaults to the built-in schemas.
    #[must_use]
    pub fn schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Set the scale-out adapter. Defaults to [`NoopBroadcast`].
    #[must_use]
    pub fn broadcast(mut self, adapter: Arc<dyn BroadcastAdapter>) -> Self {
        self.broadcast = adapter;
        self
    }

    /// Set the event sink. Defaults to [`TracingSink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Register a handler for a custom event. Built-in events cannot be
    /// overridden.
    #[must_use]
    pub fn handler(mut self, event: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
        self.handlers.insert(event.into(), Arc::new(handler));
        self
    }

    /// Build the gateway.
    #[must_use]
    pub fn build(self) -> Arc<Gateway> {
        let instance_id = self.instance_id.unwrap_or_else(generate_instance_id);
        let presence = PresenceTracker::new(self.store, instance_id.clone(), self.config.presence_ttl);
        let (shutdown, _) = watch::channel(false);

        info!(
            instance_id = %instance_id,
            store = presence.store().name(),
            broadcast = self.broadcast.name(),
            handlers = self.handlers.len(),
            "Gateway created"
        );

        Arc::new(Gateway {
            rooms: RoomRegistry::new(self.config.max_rooms_per_connection),
            instance_id,
            config: self.config,
            presence,
            schemas: self.schemas,
            broadcast: self.broadcast,
            sink: self.sink,
            handlers: self.handlers,
            next_seq: AtomicU64::new(0),
            open_connections: AtomicUsize::new(0),
            idle: Notify::new(),
            shutdown,
            pump: Mutex::new(None),
        })
    }
}

/// A gateway instance.
pub struct Gateway {
    instance_id: String,
    config: GatewayConfig,
    presence: PresenceTracker,
    schemas: SchemaRegistry,
    rooms: RoomRegistry,
    broadcast: Arc<dyn BroadcastAdapter>,
    sink: Arc<dyn EventSink>,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    next_seq: AtomicU64,
    open_connections: AtomicUsize,
    idle: Notify,
    shutdown: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("instance_id", &self.instance_id)
            .field("connections", &self.connection_count())
            .field("presence", &self.presence)
            .field("broadcast", &self.broadcast.name())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Start building a gateway on top of a presence store.
    #[must_use]
    pub fn builder(store: Arc<dyn PresenceStore>) -> GatewayBuilder {
        GatewayBuilder {
            store,
            instance_id: None,
            config: GatewayConfig::default(),
            schemas: SchemaRegistry::with_builtins(),
            broadcast: Arc::new(NoopBroadcast::new()),
            sink: Arc::new(TracingSink),
            handlers: HashMap::new(),
        }
    }

    /// Start relaying envelopes from other instances.
    pub fn start(self: &Arc<Self>) {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.is_some() {
            return;
        }

        let mut inbound = self.broadcast.subscribe();
        let mut shutdown = ShutdownSignal(self.shutdown.subscribe());
        let gateway = Arc::clone(self);

        *pump = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.recv() => break,
                    received = inbound.recv() => match received {
                        Ok(envelope) => gateway.apply_remote(envelope),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Broadcast pump lagged, envelopes dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Broadcast pump stopped");
        }));

        info!(instance_id = %self.instance_id, broadcast = self.broadcast.name(), "Gateway started");
    }

    /// Signal every session to close and wait up to `grace` for them to
    /// release their presence.
    pub async fn stop(&self, grace: Duration) {
        self.shutdown.send_replace(true);
        info!(connections = self.connection_count(), "Gateway stopping");

        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }

        let deadline = Instant::now() + grace;
        loop {
            let idle = self.idle.notified();
            let remaining = self.connection_count();
            if remaining == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                warn!(remaining, "Gateway stopped with connections still open");
                break;
            }
        }

        info!(instance_id = %self.instance_id, "Gateway stopped");
    }

    /// Whether [`Gateway::stop`] has been called.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Open a session for a newly accepted connection.
    ///
    /// The `Connected` frame is queued on `outbox` before this returns. A
    /// presence store failure is reported to the sink and does not fail the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway is stopping or at capacity.
    pub async fn connect(self: &Arc<Self>, outbox: Outbox) -> Result<Session, GatewayError> {
        if self.is_stopping() {
            return Err(GatewayError::ShuttingDown);
        }

        let max = self.config.max_connections;
        if self.open_connections.fetch_add(1, Ordering::SeqCst) >= max {
            self.open_connections.fetch_sub(1, Ordering::SeqCst);
            return Err(GatewayError::AtCapacity(max));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}.{}", self.instance_id, seq);

        let mut session = Session {
            id,
            state: ConnectionState::Connecting,
            limiter: RateLimiter::new(self.config.rate_limit),
            gateway: Arc::clone(self),
            opened_at: Instant::now(),
            shutdown: ShutdownSignal(self.shutdown.subscribe()),
        };

        self.rooms.register(&session.id, outbox);
        if let Err(e) = self.presence.on_connect(&session.id).await {
            self.report(&e);
        }

        session.state = ConnectionState::Open;
        self.sink.emit(&GatewayEvent::Connected {
            connection_id: session.id.clone(),
        });

        let heartbeat = u32::try_from(self.config.heartbeat_interval.as_millis()).unwrap_or(u32::MAX);
        self.send_to(
            &session.id,
            Frame::connected(&session.id, &self.instance_id, heartbeat),
        );

        Ok(session)
    }

    /// Current online count across all instances sharing the store.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::Snapshot`] if the store cannot answer and
    /// this instance is not in degraded mode.
    pub async fn snapshot(&self) -> Result<PresenceSnapshot, PresenceError> {
        self.presence.snapshot().await
    }

    /// Queue a frame for a local connection.
    pub fn send_to(&self, connection_id: &str, frame: Frame) -> bool {
        self.rooms.send_to(connection_id, frame)
    }

    /// Deliver an event to every member of `room` on every instance.
    ///
    /// Returns the number of local members it was queued for.
    pub async fn emit_to_room(
        &self,
        room: &str,
        event: &str,
        args: Vec<Value>,
        except: Option<&str>,
    ) -> usize {
        let frame = Frame::event(event, args.clone());
        let delivered = self.rooms.deliver(room, &frame, except);

        self.relay(Remote::Emit {
            room: room.to_string(),
            event: event.to_string(),
            args,
        })
        .await;

        delivered
    }

    /// Add a connection held by any instance to a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid, or the connection is
    /// local and the join fails.
    pub async fn add_to_room(&self, connection_id: &str, room: &str) -> Result<(), RoomError> {
        if self.rooms.is_local(connection_id) {
            return self.rooms.join(connection_id, room);
        }
        validate_room_name(room).map_err(RoomError::InvalidRoom)?;
        self.relay(Remote::Join {
            connection_id: connection_id.to_string(),
            room: room.to_string(),
        })
        .await;
        Ok(())
    }

    /// Remove a connection held by any instance from a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is local and not in the room.
    pub async fn remove_from_room(&self, connection_id: &str, room: &str) -> Result<(), RoomError> {
        if self.rooms.is_local(connection_id) {
            return self.rooms.leave(connection_id, room);
        }
        self.relay(Remote::Leave {
            connection_id: connection_id.to_string(),
            room: room.to_string(),
        })
        .await;
        Ok(())
    }

    async fn relay(&self, message: Remote) {
        let envelope = Envelope::new(self.instance_id.clone(), message);
        if let Err(e) = self.broadcast.publish(&envelope).await {
            warn!(error = %e, adapter = self.broadcast.name(), "Broadcast publish failed, delivered locally only");
        }
    }

    /// Apply an envelope received from the scale-out adapter.
    fn apply_remote(&self, envelope: Envelope) {
        if envelope.origin == self.instance_id {
            return;
        }

        match envelope.message {
            Remote::Emit { room, event, args } => {
                let delivered = self.rooms.deliver(&room, &Frame::event(event, args), None);
                debug!(origin = %envelope.origin, room = %room, delivered, "Remote emit applied");
            }
            Remote::Join {
                connection_id,
                room,
            } if self.rooms.is_local(&connection_id) => {
                if let Err(e) = self.rooms.join(&connection_id, &room) {
                    debug!(connection = %connection_id, error = %e, "Remote join not applied");
                }
            }
            Remote::Leave {
                connection_id,
                room,
            } if self.rooms.is_local(&connection_id) => {
                if let Err(e) = self.rooms.leave(&connection_id, &room) {
                    debug!(connection = %connection_id, error = %e, "Remote leave not applied");
                }
            }
            Remote::Join { .. } | Remote::Leave { .. } => {}
        }
    }

    /// Release everything a connection holds.
    async fn release(&self, connection_id: &str, reason: DisconnectReason, opened_at: Instant) {
        self.rooms.unregister(connection_id);
        if let Err(e) = self.presence.on_disconnect(connection_id).await {
            self.report(&e);
        }

        self.sink.emit(&GatewayEvent::Disconnected {
            connection_id: connection_id.to_string(),
            reason,
            duration: opened_at.elapsed(),
        });

        if self.open_connections.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn report(&self, error: &PresenceError) {
        if let PresenceError::StoreUnavailable { op, source } = error {
            self.sink.emit(&GatewayEvent::StoreUnavailable {
                op,
                error: source.to_string(),
            });
        }
    }

    /// Instance id, also the prefix of every connection id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Presence tracker.
    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Room registry.
    #[must_use]
    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// Event sink.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Number of open sessions on this instance.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }
}

/// Resolves once the gateway starts stopping.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Wait for shutdown. Returns immediately if it already began.
    pub async fn recv(&mut self) {
        loop {
            let stopping = *self.0.borrow_and_update();
            if stopping {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Rejection sent back to the client when a handler fails.
struct Rejection {
    code: u16,
    message: String,
}

impl From<RoomError> for Rejection {
    fn from(e: RoomError) -> Self {
        Self {
            code: codes::ROOM_ERROR,
            message: e.to_string(),
        }
    }
}

/// One connection's view of the gateway.
///
/// Events are handled strictly in the order they are passed in. Dropping
/// an unclosed session releases its presence in the background.
pub struct Session {
    id: String,
    state: ConnectionState,
    limiter: RateLimiter,
    gateway: Arc<Gateway>,
    opened_at: Instant,
    shutdown: ShutdownSignal,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The owning gateway.
    #[must_use]
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Signal resolving when the gateway stops.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Handle one decoded inbound frame.
    pub async fn handle(&mut self, frame: Frame) -> EventOutcome {
        match frame {
            Frame::Event { id, name, args } => self.handle_event(id, &name, args).await,
            other => {
                let message = format!("unexpected {} frame", other.kind());
                self.reject_frame(message.clone());
                EventOutcome::Invalid(message)
            }
        }
    }

    /// Handle one inbound event: rate limit, validate, dispatch.
    pub async fn handle_event(&mut self, id: Option<u64>, name: &str, args: Vec<Value>) -> EventOutcome {
        if self.state != ConnectionState::Open {
            return EventOutcome::Ignored;
        }
        let gateway = Arc::clone(&self.gateway);

        if name.is_empty() || name.len() > MAX_EVENT_NAME_LENGTH {
            let message = format!("event name must be 1 to {MAX_EVENT_NAME_LENGTH} bytes");
            debug!(connection = %self.id, len = name.len(), "Event name rejected");
            gateway.send_to(
                &self.id,
                Frame::error(id.unwrap_or(0), codes::INVALID_FRAME, message.clone()),
            );
            return EventOutcome::Invalid(message);
        }

        if !self.limiter.allow(name) {
            gateway.sink.emit(&GatewayEvent::RateLimited {
                connection_id: self.id.clone(),
                event: name.to_string(),
            });
            gateway.send_to(
                &self.id,
                Frame::rejection(id, name, codes::RATE_LIMITED, "rate limit exceeded"),
            );
            return EventOutcome::RateLimited;
        }

        if let Err(e) = gateway.schemas.validate(name, &args) {
            gateway.sink.emit(&GatewayEvent::InvalidEvent {
                connection_id: self.id.clone(),
                event: name.to_string(),
                reason: e.reason.clone(),
            });
            gateway.send_to(
                &self.id,
                Frame::rejection(id, name, codes::INVALID_EVENT, e.reason.clone()),
            );
            return EventOutcome::Invalid(e.reason);
        }

        match self.dispatch(&gateway, name, args).await {
            Ok(()) => {
                gateway.sink.emit(&GatewayEvent::Delivered {
                    connection_id: self.id.clone(),
                    event: name.to_string(),
                });
                if let Some(id) = id {
                    gateway.send_to(&self.id, Frame::ack(id));
                }
                EventOutcome::Delivered
            }
            Err(rejection) => {
                gateway.send_to(
                    &self.id,
                    Frame::rejection(id, name, rejection.code, rejection.message.clone()),
                );
                EventOutcome::Failed(rejection.message)
            }
        }
    }

    async fn dispatch(&self, gateway: &Gateway, name: &str, args: Vec<Value>) -> Result<(), Rejection> {
        match name {
            PING_EVENT => {
                gateway.send_to(&self.id, Frame::pong());
                self.heartbeat();
                Ok(())
            }
            JOIN_EVENT => Ok(gateway.rooms.join(&self.id, str_arg(&args, 0))?),
            LEAVE_EVENT => Ok(gateway.rooms.leave(&self.id, str_arg(&args, 0))?),
            EMIT_EVENT => {
                let room = str_arg(&args, 0);
                validate_room_name(room).map_err(RoomError::InvalidRoom)?;
                let payload = args.get(2).cloned().into_iter().collect();
                gateway
                    .emit_to_room(room, str_arg(&args, 1), payload, Some(&self.id))
                    .await;
                Ok(())
            }
            _ => match gateway.handlers.get(name) {
                Some(handler) => {
                    let ctx = EventContext {
                        gateway,
                        connection_id: &self.id,
                        event: name,
                    };
                    handler.handle(&ctx, args).await.map_err(|e| Rejection {
                        code: codes::INTERNAL,
                        message: e.0,
                    })
                }
                None => {
                    debug!(connection = %self.id, event = %name, "No handler for event");
                    Ok(())
                }
            },
        }
    }

    /// Queue an invalid-frame error, e.g. for undecodable input.
    pub fn reject_frame(&self, message: impl Into<String>) {
        self.gateway
            .send_to(&self.id, Frame::error(0, codes::INVALID_FRAME, message));
    }

    /// Refresh this connection's presence in the background.
    ///
    /// The refresh runs to completion even if the handle is dropped, so the
    /// caller is never held up by a store round trip.
    pub fn heartbeat(&self) -> JoinHandle<()> {
        let gateway = Arc::clone(&self.gateway);
        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.presence.heartbeat(&id).await {
                gateway.report(&e);
            }
        })
    }

    /// Close the session, releasing its rooms, rate limiter and presence.
    ///
    /// The release runs on its own task: if this future is dropped midway,
    /// the release still completes.
    pub async fn close(mut self, reason: DisconnectReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;

        let gateway = Arc::clone(&self.gateway);
        let id = self.id.clone();
        let opened_at = self.opened_at;
        let release = tokio::spawn(async move { gateway.release(&id, reason, opened_at).await });
        if let Err(e) = release.await {
            warn!(connection = %self.id, error = %e, "Session release task failed");
        }

        self.state = ConnectionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        let gateway = Arc::clone(&self.gateway);
        let id = std::mem::take(&mut self.id);
        let opened_at = self.opened_at;
        let reason = DisconnectReason::TransportError("session dropped".to_string());

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { gateway.release(&id, reason, opened_at).await });
            }
            Err(_) => {
                // Without a runtime the record is left to expire.
                gateway.rooms.unregister(&id);
                gateway.open_connections.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or_default()
}
