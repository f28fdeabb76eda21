//! # nebula-core
//!
//! Transport-agnostic engine of the Nebula realtime gateway.
//!
//! - **Limiter** - Per-connection, per-event token buckets
//! - **Validator** - Schema registry for inbound events
//! - **Store** - Presence store capability (Redis or in-memory)
//! - **Presence** - Online tracking with TTL records and a reconciled counter
//! - **Rooms** - Room membership and local fan-out
//! - **Broadcast** - Scale-out relay between gateway instances
//! - **Events** - Structured gateway events
//! - **Gateway** - Connection sessions tying it all together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Session   │────▶│    Rooms    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   ▲
//!                            ▼                   │
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Presence   │     │  Broadcast  │
//!                     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌───────────────────────────────┐
//!                     │         Redis (shared)        │
//!                     └───────────────────────────────┘
//! ```

pub mod broadcast;
pub mod events;
pub mod gateway;
pub mod limiter;
pub mod presence;
pub mod rooms;
pub mod store;
pub mod validator;

pub use broadcast::{BroadcastAdapter, BroadcastError, Envelope, LocalBroadcast, NoopBroadcast, RedisBroadcast, Remote};
pub use events::{DisconnectReason, EventSink, GatewayEvent, TracingSink};
pub use gateway::{
    ConnectionState, EventContext, EventHandler, EventOutcome, Gateway, GatewayBuilder, GatewayConfig,
    GatewayError, HandlerError, Session, ShutdownSignal,
};
pub use limiter::{RateLimitConfig, RateLimiter, TokenBucket};
pub use presence::{PresenceError, PresenceSnapshot, PresenceTracker, SnapshotSource};
pub use rooms::{Outbox, RoomError, RoomRegistry, RoomStats};
pub use store::{KeySpace, MemoryPresenceStore, PresenceStore, RedisPresenceStore, StoreError};
pub use validator::{ArgKind, EventSchema, SchemaRegistry, ValidationError};
