//! Structured gateway events.
//!
//! Every connection state transition and every error in the gateway's
//! taxonomy is emitted exactly once as a [`GatewayEvent`] to an
//! [`EventSink`]. The default [`TracingSink`] turns them into log lines;
//! embedders can install their own sink (metrics, audit) and chain to
//! [`log_event`].

use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the connection.
    ClientClosed,
    /// The transport failed.
    TransportError(String),
    /// No inbound traffic within the idle timeout.
    IdleTimeout,
    /// The gateway is shutting down.
    ServerShutdown,
}

impl DisconnectReason {
    /// Short label, used for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::TransportError(_) => "transport_error",
            DisconnectReason::IdleTimeout => "idle_timeout",
            DisconnectReason::ServerShutdown => "server_shutdown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientClosed => f.write_str("client closed"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {e}"),
            DisconnectReason::IdleTimeout => f.write_str("idle timeout"),
            DisconnectReason::ServerShutdown => f.write_str("server shutdown"),
        }
    }
}

/// A gateway state transition or recovered error.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A connection opened.
    Connected {
        /// Connection id.
        connection_id: String,
    },
    /// A connection closed.
    Disconnected {
        /// Connection id.
        connection_id: String,
        /// Why it closed.
        reason: DisconnectReason,
        /// How long it was open.
        duration: Duration,
    },
    /// An event passed the limiter and validator and was handled.
    Delivered {
        /// Connection id.
        connection_id: String,
        /// Event name.
        event: String,
    },
    /// An event exceeded its rate budget and was dropped.
    RateLimited {
        /// Connection id.
        connection_id: String,
        /// Event name.
        event: String,
    },
    /// An event failed validation and was dropped.
    InvalidEvent {
        /// Connection id.
        connection_id: String,
        /// Event name.
        event: String,
        /// Validation failure.
        reason: String,
    },
    /// The presence store failed; presence continues locally.
    StoreUnavailable {
        /// Operation that failed.
        op: &'static str,
        /// Error message.
        error: String,
    },
    /// The scale-out adapter could not be built; running single-instance.
    AdapterInitFailed {
        /// Adapter that failed.
        adapter: &'static str,
        /// Error message.
        error: String,
    },
}

impl GatewayEvent {
    /// Short label, used for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            GatewayEvent::Connected { .. } => "connected",
            GatewayEvent::Disconnected { .. } => "disconnected",
            GatewayEvent::Delivered { .. } => "delivered",
            GatewayEvent::RateLimited { .. } => "rate_limited",
            GatewayEvent::InvalidEvent { .. } => "invalid_event",
            GatewayEvent::StoreUnavailable { .. } => "store_unavailable",
            GatewayEvent::AdapterInitFailed { .. } => "adapter_init_failed",
        }
    }
}

/// Receiver of gateway events.
pub trait EventSink: Send + Sync {
    /// Handle one event. Must not block.
    fn emit(&self, event: &GatewayEvent);
}

/// Sink that logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &GatewayEvent) {
        log_event(event);
    }
}

/// Log an event at the level matching its severity.
pub fn log_event(event: &GatewayEvent) {
    match event {
        GatewayEvent::Connected { connection_id } => {
            info!(connection = %connection_id, "Client connected");
        }
        GatewayEvent::Disconnected {
            connection_id,
            reason,
            duration,
        } => {
            info!(
                connection = %connection_id,
                reason = %reason,
                duration_ms = duration.as_millis() as u64,
                "Client disconnected"
            );
        }
        GatewayEvent::Delivered {
            connection_id,
            event,
        } => {
            debug!(connection = %connection_id, event = %event, "Event delivered");
        }
        GatewayEvent::RateLimited {
            connection_id,
            event,
        } => {
            warn!(connection = %connection_id, event = %event, "Event rate limited");
        }
        GatewayEvent::InvalidEvent {
            connection_id,
            event,
            reason,
        } => {
            warn!(connection = %connection_id, event = %event, reason = %reason, "Invalid event");
        }
        GatewayEvent::StoreUnavailable { op, error } => {
            warn!(op, error = %error, "Presence store unavailable");
        }
        GatewayEvent::AdapterInitFailed { adapter, error } => {
            warn!(adapter, error = %error, "Scale-out adapter unavailable, running single-instance");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records every event for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<GatewayEvent>>,
    }

    impl RecordingSink {
        pub(crate) fn labels(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(GatewayEvent::label)
                .collect()
        }

        pub(crate) fn events(&self) -> Vec<GatewayEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: &GatewayEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::IdleTimeout.to_string(), "idle timeout");
        assert_eq!(
            DisconnectReason::TransportError("reset".into()).to_string(),
            "transport error: reset"
        );
        assert_eq!(DisconnectReason::ServerShutdown.label(), "server_shutdown");
    }

    #[test]
    fn test_tracing_sink_accepts_every_event() {
        let sink = TracingSink;
        sink.emit(&GatewayEvent::RateLimited {
            connection_id: "c".into(),
            event: "emit".into(),
        });
        sink.emit(&GatewayEvent::AdapterInitFailed {
            adapter: "redis",
            error: "refused".into(),
        });
    }
}
