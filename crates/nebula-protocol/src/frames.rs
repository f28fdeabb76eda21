//! Frame types for the Nebula protocol.
//!
//! Every inbound client event is a `(name, args...)` tuple carried in an
//! [`Frame::Event`]. The server answers with events of its own, with
//! acknowledgments, or with structured [`Frame::Error`] rejections.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version, announced in the `connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Built-in liveness event sent by clients.
pub const PING_EVENT: &str = "ping";

/// Built-in reply to [`PING_EVENT`].
pub const PONG_EVENT: &str = "pong";

/// Error codes carried in [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded or was too large.
    pub const INVALID_FRAME: u16 = 1001;
    /// The event payload failed schema validation.
    pub const INVALID_EVENT: u16 = 1002;
    /// The event exceeded its per-connection rate budget.
    pub const RATE_LIMITED: u16 = 1003;
    /// A room operation failed.
    pub const ROOM_ERROR: u16 = 1004;
    /// The server failed to handle the event.
    pub const INTERNAL: u16 = 1005;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// A named event with positional arguments.
    #[serde(rename = "event")]
    Event {
        /// Optional request ID; when present the server acknowledges it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Event name.
        name: String,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Acknowledgment of an event that carried an ID.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged event.
        id: u64,
    },

    /// Rejection of an inbound frame or event.
    #[serde(rename = "error")]
    Error {
        /// ID of the rejected event (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
        /// Name of the rejected event, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },

    /// Connection established.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Gateway instance holding the connection.
        instance_id: String,
        /// Protocol version.
        version: u8,
        /// Recommended ping interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// Create an event frame without an acknowledgment ID.
    #[must_use]
    pub fn event(name: impl Into<String>, args: Vec<Value>) -> Self {
        Frame::Event {
            id: None,
            name: name.into(),
            args,
        }
    }

    /// Create an event frame that requests an acknowledgment.
    #[must_use]
    pub fn event_with_ack(id: u64, name: impl Into<String>, args: Vec<Value>) -> Self {
        Frame::Event {
            id: Some(id),
            name: name.into(),
            args,
        }
    }

    /// Create a `ping` event.
    #[must_use]
    pub fn ping() -> Self {
        Self::event(PING_EVENT, Vec::new())
    }

    /// Create a `pong` event.
    #[must_use]
    pub fn pong() -> Self {
        Self::event(PONG_EVENT, Vec::new())
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
            event: None,
        }
    }

    /// Create an Error frame rejecting a named event.
    #[must_use]
    pub fn rejection(
        id: Option<u64>,
        event: impl Into<String>,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        Frame::Error {
            id: id.unwrap_or(0),
            code,
            message: message.into(),
            event: Some(event.into()),
        }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        instance_id: impl Into<String>,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            instance_id: instance_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }

    /// Event name, if this is an event frame.
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Frame::Event { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Short frame kind, used for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Event { .. } => "event",
            Frame::Ack { .. } => "ack",
            Frame::Error { .. } => "error",
            Frame::Connected { .. } => "connected",
        }
    }
}
