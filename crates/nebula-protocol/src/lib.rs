//! # nebula-protocol
//!
//! Wire protocol definitions for the Nebula realtime gateway.
//!
//! Clients and the gateway exchange [`Frame`]s over a persistent
//! bidirectional channel. Inbound client traffic is a stream of
//! `(name, args...)` events; the gateway answers with events, acks, or
//! structured error rejections.
//!
//! ## Example
//!
//! ```rust
//! use nebula_protocol::{codec, Frame};
//!
//! let frame = Frame::ping();
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use frames::{codes, Frame, PING_EVENT, PONG_EVENT, PROTOCOL_VERSION};
