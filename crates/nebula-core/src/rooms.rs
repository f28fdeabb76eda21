//! Room membership and local fan-out.
//!
//! Rooms are named groups of connections. The registry also owns each local
//! connection's outbox, so both room deliveries and membership changes
//! requested by other gateway instances can be applied to any connection
//! this process holds.

use dashmap::{DashMap, DashSet};
use nebula_protocol::Frame;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Default room limit per connection.
pub const DEFAULT_MAX_ROOMS_PER_CONNECTION: usize = 100;

/// Sending half of a connection's outbound frame queue.
pub type Outbox = mpsc::UnboundedSender<Frame>;

/// Room errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The connection is not held by this instance.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Not a member of the room.
    #[error("Not in room: {0}")]
    NotJoined(String),

    /// Already a member of the room.
    #[error("Already in room: {0}")]
    AlreadyJoined(String),

    /// Maximum rooms per connection reached.
    #[error("Maximum rooms per connection reached")]
    MaxRoomsReached,
}

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Registry of local connections and their rooms.
pub struct RoomRegistry {
    /// Room name -> member connection ids.
    rooms: DashMap<String, DashSet<String>>,
    /// Connection id -> joined room names.
    memberships: DashMap<String, DashSet<String>>,
    /// Connection id -> outbound queue.
    outboxes: DashMap<String, Outbox>,
    max_rooms_per_connection: usize,
}

impl RoomRegistry {
    /// Create a registry.
    #[must_use]
    pub fn new(max_rooms_per_connection: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            outboxes: DashMap::new(),
            max_rooms_per_connection,
        }
    }

    /// Register a local connection's outbox.
    pub fn register(&self, connection_id: &str, outbox: Outbox) {
        self.outboxes.insert(connection_id.to_string(), outbox);
        self.memberships
            .entry(connection_id.to_string())
            .or_default();
    }

    /// Remove a connection from every room and drop its outbox.
    pub fn unregister(&self, connection_id: &str) {
        self.leave_all(connection_id);
        self.memberships.remove(connection_id);
        self.outboxes.remove(connection_id);
    }

    /// Whether the connection is held by this instance.
    #[must_use]
    pub fn is_local(&self, connection_id: &str) -> bool {
        self.outboxes.contains_key(connection_id)
    }

    /// Add a local connection to a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the connection is unknown,
    /// it already joined the room, or it reached its room limit.
    pub fn join(&self, connection_id: &str, room: &str) -> Result<(), RoomError> {
        validate_room_name(room).map_err(RoomError::InvalidRoom)?;

        let joined = self
            .memberships
            .get(connection_id)
            .ok_or_else(|| RoomError::UnknownConnection(connection_id.to_string()))?;

        if joined.contains(room) {
            return Err(RoomError::AlreadyJoined(room.to_string()));
        }
        if joined.len() >= self.max_rooms_per_connection {
            return Err(RoomError::MaxRoomsReached);
        }

        joined.insert(room.to_string());
        let members = self.rooms.entry(room.to_string()).or_insert_with(|| {
            debug!(room = %room, "Creating room");
            DashSet::new()
        });
        members.insert(connection_id.to_string());

        debug!(room = %room, connection = %connection_id, members = members.len(), "Joined room");
        Ok(())
    }

    /// Remove a connection from a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not in the room.
    pub fn leave(&self, connection_id: &str, room: &str) -> Result<(), RoomError> {
        let removed = self
            .memberships
            .get(connection_id)
            .and_then(|joined| joined.remove(room));
        if removed.is_none() {
            return Err(RoomError::NotJoined(room.to_string()));
        }

        self.remove_member(room, connection_id);
        debug!(room = %room, connection = %connection_id, "Left room");
        Ok(())
    }

    /// Remove a connection from every room it joined.
    pub fn leave_all(&self, connection_id: &str) {
        let rooms: Vec<String> = match self.memberships.get(connection_id) {
            Some(joined) => {
                let rooms = joined.iter().map(|r| r.clone()).collect();
                joined.clear();
                rooms
            }
            None => return,
        };

        for room in &rooms {
            self.remove_member(room, connection_id);
        }

        debug!(connection = %connection_id, rooms = rooms.len(), "Left all rooms");
    }

    fn remove_member(&self, room: &str, connection_id: &str) {
        if let Some(members) = self.rooms.get(room) {
            members.remove(connection_id);
        }
        if self.rooms.remove_if(room, |_, m| m.is_empty()).is_some() {
            debug!(room = %room, "Deleted empty room");
        }
    }

    /// Queue a frame for every local member of `room`, optionally skipping
    /// one connection.
    ///
    /// Returns the number of connections the frame was queued for.
    pub fn deliver(&self, room: &str, frame: &Frame, except: Option<&str>) -> usize {
        let targets: Vec<String> = match self.rooms.get(room) {
            Some(members) => members
                .iter()
                .filter(|m| Some(m.as_str()) != except)
                .map(|m| m.clone())
                .collect(),
            None => return 0,
        };

        let delivered = targets
            .iter()
            .filter(|target| self.send_to(target, frame.clone()))
            .count();

        trace!(room = %room, recipients = delivered, "Delivered to room");
        delivered
    }

    /// Queue a frame for a single local connection.
    ///
    /// Returns `false` if the connection is unknown or its queue is closed.
    pub fn send_to(&self, connection_id: &str, frame: Frame) -> bool {
        self.outboxes
            .get(connection_id)
            .is_some_and(|outbox| outbox.send(frame).is_ok())
    }

    /// Whether the connection is in the room.
    #[must_use]
    pub fn is_member(&self, connection_id: &str, room: &str) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(connection_id))
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            room_count: self.rooms.len(),
            connection_count: self.outboxes.len(),
            total_memberships: self.memberships.iter().map(|m| m.len()).sum(),
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROOMS_PER_CONNECTION)
    }
}

/// Room registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStats {
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Number of registered local connections.
    pub connection_count: usize,
    /// Total room memberships.
    pub total_memberships: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registered(registry: &RoomRegistry, id: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id, tx);
        rx
    }

    #[test]
    fn test_join_leave() {
        let registry = RoomRegistry::default();
        let _rx = registered(&registry, "conn-1");

        registry.join("conn-1", "lobby").unwrap();
        assert!(registry.room_exists("lobby"));
        assert!(registry.is_member("conn-1", "lobby"));
        assert_eq!(
            registry.join("conn-1", "lobby"),
            Err(RoomError::AlreadyJoined("lobby".to_string()))
        );

        registry.leave("conn-1", "lobby").unwrap();
        assert!(!registry.room_exists("lobby"));
        assert_eq!(
            registry.leave("conn-1", "lobby"),
            Err(RoomError::NotJoined("lobby".to_string()))
        );
    }

    #[test]
    fn test_room_name_validation() {
        assert!(validate_room_name("workspace:general").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("$system").is_err());
        assert!(validate_room_name("tab\there").is_err());
        assert!(validate_room_name(&"a".repeat(MAX_ROOM_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_unknown_connection() {
        let registry = RoomRegistry::default();
        assert_eq!(
            registry.join("ghost", "lobby"),
            Err(RoomError::UnknownConnection("ghost".to_string()))
        );
    }

    #[test]
    fn test_room_limit() {
        let registry = RoomRegistry::new(2);
        let _rx = registered(&registry, "c");

        registry.join("c", "a").unwrap();
        registry.join("c", "b").unwrap();
        assert_eq!(registry.join("c", "d"), Err(RoomError::MaxRoomsReached));
    }

    #[test]
    fn test_deliver_skips_sender() {
        let registry = RoomRegistry::default();
        let mut rx1 = registered(&registry, "c1");
        let mut rx2 = registered(&registry, "c2");
        registry.join("c1", "lobby").unwrap();
        registry.join("c2", "lobby").unwrap();

        let frame = Frame::event("message", vec![json!("hi")]);
        assert_eq!(registry.deliver("lobby", &frame, Some("c1")), 1);

        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), frame);
        assert_eq!(registry.deliver("nowhere", &frame, None), 0);
    }

    #[test]
    fn test_unregister_cleans_up() {
        let registry = RoomRegistry::default();
        let _rx = registered(&registry, "c1");
        registry.join("c1", "a").unwrap();
        registry.join("c1", "b").unwrap();

        registry.unregister("c1");

        assert!(!registry.is_local("c1"));
        assert_eq!(
            registry.stats(),
            RoomStats {
                room_count: 0,
                connection_count: 0,
                total_memberships: 0,
            }
        );
    }

    #[test]
    fn test_stats() {
        let registry = RoomRegistry::default();
        let _rx1 = registered(&registry, "c1");
        let _rx2 = registered(&registry, "c2");
        registry.join("c1", "a").unwrap();
        registry.join("c1", "b").unwrap();
        registry.join("c2", "a").unwrap();

        let stats = registry.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_memberships, 3);
    }
}
