//! Connection Registry
//!
//! Tracks live WebSocket connections and the rooms each one is subscribed
//! to. Both directions of the room ↔ connection multi-map live in sharded
//! concurrent maps, so operations on different rooms never contend on a
//! shared lock.
//!
//! Lock order is always `connections` before `groups`; broadcasting copies
//! the group before touching `connections`.

use dashmap::DashMap;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::ServerEvent;

/// Unique identifier for a WebSocket connection
pub type ConnectionId = String;

/// Live connections and their room subscriptions
pub struct ConnectionRegistry {
    /// Active connections: ConnectionId → ConnectionHandle
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Room subscriptions: room name → set of ConnectionIds
    groups: DashMap<String, HashSet<ConnectionId>>,
    config: RegistryConfig,
}

/// Configuration for the connection registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

/// Handle for sending events to a specific connection
struct ConnectionHandle {
    sender: mpsc::UnboundedSender<ServerEvent>,
    /// Rooms this connection is subscribed to
    rooms: HashSet<String>,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            connections: DashMap::new(),
            groups: DashMap::new(),
            config,
        }
    }

    /// Register a new connection
    ///
    /// Returns the connection ID on success, or an error if the connection
    /// limit has been reached.
    pub fn register(
        &self,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<ConnectionId, RegistryError> {
        if self.connections.len() >= self.config.max_connections {
            return Err(RegistryError::TooManyConnections(self.config.max_connections));
        }

        let id = Uuid::new_v4().to_string();
        self.connections.insert(
            id.clone(),
            ConnectionHandle {
                sender,
                rooms: HashSet::new(),
            },
        );

        tracing::info!(connection_id = %id, "WebSocket connected");
        Ok(id)
    }

    /// Unregister a connection and release all of its room subscriptions
    pub fn unregister(&self, id: &str) {
        let Some((_, handle)) = self.connections.remove(id) else {
            return;
        };

        for room in &handle.rooms {
            self.drop_from_group(room, id);
        }

        tracing::info!(
            connection_id = %id,
            rooms = handle.rooms.len(),
            "WebSocket disconnected"
        );
    }

    /// Subscribe a connection to a room's broadcasts
    ///
    /// Adding an existing subscription is a no-op.
    pub fn add(&self, id: &str, room: &str) -> Result<(), RegistryError> {
        let mut handle = self
            .connections
            .get_mut(id)
            .ok_or(RegistryError::ConnectionNotFound)?;

        handle.rooms.insert(room.to_string());
        self.groups
            .entry(room.to_string())
            .or_default()
            .insert(id.to_string());

        tracing::debug!(connection_id = %id, room = %room, "Subscribed to room");
        Ok(())
    }

    /// Unsubscribe a connection from a room
    ///
    /// Returns whether the connection was subscribed.
    pub fn remove(&self, id: &str, room: &str) -> bool {
        let was_subscribed = match self.connections.get_mut(id) {
            Some(mut handle) => handle.rooms.remove(room),
            None => false,
        };

        // Prune the group even if the connection is gone
        self.drop_from_group(room, id);

        tracing::debug!(
            connection_id = %id,
            room = %room,
            was_subscribed,
            "Unsubscribed from room"
        );
        was_subscribed
    }

    /// Send an event to every connection subscribed to `room`
    ///
    /// Returns the number of connections the event was queued for. Delivery
    /// is best effort: a connection closing concurrently may miss it.
    pub fn broadcast_to_room(&self, room: &str, event: &ServerEvent) -> usize {
        let members: Vec<ConnectionId> = match self.groups.get(room) {
            Some(group) => group.iter().cloned().collect(),
            None => return 0,
        };

        let mut sent_count = 0;
        for id in &members {
            if let Some(handle) = self.connections.get(id) {
                if handle.sender.send(event.clone()).is_ok() {
                    sent_count += 1;
                }
            }
        }

        tracing::trace!(room = %room, subscribers = sent_count, "Broadcast event");
        sent_count
    }

    /// Send an event to a single connection
    pub fn send_to_connection(&self, id: &str, event: ServerEvent) -> Result<(), RegistryError> {
        let handle = self
            .connections
            .get(id)
            .ok_or(RegistryError::ConnectionNotFound)?;

        handle
            .sender
            .send(event)
            .map_err(|_| RegistryError::SendFailed)
    }

    /// Get the current connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections subscribed to a room
    pub fn group_size(&self, room: &str) -> usize {
        self.groups.get(room).map(|g| g.len()).unwrap_or(0)
    }

    /// Rooms a connection is subscribed to
    pub fn rooms_of(&self, id: &str) -> HashSet<String> {
        self.connections
            .get(id)
            .map(|h| h.rooms.clone())
            .unwrap_or_default()
    }

    /// Whether a connection is subscribed to a room
    pub fn is_subscribed(&self, id: &str, room: &str) -> bool {
        self.groups
            .get(room)
            .map(|g| g.contains(id))
            .unwrap_or(false)
    }

    fn drop_from_group(&self, room: &str, id: &str) {
        if let Some(mut group) = self.groups.get_mut(room) {
            group.remove(id);
        }
        // Clean up empty room entries
        self.groups.remove_if(room, |_, group| group.is_empty());
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Errors that can occur in the connection registry
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("Connection not found")]
    ConnectionNotFound,

    #[error("Failed to send message")]
    SendFailed,
}
