//! WebSocket Message Types
//!
//! Defines the frames exchanged between chat clients and the server.
//! Both directions are JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::storage::HistoryEntry;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a room, receive its history and announce the join
    JoinRoom { room: String },
    /// Unsubscribe from a room and announce the departure
    LeaveRoom { room: String },
    /// Post a message to a room
    SendMessage {
        room: String,
        /// Encrypted message text
        content: String,
    },
    /// Fetch the recent history of a room
    GetHistory { room: String },
    /// Ping for keepalive
    Ping,
}

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection established
    Connected {
        /// Unique connection identifier
        connection_id: String,
    },
    /// Recent messages of a room, oldest first
    HistoryDelivered {
        room: String,
        entries: Vec<HistoryEntry>,
    },
    /// A chat message or system notice in a room
    MessageReceived {
        room: String,
        /// Author's username; `None` for system notices
        sender: Option<String>,
        /// Encrypted text
        content: String,
        /// ISO-8601 UTC timestamp
        timestamp: String,
    },
    /// The caller may not access the room
    AccessDenied { message: String },
    /// The caller's request failed
    OperationError { message: String },
    /// Pong response to ping
    Pong,
}

impl ServerEvent {
    pub fn access_denied() -> Self {
        ServerEvent::AccessDenied {
            message: "You do not have access to this room.".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::OperationError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_deserialize_join() {
        let json = r#"{"type": "join_room", "room": "General"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom {
                room: "General".to_string()
            }
        );
    }

    #[test]
    fn test_client_message_deserialize_send() {
        let json = r#"{"type": "send_message", "room": "General", "content": "q83v"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::SendMessage { room, content } => {
                assert_eq!(room, "General");
                assert_eq!(content, "q83v");
            }
            _ => panic!("Expected SendMessage"),
        }
    }

    #[test]
    fn test_client_message_deserialize_ping() {
        let json = r#"{"type": "ping"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_client_message_rejects_missing_room() {
        let json = r#"{"type": "leave_room"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_system_notice_serializes_null_sender() {
        let event = ServerEvent::MessageReceived {
            room: "General".to_string(),
            sender: None,
            content: "abc".to_string(),
            timestamp: "2024-10-07T14:26:41.005Z".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"message_received\""));
        assert!(json.contains("\"sender\":null"));
    }

    #[test]
    fn test_history_serializes_entries() {
        let event = ServerEvent::HistoryDelivered {
            room: "General".to_string(),
            entries: vec![HistoryEntry {
                id: 3,
                content: "abc".to_string(),
                timestamp: "2024-10-07T14:26:41.005Z".to_string(),
                username: "alice".to_string(),
            }],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"history_delivered\""));
        assert!(json.contains("\"username\":\"alice\""));
        assert!(json.contains("\"id\":3"));
    }

    #[test]
    fn test_access_denied_serialize() {
        let json = serde_json::to_string(&ServerEvent::access_denied()).unwrap();
        assert!(json.contains("\"type\":\"access_denied\""));
        assert!(json.contains("You do not have access to this room."));
    }
}
