//! Core data types for the chat store
//!
//! This module defines the records the hub reads and writes:
//! - `User`: an identity referenced by id from rooms and messages
//! - `Room`: a named channel with a privacy flag, one admin and a member set
//! - `Message`: an immutable chat message
//! - `HistoryEntry`: a persisted message projected for display

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Numeric user identifier
pub type UserId = i64;

/// Numeric room identifier
pub type RoomId = i64;

/// Numeric message identifier
pub type MessageId = i64;

/// A registered user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

/// A user with the password hash stored for it
///
/// Users created by the admin CLI have no password and cannot log in
/// through the API.
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user: User,
    pub password_hash: Option<String>,
}

/// A chat room and its access list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    /// Unique room name, used by clients to address the room
    pub name: String,
    pub is_private: bool,
    /// The creator; always authorized regardless of membership
    pub admin_id: UserId,
    pub members: HashSet<UserId>,
}

impl Room {
    /// Whether `user_id` may join, send to, or read this room
    ///
    /// Public rooms admit every authenticated user. Private rooms admit
    /// members and the admin.
    pub fn authorizes(&self, user_id: UserId) -> bool {
        !self.is_private || self.admin_id == user_id || self.members.contains(&user_id)
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        self.members.contains(&user_id)
    }
}

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    /// Sanitized text, encrypted with the transport key
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A message about to be persisted
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl NewMessage {
    /// Create a message stamped with the current UTC time
    pub fn now(room_id: RoomId, user_id: UserId, content: impl Into<String>) -> Self {
        Self {
            room_id,
            user_id,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A message as delivered to clients in a history payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: MessageId,
    /// Ciphertext exactly as stored
    pub content: String,
    /// ISO-8601 UTC timestamp with millisecond precision
    pub timestamp: String,
    /// Author's display name
    pub username: String,
}

/// Render a timestamp the way every client-facing payload carries it
///
/// Format: `YYYY-MM-DDTHH:MM:SS.mmmZ`
pub fn iso8601(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Convert stored milliseconds back into a UTC timestamp
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
