//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.
//! These types are serialized/deserialized to/from JSON.

use serde::{Deserialize, Serialize};

use crate::storage::{HistoryEntry, Room, RoomId, UserId};

// ============================================
// AUTH DTOs
// ============================================

/// Signup request
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub password: String,
}

/// Signup response
#[derive(Debug, Serialize, Deserialize)]
pub struct SignupResponse {
    pub user_id: UserId,
    pub username: String,
}

/// Login request
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Login response carrying the bearer credential
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: UserId,
    pub username: String,
    /// Expiration time (Unix timestamp)
    pub expires_at: i64,
}

// ============================================
// ROOM DTOs
// ============================================

/// Create room request
#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    /// Unique room name
    pub name: String,
    /// Private rooms admit only members and the admin
    #[serde(default)]
    pub is_private: bool,
}

/// Add member request
#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub username: String,
}

/// Room response
#[derive(Debug, Serialize, Deserialize)]
pub struct RoomResponse {
    pub id: RoomId,
    pub name: String,
    pub is_private: bool,
    pub admin_id: UserId,
    /// Member ids, ascending
    pub members: Vec<UserId>,
    /// Whether the caller administers this room
    pub is_admin: bool,
}

impl RoomResponse {
    pub fn for_caller(room: Room, caller: UserId) -> Self {
        let mut members: Vec<UserId> = room.members.into_iter().collect();
        members.sort_unstable();
        Self {
            id: room.id,
            is_admin: room.admin_id == caller,
            name: room.name,
            is_private: room.is_private,
            admin_id: room.admin_id,
            members,
        }
    }
}

/// List rooms response
#[derive(Debug, Serialize, Deserialize)]
pub struct ListRoomsResponse {
    pub rooms: Vec<RoomResponse>,
    pub count: usize,
}

/// Add member response
#[derive(Debug, Serialize, Deserialize)]
pub struct AddMemberResponse {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
}

/// Room history response
///
/// `content` of every entry is ciphertext as stored.
#[derive(Debug, Serialize, Deserialize)]
pub struct RoomHistoryResponse {
    pub room_id: RoomId,
    pub room: String,
    /// Oldest first
    pub entries: Vec<HistoryEntry>,
    pub count: usize,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy" or "unhealthy"
    pub status: String,
    /// Store status: "ok" or "error"
    pub storage: String,
    /// Live WebSocket connections
    pub connections: usize,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Server version
    pub version: String,
}
