//! Room Routes
//!
//! Room management endpoints. The messaging hub reads whatever these write
//! on its next lookup.
//!
//! - GET /api/v1/rooms - Rooms visible to the caller
//! - POST /api/v1/rooms - Create a room (caller becomes admin)
//! - GET /api/v1/rooms/:id - Get a room
//! - POST /api/v1/rooms/:id/members - Add a member (admin only)
//! - GET /api/v1/rooms/:id/messages - Recent history (members only)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::auth::AuthUser;
use crate::api::dto::{
    AddMemberRequest, AddMemberResponse, CreateRoomRequest, ListRoomsResponse, RoomHistoryResponse,
    RoomResponse,
};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::storage::{MessageStore, RoomId};

/// Longest accepted room name, in characters
const MAX_ROOM_NAME_LEN: usize = 64;

/// GET /api/v1/rooms
///
/// Public rooms plus the private rooms the caller administers or belongs to.
pub async fn list_rooms(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<Json<ListRoomsResponse>> {
    let rooms = state.store.list_rooms_visible_to(user.user_id).await?;

    let rooms: Vec<RoomResponse> = rooms
        .into_iter()
        .map(|room| RoomResponse::for_caller(room, user.user_id))
        .collect();

    Ok(Json(ListRoomsResponse {
        count: rooms.len(),
        rooms,
    }))
}

/// GET /api/v1/rooms/:id
///
/// Private rooms the caller cannot access are reported as not found.
pub async fn get_room(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<RoomId>,
) -> ApiResult<Json<RoomResponse>> {
    let room = state
        .store
        .find_room_by_id(id)
        .await?
        .filter(|room| room.authorizes(user.user_id))
        .ok_or_else(|| ApiError::NotFound(format!("Room with id {} not found", id)))?;

    Ok(Json(RoomResponse::for_caller(room, user.user_id)))
}

/// GET /api/v1/rooms/:id/messages
///
/// Same window and ordering as the history a socket receives on join.
/// Content stays encrypted.
pub async fn get_room_messages(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<RoomId>,
) -> ApiResult<Json<RoomHistoryResponse>> {
    let room = state
        .store
        .find_room_by_id(id)
        .await?
        .filter(|room| room.authorizes(user.user_id))
        .ok_or_else(|| ApiError::NotFound(format!("Room with id {} not found", id)))?;

    let entries = state
        .store
        .recent_history(room.id, state.hub.history_limit())
        .await?;

    Ok(Json(RoomHistoryResponse {
        room_id: room.id,
        room: room.name,
        count: entries.len(),
        entries,
    }))
}

/// POST /api/v1/rooms
pub async fn create_room(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateRoomRequest>,
) -> ApiResult<(StatusCode, Json<RoomResponse>)> {
    let name = validate_room_name(&req.name)?;

    let room = state
        .store
        .create_room(name, req.is_private, user.user_id)
        .await?;

    tracing::info!(
        room_id = room.id,
        room = %room.name,
        is_private = room.is_private,
        admin = %user.username,
        "Room created"
    );

    Ok((
        StatusCode::CREATED,
        Json(RoomResponse::for_caller(room, user.user_id)),
    ))
}

/// POST /api/v1/rooms/:id/members
pub async fn add_member(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<RoomId>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<Json<AddMemberResponse>> {
    let room = state
        .store
        .find_room_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Room with id {} not found", id)))?;

    if room.admin_id != user.user_id {
        return Err(ApiError::Forbidden(
            "Only the room admin can add members".to_string(),
        ));
    }

    let member = state
        .store
        .find_user_by_name(req.username.trim())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("User '{}' not found", req.username)))?;

    if room.is_member(member.id) || !state.store.add_member(room.id, member.id).await? {
        return Err(ApiError::Conflict(format!(
            "User '{}' is already a member of '{}'",
            member.username, room.name
        )));
    }

    tracing::info!(
        room_id = room.id,
        room = %room.name,
        member = %member.username,
        "Member added"
    );

    Ok(Json(AddMemberResponse {
        room_id: room.id,
        user_id: member.id,
        username: member.username,
    }))
}

fn validate_room_name(name: &str) -> ApiResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("Room name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_ROOM_NAME_LEN {
        return Err(ApiError::Validation(format!(
            "Room name cannot exceed {} characters",
            MAX_ROOM_NAME_LEN
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_room_name() {
        assert_eq!(validate_room_name("  General ").unwrap(), "General");
        assert!(validate_room_name("   ").is_err());
        assert!(validate_room_name(&"x".repeat(65)).is_err());
        assert!(validate_room_name(&"x".repeat(64)).is_ok());
    }
}
