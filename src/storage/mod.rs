//! Chat Store
//!
//! Persistence for users, rooms and messages:
//!
//! - **types**: Core records (User, Room, Message, HistoryEntry)
//! - **sqlite**: SQLite-backed store implementing every trait below
//! - **error**: Error types
//!
//! The hub only depends on the three read/write contracts defined here,
//! so tests can wrap or replace the store.
//!
//! # Architecture
//!
//! ```text
//! Hub ─┬─ UserDirectory::find_user           (identity → username)
//!      ├─ RoomDirectory::find_room_by_name   (authorization, always fresh)
//!      └─ MessageStore::{append, recent_history}
//!                      │
//!                      ▼
//!             SqliteStore (pooled connections, one transaction per call,
//!                          cancelled when the store timeout expires)
//! ```

pub mod error;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use sqlite::{SqliteStore, StoreConfig};
pub use types::{
    iso8601, HistoryEntry, Message, MessageId, NewMessage, Room, RoomId, User, UserCredentials,
    UserId,
};

use async_trait::async_trait;

/// Resolves user ids to users
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: UserId) -> StorageResult<Option<User>>;
}

/// Read path of the room directory
///
/// Implementations must not cache indefinitely: membership changes made
/// through room management have to be visible on the next call.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn find_room_by_name(&self, name: &str) -> StorageResult<Option<Room>>;
}

/// Append-only message persistence
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message as a single-row insert
    async fn append(&self, message: NewMessage) -> StorageResult<Message>;

    /// The `limit` most recent messages of a room, oldest first
    async fn recent_history(&self, room_id: RoomId, limit: usize)
        -> StorageResult<Vec<HistoryEntry>>;
}

/// Everything the messaging hub needs from persistence
pub trait ChatStore: UserDirectory + RoomDirectory + MessageStore {}

impl<T: UserDirectory + RoomDirectory + MessageStore> ChatStore for T {}
