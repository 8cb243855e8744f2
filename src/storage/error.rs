//! Storage error types
//!
//! Defines all errors that can occur in the persistence layer.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the chat store
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite reported a failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O operation failed (creating the data directory, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A store call did not finish within the configured bound
    #[error("Store operation '{op}' timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// The blocking task running the query panicked or was cancelled
    #[error("Store task failed: {0}")]
    Task(String),

    /// No pooled connection could be handed out
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// The caller gave up on the call before it committed; nothing was written
    #[error("Store call cancelled")]
    Cancelled,

    /// A row with the same unique key already exists
    #[error("Already exists: {0}")]
    Conflict(String),

    /// A referenced row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored value could not be interpreted
    #[error("Corrupt data: {0}")]
    Corruption(String),
}

impl StorageError {
    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Timeout { .. } | StorageError::Task(_) | StorageError::Pool(_)
        ) || matches!(
            self,
            StorageError::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
