//! Hub error types and the failure policy applied to them

use thiserror::Error;

use crate::auth::IdentityError;
use crate::crypto::CryptoError;
use crate::storage::{StorageError, UserId};
use crate::websocket::{RegistryError, ServerEvent};

/// Errors that can end a hub operation
#[derive(Error, Debug)]
pub enum HubError {
    /// The connection's claims do not identify a user
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Room '{0}' not found")]
    RoomNotFound(String),

    #[error("User {user_id} may not access room '{room}'")]
    AccessDenied { user_id: UserId, room: String },

    /// The incoming payload could not be decrypted
    #[error("Failed to decrypt message: {0}")]
    Decryption(#[source] CryptoError),

    /// Nothing visible is left after decrypting and sanitizing
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Failed to encrypt outgoing content: {0}")]
    Encryption(#[source] CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] StorageError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// How loudly a failure is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Warn,
    Error,
}

impl HubError {
    pub fn severity(&self) -> Severity {
        match self {
            HubError::AccessDenied { .. } => Severity::Warn,
            HubError::Registry(_) => Severity::Debug,
            _ => Severity::Error,
        }
    }

    /// The event the caller receives for this failure, if any
    ///
    /// Identity and not-found failures stay silent so an unauthorized caller
    /// cannot tell a missing room from a forbidden one.
    pub fn caller_notice(&self) -> Option<ServerEvent> {
        match self {
            HubError::AccessDenied { .. } => Some(ServerEvent::access_denied()),
            HubError::Decryption(_) | HubError::EmptyMessage => {
                Some(ServerEvent::error("Failed to decrypt your message."))
            }
            HubError::Encryption(_) | HubError::Store(_) => {
                Some(ServerEvent::error("Failed to process your request."))
            }
            HubError::Identity(_)
            | HubError::UserNotFound(_)
            | HubError::RoomNotFound(_)
            | HubError::Registry(_) => None,
        }
    }
}

/// Result type alias for hub operations
pub type HubResult<T> = Result<T, HubError>;
