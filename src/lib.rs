//! # roomchat
//!
//! A multi-room chat server: room-scoped real-time messaging over WebSocket,
//! with per-room access control, persisted history and encrypted message
//! payloads.
//!
//! ## Features
//!
//! - **Rooms**: public rooms open to every user; private rooms open to
//!   members and the admin
//! - **Real-time**: join, leave, send and history over a WebSocket hub
//! - **Encrypted transport**: AES-256-GCM payloads, sanitized before storage
//! - **Persistence**: SQLite-backed users, rooms and messages over a
//!   connection pool
//! - **Accounts**: argon2 password signup and login issuing bearer tokens
//!
//! ## Modules
//!
//! - [`hub`]: Messaging hub operations and failure policy
//! - [`websocket`]: Connection registry, frames and the `/ws` handler
//! - [`storage`]: Chat store contracts and the SQLite implementation
//! - [`crypto`]: Transport encryption
//! - [`sanitize`]: Markup sanitizing
//! - [`auth`]: Bearer credentials, passwords and caller identity
//! - [`api`]: REST API server with Axum
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roomchat::crypto::CryptoTransport;
//! use roomchat::hub::{Caller, HubSettings, MessagingHub};
//! use roomchat::storage::SqliteStore;
//! use roomchat::websocket::ConnectionRegistry;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteStore::in_memory()?;
//!     let alice = store.create_user("alice").await?;
//!     store.create_room("General", false, alice.id).await?;
//!
//!     let crypto = Arc::new(CryptoTransport::from_base64(&CryptoTransport::generate_key())?);
//!     let registry = Arc::new(ConnectionRegistry::default());
//!     let hub = MessagingHub::new(
//!         Arc::clone(&registry),
//!         Arc::new(store),
//!         Arc::clone(&crypto),
//!         HubSettings::default(),
//!     );
//!
//!     let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
//!     let connection_id = registry.register(tx)?;
//!     let claims = roomchat::auth::Claims {
//!         sub: alice.username.clone(),
//!         uid: Some(alice.id.to_string()),
//!         iss: "roomchat".into(),
//!         aud: "roomchat-clients".into(),
//!         iat: 0,
//!         exp: 0,
//!     };
//!     let caller = Caller::new(connection_id, claims);
//!
//!     hub.join_room(&caller, "General").await?;
//!     hub.send_message(&caller, "General", &crypto.encrypt("hello")?).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod hub;
pub mod logging;
pub mod sanitize;
pub mod storage;
pub mod websocket;

// Re-export top-level types for convenience
pub use storage::{
    ChatStore, HistoryEntry, Message, MessageStore, Room, RoomDirectory, SqliteStore,
    StorageError, StorageResult, StoreConfig, User, UserCredentials, UserDirectory,
};

pub use hub::{Caller, HubError, HubResult, HubSettings, MessagingHub};

pub use websocket::{
    websocket_handler, ClientMessage, ConnectionId, ConnectionRegistry, RegistryConfig,
    RegistryError, ServerEvent,
};

pub use api::{build_router, serve, ApiError, AppState};

pub use auth::{Claims, IdentityError, PasswordError, TokenAuthority, TokenError};

pub use crypto::{CryptoError, CryptoTransport};

pub use sanitize::Sanitizer;

pub use config::{Config, ConfigError, LoggingConfig};
