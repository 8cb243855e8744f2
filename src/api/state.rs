//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::TokenAuthority;
use crate::config::{ApiConfig, HubConfig};
use crate::crypto::CryptoTransport;
use crate::hub::MessagingHub;
use crate::storage::{ChatStore, SqliteStore};
use crate::websocket::ConnectionRegistry;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Chat store for room management and readiness checks
    pub store: Arc<SqliteStore>,
    /// Messaging hub driven by WebSocket connections
    pub hub: Arc<MessagingHub>,
    /// Verifies bearer credentials on REST calls and handshakes
    pub tokens: Arc<TokenAuthority>,
    /// API configuration
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        store: SqliteStore,
        crypto: CryptoTransport,
        tokens: TokenAuthority,
        hub_config: &HubConfig,
        config: ApiConfig,
    ) -> Self {
        let store = Arc::new(store);
        let chat_store: Arc<dyn ChatStore> = store.clone();
        let registry = Arc::new(ConnectionRegistry::new(hub_config.registry_config()));
        let hub = Arc::new(MessagingHub::new(
            registry,
            chat_store,
            Arc::new(crypto),
            hub_config.hub_settings(),
        ));

        Self {
            store,
            hub,
            tokens: Arc::new(tokens),
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get WebSocket connection count
    pub fn ws_connection_count(&self) -> usize {
        self.hub.registry().connection_count()
    }
}
