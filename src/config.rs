//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::TokenSettings;
use crate::hub::{HubSettings, DEFAULT_HISTORY_LIMIT};
use crate::storage::StoreConfig;
use crate::websocket::RegistryConfig;

/// Upper bound accepted for `hub.history_limit`
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub crypto: CryptoConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Chat store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Upper bound for any single store call
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// How long SQLite waits on a locked database
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Pooled SQLite connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_db_path() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("roomchat").join("roomchat.db").to_string_lossy().to_string())
        .unwrap_or_else(|| "./roomchat.db".to_string())
}

fn default_store_timeout() -> u64 {
    5000
}

fn default_busy_timeout() -> u64 {
    2000
}

fn default_pool_size() -> usize {
    8
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            store_timeout_ms: default_store_timeout(),
            busy_timeout_ms: default_busy_timeout(),
            pool_size: default_pool_size(),
        }
    }
}

impl DatabaseConfig {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: PathBuf::from(&self.path),
            op_timeout: Duration::from_millis(self.store_timeout_ms),
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            pool_size: self.pool_size,
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins; empty allows any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
        }
    }
}

impl ApiConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Bearer credential configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret; required
    #[serde(default)]
    pub jwt_secret: String,

    #[serde(default = "default_issuer")]
    pub issuer: String,

    #[serde(default = "default_audience")]
    pub audience: String,

    #[serde(default = "default_token_ttl")]
    pub token_ttl_minutes: i64,
}

fn default_issuer() -> String {
    "roomchat".to_string()
}

fn default_audience() -> String {
    "roomchat-clients".to_string()
}

fn default_token_ttl() -> i64 {
    60 * 24
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: default_issuer(),
            audience: default_audience(),
            token_ttl_minutes: default_token_ttl(),
        }
    }
}

impl AuthConfig {
    pub fn token_settings(&self) -> TokenSettings {
        TokenSettings {
            secret: self.jwt_secret.clone(),
            issuer: self.issuer.clone(),
            audience: self.audience.clone(),
            ttl: chrono::Duration::minutes(self.token_ttl_minutes),
        }
    }
}

/// Transport encryption configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CryptoConfig {
    /// Base64-encoded 32-byte key shared with clients; required
    #[serde(default)]
    pub key: String,
}

/// Messaging hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_connections() -> usize {
    1000
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            history_limit: default_history_limit(),
        }
    }
}

impl HubConfig {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_connections: self.max_connections,
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            history_limit: self.history_limit,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// The first config file that exists in the default locations
    pub fn default_path() -> Option<PathBuf> {
        let candidates = [
            dirs::config_dir().map(|p| p.join("roomchat").join("config.toml")),
            Some(PathBuf::from("/etc/roomchat/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];
        first_existing(candidates.into_iter().flatten())
    }

    /// Load from the default locations, or from the environment alone when
    /// no config file exists
    ///
    /// A config file that exists but cannot be read or parsed is an error.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_with_env(&path),
            None => Ok(Self::from_env()),
        }
    }

    /// Check that the secrets the server cannot run without are present
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(ConfigError::Missing("auth.jwt_secret"));
        }
        if self.crypto.key.trim().is_empty() {
            return Err(ConfigError::Missing("crypto.key"));
        }
        if self.hub.history_limit == 0 || self.hub.history_limit > MAX_HISTORY_LIMIT {
            return Err(ConfigError::Invalid {
                field: "hub.history_limit",
                reason: format!("must be between 1 and {}", MAX_HISTORY_LIMIT),
            });
        }
        if self.database.pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "database.pool_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.database.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "database.store_timeout_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Database overrides
        if let Some(path) = var("ROOMCHAT_DB_PATH") {
            self.database.path = path;
        }
        if let Some(n) = var("ROOMCHAT_DB_POOL_SIZE").and_then(|v| v.parse().ok()) {
            self.database.pool_size = n;
        }

        // API overrides
        if let Some(host) = var("ROOMCHAT_API_HOST") {
            self.api.host = host;
        }
        if let Some(p) = var("ROOMCHAT_API_PORT").and_then(|v| v.parse().ok()) {
            self.api.port = p;
        }

        // Secrets
        if let Some(secret) = var("ROOMCHAT_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(key) = var("ROOMCHAT_CRYPTO_KEY") {
            self.crypto.key = key;
        }

        // Hub overrides
        if let Some(n) = var("ROOMCHAT_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.hub.max_connections = n;
        }
        if let Some(n) = var("ROOMCHAT_HISTORY_LIMIT").and_then(|v| v.parse().ok()) {
            self.hub.history_limit = n;
        }

        // Logging overrides
        if let Some(level) = var("ROOMCHAT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("ROOMCHAT_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

fn first_existing(candidates: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|path| path.exists())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# roomchat Configuration
#
# Environment variables override these settings:
# - ROOMCHAT_DB_PATH
# - ROOMCHAT_DB_POOL_SIZE
# - ROOMCHAT_API_HOST
# - ROOMCHAT_API_PORT
# - ROOMCHAT_JWT_SECRET
# - ROOMCHAT_CRYPTO_KEY
# - ROOMCHAT_MAX_CONNECTIONS
# - ROOMCHAT_HISTORY_LIMIT
# - ROOMCHAT_LOG_LEVEL
# - ROOMCHAT_LOG_FORMAT

[database]
# SQLite database file
path = "./roomchat.db"

# Upper bound for a single store call (ms)
store_timeout_ms = 5000

# How long to wait on a locked database (ms)
busy_timeout_ms = 2000

# Pooled connections; readers run concurrently with a writer
pool_size = 8

[api]
# API server host
host = "0.0.0.0"

# API server port
port = 8090

# Allowed CORS origins (empty list allows any origin)
cors_origins = ["http://localhost:5173", "http://127.0.0.1:5173"]

[auth]
# HS256 signing secret for bearer credentials (required)
jwt_secret = ""

issuer = "roomchat"
audience = "roomchat-clients"

# Lifetime of issued tokens (minutes)
token_ttl_minutes = 1440

[crypto]
# Base64-encoded 32-byte key shared with clients (required)
# Generate one with: roomchat-cli keygen
key = ""

[hub]
# Maximum concurrent WebSocket connections
max_connections = 1000

# Messages delivered on join and on history requests (1-1000)
history_limit = 50

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/roomchat/roomchat.log"
"#
    .to_string()
}
