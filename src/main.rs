//! roomchat server
//!
//! Run with: cargo run --bin roomchat -- --config config.toml
//!
//! # Configuration
//!
//! Settings come from the TOML file given with `--config`, or the first of
//! `~/.config/roomchat/config.toml`, `/etc/roomchat/config.toml` and
//! `./config.toml` that exists. `ROOMCHAT_*` environment variables override
//! the file; `RUST_LOG` overrides `logging.level`.
//!
//! `auth.jwt_secret` and `crypto.key` are required. Generate a key with
//! `roomchat-cli keygen`.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

use roomchat::api::{serve, AppState};
use roomchat::auth::TokenAuthority;
use roomchat::config::Config;
use roomchat::crypto::CryptoTransport;
use roomchat::logging;
use roomchat::storage::SqliteStore;

#[derive(Parser)]
#[command(name = "roomchat")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-room chat server with encrypted real-time messaging")]
struct Args {
    /// Config file (default: search the standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logging settings live in the file: load errors are returned, not logged
    let source = args.config.clone().or_else(Config::default_path);
    let config = match &source {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::from_env(),
    };

    logging::init(&config.logging)?;

    match &source {
        Some(path) => tracing::info!(path = %path.display(), "Loaded config"),
        None => tracing::info!("No config file found, using defaults with environment overrides"),
    }
    config.validate()?;

    tracing::info!("Starting roomchat server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        database = %config.database.path,
        pool_size = config.database.pool_size,
        history_limit = config.hub.history_limit,
        max_connections = config.hub.max_connections,
        "Configuration loaded"
    );

    let store = SqliteStore::open(config.database.store_config())
        .with_context(|| format!("opening database {}", config.database.path))?;
    let crypto =
        CryptoTransport::from_base64(&config.crypto.key).context("loading crypto.key")?;
    let tokens = TokenAuthority::new(config.auth.token_settings())?;

    let state = AppState::new(store, crypto, tokens, &config.hub, config.api.clone());

    serve(state, &config.api).await?;

    tracing::info!("roomchat server stopped");
    Ok(())
}
