//! roomchat admin CLI
//!
//! Bootstraps and inspects a roomchat deployment by working directly on its
//! database:
//! - Create users and issue their bearer credentials
//! - Create rooms and manage membership
//! - Generate the shared transport key, encrypt/decrypt payloads
//! - Print a default config file

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use roomchat::auth::TokenAuthority;
use roomchat::config::{generate_default_config, Config};
use roomchat::crypto::CryptoTransport;
use roomchat::storage::{Room, RoomDirectory, SqliteStore};

#[derive(Parser)]
#[command(name = "roomchat-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Administration tool for the roomchat server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage users
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Manage rooms
    Room {
        #[command(subcommand)]
        action: RoomAction,
    },

    /// Issue bearer credentials
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Generate a base64 transport key for crypto.key
    Keygen,

    /// Encrypt text with the configured transport key
    Encrypt {
        text: String,
    },

    /// Decrypt a payload with the configured transport key
    Decrypt {
        ciphertext: String,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum UserAction {
    /// Register a user
    Add { username: String },
}

#[derive(Subcommand)]
pub enum RoomAction {
    /// Create a room; the admin becomes its first member
    Create {
        name: String,
        /// Username of the room admin
        #[arg(long)]
        admin: String,
        /// Restrict the room to members and the admin
        #[arg(long)]
        private: bool,
    },

    /// Add a user to a room
    AddMember { room: String, username: String },

    /// List the rooms a user can see
    List {
        /// Username to list rooms for
        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand)]
pub enum TokenAction {
    /// Issue a credential for a user
    Issue { username: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => {
            println!("{}", CryptoTransport::generate_key());
        }

        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
        }

        Commands::Encrypt { text } => {
            let crypto = transport(&load_config(&cli.config)?)?;
            println!("{}", crypto.encrypt(&text)?);
        }

        Commands::Decrypt { ciphertext } => {
            let crypto = transport(&load_config(&cli.config)?)?;
            println!("{}", crypto.decrypt(&ciphertext)?);
        }

        Commands::User { action } => {
            let store = open_store(&load_config(&cli.config)?)?;
            match action {
                UserAction::Add { username } => {
                    let username = username.trim();
                    if username.is_empty() {
                        bail!("username cannot be empty");
                    }
                    let user = store.create_user(username).await?;
                    println!("Created user {} (id {})", user.username, user.id);
                }
            }
        }

        Commands::Room { action } => {
            let store = open_store(&load_config(&cli.config)?)?;
            match action {
                RoomAction::Create {
                    name,
                    admin,
                    private,
                } => {
                    let admin = find_user(&store, &admin).await?;
                    let room = store.create_room(name.trim(), private, admin.id).await?;
                    println!(
                        "Created {} room {} (id {}), admin {}",
                        if room.is_private { "private" } else { "public" },
                        room.name,
                        room.id,
                        admin.username
                    );
                }

                RoomAction::AddMember { room, username } => {
                    let room = store
                        .find_room_by_name(&room)
                        .await?
                        .with_context(|| format!("room '{}' not found", room))?;
                    let user = find_user(&store, &username).await?;
                    if store.add_member(room.id, user.id).await? {
                        println!("Added {} to {}", user.username, room.name);
                    } else {
                        println!("{} is already a member of {}", user.username, room.name);
                    }
                }

                RoomAction::List { user } => {
                    let user = find_user(&store, &user).await?;
                    let rooms = store.list_rooms_visible_to(user.id).await?;
                    print_rooms(&rooms, &cli.format)?;
                }
            }
        }

        Commands::Token { action } => {
            let config = load_config(&cli.config)?;
            let store = open_store(&config)?;
            match action {
                TokenAction::Issue { username } => {
                    let user = find_user(&store, &username).await?;
                    let tokens = TokenAuthority::new(config.auth.token_settings())
                        .context("auth.jwt_secret is not set")?;
                    println!("{}", tokens.issue(&user)?);
                }
            }
        }
    }

    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> anyhow::Result<Config> {
    Ok(match path {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default()?,
    })
}

fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    SqliteStore::open(config.database.store_config())
        .with_context(|| format!("opening database {}", config.database.path))
}

fn transport(config: &Config) -> anyhow::Result<CryptoTransport> {
    if config.crypto.key.trim().is_empty() {
        bail!("crypto.key is not set (generate one with `roomchat-cli keygen`)");
    }
    Ok(CryptoTransport::from_base64(&config.crypto.key)?)
}

async fn find_user(store: &SqliteStore, username: &str) -> anyhow::Result<roomchat::storage::User> {
    store
        .find_user_by_name(username.trim())
        .await?
        .with_context(|| format!("user '{}' not found", username))
}

fn print_rooms(rooms: &[Room], format: &str) -> anyhow::Result<()> {
    if format == "json" {
        let rows: Vec<serde_json::Value> = rooms
            .iter()
            .map(|room| {
                serde_json::json!({
                    "id": room.id,
                    "name": room.name,
                    "is_private": room.is_private,
                    "admin_id": room.admin_id,
                    "members": room.members.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rooms.is_empty() {
        println!("No rooms visible.");
        return Ok(());
    }

    println!("{:<6} {:<24} {:<8} {:<8} {}", "ID", "Name", "Private", "Admin", "Members");
    println!("{}", "-".repeat(60));
    for room in rooms {
        println!(
            "{:<6} {:<24} {:<8} {:<8} {}",
            room.id,
            room.name,
            if room.is_private { "yes" } else { "no" },
            room.admin_id,
            room.members.len()
        );
    }
    Ok(())
}
