//! SQLite Chat Store
//!
//! Users, rooms, room membership and messages in a single SQLite database.
//!
//! Connections come from a small pool, so calls for different rooms do not
//! queue behind each other; a file database runs in WAL mode and readers
//! proceed while a write is in flight. Each call runs on tokio's blocking
//! pool inside its own transaction and is bounded by
//! `StoreConfig::op_timeout`, which covers both the wait for a connection
//! and the query itself.
//!
//! A call that times out, or whose future is dropped, is cancelled: the
//! running statement is interrupted and the transaction rolls back. The
//! blocking task and the caller race for a single state flag before commit,
//! so a call reported as failed has never written anything.

use async_trait::async_trait;
use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};
use rusqlite::{
    params, Connection, InterruptHandle, OpenFlags, OptionalExtension, Transaction,
    TransactionBehavior,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::{StorageError, StorageResult};
use super::types::{
    from_millis, iso8601, HistoryEntry, Message, NewMessage, Room, RoomId, User,
    UserCredentials, UserId,
};
use super::{MessageStore, RoomDirectory, UserDirectory};

const IN_MEMORY: &str = ":memory:";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT
    );
    CREATE TABLE IF NOT EXISTS rooms (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        is_private INTEGER NOT NULL DEFAULT 0,
        admin_id INTEGER NOT NULL REFERENCES users(id)
    );
    CREATE TABLE IF NOT EXISTS room_members (
        room_id INTEGER NOT NULL REFERENCES rooms(id),
        user_id INTEGER NOT NULL REFERENCES users(id),
        PRIMARY KEY (room_id, user_id)
    );
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        room_id INTEGER NOT NULL REFERENCES rooms(id),
        user_id INTEGER NOT NULL REFERENCES users(id),
        content TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_room_time ON messages(room_id, timestamp);
";

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file, or `:memory:` for a private in-memory database
    pub path: PathBuf,
    /// Upper bound for a single store call, connection wait included
    pub op_timeout: Duration,
    /// How long SQLite waits on a locked database before failing
    pub busy_timeout: Duration,
    /// Pooled connections for a file database; an in-memory store uses one
    pub pool_size: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Configuration for a throwaway in-memory database
    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY)
    }

    fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("roomchat.db"),
            op_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(2),
            pool_size: 8,
        }
    }
}

/// Opens connections to one database for the pool
struct ConnectionManager {
    target: String,
    flags: OpenFlags,
    busy_timeout: Duration,
    wal: bool,
}

impl ConnectionManager {
    fn connect(&self) -> StorageResult<Connection> {
        let conn = Connection::open_with_flags(&self.target, self.flags)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if self.wal {
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }
        Ok(conn)
    }
}

impl managed::Manager for ConnectionManager {
    type Type = Connection;
    type Error = StorageError;

    async fn create(&self) -> Result<Connection, StorageError> {
        self.connect()
    }

    async fn recycle(&self, conn: &mut Connection, _: &Metrics) -> RecycleResult<StorageError> {
        if conn.is_autocommit() {
            Ok(())
        } else {
            Err(RecycleError::Message(
                "connection returned inside a transaction".into(),
            ))
        }
    }
}

type ConnectionPool = managed::Pool<ConnectionManager>;

const RUNNING: u8 = 0;
const COMMITTING: u8 = 1;
const CANCELLED: u8 = 2;
const FINISHED: u8 = 3;

/// Commit-or-cancel handshake between a store call and its blocking task
///
/// Only one side can leave `RUNNING`: the task by moving to `COMMITTING`,
/// the caller by moving to `CANCELLED`.
struct CallState(AtomicU8);

impl CallState {
    fn new() -> Self {
        Self(AtomicU8::new(RUNNING))
    }

    fn leave_running(&self, next: u8) -> bool {
        self.0
            .compare_exchange(RUNNING, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELLED
    }
}

/// Marks the call finished before its connection goes back to the pool
struct Finished(Arc<CallState>);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0 .0.store(FINISHED, Ordering::Release);
    }
}

/// Cancels the call unless it already committed or finished
///
/// Dropping the guard cancels too, which covers a caller whose future is
/// aborted mid-call.
struct CancelGuard {
    call: Arc<CallState>,
    interrupt: InterruptHandle,
}

impl CancelGuard {
    fn cancel(&self) -> bool {
        let cancelled = self.call.leave_running(CANCELLED);
        if cancelled {
            self.interrupt.interrupt();
        }
        cancelled
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Run `f` in a transaction, committing only if the caller has not cancelled
fn transact<T, F>(
    conn: &mut Connection,
    behavior: TransactionBehavior,
    call: &CallState,
    f: F,
) -> StorageResult<T>
where
    F: FnOnce(&Transaction<'_>) -> StorageResult<T>,
{
    if call.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    let tx = conn.transaction_with_behavior(behavior)?;
    let value = f(&tx)?;

    // Losing this race means the caller already reported a failure; the
    // transaction rolls back when dropped
    if !call.leave_running(COMMITTING) {
        return Err(StorageError::Cancelled);
    }
    tx.commit()?;
    Ok(value)
}

/// SQLite-backed implementation of every store contract
#[derive(Clone)]
pub struct SqliteStore {
    pool: ConnectionPool,
    op_timeout: Duration,
    /// Keeps a shared in-memory database alive while the pool cycles connections
    _anchor: Option<Arc<Mutex<Connection>>>,
}

impl SqliteStore {
    /// Open (or create) the database and ensure the schema exists
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        let base_flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let (manager, pool_size) = if config.is_in_memory() {
            let manager = ConnectionManager {
                target: format!(
                    "file:roomchat-{}?mode=memory&cache=shared",
                    uuid::Uuid::new_v4().simple()
                ),
                flags: base_flags | OpenFlags::SQLITE_OPEN_URI,
                busy_timeout: config.busy_timeout,
                wal: false,
            };
            (manager, 1)
        } else {
            if let Some(parent) = config.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let manager = ConnectionManager {
                target: config.path.to_string_lossy().into_owned(),
                flags: base_flags,
                busy_timeout: config.busy_timeout,
                wal: true,
            };
            (manager, config.pool_size.max(1))
        };

        let bootstrap = manager.connect()?;
        if manager.wal {
            bootstrap.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        }
        bootstrap.execute_batch(SCHEMA)?;

        let anchor = if config.is_in_memory() {
            Some(Arc::new(Mutex::new(bootstrap)))
        } else {
            None
        };

        let pool = ConnectionPool::builder(manager)
            .max_size(pool_size)
            .runtime(deadpool::Runtime::Tokio1)
            .create_timeout(Some(config.op_timeout))
            .build()
            .map_err(|e| StorageError::Pool(e.to_string()))?;

        tracing::debug!(
            path = %config.path.display(),
            pool_size,
            "Chat store opened"
        );

        Ok(Self {
            pool,
            op_timeout: config.op_timeout,
            _anchor: anchor,
        })
    }

    /// Open a private in-memory store
    pub fn in_memory() -> StorageResult<Self> {
        Self::open(StoreConfig::in_memory())
    }

    /// Open a database file with default timeouts
    pub fn open_path(path: &Path) -> StorageResult<Self> {
        Self::open(StoreConfig::new(path))
    }

    async fn read<T, F>(&self, op: &'static str, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> StorageResult<T> + Send + 'static,
    {
        self.run(op, TransactionBehavior::Deferred, f).await
    }

    async fn write<T, F>(&self, op: &'static str, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> StorageResult<T> + Send + 'static,
    {
        self.run(op, TransactionBehavior::Immediate, f).await
    }

    /// Run `f` on a pooled connection on the blocking pool, bounded by the
    /// store timeout
    async fn run<T, F>(
        &self,
        op: &'static str,
        behavior: TransactionBehavior,
        f: F,
    ) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> StorageResult<T> + Send + 'static,
    {
        let deadline = tokio::time::Instant::now() + self.op_timeout;

        let conn = match tokio::time::timeout_at(deadline, self.pool.get()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(managed::PoolError::Backend(e))) => return Err(e),
            Ok(Err(managed::PoolError::Timeout(_))) | Err(_) => return Err(self.timed_out(op)),
            Ok(Err(e)) => return Err(StorageError::Pool(e.to_string())),
        };

        let call = Arc::new(CallState::new());
        let guard = CancelGuard {
            call: Arc::clone(&call),
            interrupt: conn.get_interrupt_handle(),
        };

        let mut task = tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let _finished = Finished(Arc::clone(&call));
            transact(&mut conn, behavior, &call, f)
        });

        let joined = match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                if guard.cancel() {
                    return Err(self.timed_out(op));
                }
                // Already committing; the commit's outcome is the call's outcome
                task.await
            }
        };

        joined.map_err(|e| StorageError::Task(e.to_string()))?
    }

    fn timed_out(&self, op: &'static str) -> StorageError {
        tracing::warn!(op, timeout = ?self.op_timeout, "Store call timed out");
        StorageError::Timeout {
            op,
            after: self.op_timeout,
        }
    }

    /// Verify the database answers queries
    pub async fn ping(&self) -> StorageResult<()> {
        self.read("ping", |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    /// Register a new user without a password (admin-created accounts)
    pub async fn create_user(&self, username: &str) -> StorageResult<User> {
        self.insert_user(username, None).await
    }

    /// Register a user who logs in with a password
    pub async fn create_user_with_password(
        &self,
        username: &str,
        password_hash: &str,
    ) -> StorageResult<User> {
        self.insert_user(username, Some(password_hash.to_string()))
            .await
    }

    async fn insert_user(
        &self,
        username: &str,
        password_hash: Option<String>,
    ) -> StorageResult<User> {
        let username = username.to_string();
        self.write("create_user", move |conn| {
            conn.execute(
                "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
                params![username, password_hash],
            )
            .map_err(|e| unique_conflict(e, format!("user '{}'", username)))?;
            Ok(User {
                id: conn.last_insert_rowid(),
                username,
            })
        })
        .await
    }

    /// Look a user up together with the password hash used at login
    pub async fn find_credentials(&self, username: &str) -> StorageResult<Option<UserCredentials>> {
        let username = username.to_string();
        self.read("find_credentials", move |conn| {
            let credentials = conn
                .query_row(
                    "SELECT id, username, password_hash FROM users WHERE username = ?1",
                    params![username],
                    |row| {
                        Ok(UserCredentials {
                            user: User {
                                id: row.get(0)?,
                                username: row.get(1)?,
                            },
                            password_hash: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(credentials)
        })
        .await
    }

    pub async fn find_user_by_name(&self, username: &str) -> StorageResult<Option<User>> {
        let username = username.to_string();
        self.read("find_user_by_name", move |conn| {
            let user = conn
                .query_row(
                    "SELECT id, username FROM users WHERE username = ?1",
                    params![username],
                    |row| {
                        Ok(User {
                            id: row.get(0)?,
                            username: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    /// Create a room; the creator becomes its admin and first member
    pub async fn create_room(
        &self,
        name: &str,
        is_private: bool,
        admin_id: UserId,
    ) -> StorageResult<Room> {
        let name = name.to_string();
        self.write("create_room", move |tx| {
            let admin_exists = tx
                .query_row("SELECT 1 FROM users WHERE id = ?1", params![admin_id], |_| {
                    Ok(())
                })
                .optional()?
                .is_some();
            if !admin_exists {
                return Err(StorageError::NotFound(format!("user {}", admin_id)));
            }

            tx.execute(
                "INSERT INTO rooms (name, is_private, admin_id) VALUES (?1, ?2, ?3)",
                params![name, is_private, admin_id],
            )
            .map_err(|e| unique_conflict(e, format!("room '{}'", name)))?;
            let room_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO room_members (room_id, user_id) VALUES (?1, ?2)",
                params![room_id, admin_id],
            )?;

            Ok(Room {
                id: room_id,
                name,
                is_private,
                admin_id,
                members: [admin_id].into_iter().collect(),
            })
        })
        .await
    }

    pub async fn find_room_by_id(&self, id: RoomId) -> StorageResult<Option<Room>> {
        self.read("find_room_by_id", move |conn| {
            let header = conn
                .query_row(
                    "SELECT id, name, is_private, admin_id FROM rooms WHERE id = ?1",
                    params![id],
                    room_header,
                )
                .optional()?;
            header.map(|h| with_members(conn, h)).transpose()
        })
        .await
    }

    /// Add `user_id` to the room's member set
    ///
    /// Returns false if the user was already a member.
    pub async fn add_member(&self, room_id: RoomId, user_id: UserId) -> StorageResult<bool> {
        self.write("add_member", move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO room_members (room_id, user_id) VALUES (?1, ?2)",
                params![room_id, user_id],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    /// Rooms the user may see: public ones, ones they administer, ones they belong to
    pub async fn list_rooms_visible_to(&self, user_id: UserId) -> StorageResult<Vec<Room>> {
        self.read("list_rooms_visible_to", move |conn| {
            let headers = {
                let mut stmt = conn.prepare_cached(
                    "SELECT r.id, r.name, r.is_private, r.admin_id FROM rooms r
                     WHERE r.is_private = 0
                        OR r.admin_id = ?1
                        OR EXISTS (SELECT 1 FROM room_members m
                                   WHERE m.room_id = r.id AND m.user_id = ?1)
                     ORDER BY r.name",
                )?;
                let rows = stmt.query_map(params![user_id], room_header)?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            headers
                .into_iter()
                .map(|h| with_members(conn, h))
                .collect()
        })
        .await
    }

    /// Total number of persisted messages in a room
    pub async fn message_count(&self, room_id: RoomId) -> StorageResult<usize> {
        self.read("message_count", move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE room_id = ?1",
                params![room_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    /// `append`, with the insert held back by `stall` once the connection is taken
    #[cfg(test)]
    pub(crate) async fn append_stalled(
        &self,
        message: NewMessage,
        stall: Duration,
    ) -> StorageResult<Message> {
        self.write("append_message", move |conn| {
            std::thread::sleep(stall);
            insert_message(conn, message)
        })
        .await
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn find_user(&self, id: UserId) -> StorageResult<Option<User>> {
        self.read("find_user", move |conn| {
            let user = conn
                .query_row(
                    "SELECT id, username FROM users WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(User {
                            id: row.get(0)?,
                            username: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(user)
        })
        .await
    }
}

#[async_trait]
impl RoomDirectory for SqliteStore {
    async fn find_room_by_name(&self, name: &str) -> StorageResult<Option<Room>> {
        let name = name.to_string();
        self.read("find_room_by_name", move |conn| {
            let header = conn
                .query_row(
                    "SELECT id, name, is_private, admin_id FROM rooms WHERE name = ?1",
                    params![name],
                    room_header,
                )
                .optional()?;
            header.map(|h| with_members(conn, h)).transpose()
        })
        .await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: NewMessage) -> StorageResult<Message> {
        self.write("append_message", move |conn| insert_message(conn, message))
            .await
    }

    async fn recent_history(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> StorageResult<Vec<HistoryEntry>> {
        self.read("recent_history", move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT m.id, m.content, m.timestamp, u.username
                 FROM messages m JOIN users u ON u.id = m.user_id
                 WHERE m.room_id = ?1
                 ORDER BY m.timestamp DESC, m.id DESC
                 LIMIT ?2",
            )?;

            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt.query_map(params![room_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut newest_first = Vec::new();
            for row in rows {
                let (id, content, millis, username) = row?;
                let timestamp = from_millis(millis).ok_or_else(|| {
                    StorageError::Corruption(format!("message {} timestamp {}", id, millis))
                })?;
                newest_first.push(HistoryEntry {
                    id,
                    content,
                    timestamp: iso8601(timestamp),
                    username,
                });
            }

            newest_first.reverse();
            Ok(newest_first)
        })
        .await
    }
}

fn insert_message(conn: &Connection, message: NewMessage) -> StorageResult<Message> {
    let millis = message.timestamp.timestamp_millis();
    conn.execute(
        "INSERT INTO messages (room_id, user_id, content, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![message.room_id, message.user_id, message.content, millis],
    )?;

    // Stored precision is milliseconds; hand back what a reader will see
    let timestamp = from_millis(millis)
        .ok_or_else(|| StorageError::Corruption(format!("timestamp {}", millis)))?;

    Ok(Message {
        id: conn.last_insert_rowid(),
        room_id: message.room_id,
        user_id: message.user_id,
        content: message.content,
        timestamp,
    })
}

struct RoomHeader {
    id: RoomId,
    name: String,
    is_private: bool,
    admin_id: UserId,
}

fn room_header(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomHeader> {
    Ok(RoomHeader {
        id: row.get(0)?,
        name: row.get(1)?,
        is_private: row.get(2)?,
        admin_id: row.get(3)?,
    })
}

fn with_members(conn: &Connection, header: RoomHeader) -> StorageResult<Room> {
    let mut stmt = conn.prepare_cached("SELECT user_id FROM room_members WHERE room_id = ?1")?;
    let members = stmt
        .query_map(params![header.id], |row| row.get::<_, UserId>(0))?
        .collect::<Result<HashSet<_>, _>>()?;

    Ok(Room {
        id: header.id,
        name: header.name,
        is_private: header.is_private,
        admin_id: header.admin_id,
        members,
    })
}

/// Map a UNIQUE violation to `Conflict`, anything else to `Database`
fn unique_conflict(err: rusqlite::Error, what: String) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            StorageError::Conflict(what)
        }
        _ => StorageError::Database(err),
    }
}
