//! Messaging Hub
//!
//! Orchestrates the four room operations a connected client can invoke:
//!
//! - **join_room**: authorize, subscribe, deliver history, announce
//! - **leave_room**: unsubscribe, announce if it was subscribed
//! - **send_message**: authorize, decrypt, sanitize, persist, broadcast
//! - **get_history**: authorize, deliver history
//!
//! Every operation receives an explicit [`Caller`] and resolves the user id
//! from its claims once at entry. Failures never escape to the transport:
//! each one is logged and, where the policy in [`HubError::caller_notice`]
//! says so, reported to the calling connection only. The returned `Result`
//! is for the caller's information; it has already been handled.
//!
//! ## Ordering
//!
//! A message is persisted before it is broadcast. A store failure therefore
//! means nobody receives it.

mod error;

pub use error::{HubError, HubResult, Severity};

use std::sync::Arc;

use crate::auth::{user_id_from_claims, Claims};
use crate::crypto::CryptoTransport;
use crate::sanitize::Sanitizer;
use crate::storage::{iso8601, ChatStore, HistoryEntry, Message, NewMessage, Room, User};
use crate::websocket::{ConnectionId, ConnectionRegistry, ServerEvent};

/// Number of history entries delivered when a limit is not configured
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// The connection invoking an operation, with the claims it authenticated with
#[derive(Debug, Clone)]
pub struct Caller {
    pub connection_id: ConnectionId,
    pub claims: Claims,
}

impl Caller {
    pub fn new(connection_id: impl Into<ConnectionId>, claims: Claims) -> Self {
        Self {
            connection_id: connection_id.into(),
            claims,
        }
    }
}

/// Hub tuning
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Most recent messages delivered on join and on request
    pub history_limit: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Room-scoped real-time messaging
pub struct MessagingHub {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn ChatStore>,
    crypto: Arc<CryptoTransport>,
    sanitizer: Sanitizer,
    settings: HubSettings,
}

impl MessagingHub {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn ChatStore>,
        crypto: Arc<CryptoTransport>,
        settings: HubSettings,
    ) -> Self {
        Self {
            registry,
            store,
            crypto,
            sanitizer: Sanitizer::new(),
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Entries delivered by a history read
    pub fn history_limit(&self) -> usize {
        self.settings.history_limit
    }

    /// Subscribe the caller to `room_name`
    ///
    /// On success the caller receives the room's recent history, then every
    /// subscriber (the caller included) receives a join notice. Joining
    /// again re-sends history and re-announces.
    pub async fn join_room(&self, caller: &Caller, room_name: &str) -> HubResult<()> {
        let result = self.try_join(caller, room_name).await;
        self.settle(caller, "join_room", room_name, result)
    }

    /// Unsubscribe the caller from `room_name`
    ///
    /// Always permitted. The notice goes to the subscribers that remain, and
    /// only when the connection was actually subscribed.
    pub async fn leave_room(&self, caller: &Caller, room_name: &str) -> HubResult<()> {
        let result = self.try_leave(caller, room_name).await;
        self.settle(caller, "leave_room", room_name, result)
    }

    /// Post an encrypted payload to `room_name`
    pub async fn send_message(
        &self,
        caller: &Caller,
        room_name: &str,
        payload: &str,
    ) -> HubResult<Message> {
        let result = self.try_send(caller, room_name, payload).await;
        self.settle(caller, "send_message", room_name, result)
    }

    /// Deliver the recent history of `room_name` to the caller
    ///
    /// Gated by the same rule as joining and sending.
    pub async fn get_history(
        &self,
        caller: &Caller,
        room_name: &str,
    ) -> HubResult<Vec<HistoryEntry>> {
        let result = self.try_history(caller, room_name).await;
        self.settle(caller, "get_history", room_name, result)
    }

    async fn try_join(&self, caller: &Caller, room_name: &str) -> HubResult<()> {
        let user = self.resolve_user(caller).await?;
        let room = self.authorized_room(&user, room_name).await?;

        self.registry.add(&caller.connection_id, &room.name)?;

        let entries = match self
            .store
            .recent_history(room.id, self.settings.history_limit)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                self.registry.remove(&caller.connection_id, &room.name);
                return Err(e.into());
            }
        };

        tracing::info!(
            connection_id = %caller.connection_id,
            user = %user.username,
            room = %room.name,
            history = entries.len(),
            "Joined room"
        );

        self.registry.send_to_connection(
            &caller.connection_id,
            ServerEvent::HistoryDelivered {
                room: room.name.clone(),
                entries,
            },
        )?;

        self.announce(
            &room.name,
            &format!("{} joined the room {}", user.username, room.name),
        )
    }

    async fn try_leave(&self, caller: &Caller, room_name: &str) -> HubResult<()> {
        let user = self.resolve_user(caller).await?;

        if !self.registry.remove(&caller.connection_id, room_name) {
            tracing::debug!(
                connection_id = %caller.connection_id,
                user = %user.username,
                room = %room_name,
                "Leave without subscription"
            );
            return Ok(());
        }

        tracing::info!(
            connection_id = %caller.connection_id,
            user = %user.username,
            room = %room_name,
            "Left room"
        );

        self.announce(
            room_name,
            &format!("{} has left the room {}", user.username, room_name),
        )
    }

    async fn try_send(&self, caller: &Caller, room_name: &str, payload: &str) -> HubResult<Message> {
        let user = self.resolve_user(caller).await?;
        let room = self.authorized_room(&user, room_name).await?;

        let plaintext = self.crypto.decrypt(payload).map_err(HubError::Decryption)?;
        let clean = self
            .sanitizer
            .sanitize_non_empty(&plaintext)
            .ok_or(HubError::EmptyMessage)?;
        let ciphertext = self.crypto.encrypt(&clean).map_err(HubError::Encryption)?;

        let message = self
            .store
            .append(NewMessage::now(room.id, user.id, ciphertext))
            .await?;

        let delivered = self.registry.broadcast_to_room(
            &room.name,
            &ServerEvent::MessageReceived {
                room: room.name.clone(),
                sender: Some(user.username.clone()),
                content: message.content.clone(),
                timestamp: iso8601(message.timestamp),
            },
        );

        tracing::debug!(
            connection_id = %caller.connection_id,
            message_id = message.id,
            room = %room.name,
            delivered,
            "Message sent"
        );
        Ok(message)
    }

    async fn try_history(&self, caller: &Caller, room_name: &str) -> HubResult<Vec<HistoryEntry>> {
        let user = self.resolve_user(caller).await?;
        let room = self.authorized_room(&user, room_name).await?;

        let entries = self
            .store
            .recent_history(room.id, self.settings.history_limit)
            .await?;

        self.registry.send_to_connection(
            &caller.connection_id,
            ServerEvent::HistoryDelivered {
                room: room.name,
                entries: entries.clone(),
            },
        )?;
        Ok(entries)
    }

    async fn resolve_user(&self, caller: &Caller) -> HubResult<User> {
        let user_id = user_id_from_claims(&caller.claims)?;
        self.store
            .find_user(user_id)
            .await?
            .ok_or(HubError::UserNotFound(user_id))
    }

    /// Look the room up fresh and apply the public/member/admin rule
    async fn authorized_room(&self, user: &User, room_name: &str) -> HubResult<Room> {
        let room = self
            .store
            .find_room_by_name(room_name)
            .await?
            .ok_or_else(|| HubError::RoomNotFound(room_name.to_string()))?;

        if !room.authorizes(user.id) {
            return Err(HubError::AccessDenied {
                user_id: user.id,
                room: room.name,
            });
        }
        Ok(room)
    }

    /// Broadcast a system notice; its text travels encrypted like any message
    fn announce(&self, room_name: &str, text: &str) -> HubResult<()> {
        let content = self.crypto.encrypt(text).map_err(HubError::Encryption)?;
        self.registry.broadcast_to_room(
            room_name,
            &ServerEvent::MessageReceived {
                room: room_name.to_string(),
                sender: None,
                content,
                timestamp: iso8601(chrono::Utc::now()),
            },
        );
        Ok(())
    }

    fn settle<T>(
        &self,
        caller: &Caller,
        operation: &'static str,
        room: &str,
        result: HubResult<T>,
    ) -> HubResult<T> {
        if let Err(err) = &result {
            self.report(caller, operation, room, err);
        }
        result
    }

    /// Log a failure and notify the caller when the policy allows it
    fn report(&self, caller: &Caller, operation: &'static str, room: &str, err: &HubError) {
        let connection_id = caller.connection_id.as_str();
        match err.severity() {
            Severity::Debug => {
                tracing::debug!(connection_id, operation, room, error = %err, "Hub operation failed")
            }
            Severity::Warn => {
                tracing::warn!(connection_id, operation, room, error = %err, "Hub operation denied")
            }
            Severity::Error => {
                tracing::error!(connection_id, operation, room, error = %err, "Hub operation failed")
            }
        }

        if let Some(notice) = err.caller_notice() {
            if let Err(e) = self.registry.send_to_connection(connection_id, notice) {
                tracing::debug!(connection_id, error = %e, "Could not notify caller");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        MessageStore, RoomDirectory, RoomId, SqliteStore, StorageError, StorageResult,
        StoreConfig, UserDirectory, UserId,
    };
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Delegates to SQLite but can be told to fail or stall individual calls
    struct FlakyStore {
        inner: SqliteStore,
        fail_append: bool,
        fail_history: bool,
        stall_append: Option<std::time::Duration>,
    }

    #[async_trait]
    impl UserDirectory for FlakyStore {
        async fn find_user(&self, id: UserId) -> StorageResult<Option<User>> {
            self.inner.find_user(id).await
        }
    }

    #[async_trait]
    impl RoomDirectory for FlakyStore {
        async fn find_room_by_name(&self, name: &str) -> StorageResult<Option<Room>> {
            self.inner.find_room_by_name(name).await
        }
    }

    #[async_trait]
    impl MessageStore for FlakyStore {
        async fn append(&self, message: NewMessage) -> StorageResult<Message> {
            if self.fail_append {
                return Err(StorageError::Task("injected append failure".to_string()));
            }
            match self.stall_append {
                Some(stall) => self.inner.append_stalled(message, stall).await,
                None => self.inner.append(message).await,
            }
        }

        async fn recent_history(
            &self,
            room_id: RoomId,
            limit: usize,
        ) -> StorageResult<Vec<HistoryEntry>> {
            if self.fail_history {
                return Err(StorageError::Task("injected history failure".to_string()));
            }
            self.inner.recent_history(room_id, limit).await
        }
    }

    struct Fixture {
        hub: MessagingHub,
        store: SqliteStore,
        registry: Arc<ConnectionRegistry>,
        crypto: Arc<CryptoTransport>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = SqliteStore::in_memory().unwrap();
            Self::with_store(store.clone(), Arc::new(store))
        }

        fn flaky(fail_append: bool, fail_history: bool) -> Self {
            let store = SqliteStore::in_memory().unwrap();
            let flaky = FlakyStore {
                inner: store.clone(),
                fail_append,
                fail_history,
                stall_append: None,
            };
            Self::with_store(store, Arc::new(flaky))
        }

        /// Store calls time out after `timeout`; appends stall for `stall`
        fn slow_appends(timeout: std::time::Duration, stall: std::time::Duration) -> Self {
            let store = SqliteStore::open(StoreConfig {
                op_timeout: timeout,
                ..StoreConfig::in_memory()
            })
            .unwrap();
            let flaky = FlakyStore {
                inner: store.clone(),
                fail_append: false,
                fail_history: false,
                stall_append: Some(stall),
            };
            Self::with_store(store, Arc::new(flaky))
        }

        fn with_store(store: SqliteStore, chat_store: Arc<dyn ChatStore>) -> Self {
            let registry = Arc::new(ConnectionRegistry::default());
            let crypto = Arc::new(
                CryptoTransport::from_base64(&CryptoTransport::generate_key()).unwrap(),
            );
            let hub = MessagingHub::new(
                Arc::clone(&registry),
                chat_store,
                Arc::clone(&crypto),
                HubSettings::default(),
            );
            Self {
                hub,
                store,
                registry,
                crypto,
            }
        }

        fn connect(&self, user: &User) -> (Caller, UnboundedReceiver<ServerEvent>) {
            self.connect_with_uid(Some(user.id.to_string()), &user.username)
        }

        fn connect_with_uid(
            &self,
            uid: Option<String>,
            username: &str,
        ) -> (Caller, UnboundedReceiver<ServerEvent>) {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let connection_id = self.registry.register(tx).unwrap();
            let claims = Claims {
                sub: username.to_string(),
                uid,
                iss: "roomchat".to_string(),
                aud: "roomchat-clients".to_string(),
                iat: 0,
                exp: 0,
            };
            (Caller::new(connection_id, claims), rx)
        }

        fn encrypt(&self, text: &str) -> String {
            self.crypto.encrypt(text).unwrap()
        }

        fn decrypt(&self, text: &str) -> String {
            self.crypto.decrypt(text).unwrap()
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn received_texts(fx: &Fixture, events: &[ServerEvent]) -> Vec<(Option<String>, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::MessageReceived {
                    sender, content, ..
                } => Some((sender.clone(), fx.decrypt(content))),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_public_room_open_to_non_members() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        let u3 = fx.store.create_user("U3").await.unwrap();
        fx.store.create_room("General", false, u1.id).await.unwrap();

        let (caller, mut rx) = fx.connect(&u3);
        fx.hub.join_room(&caller, "General").await.unwrap();
        fx.hub
            .send_message(&caller, "General", &fx.encrypt("hi"))
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert!(matches!(events[0], ServerEvent::HistoryDelivered { .. }));
        assert_eq!(
            received_texts(&fx, &events),
            vec![
                (None, "U3 joined the room General".to_string()),
                (Some("U3".to_string()), "hi".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_private_room_denies_outsiders() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        let u2 = fx.store.create_user("U2").await.unwrap();
        let room = fx.store.create_room("PrivateRoom", true, u2.id).await.unwrap();

        let (admin, mut admin_rx) = fx.connect(&u2);
        fx.hub.join_room(&admin, "PrivateRoom").await.unwrap();
        drain(&mut admin_rx);

        let (outsider, mut rx) = fx.connect(&u1);
        let result = fx.hub.join_room(&outsider, "PrivateRoom").await;
        assert!(matches!(result, Err(HubError::AccessDenied { .. })));
        assert!(!fx.registry.is_subscribed(&outsider.connection_id, "PrivateRoom"));
        assert_eq!(drain(&mut rx), vec![ServerEvent::access_denied()]);

        let result = fx
            .hub
            .send_message(&outsider, "PrivateRoom", &fx.encrypt("let me in"))
            .await;
        assert!(matches!(result, Err(HubError::AccessDenied { .. })));
        assert_eq!(drain(&mut rx), vec![ServerEvent::access_denied()]);

        assert_eq!(fx.store.message_count(room.id).await.unwrap(), 0);
        assert!(drain(&mut admin_rx).is_empty());
        assert_eq!(fx.registry.group_size("PrivateRoom"), 1);
    }

    #[tokio::test]
    async fn test_membership_change_visible_without_restart() {
        let fx = Fixture::new();
        let admin = fx.store.create_user("admin").await.unwrap();
        let bob = fx.store.create_user("bob").await.unwrap();
        let room = fx.store.create_room("Staff", true, admin.id).await.unwrap();

        let (caller, mut rx) = fx.connect(&bob);
        assert!(fx.hub.join_room(&caller, "Staff").await.is_err());
        drain(&mut rx);

        fx.store.add_member(room.id, bob.id).await.unwrap();
        fx.hub.join_room(&caller, "Staff").await.unwrap();
        fx.hub
            .send_message(&caller, "Staff", &fx.encrypt("thanks"))
            .await
            .unwrap();
        assert_eq!(fx.store.message_count(room.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_admin_always_authorized() {
        let fx = Fixture::new();
        let admin = fx.store.create_user("admin").await.unwrap();
        fx.store.create_room("Vault", true, admin.id).await.unwrap();

        let (caller, _rx) = fx.connect(&admin);
        fx.hub.join_room(&caller, "Vault").await.unwrap();
        fx.hub
            .send_message(&caller, "Vault", &fx.encrypt("mine"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_decryption_persists_nothing() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        let room = fx.store.create_room("General", false, u1.id).await.unwrap();
        let (caller, mut rx) = fx.connect(&u1);
        fx.hub.join_room(&caller, "General").await.unwrap();
        fx.hub
            .send_message(&caller, "General", &fx.encrypt("first"))
            .await
            .unwrap();
        drain(&mut rx);

        let before = fx.hub.get_history(&caller, "General").await.unwrap().len();

        let foreign = CryptoTransport::from_base64(&CryptoTransport::generate_key()).unwrap();
        for payload in ["garbage!!".to_string(), foreign.encrypt("hello").unwrap()] {
            let result = fx.hub.send_message(&caller, "General", &payload).await;
            assert!(matches!(result, Err(HubError::Decryption(_))));
        }

        let after = fx.hub.get_history(&caller, "General").await.unwrap().len();
        assert_eq!(before, after);
        assert_eq!(fx.store.message_count(room.id).await.unwrap(), 1);

        let errors: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::OperationError { .. }))
            .collect();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_and_script_only_messages_rejected() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        let room = fx.store.create_room("General", false, u1.id).await.unwrap();
        let (caller, mut rx) = fx.connect(&u1);
        fx.hub.join_room(&caller, "General").await.unwrap();
        drain(&mut rx);

        for text in ["", "   ", "<script>alert(1)</script>"] {
            let result = fx
                .hub
                .send_message(&caller, "General", &fx.encrypt(text))
                .await;
            assert!(matches!(result, Err(HubError::EmptyMessage)));
        }

        assert_eq!(fx.store.message_count(room.id).await.unwrap(), 0);
        assert!(drain(&mut rx)
            .iter()
            .all(|e| matches!(e, ServerEvent::OperationError { .. })));
    }

    #[tokio::test]
    async fn test_content_is_sanitized_before_storage_and_broadcast() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        fx.store.create_room("General", false, u1.id).await.unwrap();
        let (caller, mut rx) = fx.connect(&u1);
        fx.hub.join_room(&caller, "General").await.unwrap();
        drain(&mut rx);

        let message = fx
            .hub
            .send_message(
                &caller,
                "General",
                &fx.encrypt("hi<script>alert('x')</script>"),
            )
            .await
            .unwrap();
        assert_eq!(fx.decrypt(&message.content), "hi");
        assert_eq!(
            received_texts(&fx, &drain(&mut rx)),
            vec![(Some("U1".to_string()), "hi".to_string())]
        );
    }

    #[tokio::test]
    async fn test_sent_message_is_last_history_entry() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        fx.store.create_room("General", false, u1.id).await.unwrap();
        let (caller, _rx) = fx.connect(&u1);

        for text in ["one", "two", "three"] {
            fx.hub
                .send_message(&caller, "General", &fx.encrypt(text))
                .await
                .unwrap();
        }

        let history = fx.hub.get_history(&caller, "General").await.unwrap();
        let texts: Vec<_> = history.iter().map(|e| fx.decrypt(&e.content)).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(history.iter().all(|e| e.username == "U1"));
    }

    #[tokio::test]
    async fn test_join_delivers_at_most_fifty_oldest_first() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        let room = fx.store.create_room("General", false, u1.id).await.unwrap();

        let base = Utc.with_ymd_and_hms(2024, 10, 7, 12, 0, 0).unwrap();
        for i in 0..60 {
            fx.store
                .append(NewMessage {
                    room_id: room.id,
                    user_id: u1.id,
                    content: fx.encrypt(&format!("m{i}")),
                    timestamp: base + Duration::seconds(i),
                })
                .await
                .unwrap();
        }

        let (caller, mut rx) = fx.connect(&u1);
        fx.hub.join_room(&caller, "General").await.unwrap();

        let events = drain(&mut rx);
        let ServerEvent::HistoryDelivered { entries, .. } = &events[0] else {
            panic!("Expected history first, got {:?}", events[0]);
        };
        assert_eq!(entries.len(), 50);
        assert_eq!(fx.decrypt(&entries[0].content), "m10");
        assert_eq!(fx.decrypt(&entries[49].content), "m59");
        assert!(entries.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_history_limit_is_configurable() {
        let store = SqliteStore::in_memory().unwrap();
        let registry = Arc::new(ConnectionRegistry::default());
        let crypto = Arc::new(CryptoTransport::new(&[9u8; 32]).unwrap());
        let hub = MessagingHub::new(
            Arc::clone(&registry),
            Arc::new(store.clone()),
            Arc::clone(&crypto),
            HubSettings { history_limit: 2 },
        );

        let u1 = store.create_user("U1").await.unwrap();
        store.create_room("General", false, u1.id).await.unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let id = registry.register(tx).unwrap();
        let claims = Claims {
            sub: "U1".to_string(),
            uid: Some(u1.id.to_string()),
            iss: String::new(),
            aud: String::new(),
            iat: 0,
            exp: 0,
        };
        let caller = Caller::new(id, claims);

        for text in ["a", "b", "c"] {
            hub.send_message(&caller, "General", &crypto.encrypt(text).unwrap())
                .await
                .unwrap();
        }
        let history = hub.get_history(&caller, "General").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(crypto.decrypt(&history[1].content).unwrap(), "c");
    }

    #[tokio::test]
    async fn test_leave_stops_delivery() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        let u2 = fx.store.create_user("U2").await.unwrap();
        fx.store.create_room("General", false, u1.id).await.unwrap();

        let (c1, mut rx1) = fx.connect(&u1);
        let (c2, mut rx2) = fx.connect(&u2);
        fx.hub.join_room(&c1, "General").await.unwrap();
        fx.hub.join_room(&c2, "General").await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        fx.hub.leave_room(&c2, "General").await.unwrap();
        assert!(drain(&mut rx2).is_empty());
        assert_eq!(
            received_texts(&fx, &drain(&mut rx1)),
            vec![(None, "U2 has left the room General".to_string())]
        );

        fx.hub
            .send_message(&c1, "General", &fx.encrypt("still here?"))
            .await
            .unwrap();
        assert!(drain(&mut rx2).is_empty());
        assert_eq!(drain(&mut rx1).len(), 1);
    }

    #[tokio::test]
    async fn test_leave_without_join_is_harmless() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        let (caller, mut rx) = fx.connect(&u1);

        fx.hub.leave_room(&caller, "Nowhere").await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(fx.registry.group_size("Nowhere"), 0);
    }

    #[tokio::test]
    async fn test_general_room_scenario() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        let room = fx.store.create_room("General", false, u1.id).await.unwrap();

        let (caller, mut rx) = fx.connect(&u1);
        fx.hub.join_room(&caller, "General").await.unwrap();
        drain(&mut rx);

        let stored = fx
            .hub
            .send_message(&caller, "General", &fx.encrypt("hello"))
            .await
            .unwrap();
        assert_eq!(stored.room_id, room.id);
        assert_eq!(stored.user_id, u1.id);
        assert_eq!(fx.decrypt(&stored.content), "hello");

        match drain(&mut rx).as_slice() {
            [ServerEvent::MessageReceived {
                sender,
                content,
                timestamp,
                ..
            }] => {
                assert_eq!(sender.as_deref(), Some("U1"));
                assert_eq!(fx.decrypt(content), "hello");
                assert_eq!(timestamp, &iso8601(stored.timestamp));
            }
            other => panic!("Expected one broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identity_failure_is_silent() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        fx.store.create_room("General", false, u1.id).await.unwrap();

        for uid in [None, Some("not-a-number".to_string())] {
            let (caller, mut rx) = fx.connect_with_uid(uid, "U1");
            let result = fx.hub.join_room(&caller, "General").await;
            assert!(matches!(result, Err(HubError::Identity(_))));
            let result = fx.hub.send_message(&caller, "General", "x").await;
            assert!(matches!(result, Err(HubError::Identity(_))));
            assert!(drain(&mut rx).is_empty());
        }
        assert_eq!(fx.registry.group_size("General"), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_or_room_is_silent() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();

        let (caller, mut rx) = fx.connect(&u1);
        let result = fx.hub.join_room(&caller, "Missing").await;
        assert!(matches!(result, Err(HubError::RoomNotFound(_))));

        let (ghost, mut ghost_rx) = fx.connect_with_uid(Some("999".to_string()), "ghost");
        let result = fx.hub.get_history(&ghost, "Missing").await;
        assert!(matches!(result, Err(HubError::UserNotFound(999))));

        assert!(drain(&mut rx).is_empty());
        assert!(drain(&mut ghost_rx).is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_prevents_broadcast() {
        let fx = Fixture::flaky(true, false);
        let u1 = fx.store.create_user("U1").await.unwrap();
        let u2 = fx.store.create_user("U2").await.unwrap();
        fx.store.create_room("General", false, u1.id).await.unwrap();

        let (c1, mut rx1) = fx.connect(&u1);
        let (c2, mut rx2) = fx.connect(&u2);
        fx.hub.join_room(&c1, "General").await.unwrap();
        fx.hub.join_room(&c2, "General").await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        let result = fx
            .hub
            .send_message(&c1, "General", &fx.encrypt("lost"))
            .await;
        assert!(matches!(result, Err(HubError::Store(_))));

        assert!(drain(&mut rx2).is_empty());
        assert!(matches!(
            drain(&mut rx1).as_slice(),
            [ServerEvent::OperationError { .. }]
        ));
    }

    #[tokio::test]
    async fn test_history_failure_rolls_back_join() {
        let fx = Fixture::flaky(false, true);
        let u1 = fx.store.create_user("U1").await.unwrap();
        fx.store.create_room("General", false, u1.id).await.unwrap();

        let (caller, mut rx) = fx.connect(&u1);
        let result = fx.hub.join_room(&caller, "General").await;
        assert!(matches!(result, Err(HubError::Store(_))));
        assert!(!fx.registry.is_subscribed(&caller.connection_id, "General"));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerEvent::OperationError { .. }]
        ));
    }

    #[tokio::test]
    async fn test_history_gated_for_private_rooms() {
        let fx = Fixture::new();
        let owner = fx.store.create_user("owner").await.unwrap();
        let snoop = fx.store.create_user("snoop").await.unwrap();
        fx.store.create_room("Secret", true, owner.id).await.unwrap();

        let (admin, _admin_rx) = fx.connect(&owner);
        fx.hub
            .send_message(&admin, "Secret", &fx.encrypt("classified"))
            .await
            .unwrap();

        let (caller, mut rx) = fx.connect(&snoop);
        let result = fx.hub.get_history(&caller, "Secret").await;
        assert!(matches!(result, Err(HubError::AccessDenied { .. })));
        assert_eq!(drain(&mut rx), vec![ServerEvent::access_denied()]);
    }

    #[tokio::test]
    async fn test_repeated_join_is_idempotent_for_membership() {
        let fx = Fixture::new();
        let u1 = fx.store.create_user("U1").await.unwrap();
        fx.store.create_room("General", false, u1.id).await.unwrap();

        let (caller, mut rx) = fx.connect(&u1);
        fx.hub.join_room(&caller, "General").await.unwrap();
        fx.hub.join_room(&caller, "General").await.unwrap();

        assert_eq!(fx.registry.group_size("General"), 1);
        let events = drain(&mut rx);
        let histories = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::HistoryDelivered { .. }))
            .count();
        assert_eq!(histories, 2);
        assert_eq!(received_texts(&fx, &events).len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_sends_to_one_room() {
        let fx = Arc::new(Fixture::new());
        let u1 = fx.store.create_user("U1").await.unwrap();
        let room = fx.store.create_room("General", false, u1.id).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let fx = Arc::clone(&fx);
            let u1 = u1.clone();
            tasks.push(tokio::spawn(async move {
                let (caller, _rx) = fx.connect(&u1);
                fx.hub.join_room(&caller, "General").await.unwrap();
                fx.hub
                    .send_message(&caller, "General", &fx.encrypt(&format!("msg {i}")))
                    .await
                    .unwrap();
                fx.hub.leave_room(&caller, "General").await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(fx.store.message_count(room.id).await.unwrap(), 10);
        assert_eq!(fx.registry.group_size("General"), 0);
    }

    #[tokio::test]
    async fn test_timed_out_send_is_neither_stored_nor_broadcast() {
        let fx = Fixture::slow_appends(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_millis(300),
        );
        let u1 = fx.store.create_user("U1").await.unwrap();
        let u2 = fx.store.create_user("U2").await.unwrap();
        let room = fx.store.create_room("General", false, u1.id).await.unwrap();

        let (c1, mut rx1) = fx.connect(&u1);
        let (c2, mut rx2) = fx.connect(&u2);
        fx.hub.join_room(&c1, "General").await.unwrap();
        fx.hub.join_room(&c2, "General").await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        let result = fx
            .hub
            .send_message(&c1, "General", &fx.encrypt("reported as failed"))
            .await;
        assert!(matches!(
            result,
            Err(HubError::Store(StorageError::Timeout { .. }))
        ));
        assert_eq!(
            drain(&mut rx1),
            vec![ServerEvent::error("Failed to process your request.")]
        );
        assert!(drain(&mut rx2).is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(fx.store.message_count(room.id).await.unwrap(), 0);
        assert!(fx.hub.get_history(&c2, "General").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outsider_leave_is_not_announced() {
        let fx = Fixture::new();
        let admin = fx.store.create_user("admin").await.unwrap();
        let outsider = fx.store.create_user("outsider").await.unwrap();
        fx.store.create_room("Staff", true, admin.id).await.unwrap();

        let (admin_conn, mut admin_rx) = fx.connect(&admin);
        fx.hub.join_room(&admin_conn, "Staff").await.unwrap();
        drain(&mut admin_rx);

        let (caller, mut rx) = fx.connect(&outsider);
        fx.hub.leave_room(&caller, "Staff").await.unwrap();

        assert!(drain(&mut admin_rx).is_empty());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(fx.registry.group_size("Staff"), 1);
    }
}
