//! `ChatService`: the write and read paths shared by HTTP handlers and live
//! sessions.

use std::collections::HashMap;
use std::sync::Arc;

use duet_core::{
    MarkRead, Message, MessageDraft, MessageId, PresenceChange, PresenceSnapshot, PresenceStatus,
    RoomId, UserId, ValidationError,
};
use duet_settings::RoomSettings;
use duet_store::{
    AppendOutcome, CacheConfig, KvBackend, MessageCache, MessageStore, MessageStoreConfig,
    PresenceConfig, PresenceTracker, ReadReceipts, StoreError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::broadcast::Broadcaster;

/// Which users may use which room.
#[derive(Clone, Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomId, Vec<UserId>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_room(mut self, room: impl Into<RoomId>, participants: &[&str]) -> Self {
        let _ = self.rooms.insert(
            room.into(),
            participants.iter().map(|p| UserId::from(*p)).collect(),
        );
        self
    }

    pub fn from_settings(settings: &RoomSettings) -> Self {
        let mut rooms = HashMap::new();
        let _ = rooms.insert(
            RoomId::from(settings.id.as_str()),
            settings
                .participants
                .iter()
                .map(|p| UserId::from(p.as_str()))
                .collect(),
        );
        Self { rooms }
    }

    pub fn authorize(&self, room: &RoomId, user: &UserId) -> Result<(), ValidationError> {
        if self.participants(room).contains(user) {
            Ok(())
        } else {
            Err(ValidationError::NotParticipant(
                user.to_string(),
                room.to_string(),
            ))
        }
    }

    pub fn participants(&self, room: &RoomId) -> &[UserId] {
        self.rooms.get(room).map_or(&[], Vec::as_slice)
    }

    /// The other participant of a two-user room.
    pub fn peer_of(&self, room: &RoomId, user: &UserId) -> Option<UserId> {
        self.participants(room).iter().find(|p| *p != user).cloned()
    }
}

/// Client input for a new message. The room and sender come from the
/// request path and identity.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub id: Option<MessageId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadState {
    pub last_read: i64,
    pub unread: usize,
}

/// Store, cache, presence and broadcaster behind one facade.
pub struct ChatService {
    store: Arc<MessageStore>,
    cache: Arc<MessageCache>,
    presence: PresenceTracker,
    receipts: ReadReceipts,
    broadcaster: Arc<Broadcaster>,
    rooms: RoomDirectory,
}

impl ChatService {
    pub fn new(
        kv: Arc<dyn KvBackend>,
        store_config: MessageStoreConfig,
        cache_config: CacheConfig,
        presence_config: PresenceConfig,
        rooms: RoomDirectory,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let store = Arc::new(MessageStore::new(Arc::clone(&kv), store_config));
        Self {
            cache: Arc::new(MessageCache::new(cache_config)),
            presence: PresenceTracker::new(Arc::clone(&kv), presence_config),
            receipts: ReadReceipts::new(kv, Arc::clone(&store)),
            store,
            broadcaster,
            rooms,
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    /// Append a message, refresh the cache and notify the room.
    ///
    /// Duplicates are returned as such with no refresh or publish. Sending
    /// also clears the sender's typing indicator.
    #[instrument(skip_all, fields(%room, %sender))]
    pub async fn send(
        &self,
        room: &RoomId,
        sender: &UserId,
        input: SendMessage,
    ) -> Result<AppendOutcome, StoreError> {
        let mut draft = MessageDraft::new(room.clone(), sender.clone(), input.text);
        draft.id = input.id;
        draft.reply_to = input.reply_to;
        draft.delivered_direct = self.broadcaster.has_peer_listener(room, sender);

        let outcome = self.store.append(draft).await?;
        let AppendOutcome::Stored(message) = &outcome else {
            return Ok(outcome);
        };

        self.refresh_cache(room).await;
        let recipients = self.broadcaster.publish_message(Arc::new(message.clone()));
        debug!(id = %message.id, recipients, "message published");

        if let Some(peer) = self.rooms.peer_of(room, sender) {
            if let Err(e) = self.presence.set_typing(room, sender, &peer, false).await {
                warn!(error = %e, "failed to clear typing after send");
            }
        }
        Ok(outcome)
    }

    async fn refresh_cache(&self, room: &RoomId) {
        match self.store.recent(room, self.cache.max_messages()).await {
            Ok(recent) => self.cache.set(room, &recent),
            Err(e) => {
                warn!(%room, error = %e, "cache refresh failed");
                self.cache.invalidate(room);
            }
        }
    }

    /// Every message newer than `since`, from cache when it covers the
    /// range, otherwise from the store (refilling the cache).
    pub async fn messages_since(&self, room: &RoomId, since: i64) -> Result<Vec<Message>, StoreError> {
        if let Some(hit) = self.cache.since(room, since) {
            return Ok(hit);
        }
        let messages = self.store.query(room, since, usize::MAX).await?;
        self.refresh_cache(room).await;
        Ok(messages)
    }

    /// Polling read: like [`messages_since`](Self::messages_since) but
    /// capped to the newest `limit`.
    pub async fn fetch(
        &self,
        room: &RoomId,
        since: i64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let mut messages = self.messages_since(room, since).await?;
        let skip = messages.len().saturating_sub(limit);
        let _ = messages.drain(..skip);
        Ok(messages)
    }

    /// Set `from`'s typing flag towards `to`, who must be another participant.
    pub async fn set_typing(
        &self,
        room: &RoomId,
        from: &UserId,
        to: &UserId,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        if from == to {
            return Err(ValidationError::NotParticipant(to.to_string(), room.to_string()).into());
        }
        self.rooms.authorize(room, to)?;
        self.presence.set_typing(room, from, to, is_typing).await
    }

    /// Record `user`'s status and publish the change to the room.
    pub async fn set_presence(
        &self,
        room: &RoomId,
        user: &UserId,
        status: PresenceStatus,
    ) -> Result<PresenceChange, StoreError> {
        let change = self.presence.set_presence(room, user, status).await?;
        let _ = self.broadcaster.publish_presence(room, change.clone());
        Ok(change)
    }

    /// Refresh `user`'s `last_seen` without publishing.
    pub async fn touch_presence(&self, room: &RoomId, user: &UserId) -> Result<(), StoreError> {
        let _ = self
            .presence
            .set_presence(room, user, PresenceStatus::Online)
            .await?;
        Ok(())
    }

    pub async fn presence(&self, room: &RoomId) -> Result<PresenceSnapshot, StoreError> {
        self.presence.snapshot(room).await
    }

    /// Whether `from` is currently typing towards `to`.
    pub async fn is_typing(&self, room: &RoomId, from: &UserId, to: &UserId) -> Result<bool, StoreError> {
        Ok(self
            .presence
            .get_typing(room, from, to)
            .await?
            .is_some_and(|r| r.is_typing))
    }

    pub async fn mark_read(
        &self,
        room: &RoomId,
        user: &UserId,
        through: MarkRead,
    ) -> Result<ReadState, StoreError> {
        let last_read = self.receipts.mark_read(room, user, through).await?;
        let unread = self.receipts.unread_count(room, user).await?;
        Ok(ReadState { last_read, unread })
    }

    pub async fn read_state(&self, room: &RoomId, user: &UserId) -> Result<ReadState, StoreError> {
        Ok(ReadState {
            last_read: self.receipts.last_read(room, user).await?,
            unread: self.receipts.unread_count(room, user).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Callback, RoomEvent, SubscriberError};
    use assert_matches::assert_matches;
    use duet_store::MemoryKv;
    use parking_lot::Mutex;

    fn room() -> RoomId {
        RoomId::from("private")
    }

    fn alice() -> UserId {
        UserId::from("alice")
    }

    fn bob() -> UserId {
        UserId::from("bob")
    }

    fn service() -> ChatService {
        ChatService::new(
            Arc::new(MemoryKv::new()),
            MessageStoreConfig::default(),
            CacheConfig::default(),
            PresenceConfig::default(),
            RoomDirectory::new().with_room("private", &["alice", "bob"]),
            Arc::new(Broadcaster::new()),
        )
    }

    fn text(t: &str) -> SendMessage {
        SendMessage {
            text: t.into(),
            ..SendMessage::default()
        }
    }

    fn listen(svc: &ChatService, who: UserId) -> Arc<Mutex<Vec<RoomEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: Callback = Arc::new(move |e: &RoomEvent| -> Result<(), SubscriberError> {
            sink.lock().push(e.clone());
            Ok(())
        });
        let _ = svc.broadcaster().subscribe(&room(), &who, cb);
        seen
    }

    #[test]
    fn directory_authorizes_participants_only() {
        let dir = RoomDirectory::new().with_room("private", &["alice", "bob"]);
        assert!(dir.authorize(&room(), &alice()).is_ok());
        assert_matches!(
            dir.authorize(&room(), &UserId::from("mallory")),
            Err(ValidationError::NotParticipant(..))
        );
        assert!(dir.authorize(&RoomId::from("den"), &alice()).is_err());
        assert_eq!(dir.peer_of(&room(), &alice()), Some(bob()));
    }

    #[tokio::test]
    async fn send_publishes_to_peer_and_fills_cache() {
        let svc = service();
        let seen = listen(&svc, bob());
        let outcome = svc.send(&room(), &alice(), text("hi")).await.unwrap();
        let msg = assert_matches!(outcome, AppendOutcome::Stored(m) => m);
        assert!(msg.delivered_direct);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(svc.cache().get(&room()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_is_not_republished() {
        let svc = service();
        let seen = listen(&svc, bob());
        let first = SendMessage {
            id: Some(MessageId::from("m1")),
            ..text("hi")
        };
        let _ = svc.send(&room(), &alice(), first.clone()).await.unwrap();
        let again = svc.send(&room(), &alice(), first).await.unwrap();
        assert!(again.is_duplicate());
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn without_listener_delivery_is_not_direct() {
        let svc = service();
        let msg = svc
            .send(&room(), &alice(), text("anyone?"))
            .await
            .unwrap()
            .into_message();
        assert!(!msg.delivered_direct);
    }

    #[tokio::test]
    async fn fetch_caps_to_newest() {
        let svc = service();
        for t in ["a", "b", "c"] {
            let _ = svc.send(&room(), &alice(), text(t)).await.unwrap();
        }
        let got = svc.fetch(&room(), 0, 2).await.unwrap();
        let texts: Vec<&str> = got.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn messages_since_falls_back_to_store() {
        let svc = service();
        let _ = svc.send(&room(), &alice(), text("a")).await.unwrap();
        svc.cache().invalidate(&room());
        assert_eq!(svc.messages_since(&room(), 0).await.unwrap().len(), 1);
        assert!(svc.cache().get(&room()).is_some());
    }

    #[tokio::test]
    async fn typing_cleared_on_send() {
        let svc = service();
        svc.set_typing(&room(), &alice(), &bob(), true).await.unwrap();
        assert!(svc.is_typing(&room(), &alice(), &bob()).await.unwrap());
        let _ = svc.send(&room(), &alice(), text("done")).await.unwrap();
        assert!(!svc.is_typing(&room(), &alice(), &bob()).await.unwrap());
    }

    #[tokio::test]
    async fn typing_to_self_or_stranger_is_rejected() {
        let svc = service();
        assert!(svc.set_typing(&room(), &alice(), &alice(), true).await.is_err());
        assert!(svc
            .set_typing(&room(), &alice(), &UserId::from("mallory"), true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn presence_change_is_published() {
        let svc = service();
        let seen = listen(&svc, bob());
        let _ = svc
            .set_presence(&room(), &alice(), PresenceStatus::Online)
            .await
            .unwrap();
        assert_matches!(&seen.lock()[0], RoomEvent::Presence(c) if c.user == alice());
        assert!(svc.presence(&room()).await.unwrap()[&alice()].is_online());
    }

    #[tokio::test]
    async fn read_state_tracks_unread() {
        let svc = service();
        let _ = svc.send(&room(), &alice(), text("one")).await.unwrap();
        let _ = svc.send(&room(), &alice(), text("two")).await.unwrap();
        assert_eq!(svc.read_state(&room(), &bob()).await.unwrap().unread, 2);
        let state = svc.mark_read(&room(), &bob(), MarkRead::All).await.unwrap();
        assert_eq!(state.unread, 0);
        assert!(state.last_read > 0);
    }
}
