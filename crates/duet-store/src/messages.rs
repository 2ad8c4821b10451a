//! Per-room append-only message lists with idempotent append.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use duet_core::{now_millis, Message, MessageDraft, MessageId, RoomId};
use duet_telemetry::metrics::{
    MESSAGES_APPENDED_TOTAL, MESSAGES_DUPLICATE_TOTAL, MESSAGES_REJECTED_TOTAL,
    STORE_CORRUPTION_RESETS_TOTAL,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::error::StoreError;
use crate::keys;
use crate::kv::KvBackend;

#[derive(Clone, Debug)]
pub struct MessageStoreConfig {
    /// Retained messages per room; the oldest are trimmed first.
    pub max_messages: usize,
    /// Same sender and text within this window of an existing message is a duplicate.
    pub dedupe_window: Duration,
}

impl Default for MessageStoreConfig {
    fn default() -> Self {
        Self {
            max_messages: 1_000,
            dedupe_window: Duration::from_secs(1),
        }
    }
}

/// Result of [`MessageStore::append`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Stored(Message),
    /// The submission matched this already-stored message; nothing was written.
    Duplicate(Message),
}

impl AppendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            Self::Stored(m) | Self::Duplicate(m) => m,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Stored(m) | Self::Duplicate(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Canonical message lists, one per room, persisted under `messages:<room>`.
///
/// Appends to one room are serialised by a per-room async mutex held across
/// the read, duplicate check and write-back. Reads take no lock.
pub struct MessageStore {
    kv: Arc<dyn KvBackend>,
    config: MessageStoreConfig,
    room_locks: DashMap<RoomId, Arc<Mutex<()>>>,
}

impl MessageStore {
    pub fn new(kv: Arc<dyn KvBackend>, config: MessageStoreConfig) -> Self {
        Self {
            kv,
            config,
            room_locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MessageStoreConfig {
        &self.config
    }

    fn room_lock(&self, room: &RoomId) -> Arc<Mutex<()>> {
        Arc::clone(&self.room_locks.entry(room.clone()).or_default())
    }

    /// Validate, deduplicate and append a message.
    ///
    /// The stored timestamp is the draft's (or now) raised to one past the
    /// room's newest message, so the list stays strictly ordered. The
    /// duplicate window is measured against the unadjusted timestamp.
    #[instrument(skip(self, draft), fields(room = %draft.room, sender = %draft.sender))]
    pub async fn append(&self, draft: MessageDraft) -> Result<AppendOutcome, StoreError> {
        if let Err(e) = draft.validate() {
            metrics::counter!(MESSAGES_REJECTED_TOTAL, "kind" => e.error_kind()).increment(1);
            return Err(e.into());
        }

        let room = draft.room.clone();
        let lock = self.room_lock(&room);
        let _guard = lock.lock().await;

        let mut list = self.load(&room).await?;
        let candidate_ts = draft.timestamp.unwrap_or_else(now_millis);
        let window = i64::try_from(self.config.dedupe_window.as_millis()).unwrap_or(i64::MAX);

        if let Some(existing) = list
            .iter()
            .rev()
            .find(|m| draft.duplicates(m, candidate_ts, window))
        {
            debug!(id = %existing.id, "duplicate append suppressed");
            metrics::counter!(MESSAGES_DUPLICATE_TOTAL).increment(1);
            return Ok(AppendOutcome::Duplicate(existing.clone()));
        }

        let timestamp = match list.last() {
            Some(last) => candidate_ts.max(last.timestamp + 1),
            None => candidate_ts,
        };
        let id = draft.client_id().cloned().unwrap_or_default();
        let message = draft.into_message(id, timestamp);
        list.push(message.clone());

        if list.len() > self.config.max_messages {
            let excess = list.len() - self.config.max_messages;
            let _ = list.drain(..excess);
        }

        self.kv
            .set(&keys::messages(&room), serde_json::to_value(&list)?, None)
            .await?;

        metrics::counter!(MESSAGES_APPENDED_TOTAL, "room" => room.to_string()).increment(1);
        debug!(id = %message.id, timestamp, "message stored");
        Ok(AppendOutcome::Stored(message))
    }

    /// Messages with `timestamp > since`, ascending. When more than `limit`
    /// match, only the newest `limit` are returned.
    pub async fn query(
        &self,
        room: &RoomId,
        since: i64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let list = self.load(room).await?;
        let start = list.partition_point(|m| m.timestamp <= since);
        let newer = &list[start..];
        let skip = newer.len().saturating_sub(limit);
        Ok(newer[skip..].to_vec())
    }

    /// The newest `n` messages, ascending.
    pub async fn recent(&self, room: &RoomId, n: usize) -> Result<Vec<Message>, StoreError> {
        let mut list = self.load(room).await?;
        let skip = list.len().saturating_sub(n);
        let _ = list.drain(..skip);
        Ok(list)
    }

    /// The whole retained list.
    pub async fn all(&self, room: &RoomId) -> Result<Vec<Message>, StoreError> {
        self.load(room).await
    }

    pub async fn find(&self, room: &RoomId, id: &MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.load(room).await?.into_iter().find(|m| &m.id == id))
    }

    /// Read a room's list. A value of the wrong shape is logged, reset to an
    /// empty list, and read as empty.
    async fn load(&self, room: &RoomId) -> Result<Vec<Message>, StoreError> {
        let key = keys::messages(room);
        let Some(value) = self.kv.get(&key).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_value::<Vec<Message>>(value) {
            Ok(list) => Ok(list),
            Err(e) => {
                warn!(%key, error = %e, "message list is malformed, resetting room");
                metrics::counter!(STORE_CORRUPTION_RESETS_TOTAL, "key_kind" => "messages")
                    .increment(1);
                if let Err(e) = self.kv.set(&key, Value::Array(Vec::new()), None).await {
                    warn!(%key, error = %e, "failed to reset malformed message list");
                }
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MockKvBackend;
    use crate::memory::MemoryKv;
    use assert_matches::assert_matches;
    use duet_core::{UserId, ValidationError};
    use serde_json::json;

    fn room() -> RoomId {
        RoomId::from("private")
    }

    fn store() -> MessageStore {
        MessageStore::new(Arc::new(MemoryKv::new()), MessageStoreConfig::default())
    }

    fn draft(sender: &str, text: &str, ts: i64) -> MessageDraft {
        MessageDraft::new("private", sender, text).at(ts)
    }

    #[tokio::test]
    async fn append_assigns_id_and_timestamp() {
        let store = store();
        let outcome = store
            .append(MessageDraft::new("private", "alice", "hello"))
            .await
            .unwrap();
        let msg = assert_matches!(outcome, AppendOutcome::Stored(m) => m);
        assert!(msg.id.starts_with("msg_"));
        assert!(msg.timestamp > 0);
        assert_eq!(store.all(&room()).await.unwrap(), vec![msg]);
    }

    #[tokio::test]
    async fn empty_text_is_rejected_without_write() {
        let store = store();
        let err = store.append(draft("alice", "   ", 1)).await.unwrap_err();
        assert_matches!(err, StoreError::Validation(ValidationError::EmptyText));
        assert!(store.all(&room()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_text_within_window_is_duplicate() {
        let store = store();
        let first = store.append(draft("alice", "hi", 100_000)).await.unwrap();
        let second = store.append(draft("alice", "hi", 100_400)).await.unwrap();
        assert!(second.is_duplicate());
        assert_eq!(second.message(), first.message());
        assert_eq!(store.all(&room()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_text_outside_window_is_stored() {
        let store = store();
        let _ = store.append(draft("alice", "hi", 100_000)).await.unwrap();
        let second = store.append(draft("alice", "hi", 101_500)).await.unwrap();
        assert!(!second.is_duplicate());
        assert_eq!(store.all(&room()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn blank_client_id_gets_a_fresh_id() {
        let store = store();
        let first = store
            .append(draft("alice", "first", 100_000).with_id(""))
            .await
            .unwrap();
        let second = store
            .append(draft("bob", "totally different", 100_100).with_id(""))
            .await
            .unwrap();
        let (first, second) = (
            assert_matches!(first, AppendOutcome::Stored(m) => m),
            assert_matches!(second, AppendOutcome::Stored(m) => m),
        );
        assert!(first.id.starts_with("msg_"));
        assert_ne!(first.id, second.id);
        assert_eq!(store.all(&room()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn same_id_is_duplicate() {
        let store = store();
        let _ = store
            .append(draft("alice", "one", 1_000).with_id("m1"))
            .await
            .unwrap();
        let again = store
            .append(draft("alice", "two", 90_000).with_id("m1"))
            .await
            .unwrap();
        assert!(again.is_duplicate());
        assert_eq!(again.message().text, "one");
    }

    #[tokio::test]
    async fn timestamps_are_strictly_increasing() {
        let store = store();
        let a = store.append(draft("alice", "a", 500)).await.unwrap();
        let b = store.append(draft("bob", "b", 500)).await.unwrap();
        let c = store.append(draft("alice", "c", 100)).await.unwrap();
        assert_eq!(a.message().timestamp, 500);
        assert_eq!(b.message().timestamp, 501);
        assert_eq!(c.message().timestamp, 502);
    }

    #[tokio::test]
    async fn retention_keeps_newest() {
        let store = store();
        for i in 0..1001 {
            let _ = store
                .append(draft("alice", &format!("m{i}"), 10_000 + i64::from(i) * 10))
                .await
                .unwrap();
        }
        let all = store.all(&room()).await.unwrap();
        assert_eq!(all.len(), 1000);
        assert_eq!(all[0].text, "m1");
        assert_eq!(all[999].text, "m1000");
    }

    #[tokio::test]
    async fn query_since_is_exclusive_and_limited() {
        let store = store();
        for (i, ts) in [10, 20, 30, 40, 50].into_iter().enumerate() {
            let _ = store
                .append(draft("alice", &format!("m{i}"), ts))
                .await
                .unwrap();
        }
        let all_after = store.query(&room(), 20, 100).await.unwrap();
        let stamps: Vec<i64> = all_after.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![30, 40, 50]);

        let limited = store.query(&room(), 0, 2).await.unwrap();
        let stamps: Vec<i64> = limited.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![40, 50]);

        assert!(store.query(&room(), 50, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_returns_tail() {
        let store = store();
        for ts in [1, 2, 3] {
            let _ = store
                .append(draft("bob", &ts.to_string(), ts))
                .await
                .unwrap();
        }
        let recent = store.recent(&room(), 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, 2);
    }

    #[tokio::test]
    async fn rooms_are_independent() {
        let store = store();
        let _ = store.append(draft("alice", "hi", 1)).await.unwrap();
        let other = MessageDraft::new("den", "alice", "hi").at(1);
        assert!(!store.append(other).await.unwrap().is_duplicate());
        assert!(store.find(&RoomId::from("den"), &MessageId::from("x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_list_self_heals() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("messages:private", json!({"not": "a list"}), None)
            .await
            .unwrap();
        let store = MessageStore::new(kv.clone(), MessageStoreConfig::default());

        assert!(store.query(&room(), 0, 10).await.unwrap().is_empty());
        assert_eq!(kv.get("messages:private").await.unwrap(), Some(json!([])));

        let stored = store.append(draft("alice", "after", 5)).await.unwrap();
        assert!(!stored.is_duplicate());
    }

    #[tokio::test]
    async fn failed_reset_still_reads_empty() {
        let mut kv = MockKvBackend::new();
        let _ = kv
            .expect_get()
            .returning(|_| Ok(Some(Value::String("garbage".into()))));
        let _ = kv
            .expect_set()
            .withf(|key, value, ttl| key == "messages:private" && *value == json!([]) && ttl.is_none())
            .times(1)
            .returning(|_, _, _| Err(StoreError::Database("disk full".into())));
        let store = MessageStore::new(Arc::new(kv), MessageStoreConfig::default());
        assert!(store.all(&room()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backend_read_failure_propagates() {
        let mut kv = MockKvBackend::new();
        let _ = kv
            .expect_get()
            .returning(|_| Err(StoreError::Database("locked".into())));
        let store = MessageStore::new(Arc::new(kv), MessageStoreConfig::default());
        assert_matches!(
            store.query(&room(), 0, 10).await,
            Err(StoreError::Database(_))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_appends_store_once() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append(draft("alice", "race", 7_000)).await.unwrap()
            }));
        }
        let mut stored = 0;
        for handle in handles {
            if !handle.await.unwrap().is_duplicate() {
                stored += 1;
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(store.all(&room()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn author_is_preserved() {
        let store = store();
        let msg = store
            .append(draft("bob", "yo", 1).replying_to("m0"))
            .await
            .unwrap()
            .into_message();
        assert!(msg.is_from(&UserId::from("bob")));
        assert_eq!(msg.reply_to, Some(MessageId::from("m0")));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn run<F: std::future::Future>(f: F) -> F::Output {
            tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap()
                .block_on(f)
        }

        fn submissions() -> impl Strategy<Value = Vec<(bool, String, i64, Option<u8>)>> {
            proptest::collection::vec(
                (any::<bool>(), "[a-c]{1,2}", 0i64..5_000, proptest::option::of(0u8..6)),
                1..60,
            )
        }

        proptest! {
            #[test]
            fn list_stays_sorted_and_unique(subs in submissions()) {
                let all = run(async {
                    let store = MessageStore::new(
                        Arc::new(MemoryKv::new()),
                        MessageStoreConfig { max_messages: 40, ..Default::default() },
                    );
                    for (alice, text, ts, id) in subs {
                        let sender = if alice { "alice" } else { "bob" };
                        let mut d = draft(sender, &text, ts);
                        if let Some(id) = id {
                            d = d.with_id(format!("m{id}"));
                        }
                        let _ = store.append(d).await.unwrap();
                    }
                    store.all(&room()).await.unwrap()
                });
                prop_assert!(all.len() <= 40);
                prop_assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
                let mut ids: Vec<_> = all.iter().map(|m| m.id.clone()).collect();
                ids.sort();
                ids.dedup();
                prop_assert_eq!(ids.len(), all.len());
            }

            #[test]
            fn query_respects_since_and_limit(
                stamps in proptest::collection::vec(0i64..10_000, 0..40),
                since in 0i64..10_000,
                limit in 0usize..20,
            ) {
                let result = run(async {
                    let store = MessageStore::new(
                        Arc::new(MemoryKv::new()),
                        MessageStoreConfig { dedupe_window: Duration::ZERO, ..Default::default() },
                    );
                    for (i, ts) in stamps.iter().enumerate() {
                        let _ = store.append(draft("alice", &format!("t{i}"), *ts)).await.unwrap();
                    }
                    store.query(&room(), since, limit).await.unwrap()
                });
                prop_assert!(result.len() <= limit);
                prop_assert!(result.iter().all(|m| m.timestamp > since));
                prop_assert!(result.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            }
        }
    }
}
