//! Presence and typing state.
//!
//! Presence for a room lives in one map under `presence:<room>`; typing is
//! one short-TTL record per (room, to, from).

use std::sync::Arc;
use std::time::Duration;

use duet_core::{
    now_millis, PresenceChange, PresenceRecord, PresenceSnapshot, PresenceStatus, RoomId,
    TypingRecord, UserId,
};
use duet_telemetry::metrics::STORE_CORRUPTION_RESETS_TOTAL;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::keys;
use crate::kv::KvBackend;

#[derive(Clone, Debug)]
pub struct PresenceConfig {
    /// How long a presence map persists, and how old an online record may
    /// be before it reads as offline.
    pub presence_ttl: Duration,
    pub typing_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            presence_ttl: Duration::from_secs(3_600),
            typing_ttl: Duration::from_secs(5),
        }
    }
}

pub struct PresenceTracker {
    kv: Arc<dyn KvBackend>,
    config: PresenceConfig,
    /// Serialises read-modify-write of presence maps.
    write_lock: Mutex<()>,
}

impl PresenceTracker {
    pub fn new(kv: Arc<dyn KvBackend>, config: PresenceConfig) -> Self {
        Self {
            kv,
            config,
            write_lock: Mutex::new(()),
        }
    }

    fn presence_ttl_ms(&self) -> i64 {
        i64::try_from(self.config.presence_ttl.as_millis()).unwrap_or(i64::MAX)
    }

    /// Record `user`'s status in `room` stamped with the current time.
    pub async fn set_presence(
        &self,
        room: &RoomId,
        user: &UserId,
        status: PresenceStatus,
    ) -> Result<PresenceChange, StoreError> {
        let record = PresenceRecord {
            status,
            last_seen: now_millis(),
        };
        let _guard = self.write_lock.lock().await;
        let mut map = self.load(room).await?;
        let _ = map.insert(user.clone(), record);
        self.kv
            .set(
                &keys::presence(room),
                serde_json::to_value(&map)?,
                Some(self.config.presence_ttl),
            )
            .await?;
        debug!(%room, %user, ?status, "presence updated");
        Ok(PresenceChange {
            user: user.clone(),
            record,
        })
    }

    /// `user`'s presence, offline when absent or stale.
    pub async fn get_presence(
        &self,
        room: &RoomId,
        user: &UserId,
    ) -> Result<PresenceRecord, StoreError> {
        Ok(self.snapshot(room).await?.remove(user).unwrap_or_default())
    }

    /// Every user's presence in `room`, with stale online records settled to
    /// offline.
    pub async fn snapshot(&self, room: &RoomId) -> Result<PresenceSnapshot, StoreError> {
        let now = now_millis();
        let ttl = self.presence_ttl_ms();
        let mut map = self.load(room).await?;
        for record in map.values_mut() {
            *record = record.settled(now, ttl);
        }
        Ok(map)
    }

    /// Set or clear `from`'s typing indicator towards `to`. A true flag
    /// expires after the typing TTL; false deletes the record.
    pub async fn set_typing(
        &self,
        room: &RoomId,
        from: &UserId,
        to: &UserId,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        let key = keys::typing(room, to, from);
        if !is_typing {
            return self.kv.delete(&key).await;
        }
        let record = TypingRecord {
            from: from.clone(),
            to: to.clone(),
            is_typing,
            timestamp: now_millis(),
        };
        self.kv
            .set(&key, serde_json::to_value(&record)?, Some(self.config.typing_ttl))
            .await
    }

    /// The live typing record from `from` towards `to`, if any.
    pub async fn get_typing(
        &self,
        room: &RoomId,
        from: &UserId,
        to: &UserId,
    ) -> Result<Option<TypingRecord>, StoreError> {
        let key = keys::typing(room, to, from);
        let Some(value) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<TypingRecord>(value) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(%key, error = %e, "typing record is malformed, dropping");
                self.kv.delete(&key).await?;
                Ok(None)
            }
        }
    }

    async fn load(&self, room: &RoomId) -> Result<PresenceSnapshot, StoreError> {
        let key = keys::presence(room);
        let Some(value) = self.kv.get(&key).await? else {
            return Ok(PresenceSnapshot::new());
        };
        match serde_json::from_value(value) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(%key, error = %e, "presence map is malformed, resetting");
                metrics::counter!(STORE_CORRUPTION_RESETS_TOTAL, "key_kind" => "presence")
                    .increment(1);
                if let Err(e) = self.kv.set(&key, Value::Object(serde_json::Map::new()), None).await {
                    warn!(%key, error = %e, "failed to reset malformed presence map");
                }
                Ok(PresenceSnapshot::new())
            }
        }
    }
}
