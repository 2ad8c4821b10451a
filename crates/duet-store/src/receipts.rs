use std::sync::Arc;

use duet_core::{MarkRead, RoomId, UserId, ValidationError};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::keys;
use crate::kv::KvBackend;
use crate::messages::MessageStore;

/// Last-read watermarks under `lastread:<room>:<user>`.
pub struct ReadReceipts {
    kv: Arc<dyn KvBackend>,
    messages: Arc<MessageStore>,
    write_lock: Mutex<()>,
}

impl ReadReceipts {
    pub fn new(kv: Arc<dyn KvBackend>, messages: Arc<MessageStore>) -> Self {
        Self {
            kv,
            messages,
            write_lock: Mutex::new(()),
        }
    }

    /// The user's last-read timestamp; 0 when nothing has been read.
    pub async fn last_read(&self, room: &RoomId, user: &UserId) -> Result<i64, StoreError> {
        let key = keys::last_read(room, user);
        let Some(value) = self.kv.get(&key).await? else {
            return Ok(0);
        };
        Ok(value.as_i64().unwrap_or_else(|| {
            warn!(%key, %value, "last-read value is malformed, treating as unread");
            0
        }))
    }

    /// Advance the watermark to the newest message (`All`) or to the given
    /// message. Never moves it backwards. Returns the resulting watermark.
    pub async fn mark_read(
        &self,
        room: &RoomId,
        user: &UserId,
        through: MarkRead,
    ) -> Result<i64, StoreError> {
        let target = match through {
            MarkRead::All => self
                .messages
                .recent(room, 1)
                .await?
                .last()
                .map_or(0, |m| m.timestamp),
            MarkRead::Through(id) => self
                .messages
                .find(room, &id)
                .await?
                .map(|m| m.timestamp)
                .ok_or_else(|| ValidationError::UnknownMessage(id.into_inner()))?,
        };

        let _guard = self.write_lock.lock().await;
        let current = self.last_read(room, user).await?;
        let next = current.max(target);
        if next != current {
            self.kv
                .set(&keys::last_read(room, user), Value::from(next), None)
                .await?;
            debug!(%room, %user, last_read = next, "read watermark advanced");
        }
        Ok(next)
    }

    /// Messages from other senders newer than the user's watermark.
    pub async fn unread_count(&self, room: &RoomId, user: &UserId) -> Result<usize, StoreError> {
        let last_read = self.last_read(room, user).await?;
        let newer = self.messages.query(room, last_read, usize::MAX).await?;
        Ok(newer.iter().filter(|m| !m.is_from(user)).count())
    }
}
