//! Stored messages and client-submitted drafts.

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::ids::{MessageId, RoomId, UserId};

/// A message as persisted in a room's list.
///
/// `timestamp` is server-assigned epoch milliseconds and strictly increases
/// along a room's list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room: RoomId,
    pub sender: UserId,
    pub text: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub edited: bool,
    /// A live peer was subscribed to the room when the message was sent.
    #[serde(default)]
    pub delivered_direct: bool,
}

impl Message {
    /// Whether this message was written by `user`.
    pub fn is_from(&self, user: &UserId) -> bool {
        &self.sender == user
    }
}

/// An append candidate. `id` and `timestamp` are filled in by the store
/// when absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    pub room: RoomId,
    pub sender: UserId,
    pub text: String,
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub delivered_direct: bool,
}

impl MessageDraft {
    pub fn new(room: impl Into<RoomId>, sender: impl Into<UserId>, text: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            sender: sender.into(),
            text: text.into(),
            id: None,
            timestamp: None,
            reply_to: None,
            delivered_direct: false,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn replying_to(mut self, id: impl Into<MessageId>) -> Self {
        self.reply_to = Some(id.into());
        self
    }

    /// The caller-supplied id, if it is non-blank.
    pub fn client_id(&self) -> Option<&MessageId> {
        self.id.as_ref().filter(|id| !id.is_blank())
    }

    /// Check required fields. Text is validated after trimming.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.room.is_blank() {
            return Err(ValidationError::MissingRoom);
        }
        if self.sender.is_blank() {
            return Err(ValidationError::MissingSender);
        }
        if self.text.trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        Ok(())
    }

    /// Whether `existing` is the same submission seen again: identical id,
    /// or same sender and text within `window_ms` of this draft's timestamp.
    pub fn duplicates(&self, existing: &Message, timestamp: i64, window_ms: i64) -> bool {
        if self.client_id() == Some(&existing.id) {
            return true;
        }
        existing.sender == self.sender
            && existing.text == self.text.trim()
            && (existing.timestamp - timestamp).abs() <= window_ms
    }

    /// Finalise into a stored message.
    pub fn into_message(self, id: MessageId, timestamp: i64) -> Message {
        Message {
            id,
            room: self.room,
            sender: self.sender,
            text: self.text.trim().to_owned(),
            timestamp,
            reply_to: self.reply_to,
            edited: false,
            delivered_direct: self.delivered_direct,
        }
    }
}
