//! Presence, typing and read-receipt records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, UserId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    #[default]
    Offline,
}

/// Presence of one user in one room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub last_seen: i64,
}

impl PresenceRecord {
    pub fn online(at: i64) -> Self {
        Self {
            status: PresenceStatus::Online,
            last_seen: at,
        }
    }

    pub fn offline(at: i64) -> Self {
        Self {
            status: PresenceStatus::Offline,
            last_seen: at,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }

    /// Apply the staleness convention: an online record not refreshed within
    /// `ttl_ms` of `now` reads as offline.
    #[must_use]
    pub fn settled(self, now: i64, ttl_ms: i64) -> Self {
        if self.is_online() && now - self.last_seen > ttl_ms {
            Self::offline(self.last_seen)
        } else {
            self
        }
    }
}

/// Full presence map of a room, keyed by user.
pub type PresenceSnapshot = BTreeMap<UserId, PresenceRecord>;

/// A single presence transition, fanned out to a room's live sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub user: UserId,
    pub record: PresenceRecord,
}

/// Typing state from one participant towards another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRecord {
    pub from: UserId,
    pub to: UserId,
    pub is_typing: bool,
    pub timestamp: i64,
}

/// How far a read acknowledgement reaches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkRead {
    /// Everything currently in the room.
    All,
    /// Up to and including the given message.
    Through(MessageId),
}
