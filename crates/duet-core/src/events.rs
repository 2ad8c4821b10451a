//! Typed events written to a live session's stream.

use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, SessionId, UserId};
use crate::message::Message;
use crate::presence::PresenceSnapshot;

/// One event on a live session stream.
///
/// Serialized with a `type` tag; the same string is used as the SSE event name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    Connected {
        session_id: SessionId,
        user: UserId,
        room: RoomId,
        server_time: i64,
    },
    Messages {
        messages: Vec<Message>,
    },
    Presence {
        users: PresenceSnapshot,
    },
    Typing {
        from: UserId,
        is_typing: bool,
    },
    Heartbeat {
        server_time: i64,
    },
}

impl StreamEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Messages { .. } => "messages",
            Self::Presence { .. } => "presence",
            Self::Typing { .. } => "typing",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}
