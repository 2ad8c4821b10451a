//! # duet-core
//!
//! Shared vocabulary for the duet delivery core.
//!
//! - **Branded IDs**: `RoomId`, `UserId`, `MessageId`, `SessionId` as string newtypes
//! - **Messages**: stored [`Message`] and the client-submitted [`MessageDraft`]
//! - **State records**: presence, typing and read-receipt records
//! - **Stream events**: the typed [`StreamEvent`] sent down a live session
//! - **Errors**: [`ValidationError`] for rejected input

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod presence;
pub mod time;

pub use errors::ValidationError;
pub use events::StreamEvent;
pub use ids::{MessageId, RoomId, SessionId, UserId};
pub use message::{Message, MessageDraft};
pub use presence::{
    MarkRead, PresenceChange, PresenceRecord, PresenceSnapshot, PresenceStatus, TypingRecord,
};
pub use time::now_millis;
