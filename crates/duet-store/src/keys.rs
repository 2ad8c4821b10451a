//! Logical key layout shared by every backend.

use duet_core::{RoomId, UserId};

pub fn messages(room: &RoomId) -> String {
    format!("messages:{room}")
}

pub fn presence(room: &RoomId) -> String {
    format!("presence:{room}")
}

pub fn typing(room: &RoomId, to: &UserId, from: &UserId) -> String {
    format!("typing:{room}:{to}:from:{from}")
}

pub fn last_read(room: &RoomId, user: &UserId) -> String {
    format!("lastread:{room}:{user}")
}
