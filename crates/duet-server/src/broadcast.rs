//! Room-scoped event fan-out to live session callbacks.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use duet_core::{Message, PresenceChange, RoomId, UserId};
use duet_telemetry::metrics::BROADCAST_SUBSCRIBER_FAILURES_TOTAL;
use parking_lot::RwLock;
use tracing::{debug, warn};

/// An event published to a room.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoomEvent {
    Message(Arc<Message>),
    Presence(PresenceChange),
}

/// Why a subscriber refused an event. The subscriber is removed.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("subscriber is closed")]
    Closed,
    #[error("subscriber failed: {0}")]
    Failed(String),
}

pub type Callback = Arc<dyn Fn(&RoomEvent) -> Result<(), SubscriberError> + Send + Sync>;

/// Returned by [`Broadcaster::subscribe`]; pass back to unsubscribe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub room: RoomId,
    id: u64,
}

struct Subscriber {
    id: u64,
    identity: UserId,
    callback: Callback,
}

/// Registry of room subscribers.
///
/// One instance per process, constructed at startup and shared by `Arc`.
/// Publishing calls every callback of the room on the caller's task; a
/// message is never delivered to a subscriber registered under its author.
#[derive(Default)]
pub struct Broadcaster {
    rooms: RwLock<HashMap<RoomId, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        room: &RoomId,
        identity: &UserId,
        callback: Callback,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rooms
            .write()
            .entry(room.clone())
            .or_default()
            .push(Subscriber {
                id,
                identity: identity.clone(),
                callback,
            });
        debug!(%room, %identity, subscription = id, "subscribed");
        SubscriptionHandle {
            room: room.clone(),
            id,
        }
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.remove(&handle.room, &[handle.id]) > 0
    }

    fn remove(&self, room: &RoomId, ids: &[u64]) -> usize {
        let mut rooms = self.rooms.write();
        let Some(subs) = rooms.get_mut(room) else {
            return 0;
        };
        let before = subs.len();
        subs.retain(|s| !ids.contains(&s.id));
        let removed = before - subs.len();
        if subs.is_empty() {
            let _ = rooms.remove(room);
        }
        removed
    }

    /// Notify every subscriber of `room`. Returns how many accepted the event.
    ///
    /// Callbacks run outside the registry lock. One that errors or panics is
    /// logged and removed; the rest are still notified.
    pub fn publish(&self, room: &RoomId, event: &RoomEvent) -> usize {
        let author = match event {
            RoomEvent::Message(m) => Some(&m.sender),
            RoomEvent::Presence(_) => None,
        };
        let targets: Vec<(u64, Callback)> = self
            .rooms
            .read()
            .get(room)
            .map(|subs| {
                subs.iter()
                    .filter(|s| author != Some(&s.identity))
                    .map(|s| (s.id, Arc::clone(&s.callback)))
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, callback) in targets {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(%room, subscription = id, error = %e, "subscriber failed, removing");
                    failed.push(id);
                }
                Err(_) => {
                    warn!(%room, subscription = id, "subscriber panicked, removing");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let removed = self.remove(room, &failed);
            metrics::counter!(BROADCAST_SUBSCRIBER_FAILURES_TOTAL).increment(removed as u64);
        }
        delivered
    }

    pub fn publish_message(&self, message: Arc<Message>) -> usize {
        let room = message.room.clone();
        self.publish(&room, &RoomEvent::Message(message))
    }

    pub fn publish_presence(&self, room: &RoomId, change: PresenceChange) -> usize {
        self.publish(room, &RoomEvent::Presence(change))
    }

    /// Whether some subscriber of `room` other than `author` would receive a
    /// message right now.
    pub fn has_peer_listener(&self, room: &RoomId, author: &UserId) -> bool {
        self.rooms
            .read()
            .get(room)
            .is_some_and(|subs| subs.iter().any(|s| &s.identity != author))
    }

    pub fn subscriber_count(&self, room: &RoomId) -> usize {
        self.rooms.read().get(room).map_or(0, Vec::len)
    }
}
