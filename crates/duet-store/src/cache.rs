//! Short-lived copy of each room's newest messages.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use duet_core::{Message, RoomId};
use duet_telemetry::metrics::{CACHE_EVICTIONS_TOTAL, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Messages kept per room (the newest ones).
    pub max_messages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_messages: 50,
        }
    }
}

struct CacheEntry {
    messages: Arc<[Message]>,
    stored_at: Instant,
}

/// Read-through cache in front of the message store. Never authoritative:
/// entries expire after the TTL and are checked on every read.
pub struct MessageCache {
    entries: DashMap<RoomId, CacheEntry>,
    config: CacheConfig,
}

impl MessageCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn max_messages(&self) -> usize {
        self.config.max_messages
    }

    fn fresh(&self, room: &RoomId) -> Option<Arc<[Message]>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(room) {
            if now.duration_since(entry.stored_at) < self.config.ttl {
                return Some(Arc::clone(&entry.messages));
            }
        }
        let _ = self
            .entries
            .remove_if(room, |_, e| now.duration_since(e.stored_at) >= self.config.ttl);
        None
    }

    /// The cached messages of `room`, or `None` on a miss.
    pub fn get(&self, room: &RoomId) -> Option<Arc<[Message]>> {
        let hit = self.fresh(room);
        record(hit.is_some());
        hit
    }

    /// Replace a room's entry with the newest `max_messages` of `messages`.
    ///
    /// A fresh entry whose newest message is later than the snapshot's is
    /// kept, so refreshes racing each other cannot roll the cache back.
    pub fn set(&self, room: &RoomId, messages: &[Message]) {
        let now = Instant::now();
        let skip = messages.len().saturating_sub(self.config.max_messages);
        let newest = messages.last().map(|m| m.timestamp);
        let entry = CacheEntry {
            messages: messages[skip..].into(),
            stored_at: now,
        };
        match self.entries.entry(room.clone()) {
            Entry::Occupied(mut current) => {
                let existing = current.get();
                let fresh = now.duration_since(existing.stored_at) < self.config.ttl;
                if fresh && existing.messages.last().map(|m| m.timestamp) > newest {
                    return;
                }
                let _ = current.insert(entry);
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(entry);
            }
        }
    }

    /// Messages newer than `watermark`, answered from cache only when the
    /// entry is known to hold every such message: either the entry is not
    /// full (so it holds the whole room) or its oldest message is at or
    /// before the watermark.
    pub fn since(&self, room: &RoomId, watermark: i64) -> Option<Vec<Message>> {
        let covered = self.fresh(room).filter(|messages| {
            messages.len() < self.config.max_messages
                || messages.first().is_some_and(|m| m.timestamp <= watermark)
        });
        record(covered.is_some());
        covered.map(|messages| {
            let start = messages.partition_point(|m| m.timestamp <= watermark);
            messages[start..].to_vec()
        })
    }

    pub fn invalidate(&self, room: &RoomId) {
        let _ = self.entries.remove(room);
    }

    /// Evict every expired room. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.duration_since(e.stored_at) < self.config.ttl);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            metrics::counter!(CACHE_EVICTIONS_TOTAL).increment(evicted as u64);
            debug!(evicted, "cache sweep");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn record(hit: bool) {
    if hit {
        metrics::counter!(CACHE_HITS_TOTAL).increment(1);
    } else {
        metrics::counter!(CACHE_MISSES_TOTAL).increment(1);
    }
}

/// Sweep expired entries every `every` until `cancel` fires.
pub fn spawn_sweeper(
    cache: Arc<MessageCache>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = cache.sweep();
                }
            }
        }
        debug!("cache sweeper stopped");
    })
}
