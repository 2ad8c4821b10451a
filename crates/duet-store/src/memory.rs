use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::kv::KvBackend;

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local backend. Expiry follows the Tokio clock, so paused-time
/// tests can step over TTLs.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }
        // The read guard is released above; removing under it would deadlock.
        let _ = self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let _ = self
            .entries
            .insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _ = self.entries.remove(key);
        Ok(())
    }
}
