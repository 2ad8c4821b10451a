//! # duet-store
//!
//! Persistence for the delivery core: the per-room message store with
//! idempotent append, the short-TTL message cache, presence and typing
//! state, and read receipts. Everything persists through [`KvBackend`],
//! implemented in memory ([`MemoryKv`]) and on SQLite ([`SqliteKv`]).

#![deny(unsafe_code)]

pub mod cache;
pub mod error;
pub mod keys;
pub mod kv;
pub mod memory;
pub mod messages;
pub mod presence;
pub mod receipts;
pub mod sqlite;

pub use cache::{spawn_sweeper, CacheConfig, MessageCache};
pub use error::StoreError;
pub use kv::KvBackend;
pub use memory::MemoryKv;
pub use messages::{AppendOutcome, MessageStore, MessageStoreConfig};
pub use presence::{PresenceConfig, PresenceTracker};
pub use receipts::ReadReceipts;
pub use sqlite::SqliteKv;
