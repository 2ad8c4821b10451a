use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

/// Key/value persistence used by every store component.
///
/// Values are JSON documents. An entry written with a TTL reads as absent
/// once the TTL has elapsed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
