/// cache store backends used by the read-through coordinator.
///
/// The coordinator only needs two primitives from a store: `GET key` and
/// `SETEX key ttl value`. Expiry is the store's job; a store must never
/// return an entry past its TTL.
///
/// * `MemoryStore` is a process-local worker with a hash map of entries, used
///   for single-process runs and tests
/// * `RedisStore` talks to a redis server and is shared by every worker process
///
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// return the live value for `key`, or None when absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// store `value` under `key` for `ttl`, replacing any current entry
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
}
