mod memory;
mod redis_cache;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::models::{CoreError, CoreResult};

pub use memory::InMemoryKvCache;
pub use redis_cache::RedisKvCache;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CachedValue {
    pub value: String,
    /// Changes on every write; compare-and-save keys off it.
    pub revision: u64,
}

/// Shared key-value cache used for reserved quota cells and deferred status
/// markers.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn fetch(&self, key: &str) -> CoreResult<Option<CachedValue>>;

    async fn save(&self, key: &str, value: String, ttl: Option<Duration>) -> CoreResult<()>;

    /// Writes `value` only when the key is still at `expected` (`None` means
    /// absent). Returns false when another writer got there first.
    async fn compare_and_save(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
        ttl: Option<Duration>,
    ) -> CoreResult<bool>;

    async fn delete(&self, key: &str) -> CoreResult<()>;

    async fn contains(&self, key: &str) -> CoreResult<bool>;

    /// Live keys starting with `prefix`, sorted.
    async fn scan(&self, prefix: &str) -> CoreResult<Vec<String>>;
}

pub async fn fetch_json<T: DeserializeOwned>(
    cache: &dyn KvCache,
    key: &str,
) -> CoreResult<Option<(T, u64)>> {
    let Some(cached) = cache.fetch(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_str(&cached.value).map_err(|error| {
        CoreError::internal(format!("failed to decode cache entry '{key}': {error}"))
    })?;
    Ok(Some((value, cached.revision)))
}

pub fn encode_json<T: Serialize>(key: &str, value: &T) -> CoreResult<String> {
    serde_json::to_string(value).map_err(|error| {
        CoreError::internal(format!("failed to encode cache entry '{key}': {error}"))
    })
}
