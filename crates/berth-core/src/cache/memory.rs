use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cache::{CachedValue, KvCache};
use crate::models::{CoreError, CoreResult};

#[derive(Default)]
pub struct InMemoryKvCache {
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    next_revision: u64,
    slots: HashMap<String, Slot>,
}

struct Slot {
    value: String,
    revision: u64,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

impl CacheState {
    fn live(&mut self, key: &str) -> Option<&Slot> {
        let now = Instant::now();
        if self.slots.get(key).is_some_and(|slot| !slot.is_live(now)) {
            self.slots.remove(key);
        }
        self.slots.get(key)
    }

    fn write(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        self.next_revision = self.next_revision.saturating_add(1);
        self.slots.insert(
            key.to_string(),
            Slot {
                value,
                revision: self.next_revision,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }
}

impl InMemoryKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> CoreResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::internal("kv cache mutex poisoned"))
    }
}

#[async_trait]
impl KvCache for InMemoryKvCache {
    async fn fetch(&self, key: &str) -> CoreResult<Option<CachedValue>> {
        let mut state = self.lock_state()?;
        Ok(state.live(key).map(|slot| CachedValue {
            value: slot.value.clone(),
            revision: slot.revision,
        }))
    }

    async fn save(&self, key: &str, value: String, ttl: Option<Duration>) -> CoreResult<()> {
        let mut state = self.lock_state()?;
        state.write(key, value, ttl);
        Ok(())
    }

    async fn compare_and_save(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
        ttl: Option<Duration>,
    ) -> CoreResult<bool> {
        let mut state = self.lock_state()?;
        let current = state.live(key).map(|slot| slot.revision);
        if current != expected {
            return Ok(false);
        }
        state.write(key, value, ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let mut state = self.lock_state()?;
        state.slots.remove(key);
        Ok(())
    }

    async fn contains(&self, key: &str) -> CoreResult<bool> {
        let mut state = self.lock_state()?;
        Ok(state.live(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let mut state = self.lock_state()?;
        let now = Instant::now();
        state.slots.retain(|_, slot| slot.is_live(now));
        let mut keys: Vec<String> = state
            .slots
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn compare_and_save_detects_concurrent_writer() {
        let cache = InMemoryKvCache::new();
        assert!(cache.compare_and_save("k", None, "a".into(), None).await.unwrap());
        let first = cache.fetch("k").await.unwrap().unwrap();

        cache.save("k", "b".into(), None).await.unwrap();
        assert!(!cache
            .compare_and_save("k", Some(first.revision), "c".into(), None)
            .await
            .unwrap());
        assert_eq!(cache.fetch("k").await.unwrap().unwrap().value, "b");
    }

    #[tokio::test]
    async fn expired_entries_disappear() {
        let cache = InMemoryKvCache::new();
        cache
            .save("quota:1", "x".into(), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        cache.save("quota:2", "y".into(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cache.contains("quota:1").await.unwrap());
        assert_eq!(cache.scan("quota:").await.unwrap(), vec!["quota:2".to_string()]);
    }
}
