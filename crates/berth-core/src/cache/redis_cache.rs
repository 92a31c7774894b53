use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Pipeline, RedisError};
use tokio::sync::OnceCell;

use crate::cache::{CachedValue, KvCache};
use crate::models::{CoreError, CoreErrorKind, CoreResult};

/// Counter handing out entry revisions; shared by every process on the server.
const REVISION_COUNTER_KEY: &str = "berth:cache:revision";
const VALUE_FIELD: &str = "value";
const REVISION_FIELD: &str = "revision";
const SCAN_COUNT: u64 = 500;

/// Cache shared between processes. Each entry is a hash holding the value and
/// the revision it was written at.
pub struct RedisKvCache {
    client: Client,
    shared: OnceCell<MultiplexedConnection>,
}

impl RedisKvCache {
    pub fn open(url: &str) -> CoreResult<Self> {
        let client = Client::open(url).map_err(|error| redis_error("open", error))?;
        Ok(Self {
            client,
            shared: OnceCell::new(),
        })
    }

    async fn connection(&self) -> CoreResult<MultiplexedConnection> {
        self.shared
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|error| redis_error("connect", error))
            })
            .await
            .cloned()
    }

    /// WATCH state belongs to a connection, so transactions get their own.
    async fn dedicated_connection(&self) -> CoreResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| redis_error("connect", error))
    }

    async fn next_revision(connection: &mut MultiplexedConnection) -> CoreResult<u64> {
        redis::cmd("INCR")
            .arg(REVISION_COUNTER_KEY)
            .query_async(connection)
            .await
            .map_err(|error| redis_error("incr", error))
    }
}

fn write_pipeline(key: &str, value: &str, revision: u64, ttl: Option<Duration>) -> Pipeline {
    let mut pipeline = redis::pipe();
    pipeline.atomic();
    pipeline.cmd("DEL").arg(key).ignore();
    pipeline
        .cmd("HSET")
        .arg(key)
        .arg(VALUE_FIELD)
        .arg(value)
        .arg(REVISION_FIELD)
        .arg(revision);
    if let Some(ttl) = ttl {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        pipeline.cmd("PEXPIRE").arg(key).arg(millis).ignore();
    }
    pipeline
}

/// Glob pattern matching keys that start with `prefix` literally.
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for character in prefix.chars() {
        if matches!(character, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(character);
    }
    pattern.push('*');
    pattern
}

fn redis_error(operation: &str, error: RedisError) -> CoreError {
    let kind = if error.is_io_error()
        || error.is_timeout()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
    {
        CoreErrorKind::Transient
    } else {
        CoreErrorKind::Internal
    };
    CoreError::new(kind, format!("redis cache '{operation}' failed: {error}"))
}

#[async_trait]
impl KvCache for RedisKvCache {
    async fn fetch(&self, key: &str) -> CoreResult<Option<CachedValue>> {
        let mut connection = self.connection().await?;
        let (value, revision): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(key)
            .arg(VALUE_FIELD)
            .arg(REVISION_FIELD)
            .query_async(&mut connection)
            .await
            .map_err(|error| redis_error("fetch", error))?;
        Ok(value.map(|value| CachedValue {
            value,
            revision: revision.unwrap_or(0),
        }))
    }

    async fn save(&self, key: &str, value: String, ttl: Option<Duration>) -> CoreResult<()> {
        let mut connection = self.connection().await?;
        let revision = Self::next_revision(&mut connection).await?;
        let _: Option<(i64,)> = write_pipeline(key, &value, revision, ttl)
            .query_async(&mut connection)
            .await
            .map_err(|error| redis_error("save", error))?;
        Ok(())
    }

    async fn compare_and_save(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
        ttl: Option<Duration>,
    ) -> CoreResult<bool> {
        let mut connection = self.dedicated_connection().await?;
        let _: () = redis::cmd("WATCH")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(|error| redis_error("watch", error))?;

        let current: Option<u64> = redis::cmd("HGET")
            .arg(key)
            .arg(REVISION_FIELD)
            .query_async(&mut connection)
            .await
            .map_err(|error| redis_error("compare", error))?;
        if current != expected {
            let _: () = redis::cmd("UNWATCH")
                .query_async(&mut connection)
                .await
                .map_err(|error| redis_error("unwatch", error))?;
            return Ok(false);
        }

        let revision = Self::next_revision(&mut connection).await?;
        // EXEC answers nil when the watched key changed after WATCH.
        let committed: Option<(i64,)> = write_pipeline(key, &value, revision, ttl)
            .query_async(&mut connection)
            .await
            .map_err(|error| redis_error("compare_and_save", error))?;
        Ok(committed.is_some())
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let mut connection = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(|error| redis_error("delete", error))?;
        Ok(())
    }

    async fn contains(&self, key: &str) -> CoreResult<bool> {
        let mut connection = self.connection().await?;
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(|error| redis_error("contains", error))
    }

    async fn scan(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let mut connection = self.connection().await?;
        let pattern = prefix_pattern(prefix);
        let mut keys = BTreeSet::new();
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut connection)
                .await
                .map_err(|error| redis_error("scan", error))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_pattern_escapes_glob_characters() {
        assert_eq!(prefix_pattern("cache:quota:"), "cache:quota:*");
        assert_eq!(prefix_pattern("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\*");
    }

    #[test]
    fn invalid_urls_are_rejected() {
        assert!(RedisKvCache::open("not a url").is_err());
        assert!(RedisKvCache::open("redis://127.0.0.1:6379/0").is_ok());
    }
}
