use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cache::{KvCache, fetch_json};
use crate::models::{CoreResult, Quota};
use crate::persistence::{QuotaStore, blocking};
use crate::quota::controller::QUOTA_CACHE_PREFIX;
use crate::signal::StopSignal;

/// Writes every reserved cell back to the store. Failures are logged and the
/// cell stays authoritative until the next pass. Returns the flushed count.
pub async fn flush_quotas(cache: &dyn KvCache, store: &Arc<dyn QuotaStore>) -> CoreResult<usize> {
    let keys = cache.scan(QUOTA_CACHE_PREFIX).await?;
    let mut flushed = 0;

    for key in keys {
        let quota = match fetch_json::<Quota>(cache, &key).await {
            Ok(Some((quota, _))) => quota,
            Ok(None) => continue,
            Err(error) => {
                tracing::error!(key = %key, message = %error.message, "failed to read quota cache entry");
                continue;
            }
        };

        let (id, used) = (quota.id, quota.used.clone());
        match blocking(store, move |store| store.flush_usage(id, &used)).await {
            Ok(()) => flushed += 1,
            Err(error) => tracing::error!(
                key = %key,
                quota_id = id,
                kind = ?error.kind,
                message = %error.message,
                "failed to flush quota usage"
            ),
        }
    }

    Ok(flushed)
}

pub fn spawn_flush_loop(
    cache: Arc<dyn KvCache>,
    store: Arc<dyn QuotaStore>,
    interval: Duration,
    stop: StopSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.stopped() => break,
            }
            match flush_quotas(cache.as_ref(), &store).await {
                Ok(flushed) => tracing::debug!(flushed, "flushed quota cache"),
                Err(error) => tracing::error!(message = %error.message, "quota flush pass failed"),
            }
        }
        // last pass so reservations made since the previous tick are kept
        if let Err(error) = flush_quotas(cache.as_ref(), &store).await {
            tracing::error!(message = %error.message, "final quota flush failed");
        }
    })
}
