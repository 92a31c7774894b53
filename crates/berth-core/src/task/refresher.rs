use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cache::KvCache;
use crate::models::{CoreErrorKind, CoreResult};
use crate::persistence::{ExecutionStore, blocking};
use crate::signal::StopSignal;
use crate::task::hook::{STATUS_OUTDATED_PREFIX, parse_status_outdated_key, run_status_change_hook};
use crate::task::registry::VendorRegistry;

/// Rolls up executions marked outdated by the hook ingress in deferred mode.
pub struct StatusRefresher {
    cache: Arc<dyn KvCache>,
    executions: Arc<dyn ExecutionStore>,
    registry: Arc<VendorRegistry>,
}

impl StatusRefresher {
    pub fn new(
        cache: Arc<dyn KvCache>,
        executions: Arc<dyn ExecutionStore>,
        registry: Arc<VendorRegistry>,
    ) -> Self {
        Self {
            cache,
            executions,
            registry,
        }
    }

    /// One pass over the markers; returns how many executions were rolled up.
    /// A marker survives a failed rollup and is retried on the next pass.
    pub async fn refresh_outdated(&self) -> CoreResult<usize> {
        let mut refreshed = 0;
        for key in self.cache.scan(STATUS_OUTDATED_PREFIX).await? {
            let Some((execution_id, vendor_type)) = parse_status_outdated_key(&key) else {
                tracing::warn!(key = %key, "dropping malformed status marker");
                self.cache.delete(&key).await?;
                continue;
            };

            match blocking(&self.executions, move |store| {
                store.refresh_execution_status(execution_id)
            })
            .await
            {
                Ok(refresh) => {
                    run_status_change_hook(&self.registry, &vendor_type, execution_id, refresh)
                        .await;
                    refreshed += 1;
                }
                Err(error) if error.is(CoreErrorKind::NotFound) => {
                    tracing::debug!(execution_id, "execution gone, dropping status marker");
                }
                Err(error) => {
                    tracing::error!(
                        execution_id,
                        vendor_type = %vendor_type,
                        kind = ?error.kind,
                        message = %error.message,
                        "failed to refresh execution status"
                    );
                    continue;
                }
            }
            self.cache.delete(&key).await?;
        }
        Ok(refreshed)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, stop: StopSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.stopped() => break,
                }
                match self.refresh_outdated().await {
                    Ok(0) => {}
                    Ok(refreshed) => tracing::debug!(refreshed, "refreshed outdated executions"),
                    Err(error) => tracing::error!(
                        kind = ?error.kind,
                        message = %error.message,
                        "execution status refresh pass failed"
                    ),
                }
            }
        })
    }
}
