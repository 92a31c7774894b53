use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use crate::cache::{KvCache, encode_json, fetch_json};
use crate::config::QuotaUpdateProvider;
use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Quota, QuotaChanges, QuotaQuery, QuotaView,
    ResourceErrors, ResourceList, is_safe,
};
use crate::persistence::{QuotaStore, blocking};
use crate::quota::driver::DriverRegistry;
use crate::quota::warning::{
    DEFAULT_WARNING_PERCENT, QuotaEventSink, QuotaWarningEvent, crossed_resources,
};
use crate::retry::{RetryOptions, retry};
use crate::singleflight::SingleFlight;

pub const QUOTA_CACHE_PREFIX: &str = "cache:quota:";
pub const QUOTA_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// How long a resource missing from the hard limits is retried. It only
/// resolves if the limits are updated meanwhile.
pub const MISSING_RESOURCE_RETRY: Duration = Duration::from_secs(5);

const REFRESH_ALL_PAGE_SIZE: u64 = 100;

pub fn quota_cache_key(reference: &str, reference_id: &str) -> String {
    format!("{QUOTA_CACHE_PREFIX}{reference}:{reference_id}")
}

#[derive(Clone, Debug, Default)]
pub struct QuotaOptions {
    pub ignore_limitation: bool,
    pub with_reference_object: bool,
    pub retry: Option<RetryOptions>,
}

impl QuotaOptions {
    pub fn ignore_limitation(mut self, ignore: bool) -> Self {
        self.ignore_limitation = ignore;
        self
    }

    pub fn with_reference_object(mut self) -> Self {
        self.with_reference_object = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
}

pub struct QuotaController {
    store: Arc<dyn QuotaStore>,
    drivers: Arc<DriverRegistry>,
    cache: Arc<dyn KvCache>,
    provider: QuotaUpdateProvider,
    flights: SingleFlight<Quota>,
    retry: RetryOptions,
    missing_resource_retry: Duration,
    warning_percent: u8,
    event_sink: Option<Arc<dyn QuotaEventSink>>,
}

impl QuotaController {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        drivers: Arc<DriverRegistry>,
        cache: Arc<dyn KvCache>,
        provider: QuotaUpdateProvider,
    ) -> Self {
        Self {
            store,
            drivers,
            cache,
            provider,
            flights: SingleFlight::new(),
            retry: RetryOptions::default(),
            missing_resource_retry: MISSING_RESOURCE_RETRY,
            warning_percent: DEFAULT_WARNING_PERCENT,
            event_sink: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_missing_resource_retry(mut self, bound: Duration) -> Self {
        self.missing_resource_retry = bound;
        self
    }

    pub fn with_warnings(mut self, percent: u8, sink: Arc<dyn QuotaEventSink>) -> Self {
        self.warning_percent = percent;
        self.event_sink = Some(sink);
        self
    }

    pub fn provider(&self) -> QuotaUpdateProvider {
        self.provider
    }

    pub async fn create(
        &self,
        reference: &str,
        reference_id: &str,
        hard: &ResourceList,
        used: Option<&ResourceList>,
    ) -> CoreResult<i64> {
        self.drivers.get(reference)?.validate(hard)?;
        let (reference, reference_id) = (reference.to_string(), reference_id.to_string());
        let (hard, used) = (hard.clone(), used.cloned());
        blocking(&self.store, move |store| {
            store.create_quota(&reference, &reference_id, &hard, used.as_ref())
        })
        .await
    }

    pub async fn delete(&self, id: i64) -> CoreResult<()> {
        let quota = blocking(&self.store, move |store| store.get_quota(id)).await?;
        blocking(&self.store, move |store| store.delete_quota(id)).await?;
        self.cache
            .delete(&quota_cache_key(&quota.reference, &quota.reference_id))
            .await
    }

    pub async fn get(&self, id: i64, options: &QuotaOptions) -> CoreResult<QuotaView> {
        let quota = blocking(&self.store, move |store| store.get_quota(id)).await?;
        let reference_object = if options.with_reference_object {
            let driver = self.drivers.get(&quota.reference)?;
            Some(driver.load(&quota.reference_id).await?)
        } else {
            None
        };
        Ok(QuotaView {
            quota,
            reference_object,
        })
    }

    /// In cache mode a live reserved cell is newer than the store row.
    pub async fn get_by_ref(&self, reference: &str, reference_id: &str) -> CoreResult<Quota> {
        if self.provider == QuotaUpdateProvider::Redis
            && let Some((quota, _)) =
                fetch_json::<Quota>(&*self.cache, &quota_cache_key(reference, reference_id))
                    .await?
        {
            return Ok(quota);
        }
        let (reference, reference_id) = (reference.to_string(), reference_id.to_string());
        blocking(&self.store, move |store| {
            store.get_quota_by_ref(&reference, &reference_id)
        })
        .await
    }

    pub async fn is_enabled(&self, reference: &str, reference_id: &str) -> CoreResult<bool> {
        self.drivers.get(reference)?.enabled(reference_id).await
    }

    pub async fn list(&self, query: &QuotaQuery) -> CoreResult<Vec<Quota>> {
        let query = query.clone();
        blocking(&self.store, move |store| store.list_quotas(&query)).await
    }

    pub async fn count(&self, query: &QuotaQuery) -> CoreResult<i64> {
        let query = query.clone();
        blocking(&self.store, move |store| store.count_quotas(&query)).await
    }

    /// Writes hard limits (validated) and usage of `quota`, guarded by its
    /// version.
    pub async fn update(&self, quota: &Quota) -> CoreResult<()> {
        self.drivers.get(&quota.reference)?.validate(&quota.hard)?;
        let quota = quota.clone();
        let key = quota_cache_key(&quota.reference, &quota.reference_id);
        blocking(&self.store, move |store| {
            store.update_quota(&quota, QuotaChanges::ALL)
        })
        .await?;
        self.cache.delete(&key).await
    }

    /// Reserves `resources`, runs `action`, and releases the reservation if
    /// the action fails. An empty request runs the action unguarded.
    pub async fn request<T, F, Fut>(
        &self,
        reference: &str,
        reference_id: &str,
        resources: &ResourceList,
        action: F,
    ) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        if resources.is_empty() {
            return action().await;
        }

        let reservation = resources.clone();
        let bound = MissingResourceBound::new(self.missing_resource_retry);
        let reserved = self
            .update_usage(reference, reference_id, &self.retry, move |hard, used| {
                let next = used.add(&reservation);
                reject_negative(&next)?;
                is_safe(hard, used, &next, false).map_err(|errors| bound.error(errors))?;
                Ok(next)
            })
            .await?;

        self.emit_warning(&reserved).await;

        match action().await {
            Ok(value) => Ok(value),
            Err(error) => {
                let release = resources.clone();
                let rollback = self
                    .update_usage(reference, reference_id, &self.retry, move |_, used| {
                        let next = used.subtract(&release);
                        reject_negative(&next)?;
                        Ok(next)
                    })
                    .await;
                if let Err(rollback_error) = rollback {
                    tracing::error!(
                        reference,
                        reference_id,
                        resources = %resources,
                        kind = ?rollback_error.kind,
                        message = %rollback_error.message,
                        "failed to roll back reserved quota"
                    );
                }
                Err(error)
            }
        }
    }

    /// Replaces `used` with the driver's recount.
    pub async fn refresh(
        &self,
        reference: &str,
        reference_id: &str,
        options: &QuotaOptions,
    ) -> CoreResult<()> {
        let driver = self.drivers.get(reference)?;
        let retry_options = options.retry.clone().unwrap_or_else(|| self.retry.clone());
        let ignore_limitation = options.ignore_limitation;
        let bound = MissingResourceBound::new(self.missing_resource_retry);

        retry(&retry_options, || {
            let driver = Arc::clone(&driver);
            let bound = bound.clone();
            async move {
                let calculated = driver
                    .calculate_usage(reference_id)
                    .await
                    .map_err(permanent)?;
                reject_negative(&calculated)?;
                self.update_usage_once(reference, reference_id, move |hard, used| {
                    is_safe(hard, used, &calculated, ignore_limitation)
                        .map_err(|errors| bound.error(errors))?;
                    Ok(calculated.clone())
                })
                .await
            }
        })
        .await
        .map(|_| ())
    }

    /// Refreshes every quota; individual failures are logged and counted.
    pub async fn refresh_all(&self, ignore_limitation: bool) -> CoreResult<RefreshSummary> {
        let options = QuotaOptions::default().ignore_limitation(ignore_limitation);
        let mut summary = RefreshSummary::default();
        let mut page_number = 1;

        loop {
            let query = QuotaQuery {
                page: Some(crate::models::Page::new(page_number, REFRESH_ALL_PAGE_SIZE)),
                ..QuotaQuery::default()
            };
            let quotas = self.list(&query).await?;
            let last_page = (quotas.len() as u64) < REFRESH_ALL_PAGE_SIZE;

            for quota in quotas {
                match self
                    .refresh(&quota.reference, &quota.reference_id, &options)
                    .await
                {
                    Ok(()) => summary.refreshed += 1,
                    Err(error) => {
                        summary.failed += 1;
                        tracing::error!(
                            reference = %quota.reference,
                            reference_id = %quota.reference_id,
                            kind = ?error.kind,
                            message = %error.message,
                            "failed to refresh quota"
                        );
                    }
                }
            }

            if last_page {
                break;
            }
            page_number += 1;
        }

        tracing::info!(
            refreshed = summary.refreshed,
            failed = summary.failed,
            "refreshed all quotas"
        );
        Ok(summary)
    }

    async fn update_usage<F>(
        &self,
        reference: &str,
        reference_id: &str,
        options: &RetryOptions,
        op: F,
    ) -> CoreResult<Quota>
    where
        F: Fn(&ResourceList, &ResourceList) -> CoreResult<ResourceList>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        retry(options, || {
            self.update_usage_once(reference, reference_id, op.clone())
        })
        .await
    }

    async fn update_usage_once<F>(
        &self,
        reference: &str,
        reference_id: &str,
        op: F,
    ) -> CoreResult<Quota>
    where
        F: Fn(&ResourceList, &ResourceList) -> CoreResult<ResourceList> + Send + Sync + 'static,
    {
        match self.provider {
            QuotaUpdateProvider::Db => self.update_usage_db(reference, reference_id, op).await,
            QuotaUpdateProvider::Redis => {
                self.update_usage_cache(reference, reference_id, op).await
            }
        }
    }

    async fn update_usage_db<F>(
        &self,
        reference: &str,
        reference_id: &str,
        op: F,
    ) -> CoreResult<Quota>
    where
        F: Fn(&ResourceList, &ResourceList) -> CoreResult<ResourceList> + Send + Sync + 'static,
    {
        let (reference, reference_id) = (reference.to_string(), reference_id.to_string());
        blocking(&self.store, move |store| {
            store.update_usage_for_update(&reference, &reference_id, &mut |quota: &Quota| {
                let next = op(&quota.hard, &quota.used)?;
                // zero-sized uploads leave usage as it is
                Ok((next != quota.used).then_some(next))
            })
        })
        .await
        .map_err(permanent)
    }

    async fn update_usage_cache<F>(
        &self,
        reference: &str,
        reference_id: &str,
        op: F,
    ) -> CoreResult<Quota>
    where
        F: Fn(&ResourceList, &ResourceList) -> CoreResult<ResourceList> + Send + Sync + 'static,
    {
        let key = quota_cache_key(reference, reference_id);
        let (quota, revision) = match fetch_json::<Quota>(&*self.cache, &key).await? {
            Some((quota, revision)) => (quota, Some(revision)),
            None => (self.calc_quota(&key, reference, reference_id).await?, None),
        };

        let used = op(&quota.hard, &quota.used)?;
        let updated = Quota {
            used,
            update_time: SystemTime::now(),
            ..quota
        };
        let saved = self
            .cache
            .compare_and_save(
                &key,
                revision,
                encode_json(&key, &updated)?,
                Some(QUOTA_CACHE_TTL),
            )
            .await?;
        if !saved {
            return Err(CoreError::conflict(format!(
                "quota cache entry '{key}' changed during update"
            )));
        }
        Ok(updated)
    }

    /// Rebuilds a missing cache cell from the store row and the driver's
    /// recount; concurrent misses for one key share a single computation.
    async fn calc_quota(&self, key: &str, reference: &str, reference_id: &str) -> CoreResult<Quota> {
        self.flights
            .run(key, || async move {
                let driver = self.drivers.get(reference)?;
                let (owned_reference, owned_reference_id) =
                    (reference.to_string(), reference_id.to_string());
                let mut quota = blocking(&self.store, move |store| {
                    store.get_quota_by_ref(&owned_reference, &owned_reference_id)
                })
                .await
                .map_err(permanent)?;
                quota.used = driver
                    .calculate_usage(reference_id)
                    .await
                    .map_err(permanent)?;
                Ok(quota)
            })
            .await
    }

    async fn emit_warning(&self, quota: &Quota) {
        let Some(sink) = &self.event_sink else {
            return;
        };
        let resources = crossed_resources(&quota.hard, &quota.used, self.warning_percent);
        if resources.is_empty() {
            return;
        }
        sink.publish(QuotaWarningEvent {
            reference: quota.reference.clone(),
            reference_id: quota.reference_id.clone(),
            resources,
            usage: quota.used.clone(),
            hard: quota.hard.clone(),
            percent: self.warning_percent,
        })
        .await;
    }
}

fn reject_negative(used: &ResourceList) -> CoreResult<()> {
    let negative = used.is_negative();
    if negative.is_empty() {
        return Ok(());
    }
    let names = negative
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Err(CoreError::bad_request(format!("quota usage is negative for resource(s): {names}")).abort())
}

/// Overflow is final; anything else from the resource check is retried.
fn resource_error(errors: ResourceErrors) -> CoreError {
    let exceeded = errors.exceeded();
    if exceeded.is_empty() {
        CoreError::internal(errors.to_string())
    } else {
        CoreError::denied(exceeded).abort()
    }
}

/// Stops retrying a missing hard resource once it has been seen for longer
/// than the bound.
#[derive(Clone)]
struct MissingResourceBound {
    bound: Duration,
    first_seen: Arc<OnceLock<Instant>>,
}

impl MissingResourceBound {
    fn new(bound: Duration) -> Self {
        Self {
            bound,
            first_seen: Arc::new(OnceLock::new()),
        }
    }

    fn error(&self, errors: ResourceErrors) -> CoreError {
        let error = resource_error(errors);
        if error.is_abort() {
            return error;
        }
        let first_seen = *self.first_seen.get_or_init(Instant::now);
        if first_seen.elapsed() >= self.bound {
            error.abort()
        } else {
            error
        }
    }
}

fn permanent(error: CoreError) -> CoreError {
    match error.kind {
        CoreErrorKind::NotFound
        | CoreErrorKind::Denied
        | CoreErrorKind::BadRequest
        | CoreErrorKind::PreconditionFailed => error.abort(),
        _ => error,
    }
}
