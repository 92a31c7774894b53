use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_core::cache::{InMemoryKvCache, KvCache, RedisKvCache};
use berth_core::config::{CoreConfig, QuotaUpdateProvider};
use berth_core::jobservice::{HttpJobServiceClient, JobServiceClient};
use berth_core::models::{CoreResult, PROJECT_REFERENCE};
use berth_core::persistence::MigrationStore;
use berth_core::quota::{
    DriverRegistry, ProjectDriver, QuotaController, QuotaEventSink, QuotaWarningEvent,
    StoredUsageCatalog, spawn_flush_loop,
};
use berth_core::scheduler::{CallbackRegistry, JobControllers, Scheduler};
use berth_core::signal::StopSignal;
use berth_core::sqlite::SqliteStore;
use berth_core::sweep::{DanglingFixer, ExecutionSweeper, SweepJob};
use berth_core::task::{
    ExecutionManager, HookHandler, RollupMode, StatusRefresher, TaskManager, VendorRegistry,
    WorkerPool,
};
use tokio::task::JoinHandle;

use crate::routes::AppState;

const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Publishes quota warnings to the log.
struct LogEventSink;

#[async_trait]
impl QuotaEventSink for LogEventSink {
    async fn publish(&self, event: QuotaWarningEvent) {
        tracing::warn!(
            reference = %event.reference,
            reference_id = %event.reference_id,
            resources = ?event.resources,
            usage = %event.usage.to_json(),
            hard = %event.hard.to_json(),
            percent = event.percent,
            "quota usage crossed the warning threshold"
        );
    }
}

/// Every long-lived component of the service, wired from one config.
pub struct Services {
    pub config: CoreConfig,
    pub store: Arc<SqliteStore>,
    pub cache: Arc<dyn KvCache>,
    pub pool: WorkerPool,
    pub quota: Arc<QuotaController>,
    pub executions: Arc<ExecutionManager>,
    pub controllers: JobControllers,
    pub hook: Arc<HookHandler>,
    pub refresher: Arc<StatusRefresher>,
    pub scheduler: Arc<Scheduler>,
    pub sweep: Arc<SweepJob>,
}

impl Services {
    pub fn from_config(config: CoreConfig) -> CoreResult<Self> {
        let mut jobservice = HttpJobServiceClient::new(config.jobservice_url.clone());
        if !config.jobservice_secret.is_empty() {
            jobservice = jobservice.with_secret(config.jobservice_secret.clone());
        }
        config.validate()?;
        let cache: Arc<dyn KvCache> = if config.uses_shared_cache() {
            tracing::info!("quota cells and status markers use the redis cache");
            Arc::new(RedisKvCache::open(&config.redis_url)?)
        } else {
            Arc::new(InMemoryKvCache::new())
        };
        Self::assemble(config, Arc::new(jobservice), cache)
    }

    /// Migrates the database and wires the components around `jobservice`
    /// and `cache`.
    pub fn assemble(
        config: CoreConfig,
        jobservice: Arc<dyn JobServiceClient>,
        cache: Arc<dyn KvCache>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let store = Arc::new(SqliteStore::new(config.database_path.clone()));
        store.migrate_to_latest()?;
        tracing::info!(
            database = %store.database_path().display(),
            schema_version = store.current_version()?,
            "database ready"
        );
        let pool = WorkerPool::new(config.worker_pool_size);

        let mut drivers = DriverRegistry::new();
        drivers.register(
            PROJECT_REFERENCE,
            Arc::new(ProjectDriver::new(Arc::new(StoredUsageCatalog::new(
                store.clone(),
            )))),
        )?;
        let mut quota = QuotaController::new(
            store.clone(),
            Arc::new(drivers),
            cache.clone(),
            config.quota_update_provider,
        );
        if config.quota_warning_enabled {
            quota = quota.with_warnings(config.quota_warning_percent, Arc::new(LogEventSink));
        }
        let quota = Arc::new(quota);

        let tasks = Arc::new(TaskManager::new(
            store.clone(),
            store.clone(),
            jobservice,
            config.core_url.clone(),
        ));
        let executions = Arc::new(ExecutionManager::new(store.clone(), store.clone(), tasks));

        let controllers = JobControllers::new(executions.clone(), pool.clone());
        let mut callbacks = CallbackRegistry::new();
        let mut registry = VendorRegistry::new();
        controllers.register(&mut callbacks, &mut registry, quota.clone(), pool.clone())?;
        let registry = Arc::new(registry);

        let rollup = if config.execution_status_refresh_interval_secs > 0 {
            RollupMode::Deferred {
                reserved_expiration: config.reserved_expiration(),
            }
        } else {
            RollupMode::Inline
        };
        let hook = Arc::new(
            HookHandler::new(store.clone(), store.clone(), registry.clone(), cache.clone())
                .with_rollup(rollup),
        );
        let refresher = Arc::new(StatusRefresher::new(cache.clone(), store.clone(), registry));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            executions.clone(),
            Arc::new(callbacks),
        ));
        let sweep = Arc::new(SweepJob::new(
            ExecutionSweeper::from_config(store.clone(), &config),
            DanglingFixer::new(store.clone(), config.max_dangling()),
            executions.clone(),
        ));

        Ok(Self {
            config,
            store,
            cache,
            pool,
            quota,
            executions,
            controllers,
            hook,
            refresher,
            scheduler,
            sweep,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            hook: self.hook.clone(),
        }
    }

    /// Starts the periodic loops; each ends once `stop` fires.
    pub fn spawn_background(&self, stop: &StopSignal) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.sweep.clone().spawn(
                Duration::from_secs(self.config.sweep_interval_secs),
                stop.clone(),
            ),
            self.scheduler.clone().spawn(SCHEDULER_TICK, stop.clone()),
        ];
        if self.config.quota_update_provider == QuotaUpdateProvider::Redis {
            handles.push(spawn_flush_loop(
                self.cache.clone(),
                self.store.clone(),
                Duration::from_secs(self.config.quota_flush_interval_secs),
                stop.clone(),
            ));
        }
        if self.config.execution_status_refresh_interval_secs > 0 {
            handles.push(self.refresher.clone().spawn(
                Duration::from_secs(self.config.execution_status_refresh_interval_secs),
                stop.clone(),
            ));
        }
        handles
    }
}
