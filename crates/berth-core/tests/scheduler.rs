use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use berth_core::cache::InMemoryKvCache;
use berth_core::config::QuotaUpdateProvider;
use berth_core::jobservice::{JobAction, JobDescriptor, JobServiceClient, JobServiceError};
use berth_core::models::{
    CoreError, CoreErrorKind, CoreResult, ExecutionQuery, PROJECT_REFERENCE, ResourceList,
    ResourceName, StatusChange, StatusChangeMetadata, TaskQuery, TaskStatus, Trigger, vendor,
};
use berth_core::persistence::QuotaStore;
use berth_core::quota::{DriverRegistry, MemoryProjectCatalog, ProjectDriver, QuotaController};
use berth_core::scheduler::{
    CallbackRegistry, GC_CALLBACK, GcPolicy, JobControllers, QUOTA_REFRESH_CALLBACK,
    ReplicationPolicy, Scheduler, SchedulerCallback,
};
use berth_core::sqlite::SqliteStore;
use berth_core::task::{ExecutionManager, HookHandler, TaskManager, VendorRegistry, WorkerPool};
use chrono::{TimeZone, Utc};
use serde_json::json;

#[derive(Default)]
struct FakeJobService {
    submitted: Mutex<Vec<JobDescriptor>>,
}

#[async_trait]
impl JobServiceClient for FakeJobService {
    async fn submit_job(&self, job: &JobDescriptor) -> Result<String, JobServiceError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(job.clone());
        Ok(format!("job-{}", submitted.len()))
    }

    async fn post_action(&self, _job_id: &str, _action: JobAction) -> Result<(), JobServiceError> {
        Ok(())
    }

    async fn get_job_log(&self, _job_id: &str) -> Result<Vec<u8>, JobServiceError> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct RecordingCallback {
    params: Mutex<Vec<String>>,
}

#[async_trait]
impl SchedulerCallback for RecordingCallback {
    async fn call(&self, param: &str) -> CoreResult<()> {
        self.params.lock().unwrap().push(param.to_string());
        Ok(())
    }
}

struct FailingCallback;

#[async_trait]
impl SchedulerCallback for FailingCallback {
    async fn call(&self, _param: &str) -> CoreResult<()> {
        Err(CoreError::internal("registry unreachable"))
    }
}

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("berth-{test_name}-{nanos}.sqlite3"))
}

struct Harness {
    store: Arc<SqliteStore>,
    fleet: Arc<FakeJobService>,
    executions: Arc<ExecutionManager>,
    recorder: Arc<RecordingCallback>,
    catalog: Arc<MemoryProjectCatalog>,
    quota: Arc<QuotaController>,
    controllers: JobControllers,
    hook: HookHandler,
    scheduler: Scheduler,
}

fn harness(test_name: &str) -> Harness {
    let store = Arc::new(SqliteStore::new(test_db_path(test_name)));
    store.migrate_to_latest().unwrap();

    let fleet = Arc::new(FakeJobService::default());
    let tasks = Arc::new(TaskManager::new(
        store.clone(),
        store.clone(),
        fleet.clone(),
        "http://core:8080",
    ));
    let executions = Arc::new(ExecutionManager::new(store.clone(), store.clone(), tasks));

    let catalog = Arc::new(MemoryProjectCatalog::new());
    let mut drivers = DriverRegistry::new();
    drivers
        .register(PROJECT_REFERENCE, Arc::new(ProjectDriver::new(catalog.clone())))
        .unwrap();
    let cache = Arc::new(InMemoryKvCache::new());
    let quota = Arc::new(QuotaController::new(
        store.clone(),
        Arc::new(drivers),
        cache.clone(),
        QuotaUpdateProvider::Db,
    ));

    let pool = WorkerPool::new(4);
    let controllers = JobControllers::new(executions.clone(), pool.clone());
    let mut callbacks = CallbackRegistry::new();
    let mut registry = VendorRegistry::new();
    controllers
        .register(&mut callbacks, &mut registry, quota.clone(), pool)
        .unwrap();
    let recorder = Arc::new(RecordingCallback::default());
    callbacks.register("RECORD", recorder.clone()).unwrap();
    callbacks.register("FAIL", Arc::new(FailingCallback)).unwrap();

    let hook = HookHandler::new(store.clone(), store.clone(), Arc::new(registry), cache);
    let scheduler = Scheduler::new(store.clone(), executions.clone(), Arc::new(callbacks));
    Harness {
        store,
        fleet,
        executions,
        recorder,
        catalog,
        quota,
        controllers,
        hook,
        scheduler,
    }
}

fn by_vendor(vendor_type: &str) -> ExecutionQuery {
    ExecutionQuery {
        vendor_type: Some(vendor_type.to_string()),
        ..ExecutionQuery::default()
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn create_validates_cron_and_callback() {
    let h = harness("schedule-validate");

    let error = h
        .scheduler
        .create(vendor::SCAN_ALL, 1, "0 0 * * *", "RECORD", &json!({}))
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::BadRequest);

    let error = h
        .scheduler
        .create(vendor::SCAN_ALL, 1, "0 0 0 * * *", "MISSING", &json!({}))
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::BadRequest);

    let id = h
        .scheduler
        .create(vendor::SCAN_ALL, 1, " 0 0 0 * * * ", "RECORD", &json!({"scope": "all"}))
        .await
        .unwrap();
    let schedule = h.scheduler.get(id).await.unwrap();
    assert_eq!(schedule.cron, "0 0 0 * * *");
    assert_eq!(schedule.callback_func_param, r#"{"scope":"all"}"#);

    assert_eq!(h.scheduler.list(Some(vendor::SCAN_ALL)).await.unwrap().len(), 1);
    assert!(h.scheduler.list(Some(vendor::REPLICATION)).await.unwrap().is_empty());

    h.scheduler.delete(id).await.unwrap();
    assert_eq!(
        h.scheduler.get(id).await.unwrap_err().kind,
        CoreErrorKind::NotFound
    );
}

#[tokio::test]
async fn run_records_a_scheduler_execution() {
    let h = harness("schedule-run");
    let id = h
        .scheduler
        .create(vendor::SCAN_ALL, 3, "0 0 0 * * *", "RECORD", &json!({"x": 1}))
        .await
        .unwrap();

    let execution_id = h.scheduler.run(id).await.unwrap();

    assert_eq!(*h.recorder.params.lock().unwrap(), vec![r#"{"x":1}"#.to_string()]);
    let execution = h.executions.get(execution_id).await.unwrap();
    assert_eq!(execution.vendor_type, vendor::SCHEDULER);
    assert_eq!(execution.vendor_id, id);
    assert_eq!(execution.trigger, Trigger::Schedule);
    assert_eq!(execution.status, TaskStatus::Success);
    assert_eq!(execution.extra_attrs["callback_func_name"], json!("RECORD"));
}

#[tokio::test]
async fn failing_callback_marks_execution_error() {
    let h = harness("schedule-run-failure");
    let id = h
        .scheduler
        .create(vendor::SCAN_ALL, 3, "0 0 0 * * *", "FAIL", &json!(null))
        .await
        .unwrap();

    let error = h.scheduler.run(id).await.unwrap_err();
    assert!(error.message.contains("registry unreachable"));

    let executions = h.executions.list(&by_vendor(vendor::SCHEDULER)).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, TaskStatus::Error);
    assert!(executions[0].status_message.contains("registry unreachable"));
}

#[tokio::test]
async fn run_due_fires_schedules_with_a_tick_in_the_window() {
    let h = harness("schedule-run-due");
    h.scheduler
        .create(vendor::SCAN_ALL, 1, "0 0 * * * *", "RECORD", &json!({"every": "hour"}))
        .await
        .unwrap();
    h.scheduler
        .create(vendor::SCAN_ALL, 2, "0 0 3 * * *", "RECORD", &json!({"every": "day"}))
        .await
        .unwrap();

    let at = |hour, minute| Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap();
    assert_eq!(h.scheduler.run_due(at(9, 30), at(10, 0)).await.unwrap(), 1);
    assert_eq!(h.scheduler.run_due(at(10, 0), at(10, 59)).await.unwrap(), 0);
    assert_eq!(h.scheduler.run_due(at(2, 30), at(3, 0)).await.unwrap(), 2);

    assert_eq!(h.recorder.params.lock().unwrap().len(), 3);
    assert_eq!(
        h.executions.count(&by_vendor(vendor::SCHEDULER)).await.unwrap(),
        3
    );
}

#[tokio::test]
async fn scheduled_gc_dispatches_a_job_and_refreshes_quotas_on_success() {
    let h = harness("schedule-gc");
    let quota_id = h
        .quota
        .create(
            PROJECT_REFERENCE,
            "1",
            &ResourceList::new()
                .with(ResourceName::Count, 100)
                .with(ResourceName::Storage, 1000),
            None,
        )
        .await
        .unwrap();
    h.catalog
        .set_usage(
            1,
            ResourceList::new()
                .with(ResourceName::Count, 3)
                .with(ResourceName::Storage, 120),
        )
        .unwrap();

    let schedule_id = h
        .scheduler
        .create(
            vendor::GARBAGE_COLLECTION,
            -1,
            "0 0 0 * * 6",
            GC_CALLBACK,
            &json!({"delete_untagged": true}),
        )
        .await
        .unwrap();
    h.scheduler.run(schedule_id).await.unwrap();

    let gc = h
        .executions
        .list(&by_vendor(vendor::GARBAGE_COLLECTION))
        .await
        .unwrap();
    assert_eq!(gc.len(), 1);
    assert_eq!(gc[0].extra_attrs["delete_untagged"], json!(true));
    let submitted = h.fleet.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].name, vendor::GARBAGE_COLLECTION);
    assert_eq!(submitted[0].parameters["delete_untagged"], json!(true));

    let tasks = h
        .executions
        .task_manager()
        .list(&TaskQuery {
            execution_id: Some(gc[0].id),
            ..TaskQuery::default()
        })
        .await
        .unwrap();
    h.hook
        .handle(
            tasks[0].id,
            StatusChange {
                job_id: tasks[0].job_id.clone(),
                status: TaskStatus::Success,
                check_in: String::new(),
                metadata: StatusChangeMetadata { revision: 1 },
            },
        )
        .await
        .unwrap();
    assert_eq!(
        h.executions.get(gc[0].id).await.unwrap().status,
        TaskStatus::Success
    );

    let quota = h.quota.clone();
    eventually(|| {
        let quota = quota.clone();
        async move {
            quota
                .get_by_ref(PROJECT_REFERENCE, "1")
                .await
                .is_ok_and(|quota| quota.used.get(ResourceName::Storage) == Some(120))
        }
    })
    .await;
    let stored = h.store.get_quota(quota_id).unwrap();
    assert_eq!(stored.used.get(ResourceName::Count), Some(3));
}

#[tokio::test]
async fn quota_refresh_callback_succeeds_without_quotas() {
    let h = harness("schedule-quota-refresh");
    let id = h
        .scheduler
        .create(vendor::SCHEDULER, 0, "0 0 4 * * *", QUOTA_REFRESH_CALLBACK, &json!({}))
        .await
        .unwrap();
    let execution_id = h.scheduler.run(id).await.unwrap();
    assert_eq!(
        h.executions.get(execution_id).await.unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn replication_dispatches_one_task_per_resource() {
    let h = harness("replication");
    let policy = ReplicationPolicy {
        policy_id: 9,
        resources: vec!["library/nginx:1.25".to_string(), "library/redis:7".to_string()],
    };

    let execution_id = h
        .controllers
        .replication
        .start(Trigger::Manual, policy)
        .await
        .unwrap();

    let tasks = h.executions.task_manager().clone();
    eventually(|| {
        let tasks = tasks.clone();
        async move {
            tasks
                .count(&TaskQuery {
                    execution_id: Some(execution_id),
                    ..TaskQuery::default()
                })
                .await
                .is_ok_and(|count| count == 2)
        }
    })
    .await;
    let execution = h.executions.get(execution_id).await.unwrap();
    assert_eq!(execution.vendor_id, 9);
    assert_eq!(execution.status, TaskStatus::Running);
}

#[tokio::test]
async fn replication_without_resources_finishes_immediately() {
    let h = harness("replication-empty");
    let execution_id = h
        .controllers
        .replication
        .start(
            Trigger::Manual,
            ReplicationPolicy {
                policy_id: 4,
                resources: Vec::new(),
            },
        )
        .await
        .unwrap();

    let executions = h.executions.clone();
    eventually(|| {
        let executions = executions.clone();
        async move {
            executions
                .get(execution_id)
                .await
                .is_ok_and(|execution| execution.status == TaskStatus::Success)
        }
    })
    .await;
    assert_eq!(
        h.executions.get(execution_id).await.unwrap().status_message,
        "no resources need to be replicated"
    );
}

#[tokio::test]
async fn manual_gc_uses_the_default_policy() {
    let h = harness("manual-gc");
    let execution_id = h
        .controllers
        .gc
        .start(Trigger::Manual, &GcPolicy::default())
        .await
        .unwrap();

    let execution = h.executions.get(execution_id).await.unwrap();
    assert_eq!(execution.vendor_id, -1);
    assert_eq!(execution.extra_attrs["delete_untagged"], json!(false));
    assert_eq!(execution.extra_attrs.len(), 3);
    assert_eq!(execution.metrics.unwrap().task_count, 1);
    assert!(execution.extra_attrs.contains_key("workers"));
}
