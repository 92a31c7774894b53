use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use berth_core::jobservice::{JobAction, JobDescriptor, JobServiceClient, JobServiceError};
use berth_core::models::{
    CheckInMode, ExecutionQuery, NewExecution, NewTask, TaskStatus, Trigger, vendor,
};
use berth_core::persistence::{ExecutionStore, TaskStore};
use berth_core::signal::StopSignal;
use berth_core::sqlite::SqliteStore;
use berth_core::sweep::{DanglingFixer, ExecutionSweeper, SweepJob};
use berth_core::task::{ExecutionManager, TaskManager};
use serde_json::Map;

const VENDOR: &str = "REPLICATION";

struct IdleJobService;

#[async_trait]
impl JobServiceClient for IdleJobService {
    async fn submit_job(&self, _job: &JobDescriptor) -> Result<String, JobServiceError> {
        Ok("job".to_string())
    }

    async fn post_action(&self, _job_id: &str, _action: JobAction) -> Result<(), JobServiceError> {
        Ok(())
    }

    async fn get_job_log(&self, _job_id: &str) -> Result<Vec<u8>, JobServiceError> {
        Ok(Vec::new())
    }
}

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("berth-{test_name}-{nanos}.sqlite3"))
}

fn open_store(test_name: &str) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::new(test_db_path(test_name)));
    store.migrate_to_latest().unwrap();
    store
}

fn started_minutes_ago(minutes: u64) -> SystemTime {
    SystemTime::now() - Duration::from_secs(minutes * 60)
}

fn insert_execution(store: &SqliteStore, vendor_id: i64, start_time: SystemTime) -> i64 {
    store
        .create_execution(&NewExecution {
            vendor_type: VENDOR.to_string(),
            vendor_id,
            trigger: Trigger::Manual,
            extra_attrs: Map::new(),
            start_time,
        })
        .unwrap()
}

fn insert_task(store: &SqliteStore, execution_id: i64, status: TaskStatus) -> i64 {
    let id = store
        .create_task(&NewTask {
            execution_id,
            vendor_type: VENDOR.to_string(),
            check_in_mode: CheckInMode::Override,
            extra_attrs: Map::new(),
        })
        .unwrap();
    store.force_task_status(id, status, "").unwrap();
    id
}

fn retain(count: u64) -> BTreeMap<String, u64> {
    BTreeMap::from([(VENDOR.to_string(), count)])
}

fn remaining(store: &SqliteStore, vendor_id: i64) -> Vec<i64> {
    let mut ids: Vec<i64> = store
        .list_executions(&ExecutionQuery {
            vendor_type: Some(VENDOR.to_string()),
            vendor_id: Some(vendor_id),
            ..ExecutionQuery::default()
        })
        .unwrap()
        .into_iter()
        .map(|execution| execution.id)
        .collect();
    ids.sort_unstable();
    ids
}

#[tokio::test]
async fn keeps_the_newest_executions_per_vendor() {
    let store = open_store("sweep-retention");
    let running = insert_execution(&store, 1, started_minutes_ago(60));
    let finished: Vec<i64> = (1..=5)
        .map(|n| {
            let id = insert_execution(&store, 1, started_minutes_ago(60 - n));
            store
                .set_execution_status(id, TaskStatus::Success, "")
                .unwrap();
            id
        })
        .collect();
    let swept_task = insert_task(&store, finished[1], TaskStatus::Success);
    let other_vendor_id = insert_execution(&store, 2, started_minutes_ago(90));
    store
        .set_execution_status(other_vendor_id, TaskStatus::Error, "")
        .unwrap();

    // a batch of one walks every chunk
    let sweeper = ExecutionSweeper::new(store.clone(), retain(2), 1);
    let summary = sweeper.sweep(&StopSignal::new()).await;

    assert_eq!(summary.executions, 3);
    assert_eq!(summary.tasks, 1);
    assert!(!summary.stopped);
    assert_eq!(remaining(&store, 1), vec![running, finished[3], finished[4]]);
    assert_eq!(remaining(&store, 2), vec![other_vendor_id]);
    assert!(store.get_task(swept_task).is_err());
}

#[tokio::test]
async fn zero_retention_disables_sweeping() {
    let store = open_store("sweep-disabled");
    for n in 0..3 {
        let id = insert_execution(&store, 1, started_minutes_ago(10 - n));
        store
            .set_execution_status(id, TaskStatus::Stopped, "")
            .unwrap();
    }

    let summary = ExecutionSweeper::new(store.clone(), retain(0), 100)
        .sweep(&StopSignal::new())
        .await;

    assert_eq!(summary.executions, 0);
    assert_eq!(remaining(&store, 1).len(), 3);
}

#[tokio::test]
async fn executions_with_unfinished_tasks_survive() {
    let store = open_store("sweep-unfinished-task");
    let old = insert_execution(&store, 1, started_minutes_ago(30));
    // inconsistent on purpose: final execution, task still running
    store.set_execution_status(old, TaskStatus::Error, "").unwrap();
    let running_task = insert_task(&store, old, TaskStatus::Running);
    let newest = insert_execution(&store, 1, started_minutes_ago(1));
    store
        .set_execution_status(newest, TaskStatus::Success, "")
        .unwrap();

    let summary = ExecutionSweeper::new(store.clone(), retain(1), 100)
        .sweep(&StopSignal::new())
        .await;

    assert_eq!(summary.executions, 0);
    assert_eq!(remaining(&store, 1), vec![old, newest]);
    assert!(store.get_task(running_task).is_ok());
}

#[tokio::test]
async fn dangling_executions_are_rolled_up() {
    let store = open_store("dangling");
    let dangling = insert_execution(&store, 1, started_minutes_ago(5));
    insert_task(&store, dangling, TaskStatus::Success);
    insert_task(&store, dangling, TaskStatus::Stopped);
    let busy = insert_execution(&store, 1, started_minutes_ago(5));
    insert_task(&store, busy, TaskStatus::Running);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let fixed = DanglingFixer::new(store.clone(), Duration::ZERO)
        .fix()
        .await
        .unwrap();
    assert_eq!(fixed, 1);
    let execution = store.get_execution(dangling).unwrap();
    assert_eq!(execution.status, TaskStatus::Stopped);
    assert!(execution.end_time.is_some());
    assert_eq!(store.get_execution(busy).unwrap().status, TaskStatus::Running);

    // too recent for a long threshold
    let recent = insert_execution(&store, 1, started_minutes_ago(1));
    insert_task(&store, recent, TaskStatus::Error);
    let fixed = DanglingFixer::new(store.clone(), Duration::from_secs(3600))
        .fix()
        .await
        .unwrap();
    assert_eq!(fixed, 0);
    assert_eq!(store.get_execution(recent).unwrap().status, TaskStatus::Running);
}

fn sweep_job(store: &Arc<SqliteStore>) -> (SweepJob, Arc<ExecutionManager>) {
    let tasks = Arc::new(TaskManager::new(
        store.clone(),
        store.clone(),
        Arc::new(IdleJobService),
        "http://core:8080",
    ));
    let executions = Arc::new(ExecutionManager::new(store.clone(), store.clone(), tasks));
    let job = SweepJob::new(
        ExecutionSweeper::new(store.clone(), retain(1), 100),
        DanglingFixer::new(store.clone(), Duration::from_secs(3600)),
        executions.clone(),
    );
    (job, executions)
}

fn sweep_records(store: &SqliteStore) -> Vec<(TaskStatus, String)> {
    store
        .list_executions(&ExecutionQuery {
            vendor_type: Some(vendor::EXECUTION_SWEEP.to_string()),
            ..ExecutionQuery::default()
        })
        .unwrap()
        .into_iter()
        .map(|execution| (execution.status, execution.status_message))
        .collect()
}

#[tokio::test]
async fn sweep_pass_is_recorded_as_an_execution() {
    let store = open_store("sweep-job");
    for n in 0..3 {
        let id = insert_execution(&store, 7, started_minutes_ago(10 - n));
        store
            .set_execution_status(id, TaskStatus::Success, "")
            .unwrap();
    }
    let (job, _) = sweep_job(&store);

    let summary = job.run_once(&StopSignal::new()).await.unwrap();

    assert_eq!(summary.executions, 2);
    assert_eq!(remaining(&store, 7).len(), 1);
    let records = sweep_records(&store);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, TaskStatus::Success);
    assert!(records[0].1.contains("swept 2 executions"));
}

#[tokio::test]
async fn stopped_sweep_is_recorded_as_error() {
    let store = open_store("sweep-job-stopped");
    for n in 0..3 {
        let id = insert_execution(&store, 7, started_minutes_ago(10 - n));
        store
            .set_execution_status(id, TaskStatus::Success, "")
            .unwrap();
    }
    let (job, _) = sweep_job(&store);
    let stop = StopSignal::new();
    stop.stop();

    let summary = job.run_once(&stop).await.unwrap();

    assert!(summary.stopped);
    assert_eq!(remaining(&store, 7).len(), 3);
    assert_eq!(
        sweep_records(&store),
        vec![(TaskStatus::Error, "sweep stopped".to_string())]
    );
}
