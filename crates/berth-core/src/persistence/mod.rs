use std::sync::Arc;
use std::time::SystemTime;

use serde_json::{Map, Value};

use crate::models::{
    CoreError, Execution, ExecutionMetrics, ExecutionQuery, NewExecution, NewSchedule, NewTask,
    Quota, QuotaChanges, QuotaQuery, ResourceList, Schedule, StatusRefresh, Task, TaskQuery,
    TaskStatus, TaskStatusCount,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

/// Computes the next `used` from the locked quota. `None` leaves the row
/// untouched.
pub type UsageUpdate<'a> = dyn FnMut(&Quota) -> PersistenceResult<Option<ResourceList>> + 'a;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait QuotaStore: Send + Sync {
    fn create_quota(
        &self,
        reference: &str,
        reference_id: &str,
        hard: &ResourceList,
        used: Option<&ResourceList>,
    ) -> PersistenceResult<i64>;

    fn get_quota(&self, id: i64) -> PersistenceResult<Quota>;

    fn get_quota_by_ref(&self, reference: &str, reference_id: &str) -> PersistenceResult<Quota>;

    /// Reads the quota while holding the write lock, lets `update` compute
    /// the next usage and persists it in the same transaction.
    fn update_usage_for_update(
        &self,
        reference: &str,
        reference_id: &str,
        update: &mut UsageUpdate<'_>,
    ) -> PersistenceResult<Quota>;

    fn list_quotas(&self, query: &QuotaQuery) -> PersistenceResult<Vec<Quota>>;

    fn count_quotas(&self, query: &QuotaQuery) -> PersistenceResult<i64>;

    fn update_quota(&self, quota: &Quota, changes: QuotaChanges) -> PersistenceResult<()>;

    /// Unconditional write of `used`; the caller owns the authoritative value.
    fn flush_usage(&self, id: i64, used: &ResourceList) -> PersistenceResult<()>;

    fn delete_quota(&self, id: i64) -> PersistenceResult<()>;
}

pub trait ExecutionStore: Send + Sync {
    fn create_execution(&self, execution: &NewExecution) -> PersistenceResult<i64>;

    fn get_execution(&self, id: i64) -> PersistenceResult<Execution>;

    fn list_executions(&self, query: &ExecutionQuery) -> PersistenceResult<Vec<Execution>>;

    fn count_executions(&self, query: &ExecutionQuery) -> PersistenceResult<i64>;

    fn update_execution_extra_attrs(
        &self,
        id: i64,
        extra_attrs: &Map<String, Value>,
    ) -> PersistenceResult<()>;

    /// Sets a status directly, bypassing the task rollup.
    fn set_execution_status(
        &self,
        id: i64,
        status: TaskStatus,
        message: &str,
    ) -> PersistenceResult<()>;

    fn delete_execution(&self, id: i64) -> PersistenceResult<()>;

    fn execution_metrics(&self, id: i64) -> PersistenceResult<ExecutionMetrics>;

    fn refresh_execution_status(&self, id: i64) -> PersistenceResult<StatusRefresh>;

    fn list_vendor_ids(&self, vendor_type: &str) -> PersistenceResult<Vec<i64>>;

    /// Start time of the `n`-th most recent execution (1-based).
    fn nth_latest_start_time(
        &self,
        vendor_type: &str,
        vendor_id: i64,
        n: u64,
    ) -> PersistenceResult<Option<SystemTime>>;

    fn count_sweep_candidates(
        &self,
        vendor_type: &str,
        vendor_id: i64,
        before: SystemTime,
    ) -> PersistenceResult<i64>;

    /// Final executions started before `before`, ordered by id descending.
    fn list_sweep_candidates(
        &self,
        vendor_type: &str,
        vendor_id: i64,
        before: SystemTime,
        offset: u64,
        limit: u64,
    ) -> PersistenceResult<Vec<i64>>;

    /// Deletes final tasks of the given executions, then the executions that
    /// are no longer referenced. Returns `(tasks, executions)` deleted.
    fn sweep_executions(&self, ids: &[i64]) -> PersistenceResult<(usize, usize)>;

    /// Running executions untouched since `updated_before` whose tasks are
    /// all final.
    fn list_dangling_executions(&self, updated_before: SystemTime) -> PersistenceResult<Vec<i64>>;
}

pub trait TaskStore: Send + Sync {
    fn create_task(&self, task: &NewTask) -> PersistenceResult<i64>;

    fn get_task(&self, id: i64) -> PersistenceResult<Task>;

    fn list_tasks(&self, query: &TaskQuery) -> PersistenceResult<Vec<Task>>;

    fn count_tasks(&self, query: &TaskQuery) -> PersistenceResult<i64>;

    fn set_task_job_id(&self, id: i64, job_id: &str) -> PersistenceResult<()>;

    /// Forces a status regardless of revision, used for dispatch failures and
    /// stop results.
    fn force_task_status(
        &self,
        id: i64,
        status: TaskStatus,
        message: &str,
    ) -> PersistenceResult<()>;

    /// Revision-guarded status write from the status hook. Returns whether
    /// the row changed.
    fn update_task_status(
        &self,
        id: i64,
        status: TaskStatus,
        revision: i64,
    ) -> PersistenceResult<bool>;

    fn update_task_extra_attrs(
        &self,
        id: i64,
        extra_attrs: &Map<String, Value>,
    ) -> PersistenceResult<()>;

    fn list_status_count(&self, execution_id: i64) -> PersistenceResult<Vec<TaskStatusCount>>;

    fn delete_task(&self, id: i64) -> PersistenceResult<()>;
}

pub trait ScheduleStore: Send + Sync {
    fn create_schedule(&self, schedule: &NewSchedule) -> PersistenceResult<i64>;

    fn get_schedule(&self, id: i64) -> PersistenceResult<Schedule>;

    fn list_schedules(&self, vendor_type: Option<&str>) -> PersistenceResult<Vec<Schedule>>;

    fn delete_schedule(&self, id: i64) -> PersistenceResult<()>;
}

/// Runs a store call on the blocking pool.
pub async fn blocking<S, T, F>(store: &Arc<S>, operation: F) -> PersistenceResult<T>
where
    S: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> PersistenceResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || operation(store.as_ref()))
        .await
        .map_err(|error| CoreError::internal(format!("store worker join failure: {error}")))?
}
