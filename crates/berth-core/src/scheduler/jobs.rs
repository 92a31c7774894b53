use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jobservice::JobSpec;
use crate::models::{CoreError, CoreResult, TaskStatus, Trigger, vendor};
use crate::quota::QuotaController;
use crate::scheduler::callback::{CallbackRegistry, SchedulerCallback};
use crate::task::{ExecutionManager, StatusChangeHook, TaskOptions, VendorRegistry, WorkerPool};

pub const GC_CALLBACK: &str = "GARBAGE_COLLECTION";
pub const PURGE_AUDIT_LOG_CALLBACK: &str = "PURGE_AUDIT_LOG";
pub const REPLICATION_CALLBACK: &str = "REPLICATION_CALLBACK";
pub const QUOTA_REFRESH_CALLBACK: &str = "QUOTA_REFRESH_ALL";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcPolicy {
    pub delete_untagged: bool,
    pub dry_run: bool,
    pub workers: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgePolicy {
    pub retention_hour: u64,
    pub include_operations: Vec<String>,
    pub dry_run: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationPolicy {
    pub policy_id: i64,
    /// One task is dispatched per resource.
    pub resources: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaRefreshPolicy {
    pub ignore_limitation: bool,
}

impl Default for QuotaRefreshPolicy {
    fn default() -> Self {
        Self {
            ignore_limitation: true,
        }
    }
}

/// Creates the execution and its single task; the execution is marked
/// error when the task cannot even be recorded.
async fn start_single_task<P: Serialize>(
    executions: &ExecutionManager,
    vendor_type: &str,
    vendor_id: i64,
    trigger: Trigger,
    policy: &P,
) -> CoreResult<i64> {
    let parameters = to_map(policy)?;
    let execution_id = executions
        .create(vendor_type, vendor_id, trigger, parameters.clone())
        .await?;

    let job = JobSpec {
        name: vendor_type.to_string(),
        parameters,
        ..JobSpec::default()
    };
    if let Err(error) = executions
        .task_manager()
        .create(execution_id, job, TaskOptions::default())
        .await
    {
        executions.mark_error(execution_id, &error.message).await?;
        return Err(error);
    }
    Ok(execution_id)
}

pub struct GcController {
    executions: Arc<ExecutionManager>,
}

impl GcController {
    pub fn new(executions: Arc<ExecutionManager>) -> Self {
        Self { executions }
    }

    pub async fn start(&self, trigger: Trigger, policy: &GcPolicy) -> CoreResult<i64> {
        start_single_task(&self.executions, vendor::GARBAGE_COLLECTION, -1, trigger, policy).await
    }
}

/// After a successful GC, project usage shrank; recount every quota in the
/// background without enforcing limits.
pub struct GcSuccessHook {
    quota: Arc<QuotaController>,
    pool: WorkerPool,
}

impl GcSuccessHook {
    pub fn new(quota: Arc<QuotaController>, pool: WorkerPool) -> Self {
        Self { quota, pool }
    }
}

#[async_trait]
impl StatusChangeHook for GcSuccessHook {
    async fn on_status_change(&self, execution_id: i64, status: TaskStatus) -> CoreResult<()> {
        if status != TaskStatus::Success {
            return Ok(());
        }
        let quota = Arc::clone(&self.quota);
        tracing::info!(execution_id, "garbage collection succeeded, refreshing quotas");
        self.pool.spawn("quota_refresh_after_gc", async move {
            quota.refresh_all(true).await.map(|_| ())
        });
        Ok(())
    }
}

pub struct PurgeController {
    executions: Arc<ExecutionManager>,
}

impl PurgeController {
    pub fn new(executions: Arc<ExecutionManager>) -> Self {
        Self { executions }
    }

    pub async fn start(&self, trigger: Trigger, policy: &PurgePolicy) -> CoreResult<i64> {
        start_single_task(&self.executions, vendor::PURGE_AUDIT_LOG, -1, trigger, policy).await
    }
}

/// Returns the execution id at once and dispatches tasks on the worker pool.
pub struct ReplicationController {
    executions: Arc<ExecutionManager>,
    pool: WorkerPool,
}

impl ReplicationController {
    pub fn new(executions: Arc<ExecutionManager>, pool: WorkerPool) -> Self {
        Self { executions, pool }
    }

    pub async fn start(&self, trigger: Trigger, policy: ReplicationPolicy) -> CoreResult<i64> {
        let execution_id = self
            .executions
            .create(vendor::REPLICATION, policy.policy_id, trigger, to_map(&policy)?)
            .await?;

        let executions = Arc::clone(&self.executions);
        self.pool.spawn("replication_flow", async move {
            let outcome = dispatch_replication(&executions, execution_id, &policy).await;
            if let Err(error) = &outcome {
                executions.mark_error(execution_id, &error.message).await?;
            }
            outcome
        });
        Ok(execution_id)
    }
}

async fn dispatch_replication(
    executions: &ExecutionManager,
    execution_id: i64,
    policy: &ReplicationPolicy,
) -> CoreResult<()> {
    if policy.resources.is_empty() {
        return executions
            .mark_done(execution_id, "no resources need to be replicated")
            .await;
    }
    for resource in &policy.resources {
        let job = JobSpec::generic(vendor::REPLICATION)
            .with_parameter("policy_id", Value::from(policy.policy_id))
            .with_parameter("resource", Value::from(resource.as_str()));
        executions
            .task_manager()
            .create(execution_id, job, TaskOptions::default())
            .await?;
    }
    tracing::info!(
        execution_id,
        policy_id = policy.policy_id,
        tasks = policy.resources.len(),
        "replication tasks dispatched"
    );
    Ok(())
}

struct GcCallback(Arc<GcController>);

#[async_trait]
impl SchedulerCallback for GcCallback {
    async fn call(&self, param: &str) -> CoreResult<()> {
        self.0
            .start(Trigger::Schedule, &parse_policy::<GcPolicy>(param)?)
            .await
            .map(|_| ())
    }
}

struct PurgeCallback(Arc<PurgeController>);

#[async_trait]
impl SchedulerCallback for PurgeCallback {
    async fn call(&self, param: &str) -> CoreResult<()> {
        self.0
            .start(Trigger::Schedule, &parse_policy::<PurgePolicy>(param)?)
            .await
            .map(|_| ())
    }
}

struct ReplicationCallback(Arc<ReplicationController>);

#[async_trait]
impl SchedulerCallback for ReplicationCallback {
    async fn call(&self, param: &str) -> CoreResult<()> {
        self.0
            .start(Trigger::Schedule, parse_policy::<ReplicationPolicy>(param)?)
            .await
            .map(|_| ())
    }
}

struct QuotaRefreshCallback(Arc<QuotaController>);

#[async_trait]
impl SchedulerCallback for QuotaRefreshCallback {
    async fn call(&self, param: &str) -> CoreResult<()> {
        let policy = parse_policy::<QuotaRefreshPolicy>(param)?;
        let summary = self.0.refresh_all(policy.ignore_limitation).await?;
        if summary.failed > 0 {
            return Err(CoreError::internal(format!(
                "{} of {} quotas failed to refresh",
                summary.failed,
                summary.failed + summary.refreshed
            )));
        }
        Ok(())
    }
}

/// The vendor controllers wired into the scheduler and the hook registry.
pub struct JobControllers {
    pub gc: Arc<GcController>,
    pub purge: Arc<PurgeController>,
    pub replication: Arc<ReplicationController>,
}

impl JobControllers {
    pub fn new(executions: Arc<ExecutionManager>, pool: WorkerPool) -> Self {
        Self {
            gc: Arc::new(GcController::new(Arc::clone(&executions))),
            purge: Arc::new(PurgeController::new(Arc::clone(&executions))),
            replication: Arc::new(ReplicationController::new(executions, pool)),
        }
    }

    /// Startup-time registration; fails on duplicates.
    pub fn register(
        &self,
        callbacks: &mut CallbackRegistry,
        hooks: &mut VendorRegistry,
        quota: Arc<QuotaController>,
        pool: WorkerPool,
    ) -> CoreResult<()> {
        callbacks.register(GC_CALLBACK, Arc::new(GcCallback(Arc::clone(&self.gc))))?;
        callbacks.register(
            PURGE_AUDIT_LOG_CALLBACK,
            Arc::new(PurgeCallback(Arc::clone(&self.purge))),
        )?;
        callbacks.register(
            REPLICATION_CALLBACK,
            Arc::new(ReplicationCallback(Arc::clone(&self.replication))),
        )?;
        callbacks.register(
            QUOTA_REFRESH_CALLBACK,
            Arc::new(QuotaRefreshCallback(Arc::clone(&quota))),
        )?;
        hooks.register_status_change_hook(
            vendor::GARBAGE_COLLECTION,
            Arc::new(GcSuccessHook::new(quota, pool)),
        )
    }
}

fn parse_policy<P: DeserializeOwned + Default>(param: &str) -> CoreResult<P> {
    if param.trim().is_empty() {
        return Ok(P::default());
    }
    serde_json::from_str(param)
        .map_err(|error| CoreError::bad_request(format!("invalid callback parameter: {error}")))
}

fn to_map<P: Serialize>(policy: &P) -> CoreResult<Map<String, Value>> {
    match serde_json::to_value(policy) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(CoreError::bad_request(format!(
            "policy must encode as an object, got {other}"
        ))),
        Err(error) => Err(CoreError::internal(format!("failed to encode policy: {error}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_param_uses_defaults() {
        assert_eq!(parse_policy::<QuotaRefreshPolicy>("").unwrap(), QuotaRefreshPolicy::default());
        let policy = parse_policy::<GcPolicy>(r#"{"delete_untagged": true}"#).unwrap();
        assert!(policy.delete_untagged);
        assert!(parse_policy::<GcPolicy>("[1]").is_err());
    }
}
