use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::cache::KvCache;
use crate::models::{CheckInMode, CoreError, CoreResult, StatusChange, StatusRefresh, Task};
use crate::persistence::{ExecutionStore, TaskStore, blocking};
use crate::task::registry::VendorRegistry;

pub const CHECK_IN_ATTR: &str = "check_in";
pub const STATUS_OUTDATED_PREFIX: &str = "execution:id:";
const STATUS_OUTDATED_SUFFIX: &str = ":status_outdate";
const VENDOR_SEPARATOR: &str = ":vendor:";

pub fn status_outdated_key(execution_id: i64, vendor_type: &str) -> String {
    format!("{STATUS_OUTDATED_PREFIX}{execution_id}{VENDOR_SEPARATOR}{vendor_type}{STATUS_OUTDATED_SUFFIX}")
}

pub fn parse_status_outdated_key(key: &str) -> Option<(i64, String)> {
    let body = key
        .strip_prefix(STATUS_OUTDATED_PREFIX)?
        .strip_suffix(STATUS_OUTDATED_SUFFIX)?;
    let (id, vendor_type) = body.split_once(VENDOR_SEPARATOR)?;
    Some((id.parse().ok()?, vendor_type.to_string()))
}

/// When the execution rollup runs after a task changed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RollupMode {
    Inline,
    /// Mark the execution outdated and let the periodic refresher roll it up.
    Deferred { reserved_expiration: Duration },
}

/// Reconciles status changes posted by the worker fleet into task and
/// execution rows.
pub struct HookHandler {
    tasks: Arc<dyn TaskStore>,
    executions: Arc<dyn ExecutionStore>,
    registry: Arc<VendorRegistry>,
    cache: Arc<dyn KvCache>,
    rollup: RollupMode,
}

impl HookHandler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        executions: Arc<dyn ExecutionStore>,
        registry: Arc<VendorRegistry>,
        cache: Arc<dyn KvCache>,
    ) -> Self {
        Self {
            tasks,
            executions,
            registry,
            cache,
            rollup: RollupMode::Inline,
        }
    }

    pub fn with_rollup(mut self, rollup: RollupMode) -> Self {
        self.rollup = rollup;
        self
    }

    /// A task that is not visible yet is an error so the fleet retransmits;
    /// its row may still sit in an uncommitted transaction.
    pub async fn handle(&self, task_id: i64, change: StatusChange) -> CoreResult<()> {
        let task = blocking(&self.tasks, move |store| store.get_task(task_id))
            .await
            .map_err(|error| error.with_context("status hook"))?;

        if !change.check_in.is_empty() {
            return self.check_in(task, &change).await;
        }

        let (status, revision) = (change.status, change.metadata.revision);
        let updated = blocking(&self.tasks, move |store| {
            store.update_task_status(task_id, status, revision)
        })
        .await?;
        if updated {
            tracing::debug!(task_id, status = %status, revision, "task status updated");
        } else {
            tracing::debug!(
                task_id,
                status = %status,
                revision,
                current = %task.status,
                current_revision = task.status_revision,
                "stale task status change ignored"
            );
        }

        // rolled up even when stale so a retransmission repairs a failed rollup
        self.after_task_change(task.execution_id, &task.vendor_type)
            .await
    }

    async fn check_in(&self, task: Task, change: &StatusChange) -> CoreResult<()> {
        let Some(processor) = self.registry.check_in_processor(&task.vendor_type) else {
            return Err(CoreError::bad_request(format!(
                "no check-in processor registered for vendor type '{}'",
                task.vendor_type
            )));
        };
        let value = processor.process(&task, change).await?;

        let mut extra_attrs = task.extra_attrs;
        apply_check_in(&mut extra_attrs, task.check_in_mode, value);
        let task_id = task.id;
        blocking(&self.tasks, move |store| {
            store.update_task_extra_attrs(task_id, &extra_attrs)
        })
        .await
    }

    async fn after_task_change(&self, execution_id: i64, vendor_type: &str) -> CoreResult<()> {
        match self.rollup {
            RollupMode::Inline => {
                let refresh = blocking(&self.executions, move |store| {
                    store.refresh_execution_status(execution_id)
                })
                .await?;
                run_status_change_hook(&self.registry, vendor_type, execution_id, refresh).await;
                Ok(())
            }
            RollupMode::Deferred {
                reserved_expiration,
            } => {
                self.cache
                    .save(
                        &status_outdated_key(execution_id, vendor_type),
                        String::new(),
                        Some(reserved_expiration),
                    )
                    .await
            }
        }
    }
}

/// Records a processor's result under `check_in`: override replaces the
/// previous value, append accumulates an array.
pub fn apply_check_in(extra_attrs: &mut Map<String, Value>, mode: CheckInMode, value: Value) {
    match mode {
        CheckInMode::Override => {
            extra_attrs.insert(CHECK_IN_ATTR.to_string(), value);
        }
        CheckInMode::Append => match extra_attrs.get_mut(CHECK_IN_ATTR) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let previous = existing.take();
                *existing = Value::Array(vec![previous, value]);
            }
            None => {
                extra_attrs.insert(CHECK_IN_ATTR.to_string(), Value::Array(vec![value]));
            }
        },
    }
}

/// Failures are logged; the rollup already happened.
pub(crate) async fn run_status_change_hook(
    registry: &VendorRegistry,
    vendor_type: &str,
    execution_id: i64,
    refresh: StatusRefresh,
) {
    let (true, Some(status)) = (refresh.changed, refresh.status) else {
        return;
    };
    let Some(hook) = registry.status_change_hook(vendor_type) else {
        return;
    };
    if let Err(error) = hook.on_status_change(execution_id, status).await {
        tracing::error!(
            execution_id,
            vendor_type,
            status = %status,
            kind = ?error.kind,
            message = %error.message,
            "execution status change hook failed"
        );
    }
}
