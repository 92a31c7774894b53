use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Execution, ExecutionQuery, NewExecution, Task,
    TaskQuery, TaskStatus, Trigger,
};
use crate::persistence::{ExecutionStore, TaskStore, blocking};
use crate::task::manager::TaskManager;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL_MAX_INTERVAL: Duration = Duration::from_secs(1);

pub struct ExecutionManager {
    executions: Arc<dyn ExecutionStore>,
    tasks: Arc<dyn TaskStore>,
    task_manager: Arc<TaskManager>,
}

impl ExecutionManager {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        tasks: Arc<dyn TaskStore>,
        task_manager: Arc<TaskManager>,
    ) -> Self {
        Self {
            executions,
            tasks,
            task_manager,
        }
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    pub async fn create(
        &self,
        vendor_type: &str,
        vendor_id: i64,
        trigger: Trigger,
        extra_attrs: Map<String, Value>,
    ) -> CoreResult<i64> {
        let execution = NewExecution {
            vendor_type: vendor_type.to_string(),
            vendor_id,
            trigger,
            extra_attrs,
            start_time: SystemTime::now(),
        };
        let id = blocking(&self.executions, move |store| {
            store.create_execution(&execution)
        })
        .await?;
        tracing::debug!(execution_id = id, vendor_type, vendor_id, trigger = %trigger, "execution created");
        Ok(id)
    }

    /// For executions without tasks; the task rollup owns the status otherwise.
    pub async fn mark_done(&self, id: i64, message: &str) -> CoreResult<()> {
        self.set_status(id, TaskStatus::Success, message).await
    }

    pub async fn mark_error(&self, id: i64, message: &str) -> CoreResult<()> {
        self.set_status(id, TaskStatus::Error, message).await
    }

    /// Stops every non-final task. Each task is attempted even when an
    /// earlier one fails; the first failure is returned.
    pub async fn stop(&self, id: i64) -> CoreResult<()> {
        let execution = self.get(id).await?;
        if execution.status.is_final() {
            return Ok(());
        }

        let tasks = self.tasks_of(id).await?;
        if tasks.is_empty() {
            return self.set_status(id, TaskStatus::Stopped, "").await;
        }

        let mut first_error = None;
        for task in tasks.iter().filter(|task| !task.status.is_final()) {
            match self.task_manager.stop(task.id).await {
                Ok(()) => {}
                // finished between the listing and the stop
                Err(error) if error.is(CoreErrorKind::PreconditionFailed) => {}
                Err(error) => {
                    tracing::error!(
                        execution_id = id,
                        task_id = task.id,
                        kind = ?error.kind,
                        message = %error.message,
                        "failed to stop task"
                    );
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub async fn stop_and_wait(&self, id: i64, timeout: Duration) -> CoreResult<()> {
        self.stop(id).await?;

        let deadline = Instant::now() + timeout;
        let mut interval = STOP_POLL_INTERVAL;
        loop {
            let execution = self.get(id).await?;
            if execution.status.is_final() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoreError::new(
                    CoreErrorKind::DeadlineExceeded,
                    format!("execution {id} did not stop within {timeout:?}"),
                ));
            }
            tokio::time::sleep(interval.min(deadline.saturating_duration_since(Instant::now())))
                .await;
            interval = interval.saturating_mul(2).min(STOP_POLL_MAX_INTERVAL);
        }
    }

    pub async fn delete(&self, id: i64) -> CoreResult<()> {
        let tasks = self.tasks_of(id).await?;
        ensure_all_final(id, &tasks)?;
        self.delete_with_tasks(id, tasks).await
    }

    /// Deletes every execution of the vendor; refuses before deleting
    /// anything when one of them still has a running task.
    pub async fn delete_by_vendor(&self, vendor_type: &str, vendor_id: i64) -> CoreResult<()> {
        let query = ExecutionQuery {
            vendor_type: Some(vendor_type.to_string()),
            vendor_id: Some(vendor_id),
            ..ExecutionQuery::default()
        };
        let executions = self.list(&query).await?;

        let mut doomed = Vec::with_capacity(executions.len());
        for execution in executions {
            let tasks = self.tasks_of(execution.id).await?;
            ensure_all_final(execution.id, &tasks)?;
            doomed.push((execution.id, tasks));
        }
        for (id, tasks) in doomed {
            self.delete_with_tasks(id, tasks).await?;
        }
        Ok(())
    }

    /// Includes per-status task counts.
    pub async fn get(&self, id: i64) -> CoreResult<Execution> {
        let mut execution = blocking(&self.executions, move |store| store.get_execution(id)).await?;
        let metrics = blocking(&self.executions, move |store| store.execution_metrics(id)).await?;
        execution.metrics = Some(metrics);
        Ok(execution)
    }

    pub async fn list(&self, query: &ExecutionQuery) -> CoreResult<Vec<Execution>> {
        let query = query.clone();
        blocking(&self.executions, move |store| store.list_executions(&query)).await
    }

    pub async fn count(&self, query: &ExecutionQuery) -> CoreResult<i64> {
        let query = query.clone();
        blocking(&self.executions, move |store| store.count_executions(&query)).await
    }

    pub async fn update_extra_attrs(&self, id: i64, extra_attrs: Map<String, Value>) -> CoreResult<()> {
        blocking(&self.executions, move |store| {
            store.update_execution_extra_attrs(id, &extra_attrs)
        })
        .await
    }

    async fn set_status(&self, id: i64, status: TaskStatus, message: &str) -> CoreResult<()> {
        let message = message.to_string();
        blocking(&self.executions, move |store| {
            store.set_execution_status(id, status, &message)
        })
        .await
    }

    async fn tasks_of(&self, execution_id: i64) -> CoreResult<Vec<Task>> {
        let query = TaskQuery {
            execution_id: Some(execution_id),
            ..TaskQuery::default()
        };
        blocking(&self.tasks, move |store| store.list_tasks(&query)).await
    }

    async fn delete_with_tasks(&self, id: i64, tasks: Vec<Task>) -> CoreResult<()> {
        for task in tasks {
            let task_id = task.id;
            blocking(&self.tasks, move |store| store.delete_task(task_id)).await?;
        }
        blocking(&self.executions, move |store| store.delete_execution(id)).await?;
        tracing::debug!(execution_id = id, "execution deleted");
        Ok(())
    }
}

fn ensure_all_final(execution_id: i64, tasks: &[Task]) -> CoreResult<()> {
    match tasks.iter().find(|task| !task.status.is_final()) {
        Some(task) => Err(CoreError::precondition(format!(
            "execution {execution_id} has task {} in non-final status {}",
            task.id, task.status
        ))),
        None => Ok(()),
    }
}
