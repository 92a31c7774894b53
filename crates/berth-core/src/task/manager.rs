use std::sync::Arc;

use serde_json::{Map, Value};

use crate::jobservice::{
    JobAction, JobServiceClient, JobServiceError, JobSpec, task_status_hook_url,
};
use crate::models::{CheckInMode, CoreError, CoreResult, NewTask, Task, TaskQuery, TaskStatus};
use crate::persistence::{ExecutionStore, TaskStore, blocking};

#[derive(Clone, Debug, Default)]
pub struct TaskOptions {
    pub check_in_mode: CheckInMode,
    pub extra_attrs: Map<String, Value>,
}

impl TaskOptions {
    pub fn with_check_in_mode(mut self, mode: CheckInMode) -> Self {
        self.check_in_mode = mode;
        self
    }

    pub fn with_extra_attrs(mut self, extra_attrs: Map<String, Value>) -> Self {
        self.extra_attrs = extra_attrs;
        self
    }
}

pub struct TaskManager {
    tasks: Arc<dyn TaskStore>,
    executions: Arc<dyn ExecutionStore>,
    jobservice: Arc<dyn JobServiceClient>,
    core_url: String,
}

impl TaskManager {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        executions: Arc<dyn ExecutionStore>,
        jobservice: Arc<dyn JobServiceClient>,
        core_url: impl Into<String>,
    ) -> Self {
        Self {
            tasks,
            executions,
            jobservice,
            core_url: core_url.into(),
        }
    }

    /// Persists the task and dispatches its job. A failed dispatch still
    /// returns the id: the row is marked `Error` and the execution rolls up.
    pub async fn create(
        &self,
        execution_id: i64,
        job: JobSpec,
        options: TaskOptions,
    ) -> CoreResult<i64> {
        let execution =
            blocking(&self.executions, move |store| store.get_execution(execution_id)).await?;
        let new_task = NewTask {
            execution_id,
            vendor_type: execution.vendor_type,
            check_in_mode: options.check_in_mode,
            extra_attrs: options.extra_attrs,
        };
        let id = blocking(&self.tasks, move |store| store.create_task(&new_task)).await?;

        let descriptor = job.into_descriptor(task_status_hook_url(&self.core_url, id));
        match self.jobservice.submit_job(&descriptor).await {
            Ok(job_id) => {
                blocking(&self.tasks, move |store| store.set_task_job_id(id, &job_id)).await?;
                tracing::debug!(task_id = id, execution_id, job = %descriptor.name, "task dispatched");
            }
            Err(error) => {
                tracing::error!(
                    task_id = id,
                    execution_id,
                    job = %descriptor.name,
                    message = %error,
                    "failed to submit job for task"
                );
                let message = error.to_string();
                if let Err(error) = self
                    .finish_task(id, execution_id, TaskStatus::Error, &message)
                    .await
                {
                    tracing::error!(
                        task_id = id,
                        execution_id,
                        kind = ?error.kind,
                        message = %error.message,
                        "failed to record dispatch failure"
                    );
                }
            }
        }

        Ok(id)
    }

    /// Asks the fleet to stop the job. When the fleet no longer knows it, or
    /// reports it already finished, the row is forced to that outcome.
    pub async fn stop(&self, id: i64) -> CoreResult<()> {
        let task = self.get(id).await?;
        if task.status.is_final() {
            return Err(CoreError::precondition(format!(
                "task {id} is already in final status {}",
                task.status
            )));
        }
        if task.job_id.is_empty() {
            return self
                .finish_task(id, task.execution_id, TaskStatus::Stopped, "")
                .await;
        }

        match self.jobservice.post_action(&task.job_id, JobAction::Stop).await {
            Ok(()) => Ok(()),
            Err(JobServiceError::NotFound(job_id)) => {
                tracing::warn!(task_id = id, job_id = %job_id, "job not found on stop, marking task stopped");
                self.finish_task(id, task.execution_id, TaskStatus::Stopped, "")
                    .await
            }
            Err(JobServiceError::StatusBehind { status, .. }) => {
                tracing::info!(task_id = id, status = %status, "job already finished on stop");
                self.finish_task(id, task.execution_id, status, "").await
            }
            Err(error) => Err(CoreError::from(error).with_context(format!("stop task {id}"))),
        }
    }

    pub async fn get_log(&self, id: i64) -> CoreResult<Vec<u8>> {
        let task = self.get(id).await?;
        if task.job_id.is_empty() {
            return Err(CoreError::not_found(format!("task {id} has no job")));
        }
        Ok(self.jobservice.get_job_log(&task.job_id).await?)
    }

    pub async fn get(&self, id: i64) -> CoreResult<Task> {
        blocking(&self.tasks, move |store| store.get_task(id)).await
    }

    pub async fn list(&self, query: &TaskQuery) -> CoreResult<Vec<Task>> {
        let query = query.clone();
        blocking(&self.tasks, move |store| store.list_tasks(&query)).await
    }

    pub async fn count(&self, query: &TaskQuery) -> CoreResult<i64> {
        let query = query.clone();
        blocking(&self.tasks, move |store| store.count_tasks(&query)).await
    }

    pub async fn update_extra_attrs(&self, id: i64, extra_attrs: Map<String, Value>) -> CoreResult<()> {
        blocking(&self.tasks, move |store| {
            store.update_task_extra_attrs(id, &extra_attrs)
        })
        .await
    }

    async fn finish_task(
        &self,
        id: i64,
        execution_id: i64,
        status: TaskStatus,
        message: &str,
    ) -> CoreResult<()> {
        let message = message.to_string();
        blocking(&self.tasks, move |store| {
            store.force_task_status(id, status, &message)
        })
        .await?;
        blocking(&self.executions, move |store| {
            store.refresh_execution_status(execution_id)
        })
        .await
        .map(|_| ())
    }
}
