mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{CoreError, TaskStatus};

pub use http::HttpJobServiceClient;

/// Path the worker fleet posts status changes to, relative to the core URL.
pub const TASK_HOOK_PATH: &str = "/service/notifications/tasks";

pub fn task_status_hook_url(core_url: &str, task_id: i64) -> String {
    format!("{}{TASK_HOOK_PATH}/{task_id}", core_url.trim_end_matches('/'))
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobKind {
    #[default]
    Generic,
    Periodic,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub kind: JobKind,
    /// Seconds to wait before the worker picks the job up.
    #[serde(default)]
    pub schedule_delay: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron_spec: String,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub metadata: JobMetadata,
    pub status_hook: String,
}

/// Job submitted on behalf of a task; the hook URL is filled in once the
/// task row exists.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub parameters: Map<String, Value>,
    pub metadata: JobMetadata,
}

impl JobSpec {
    pub fn generic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn into_descriptor(self, status_hook: String) -> JobDescriptor {
        JobDescriptor {
            name: self.name,
            parameters: self.parameters,
            metadata: self.metadata,
            status_hook,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobAction {
    Stop,
    Cancel,
}

impl JobAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum JobServiceError {
    /// The fleet no longer knows the job, usually because it was swept.
    #[error("job '{0}' not found")]
    NotFound(String),
    /// The job already reached `status`; the action is moot.
    #[error("job '{job_id}' is already in status {status}")]
    StatusBehind { job_id: String, status: TaskStatus },
    #[error("job service request failed: {0}")]
    Request(String),
}

impl From<JobServiceError> for CoreError {
    fn from(error: JobServiceError) -> Self {
        match &error {
            JobServiceError::NotFound(_) => CoreError::not_found(error.to_string()),
            JobServiceError::StatusBehind { .. } => CoreError::precondition(error.to_string()),
            JobServiceError::Request(_) => CoreError::transient(error.to_string()),
        }
    }
}

#[async_trait]
pub trait JobServiceClient: Send + Sync {
    /// Returns the job id assigned by the fleet.
    async fn submit_job(&self, job: &JobDescriptor) -> Result<String, JobServiceError>;

    async fn post_action(&self, job_id: &str, action: JobAction) -> Result<(), JobServiceError>;

    async fn get_job_log(&self, job_id: &str) -> Result<Vec<u8>, JobServiceError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn descriptor_serializes_in_wire_shape() {
        let descriptor = JobSpec::generic("GARBAGE_COLLECTION")
            .with_parameter("delete_untagged", json!(true))
            .into_descriptor(task_status_hook_url("http://core:8080/", 7));
        let encoded = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(
            encoded,
            json!({
                "name": "GARBAGE_COLLECTION",
                "parameters": {"delete_untagged": true},
                "metadata": {"kind": "Generic", "schedule_delay": 0, "unique": false},
                "status_hook": "http://core:8080/service/notifications/tasks/7"
            })
        );
    }
}
