use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::jobservice::{JobAction, JobDescriptor, JobServiceClient, JobServiceError};
use crate::models::TaskStatus;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const JOBS_PATH: &str = "/api/v1/jobs";

/// Worker-fleet client over the fleet's REST API. `ureq` is blocking, so
/// every call runs on the blocking pool.
#[derive(Clone)]
pub struct HttpJobServiceClient {
    base_url: String,
    secret: Option<String>,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job: SubmittedJob,
}

#[derive(Deserialize)]
struct SubmittedJob {
    id: String,
}

impl HttpJobServiceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build();
        Self {
            base_url: base_url.into(),
            secret: None,
            agent,
        }
    }

    /// Shared secret sent as the `Authorization` header on every call.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    fn jobs_url(&self) -> String {
        format!("{}{JOBS_PATH}", self.base_url.trim_end_matches('/'))
    }

    fn job_url(&self, job_id: &str) -> String {
        format!("{}/{job_id}", self.jobs_url())
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        match &self.secret {
            Some(secret) => request.set("Authorization", &format!("Berth-Secret {secret}")),
            None => request,
        }
    }

    async fn call<T, F>(&self, operation: F) -> Result<T, JobServiceError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, JobServiceError> + Send + 'static,
    {
        tokio::task::spawn_blocking(operation)
            .await
            .map_err(|error| JobServiceError::Request(format!("worker join failure: {error}")))?
    }
}

#[async_trait]
impl JobServiceClient for HttpJobServiceClient {
    async fn submit_job(&self, job: &JobDescriptor) -> Result<String, JobServiceError> {
        let request = self.authorize(self.agent.post(&self.jobs_url()));
        let body = json!({ "job": job });
        let name = job.name.clone();

        self.call(move || {
            let response = request
                .send_json(body)
                .map_err(|error| request_error(&name, error))?;
            let submitted: SubmitResponse = response.into_json().map_err(|error| {
                JobServiceError::Request(format!("invalid submit response for job '{name}': {error}"))
            })?;
            Ok(submitted.job.id)
        })
        .await
    }

    async fn post_action(&self, job_id: &str, action: JobAction) -> Result<(), JobServiceError> {
        let request = self.authorize(self.agent.post(&self.job_url(job_id)));
        let body = json!({ "action": action.as_str() });
        let job_id = job_id.to_string();

        self.call(move || {
            request
                .send_json(body)
                .map(|_| ())
                .map_err(|error| request_error(&job_id, error))
        })
        .await
    }

    async fn get_job_log(&self, job_id: &str) -> Result<Vec<u8>, JobServiceError> {
        let request = self.authorize(self.agent.get(&format!("{}/log", self.job_url(job_id))));
        let job_id = job_id.to_string();

        self.call(move || {
            let response = request.call().map_err(|error| request_error(&job_id, error))?;
            let mut log = Vec::new();
            response
                .into_reader()
                .read_to_end(&mut log)
                .map_err(|error| {
                    JobServiceError::Request(format!("failed reading log of job '{job_id}': {error}"))
                })?;
            Ok(log)
        })
        .await
    }
}

/// 404 means the fleet swept the job; 409 carries the job's actual status
/// when an action arrives after the job finished.
fn request_error(job_id: &str, error: ureq::Error) -> JobServiceError {
    match error {
        ureq::Error::Status(404, _) => JobServiceError::NotFound(job_id.to_string()),
        ureq::Error::Status(409, response) => {
            let body = response.into_string().unwrap_or_default();
            match reported_status(&body) {
                Some(status) => JobServiceError::StatusBehind {
                    job_id: job_id.to_string(),
                    status,
                },
                None => JobServiceError::Request(format!("job '{job_id}' conflict: {body}")),
            }
        }
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            JobServiceError::Request(format!("job '{job_id}' request failed ({code}): {body}"))
        }
        ureq::Error::Transport(transport) => {
            JobServiceError::Request(format!("job '{job_id}' transport error: {transport}"))
        }
    }
}

fn reported_status(body: &str) -> Option<TaskStatus> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("status")?
        .as_str()?
        .parse()
        .ok()
}
