use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::models::CoreResult;

/// Bounds how many background flows (replication dispatch, quota refresh
/// after GC) run at once. Callers never wait for the flow itself.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn spawn<F>(&self, job: &'static str, flow: F) -> JoinHandle<()>
    where
        F: Future<Output = CoreResult<()>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!(job, "worker pool closed before the job could start");
                return;
            };
            if let Err(error) = flow.await {
                tracing::error!(
                    job,
                    kind = ?error.kind,
                    message = %error.message,
                    "background job failed"
                );
            }
        })
    }
}
