use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::models::CoreResult;
use crate::persistence::{ExecutionStore, blocking};

/// Repairs executions left `Running` after all their tasks finished, e.g.
/// when the last rollup was lost. The rollup assigns Error, then Stopped,
/// then Success by precedence.
pub struct DanglingFixer {
    executions: Arc<dyn ExecutionStore>,
    max_dangling: Duration,
}

impl DanglingFixer {
    pub fn new(executions: Arc<dyn ExecutionStore>, max_dangling: Duration) -> Self {
        Self {
            executions,
            max_dangling,
        }
    }

    /// Returns the number of executions whose status was corrected.
    pub async fn fix(&self) -> CoreResult<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.max_dangling)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let dangling =
            blocking(&self.executions, move |store| store.list_dangling_executions(cutoff)).await?;

        let mut fixed = 0;
        for id in dangling {
            match blocking(&self.executions, move |store| store.refresh_execution_status(id)).await
            {
                Ok(refresh) if refresh.changed => {
                    fixed += 1;
                    tracing::info!(
                        execution_id = id,
                        status = ?refresh.status,
                        "fixed dangling execution status"
                    );
                }
                Ok(_) => {}
                Err(error) => tracing::error!(
                    execution_id = id,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to fix dangling execution"
                ),
            }
        }
        Ok(fixed)
    }
}
