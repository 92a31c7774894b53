pub mod dangling;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use tokio::task::JoinHandle;

use crate::models::{CoreResult, Trigger, vendor};
use crate::signal::StopSignal;
use crate::task::ExecutionManager;

pub use dangling::DanglingFixer;
pub use sweeper::{ExecutionSweeper, SWEEP_PAGE_SIZE, SweepSummary};

/// Periodic housekeeping: fix dangling executions, then sweep. Each pass is
/// recorded as an `EXECUTION_SWEEP` execution so it is itself retained.
pub struct SweepJob {
    sweeper: ExecutionSweeper,
    fixer: DanglingFixer,
    executions: Arc<ExecutionManager>,
}

impl SweepJob {
    pub fn new(
        sweeper: ExecutionSweeper,
        fixer: DanglingFixer,
        executions: Arc<ExecutionManager>,
    ) -> Self {
        Self {
            sweeper,
            fixer,
            executions,
        }
    }

    pub async fn run_once(&self, stop: &StopSignal) -> CoreResult<SweepSummary> {
        let execution_id = self
            .executions
            .create(vendor::EXECUTION_SWEEP, 0, Trigger::Schedule, Map::new())
            .await?;

        let fixed = match self.fixer.fix().await {
            Ok(fixed) => fixed,
            Err(error) => {
                tracing::error!(
                    kind = ?error.kind,
                    message = %error.message,
                    "dangling execution fix failed"
                );
                0
            }
        };
        let summary = self.sweeper.sweep(stop).await;

        let message = format!(
            "fixed {fixed} dangling, swept {} executions and {} tasks",
            summary.executions, summary.tasks
        );
        if summary.stopped {
            self.executions.mark_error(execution_id, "sweep stopped").await?;
        } else {
            self.executions.mark_done(execution_id, &message).await?;
        }
        tracing::info!(
            execution_id,
            fixed,
            executions = summary.executions,
            tasks = summary.tasks,
            stopped = summary.stopped,
            "sweep pass finished"
        );
        Ok(summary)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, stop: StopSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.stopped() => break,
                }
                if let Err(error) = self.run_once(&stop).await {
                    tracing::error!(
                        kind = ?error.kind,
                        message = %error.message,
                        "sweep pass failed"
                    );
                }
            }
        })
    }
}
