use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::{CoreConfig, MAX_SWEEP_BATCH_SIZE};
use crate::models::CoreResult;
use crate::persistence::{ExecutionStore, blocking};
use crate::signal::StopSignal;

/// Candidate ids fetched per query.
pub const SWEEP_PAGE_SIZE: u64 = 100_000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    pub executions: usize,
    pub tasks: usize,
    /// The stop signal cut the pass short.
    pub stopped: bool,
}

impl SweepSummary {
    fn absorb(&mut self, other: SweepSummary) {
        self.executions += other.executions;
        self.tasks += other.tasks;
        self.stopped |= other.stopped;
    }
}

/// Keeps at most `retain_counts[vendor_type]` executions per vendor id,
/// plus any that are still running.
pub struct ExecutionSweeper {
    executions: Arc<dyn ExecutionStore>,
    retain_counts: BTreeMap<String, u64>,
    batch_size: usize,
}

impl ExecutionSweeper {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        retain_counts: BTreeMap<String, u64>,
        batch_size: u32,
    ) -> Self {
        Self {
            executions,
            retain_counts,
            batch_size: batch_size.clamp(1, MAX_SWEEP_BATCH_SIZE) as usize,
        }
    }

    pub fn from_config(executions: Arc<dyn ExecutionStore>, config: &CoreConfig) -> Self {
        Self::new(
            executions,
            config.execution_retain_counts.clone(),
            config.sweep_batch_size(),
        )
    }

    /// Sweeps every vendor type with a retention count. A failing vendor is
    /// logged and skipped; the stop signal ends the pass between batches.
    pub async fn sweep(&self, stop: &StopSignal) -> SweepSummary {
        let mut summary = SweepSummary::default();
        for (vendor_type, &retain) in &self.retain_counts {
            if retain == 0 {
                continue;
            }
            if stop.is_stopped() {
                summary.stopped = true;
                break;
            }
            match self.sweep_vendor(vendor_type, retain, stop).await {
                Ok(swept) => {
                    if swept.executions > 0 {
                        tracing::info!(
                            vendor_type = %vendor_type,
                            retain,
                            executions = swept.executions,
                            tasks = swept.tasks,
                            "swept executions"
                        );
                    }
                    summary.absorb(swept);
                    if summary.stopped {
                        break;
                    }
                }
                Err(error) => tracing::error!(
                    vendor_type = %vendor_type,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to sweep executions"
                ),
            }
        }
        summary
    }

    pub async fn sweep_vendor(
        &self,
        vendor_type: &str,
        retain: u64,
        stop: &StopSignal,
    ) -> CoreResult<SweepSummary> {
        let mut summary = SweepSummary::default();
        let owned_vendor = vendor_type.to_string();
        let vendor_ids =
            blocking(&self.executions, move |store| store.list_vendor_ids(&owned_vendor)).await?;

        for vendor_id in vendor_ids {
            let owned_vendor = vendor_type.to_string();
            let Some(max_start) = blocking(&self.executions, move |store| {
                store.nth_latest_start_time(&owned_vendor, vendor_id, retain)
            })
            .await?
            else {
                continue;
            };

            let swept = self
                .sweep_candidates(vendor_type, vendor_id, max_start, stop)
                .await?;
            summary.absorb(swept);
            if summary.stopped {
                break;
            }
        }
        Ok(summary)
    }

    /// Pages are walked last to first so deletions never shift the offsets
    /// of pages still to come.
    async fn sweep_candidates(
        &self,
        vendor_type: &str,
        vendor_id: i64,
        before: SystemTime,
        stop: &StopSignal,
    ) -> CoreResult<SweepSummary> {
        let mut summary = SweepSummary::default();
        let owned_vendor = vendor_type.to_string();
        let total = blocking(&self.executions, move |store| {
            store.count_sweep_candidates(&owned_vendor, vendor_id, before)
        })
        .await?;
        let total = u64::try_from(total).unwrap_or(0);
        if total == 0 {
            return Ok(summary);
        }

        let pages = total.div_ceil(SWEEP_PAGE_SIZE);
        for page in (0..pages).rev() {
            let owned_vendor = vendor_type.to_string();
            let ids = blocking(&self.executions, move |store| {
                store.list_sweep_candidates(
                    &owned_vendor,
                    vendor_id,
                    before,
                    page * SWEEP_PAGE_SIZE,
                    SWEEP_PAGE_SIZE,
                )
            })
            .await?;

            for batch in ids.chunks(self.batch_size) {
                if stop.is_stopped() {
                    summary.stopped = true;
                    return Ok(summary);
                }
                let batch = batch.to_vec();
                let (tasks, executions) =
                    blocking(&self.executions, move |store| store.sweep_executions(&batch))
                        .await?;
                summary.tasks += tasks;
                summary.executions += executions;
            }
        }
        Ok(summary)
    }
}
