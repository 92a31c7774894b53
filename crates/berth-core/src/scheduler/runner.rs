use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;

use crate::models::{CoreError, CoreResult, NewSchedule, Schedule, Trigger, vendor};
use crate::persistence::{ScheduleStore, blocking};
use crate::scheduler::callback::CallbackRegistry;
use crate::signal::StopSignal;
use crate::task::ExecutionManager;

/// Six-field cron (`sec min hour day month weekday`), optional year.
pub fn parse_cron(expression: &str) -> CoreResult<cron::Schedule> {
    cron::Schedule::from_str(expression.trim()).map_err(|error| {
        CoreError::bad_request(format!("invalid cron expression '{expression}': {error}"))
    })
}

/// Whether the schedule has a tick in `(since, until]`.
pub fn fires_between(schedule: &cron::Schedule, since: DateTime<Utc>, until: DateTime<Utc>) -> bool {
    schedule
        .after(&since)
        .next()
        .is_some_and(|next| next <= until)
}

pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    executions: Arc<ExecutionManager>,
    callbacks: Arc<CallbackRegistry>,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        executions: Arc<ExecutionManager>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        Self {
            schedules,
            executions,
            callbacks,
        }
    }

    pub async fn create(
        &self,
        vendor_type: &str,
        vendor_id: i64,
        cron: &str,
        callback_func_name: &str,
        param: &Value,
    ) -> CoreResult<i64> {
        parse_cron(cron)?;
        self.callbacks.get(callback_func_name)?;
        let callback_func_param = serde_json::to_string(param).map_err(|error| {
            CoreError::bad_request(format!("invalid callback parameter: {error}"))
        })?;

        let schedule = NewSchedule {
            vendor_type: vendor_type.to_string(),
            vendor_id,
            cron: cron.trim().to_string(),
            callback_func_name: callback_func_name.to_string(),
            callback_func_param,
        };
        let id = blocking(&self.schedules, move |store| store.create_schedule(&schedule)).await?;
        tracing::info!(schedule_id = id, vendor_type, vendor_id, cron, "schedule created");
        Ok(id)
    }

    pub async fn delete(&self, id: i64) -> CoreResult<()> {
        blocking(&self.schedules, move |store| store.delete_schedule(id)).await
    }

    pub async fn get(&self, id: i64) -> CoreResult<Schedule> {
        blocking(&self.schedules, move |store| store.get_schedule(id)).await
    }

    pub async fn list(&self, vendor_type: Option<&str>) -> CoreResult<Vec<Schedule>> {
        let vendor_type = vendor_type.map(str::to_string);
        blocking(&self.schedules, move |store| {
            store.list_schedules(vendor_type.as_deref())
        })
        .await
    }

    /// Fires the schedule now. The firing is recorded as a `SCHEDULER`
    /// execution that ends done or error with the callback's outcome.
    pub async fn run(&self, id: i64) -> CoreResult<i64> {
        let schedule = self.get(id).await?;
        let extra_attrs = Map::from_iter([
            (
                "callback_func_name".to_string(),
                json!(schedule.callback_func_name),
            ),
            ("cron".to_string(), json!(schedule.cron)),
        ]);
        let execution_id = self
            .executions
            .create(vendor::SCHEDULER, schedule.id, Trigger::Schedule, extra_attrs)
            .await?;

        let outcome = match self.callbacks.get(&schedule.callback_func_name) {
            Ok(callback) => callback.call(&schedule.callback_func_param).await,
            Err(error) => Err(error),
        };
        match outcome {
            Ok(()) => {
                self.executions.mark_done(execution_id, "").await?;
                Ok(execution_id)
            }
            Err(error) => {
                tracing::error!(
                    schedule_id = id,
                    execution_id,
                    callback = %schedule.callback_func_name,
                    kind = ?error.kind,
                    message = %error.message,
                    "scheduled callback failed"
                );
                self.executions.mark_error(execution_id, &error.message).await?;
                Err(error)
            }
        }
    }

    /// Runs every schedule with a tick in `(since, until]`; returns how many
    /// fired successfully.
    pub async fn run_due(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> CoreResult<usize> {
        let mut fired = 0;
        for schedule in self.list(None).await? {
            let cron = match parse_cron(&schedule.cron) {
                Ok(cron) => cron,
                Err(error) => {
                    tracing::warn!(schedule_id = schedule.id, message = %error.message, "skipping schedule");
                    continue;
                }
            };
            if !fires_between(&cron, since, until) {
                continue;
            }
            if self.run(schedule.id).await.is_ok() {
                fired += 1;
            }
        }
        Ok(fired)
    }

    pub fn spawn(self: Arc<Self>, tick: Duration, stop: StopSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut since = Utc::now();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = stop.stopped() => break,
                }
                let until = Utc::now();
                if let Err(error) = self.run_due(since, until).await {
                    tracing::error!(
                        kind = ?error.kind,
                        message = %error.message,
                        "scheduler pass failed"
                    );
                }
                since = until;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn rejects_five_field_expressions() {
        assert!(parse_cron("0 0 * * *").is_err());
        assert!(parse_cron("0 0 0 * * *").is_ok());
    }

    #[test]
    fn detects_ticks_inside_window() {
        let hourly = parse_cron("0 0 * * * *").unwrap();
        let at = |hour, minute| Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap();
        assert!(fires_between(&hourly, at(9, 30), at(10, 0)));
        assert!(!fires_between(&hourly, at(10, 0), at(10, 59)));
        assert!(fires_between(&hourly, at(10, 0), at(11, 5)));
    }
}
