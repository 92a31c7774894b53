use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{TaskStatus, TaskStatusCount};

pub mod vendor {
    pub const REPLICATION: &str = "REPLICATION";
    pub const GARBAGE_COLLECTION: &str = "GARBAGE_COLLECTION";
    pub const RETENTION: &str = "RETENTION";
    pub const SCAN: &str = "SCAN";
    pub const SCAN_ALL: &str = "SCAN_ALL";
    pub const PURGE_AUDIT_LOG: &str = "PURGE_AUDIT_LOG";
    pub const SCHEDULER: &str = "SCHEDULER";
    pub const EXECUTION_SWEEP: &str = "EXECUTION_SWEEP";
    pub const SYSTEM_ARTIFACT_CLEANUP: &str = "SYSTEM_ARTIFACT_CLEANUP";
    pub const P2P_PREHEAT: &str = "P2P_PREHEAT";
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    Manual,
    Schedule,
    Event,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Schedule => "SCHEDULE",
            Self::Event => "EVENT",
        }
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(Self::Manual),
            "SCHEDULE" => Ok(Self::Schedule),
            "EVENT" => Ok(Self::Event),
            _ => Err(format!("unknown trigger '{value}'")),
        }
    }
}

impl Display for Trigger {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub task_count: i64,
    pub pending: i64,
    pub scheduled: i64,
    pub running: i64,
    pub error: i64,
    pub stopped: i64,
    pub success: i64,
}

impl ExecutionMetrics {
    pub fn from_counts(counts: &[TaskStatusCount]) -> Self {
        let mut metrics = Self::default();
        for entry in counts {
            metrics.task_count += entry.count;
            match entry.status {
                TaskStatus::Pending => metrics.pending += entry.count,
                TaskStatus::Scheduled => metrics.scheduled += entry.count,
                TaskStatus::Running => metrics.running += entry.count,
                TaskStatus::Error => metrics.error += entry.count,
                TaskStatus::Stopped => metrics.stopped += entry.count,
                TaskStatus::Success => metrics.success += entry.count,
            }
        }
        metrics
    }

    /// Execution status derived from its tasks. `None` when there are no
    /// tasks; such executions are finished explicitly.
    pub fn rollup_status(&self) -> Option<TaskStatus> {
        if self.pending + self.scheduled + self.running > 0 {
            Some(TaskStatus::Running)
        } else if self.error > 0 {
            Some(TaskStatus::Error)
        } else if self.stopped > 0 {
            Some(TaskStatus::Stopped)
        } else if self.success > 0 {
            Some(TaskStatus::Success)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Execution {
    pub id: i64,
    pub vendor_type: String,
    pub vendor_id: i64,
    pub status: TaskStatus,
    pub status_message: String,
    pub trigger: Trigger,
    pub extra_attrs: Map<String, Value>,
    pub start_time: SystemTime,
    pub update_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub revision: i64,
    pub metrics: Option<ExecutionMetrics>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewExecution {
    pub vendor_type: String,
    pub vendor_id: i64,
    pub trigger: Trigger,
    pub extra_attrs: Map<String, Value>,
    pub start_time: SystemTime,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusRefresh {
    pub changed: bool,
    pub status: Option<TaskStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pending: i64, running: i64, error: i64, stopped: i64, success: i64) -> ExecutionMetrics {
        ExecutionMetrics {
            task_count: pending + running + error + stopped + success,
            pending,
            scheduled: 0,
            running,
            error,
            stopped,
            success,
        }
    }

    #[test]
    fn rollup_prefers_running_then_error_then_stopped() {
        assert_eq!(metrics(1, 0, 3, 0, 0).rollup_status(), Some(TaskStatus::Running));
        assert_eq!(metrics(0, 0, 1, 1, 1).rollup_status(), Some(TaskStatus::Error));
        assert_eq!(metrics(0, 0, 0, 1, 4).rollup_status(), Some(TaskStatus::Stopped));
        assert_eq!(metrics(0, 0, 0, 0, 2).rollup_status(), Some(TaskStatus::Success));
        assert_eq!(metrics(0, 0, 0, 0, 0).rollup_status(), None);
    }

    #[test]
    fn metrics_accumulate_counts() {
        let counts = [
            TaskStatusCount {
                status: TaskStatus::Scheduled,
                count: 2,
            },
            TaskStatusCount {
                status: TaskStatus::Success,
                count: 5,
            },
        ];
        let metrics = ExecutionMetrics::from_counts(&counts);
        assert_eq!(metrics.task_count, 7);
        assert_eq!(metrics.scheduled, 2);
        assert_eq!(metrics.rollup_status(), Some(TaskStatus::Running));
    }
}
