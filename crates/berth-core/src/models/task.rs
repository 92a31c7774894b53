use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const FINAL_STATUS_CODE: i64 = 3;

/// Shared by tasks and executions. The three final statuses share one code so
/// a retry (new revision) is the only way to move between them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Stopped,
    Error,
    Success,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Scheduled,
        TaskStatus::Running,
        TaskStatus::Stopped,
        TaskStatus::Error,
        TaskStatus::Success,
    ];

    pub fn code(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Scheduled => 1,
            Self::Running => 2,
            Self::Stopped | Self::Error | Self::Success => FINAL_STATUS_CODE,
        }
    }

    pub fn is_final(self) -> bool {
        self.code() == FINAL_STATUS_CODE
    }

    pub fn is_after(self, other: TaskStatus) -> bool {
        self.code() > other.code()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
            Self::Success => "Success",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown status '{value}'"))
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a check-in value returned by a processor lands in `extra_attrs.check_in`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckInMode {
    Append,
    #[default]
    Override,
}

impl CheckInMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Override => "override",
        }
    }
}

impl FromStr for CheckInMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "append" => Ok(Self::Append),
            "override" => Ok(Self::Override),
            _ => Err(format!("unknown check-in mode '{value}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub id: i64,
    pub vendor_type: String,
    pub execution_id: i64,
    pub job_id: String,
    pub status: TaskStatus,
    pub status_code: i64,
    pub status_revision: i64,
    pub status_message: String,
    pub run_count: i64,
    pub check_in_mode: CheckInMode,
    pub extra_attrs: Map<String, Value>,
    pub creation_time: SystemTime,
    pub start_time: Option<SystemTime>,
    pub update_time: SystemTime,
    pub end_time: Option<SystemTime>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewTask {
    pub execution_id: i64,
    pub vendor_type: String,
    pub check_in_mode: CheckInMode,
    pub extra_attrs: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeMetadata {
    #[serde(default)]
    pub revision: i64,
}

/// Body posted by the worker fleet to the status hook.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    #[serde(default)]
    pub job_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub check_in: String,
    #[serde(default)]
    pub metadata: StatusChangeMetadata,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TaskStatusCount {
    pub status: TaskStatus,
    pub count: i64,
}
