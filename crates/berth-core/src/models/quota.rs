use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::ResourceList;

pub const PROJECT_REFERENCE: &str = "project";

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReferenceObject {
    pub reference: String,
    pub reference_id: String,
}

impl ReferenceObject {
    pub fn new(reference: impl Into<String>, reference_id: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            reference_id: reference_id.into(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub id: i64,
    pub reference: String,
    pub reference_id: String,
    pub hard: ResourceList,
    pub used: ResourceList,
    pub creation_time: SystemTime,
    pub update_time: SystemTime,
    pub version: i64,
}

/// Columns an `update_quota` call should write.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QuotaChanges {
    pub hard: bool,
    pub used: bool,
}

impl QuotaChanges {
    pub const HARD: QuotaChanges = QuotaChanges {
        hard: true,
        used: false,
    };
    pub const USED: QuotaChanges = QuotaChanges {
        hard: false,
        used: true,
    };
    pub const ALL: QuotaChanges = QuotaChanges {
        hard: true,
        used: true,
    };
}

/// Quota expanded with its display object, as returned by `get` with
/// reference expansion.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuotaView {
    #[serde(flatten)]
    pub quota: Quota,
    pub reference_object: Option<serde_json::Value>,
}
