use async_trait::async_trait;
use serde::Serialize;

use crate::models::{ResourceList, ResourceName, UNLIMITED};

pub const DEFAULT_WARNING_PERCENT: u8 = 85;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct QuotaWarningEvent {
    pub reference: String,
    pub reference_id: String,
    pub resources: Vec<ResourceName>,
    pub usage: ResourceList,
    pub hard: ResourceList,
    pub percent: u8,
}

#[async_trait]
pub trait QuotaEventSink: Send + Sync {
    async fn publish(&self, event: QuotaWarningEvent);
}

/// Limited resources whose usage is at or above `percent` of the limit.
pub fn crossed_resources(hard: &ResourceList, used: &ResourceList, percent: u8) -> Vec<ResourceName> {
    hard.iter()
        .filter(|(_, limit)| *limit != UNLIMITED && *limit > 0)
        .filter(|(resource, limit)| {
            let used = i128::from(used.get(*resource).unwrap_or(0));
            used * 100 >= i128::from(*limit) * i128::from(percent)
        })
        .map(|(resource, _)| resource)
        .collect()
}
