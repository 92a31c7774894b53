use std::time::SystemTime;

use serde_json::Value;

use crate::models::{ResourceName, TaskStatus, Trigger};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Page {
    /// 1-based.
    pub number: u64,
    pub size: u64,
}

impl Page {
    pub fn new(number: u64, size: u64) -> Self {
        Self {
            number: number.max(1),
            size,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.number.saturating_sub(1)).saturating_mul(self.size)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuotaSortKey {
    CreationTime,
    UpdateTime,
    Hard(ResourceName),
    Used(ResourceName),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QuotaSort {
    pub key: QuotaSortKey,
    pub descending: bool,
}

impl QuotaSort {
    /// Accepts `creation_time`, `update_time`, `hard.<res>`, `used.<res>`,
    /// optionally prefixed with `-` for descending order.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (descending, field) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let key = match field {
            "creation_time" => QuotaSortKey::CreationTime,
            "update_time" => QuotaSortKey::UpdateTime,
            other => match other.split_once('.') {
                Some(("hard", resource)) => QuotaSortKey::Hard(resource.parse()?),
                Some(("used", resource)) => QuotaSortKey::Used(resource.parse()?),
                _ => return Err(format!("unsupported quota sort '{raw}'")),
            },
        };
        Ok(Self { key, descending })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuotaQuery {
    pub id: Option<i64>,
    pub reference: Option<String>,
    pub reference_ids: Vec<String>,
    pub sort: Option<QuotaSort>,
    pub page: Option<Page>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionQuery {
    pub ids: Vec<i64>,
    pub vendor_type: Option<String>,
    pub vendor_id: Option<i64>,
    pub trigger: Option<Trigger>,
    pub status: Option<TaskStatus>,
    pub start_time_from: Option<SystemTime>,
    pub start_time_to: Option<SystemTime>,
    /// Dotted path into `extra_attrs` (e.g. `policy.id`) and the expected value.
    pub extra_attrs: Vec<(String, Value)>,
    pub page: Option<Page>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskQuery {
    pub ids: Vec<i64>,
    pub execution_id: Option<i64>,
    pub vendor_type: Option<String>,
    pub status: Option<TaskStatus>,
    pub job_id: Option<String>,
    pub page: Option<Page>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_sorts() {
        assert_eq!(
            QuotaSort::parse("-used.storage"),
            Ok(QuotaSort {
                key: QuotaSortKey::Used(ResourceName::Storage),
                descending: true,
            })
        );
        assert_eq!(
            QuotaSort::parse("creation_time").map(|sort| sort.key),
            Ok(QuotaSortKey::CreationTime)
        );
        assert!(QuotaSort::parse("hard.cpu").is_err());
        assert!(QuotaSort::parse("name").is_err());
    }

    #[test]
    fn page_offset_is_zero_based() {
        assert_eq!(Page::new(1, 20).offset(), 0);
        assert_eq!(Page::new(3, 20).offset(), 40);
        assert_eq!(Page::new(0, 10).offset(), 0);
    }
}
