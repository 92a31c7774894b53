use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Hard-limit sentinel meaning the resource is not limited.
pub const UNLIMITED: i64 = -1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ResourceName {
    Count,
    Storage,
}

impl ResourceName {
    pub const ALL: [ResourceName; 2] = [ResourceName::Count, ResourceName::Storage];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Storage => "storage",
        }
    }

    pub fn format_value(self, value: i64) -> String {
        if value == UNLIMITED {
            return "unlimited".to_string();
        }
        match self {
            Self::Count => value.to_string(),
            Self::Storage => format_bytes(value),
        }
    }
}

impl FromStr for ResourceName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "count" => Ok(Self::Count),
            "storage" => Ok(Self::Storage),
            _ => Err(format!("unknown resource name '{value}'")),
        }
    }
}

impl Display for ResourceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResourceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

fn format_bytes(value: i64) -> String {
    const UNIT: u64 = 1024;
    let magnitude = value.unsigned_abs();
    if magnitude < UNIT {
        return format!("{value} B");
    }
    let mut divisor = UNIT;
    let mut exponent = 0usize;
    let mut remaining = magnitude / UNIT;
    while remaining >= UNIT && exponent < 5 {
        divisor *= UNIT;
        exponent += 1;
        remaining /= UNIT;
    }
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exponent];
    format!("{:.1} {prefix}iB", value as f64 / divisor as f64)
}

/// Resource name to amount. Missing keys behave as zero in arithmetic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceList(BTreeMap<ResourceName, i64>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: ResourceName, value: i64) -> Self {
        self.0.insert(name, value);
        self
    }

    pub fn get(&self, name: ResourceName) -> Option<i64> {
        self.0.get(&name).copied()
    }

    pub fn insert(&mut self, name: ResourceName, value: i64) {
        self.0.insert(name, value);
    }

    pub fn contains(&self, name: ResourceName) -> bool {
        self.0.contains_key(&name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = ResourceName> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceName, i64)> + '_ {
        self.0.iter().map(|(name, value)| (*name, *value))
    }

    pub fn add(&self, other: &ResourceList) -> ResourceList {
        self.combine(other, i64::wrapping_add)
    }

    pub fn subtract(&self, other: &ResourceList) -> ResourceList {
        self.combine(other, i64::wrapping_sub)
    }

    pub fn zero(&self) -> ResourceList {
        ResourceList(self.0.keys().map(|name| (*name, 0)).collect())
    }

    /// Keys whose value is negative, in key order.
    pub fn is_negative(&self) -> Vec<ResourceName> {
        self.0
            .iter()
            .filter(|(_, value)| **value < 0)
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn to_json(&self) -> String {
        let canonical: BTreeMap<&str, i64> = self
            .0
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .collect();
        serde_json::to_string(&canonical).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Self::new());
        }
        serde_json::from_str(raw).map_err(|error| format!("invalid resource list: {error}"))
    }

    fn combine(&self, other: &ResourceList, op: fn(i64, i64) -> i64) -> ResourceList {
        let mut result = BTreeMap::new();
        for name in self.0.keys().chain(other.0.keys()) {
            let left = self.get(*name).unwrap_or(0);
            let right = other.get(*name).unwrap_or(0);
            result.insert(*name, op(left, right));
        }
        ResourceList(result)
    }
}

impl FromIterator<(ResourceName, i64)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (ResourceName, i64)>>(iter: T) -> Self {
        ResourceList(iter.into_iter().collect())
    }
}

impl Display for ResourceList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let rendered = self
            .0
            .iter()
            .map(|(name, value)| format!("{name}: {}", name.format_value(*value)))
            .collect::<Vec<_>>()
            .join(", ");
        f.write_str(&rendered)
    }
}

impl Serialize for ResourceList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let canonical: BTreeMap<&str, i64> = self
            .0
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .collect();
        canonical.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ResourceList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, i64>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(name, value)| {
                name.parse::<ResourceName>()
                    .map(|name| (name, value))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceOverflow {
    pub resource: ResourceName,
    pub hard: i64,
    pub current: i64,
    pub new_used: i64,
}

impl Display for ResourceOverflow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let delta = self.new_used.saturating_sub(self.current);
        write!(
            f,
            "adding {} of {}, which when updated to current usage of {} will exceed the configured upper limit of {}",
            self.resource.format_value(delta),
            self.resource,
            self.resource.format_value(self.current),
            self.resource.format_value(self.hard),
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ResourceError {
    #[error("resource {0} not found in the hard limits")]
    NotFound(ResourceName),
    #[error("{0}")]
    Overflow(ResourceOverflow),
}

#[derive(Clone, Debug, Default, Eq, PartialEq, thiserror::Error)]
#[error("{}", join_errors(.0))]
pub struct ResourceErrors(pub Vec<ResourceError>);

impl ResourceErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Only the over-limit violations; anything else is an internal error.
    pub fn exceeded(&self) -> Vec<ResourceOverflow> {
        self.0
            .iter()
            .filter_map(|error| match error {
                ResourceError::Overflow(overflow) => Some(overflow.clone()),
                ResourceError::NotFound(_) => None,
            })
            .collect()
    }
}

fn join_errors(errors: &[ResourceError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn is_safe(
    hard: &ResourceList,
    current_used: &ResourceList,
    new_used: &ResourceList,
    ignore_limitation: bool,
) -> Result<(), ResourceErrors> {
    let mut errors = Vec::new();
    for (resource, used) in new_used.iter() {
        let Some(limit) = hard.get(resource) else {
            errors.push(ResourceError::NotFound(resource));
            continue;
        };
        if limit == UNLIMITED {
            continue;
        }
        if used > limit && !ignore_limitation {
            errors.push(ResourceError::Overflow(ResourceOverflow {
                resource,
                hard: limit,
                current: current_used.get(resource).unwrap_or(0),
                new_used: used,
            }));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ResourceErrors(errors))
    }
}
