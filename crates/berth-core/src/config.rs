use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreResult, vendor};

pub const MAX_SWEEP_BATCH_SIZE: u32 = 65535;

/// Where the quota controller serializes `used`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaUpdateProvider {
    /// Row lock plus optimistic version on the store.
    #[default]
    Db,
    /// Cache cell with compare-and-save, flushed to the store periodically.
    Redis,
}

impl FromStr for QuotaUpdateProvider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "db" => Ok(Self::Db),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown quota update provider '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub database_path: PathBuf,
    pub listen_addr: String,
    pub core_url: String,
    pub jobservice_url: String,
    /// Shared secret presented to the job service; empty disables the header.
    pub jobservice_secret: String,
    pub quota_update_provider: QuotaUpdateProvider,
    /// Shared cache for quota cells and status markers across processes.
    pub redis_url: String,
    pub execution_retain_counts: BTreeMap<String, u64>,
    pub execution_sweep_batch_size: u32,
    pub max_dangling_hour: u64,
    pub reserved_expiration_secs: u64,
    pub quota_warning_percent: u8,
    pub quota_warning_enabled: bool,
    pub quota_flush_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub worker_pool_size: usize,
    pub execution_status_refresh_interval_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("berth.sqlite3"),
            listen_addr: "0.0.0.0:8080".to_string(),
            core_url: "http://core:8080".to_string(),
            jobservice_url: "http://jobservice:8080".to_string(),
            jobservice_secret: String::new(),
            quota_update_provider: QuotaUpdateProvider::Db,
            redis_url: "redis://redis:6379/0".to_string(),
            execution_retain_counts: default_retain_counts(),
            execution_sweep_batch_size: MAX_SWEEP_BATCH_SIZE,
            max_dangling_hour: 168,
            reserved_expiration_secs: 3600,
            quota_warning_percent: 85,
            quota_warning_enabled: false,
            quota_flush_interval_secs: 30,
            sweep_interval_secs: 3600,
            worker_pool_size: 10,
            execution_status_refresh_interval_secs: 0,
        }
    }
}

pub fn default_retain_counts() -> BTreeMap<String, u64> {
    [
        (vendor::REPLICATION, 50),
        (vendor::GARBAGE_COLLECTION, 50),
        (vendor::RETENTION, 50),
        (vendor::SCAN, 1),
        (vendor::SCAN_ALL, 1),
        (vendor::PURGE_AUDIT_LOG, 10),
        (vendor::SCHEDULER, 1),
        (vendor::EXECUTION_SWEEP, 10),
        (vendor::SYSTEM_ARTIFACT_CLEANUP, 50),
        (vendor::P2P_PREHEAT, 50),
    ]
    .into_iter()
    .map(|(vendor_type, count)| (vendor_type.to_string(), count))
    .collect()
}

/// Parses `VENDOR:N,VENDOR:N`.
pub fn parse_retain_counts(raw: &str) -> CoreResult<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (vendor_type, count) = entry.split_once(':').ok_or_else(|| {
            CoreError::bad_request(format!("invalid retain count entry '{entry}'"))
        })?;
        let count = count.trim().parse::<u64>().map_err(|_| {
            CoreError::bad_request(format!("invalid retain count in entry '{entry}'"))
        })?;
        counts.insert(vendor_type.trim().to_string(), count);
    }
    Ok(counts)
}

impl CoreConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(CoreError::bad_request("database_path must not be empty"));
        }
        if !(1..=100).contains(&self.quota_warning_percent) {
            return Err(CoreError::bad_request(
                "quota_warning_percent must be between 1 and 100",
            ));
        }
        if !(1..=1024).contains(&self.worker_pool_size) {
            return Err(CoreError::bad_request(
                "worker_pool_size must be between 1 and 1024",
            ));
        }
        if self.uses_shared_cache() && self.redis_url.trim().is_empty() {
            return Err(CoreError::bad_request(
                "redis_url is required by the redis quota provider and deferred status refresh",
            ));
        }
        if self.quota_flush_interval_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(CoreError::bad_request(
                "periodic intervals must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn from_json_str(input: &str) -> CoreResult<Self> {
        let config: CoreConfig = serde_json::from_str(input)
            .map_err(|error| CoreError::bad_request(format!("parse error: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup` (an environment reader) on top of the
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("BERTH_DATABASE_PATH") {
            config.database_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("BERTH_LISTEN_ADDR") {
            config.listen_addr = value;
        }
        if let Some(value) = lookup("BERTH_CORE_URL") {
            config.core_url = value;
        }
        if let Some(value) = lookup("BERTH_JOBSERVICE_URL") {
            config.jobservice_url = value;
        }
        if let Some(value) = lookup("BERTH_JOBSERVICE_SECRET") {
            config.jobservice_secret = value;
        }
        if let Some(value) = lookup("QUOTA_UPDATE_PROVIDER") {
            config.quota_update_provider = value.parse().map_err(CoreError::bad_request)?;
        }
        if let Some(value) = lookup("BERTH_REDIS_URL") {
            config.redis_url = value;
        }
        if let Some(value) = lookup("EXECUTION_RETAIN_COUNTS") {
            config.execution_retain_counts.extend(parse_retain_counts(&value)?);
        }
        if let Some(value) = lookup("EXECUTION_SWEEP_BATCH_SIZE") {
            config.execution_sweep_batch_size = parse_number("EXECUTION_SWEEP_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("MAX_DANGLING_HOUR") {
            config.max_dangling_hour = parse_number("MAX_DANGLING_HOUR", &value)?;
        }
        if let Some(value) = lookup("RESERVED_EXPIRATION") {
            config.reserved_expiration_secs = parse_number("RESERVED_EXPIRATION", &value)?;
        }
        if let Some(value) = lookup("QUOTA_WARNING_PERCENT") {
            config.quota_warning_percent = parse_number("QUOTA_WARNING_PERCENT", &value)?;
        }
        if let Some(value) = lookup("QUOTA_WARNING_ENABLED") {
            config.quota_warning_enabled = parse_number("QUOTA_WARNING_ENABLED", &value)?;
        }
        if let Some(value) = lookup("EXECUTION_STATUS_REFRESH_INTERVAL") {
            config.execution_status_refresh_interval_secs =
                parse_number("EXECUTION_STATUS_REFRESH_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("WORKER_POOL_SIZE") {
            config.worker_pool_size = parse_number("WORKER_POOL_SIZE", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Cache cells and status markers must be visible to every process.
    pub fn uses_shared_cache(&self) -> bool {
        self.quota_update_provider == QuotaUpdateProvider::Redis
            || self.execution_status_refresh_interval_secs > 0
    }

    pub fn sweep_batch_size(&self) -> u32 {
        self.execution_sweep_batch_size.clamp(1, MAX_SWEEP_BATCH_SIZE)
    }

    pub fn retain_count(&self, vendor_type: &str) -> u64 {
        self.execution_retain_counts
            .get(vendor_type)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_dangling(&self) -> Duration {
        Duration::from_secs(self.max_dangling_hour.saturating_mul(3600))
    }

    pub fn reserved_expiration(&self) -> Duration {
        Duration::from_secs(self.reserved_expiration_secs)
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> CoreResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| CoreError::bad_request(format!("invalid value '{value}' for {name}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retain_count(vendor::SCAN_ALL), 1);
        assert_eq!(config.retain_count("UNKNOWN"), 0);
        assert_eq!(config.sweep_batch_size(), 65535);
    }

    #[test]
    fn env_overrides_merge_into_defaults() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("EXECUTION_RETAIN_COUNTS", "REPLICATION:5, CUSTOM:2"),
            ("QUOTA_UPDATE_PROVIDER", "redis"),
            ("EXECUTION_SWEEP_BATCH_SIZE", "100000"),
        ]);
        let config =
            CoreConfig::from_lookup(|name| env.get(name).map(|value| value.to_string())).unwrap();
        assert_eq!(config.retain_count(vendor::REPLICATION), 5);
        assert_eq!(config.retain_count("CUSTOM"), 2);
        assert_eq!(config.retain_count(vendor::GARBAGE_COLLECTION), 50);
        assert_eq!(config.quota_update_provider, QuotaUpdateProvider::Redis);
        assert_eq!(config.sweep_batch_size(), MAX_SWEEP_BATCH_SIZE);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(parse_retain_counts("REPLICATION").is_err());
        assert!(parse_retain_counts("REPLICATION:x").is_err());
        assert!(CoreConfig::from_json_str(r#"{"quota_warning_percent": 0}"#).is_err());
        assert!(CoreConfig::from_json_str(r#"{"worker_pool_size": 4}"#).is_ok());
    }

    #[test]
    fn shared_cache_needs_a_redis_url() {
        assert!(!CoreConfig::default().uses_shared_cache());
        let deferred = CoreConfig {
            execution_status_refresh_interval_secs: 5,
            ..CoreConfig::default()
        };
        assert!(deferred.uses_shared_cache());
        assert!(
            CoreConfig::from_json_str(r#"{"quota_update_provider": "redis", "redis_url": ""}"#)
                .is_err()
        );
        let env: HashMap<&str, &str> = HashMap::from([
            ("QUOTA_UPDATE_PROVIDER", "redis"),
            ("BERTH_REDIS_URL", "redis://cache:6380/1"),
        ]);
        let config =
            CoreConfig::from_lookup(|name| env.get(name).map(|value| value.to_string())).unwrap();
        assert_eq!(config.redis_url, "redis://cache:6380/1");
    }
}
