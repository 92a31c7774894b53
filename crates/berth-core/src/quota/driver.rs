use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::{CoreError, CoreResult, ResourceList};

/// Per-reference-type policy: which resources exist, their defaults, and
/// how usage is recounted.
#[async_trait]
pub trait QuotaDriver: Send + Sync {
    async fn enabled(&self, reference_id: &str) -> CoreResult<bool>;

    /// Hard limits for newly created quotas.
    fn hard_limits(&self) -> ResourceList;

    /// Display object for the reference, used when a quota is expanded.
    async fn load(&self, reference_id: &str) -> CoreResult<Value>;

    fn validate(&self, hard: &ResourceList) -> CoreResult<()>;

    async fn calculate_usage(&self, reference_id: &str) -> CoreResult<ResourceList>;
}

#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn QuotaDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        reference: impl Into<String>,
        driver: Arc<dyn QuotaDriver>,
    ) -> CoreResult<()> {
        let reference = reference.into();
        if self.drivers.contains_key(&reference) {
            return Err(CoreError::conflict(format!(
                "quota driver for '{reference}' already registered"
            )));
        }
        self.drivers.insert(reference, driver);
        Ok(())
    }

    pub fn get(&self, reference: &str) -> CoreResult<Arc<dyn QuotaDriver>> {
        self.drivers.get(reference).cloned().ok_or_else(|| {
            CoreError::bad_request(format!("quota driver for '{reference}' not found")).abort()
        })
    }

    pub fn references(&self) -> Vec<String> {
        let mut references: Vec<String> = self.drivers.keys().cloned().collect();
        references.sort();
        references
    }
}
