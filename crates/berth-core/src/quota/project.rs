use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::models::{
    CoreError, CoreResult, PROJECT_REFERENCE, ResourceList, ResourceName, UNLIMITED,
};
use crate::persistence::{QuotaStore, blocking};
use crate::quota::driver::QuotaDriver;

/// Upper bound for a limited value: 1000 TiB.
pub const MAX_LIMITED: i64 = 1_099_511_627_776_000;

/// Registry-side facts the project driver needs: project metadata and the
/// artifact/blob totals it recounts usage from.
#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn project(&self, project_id: i64) -> CoreResult<Value>;

    async fn usage(&self, project_id: i64) -> CoreResult<ResourceList>;
}

pub struct ProjectDriver {
    catalog: Arc<dyn ProjectCatalog>,
    enabled: bool,
    count_per_project: i64,
    storage_per_project: i64,
}

impl ProjectDriver {
    pub fn new(catalog: Arc<dyn ProjectCatalog>) -> Self {
        Self {
            catalog,
            enabled: true,
            count_per_project: UNLIMITED,
            storage_per_project: UNLIMITED,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_defaults(mut self, count_per_project: i64, storage_per_project: i64) -> Self {
        self.count_per_project = count_per_project;
        self.storage_per_project = storage_per_project;
        self
    }
}

fn parse_project_id(reference_id: &str) -> CoreResult<i64> {
    reference_id.parse::<i64>().map_err(|_| {
        CoreError::bad_request(format!("invalid project reference id '{reference_id}'")).abort()
    })
}

#[async_trait]
impl QuotaDriver for ProjectDriver {
    async fn enabled(&self, _reference_id: &str) -> CoreResult<bool> {
        Ok(self.enabled)
    }

    fn hard_limits(&self) -> ResourceList {
        ResourceList::new()
            .with(ResourceName::Count, self.count_per_project)
            .with(ResourceName::Storage, self.storage_per_project)
    }

    async fn load(&self, reference_id: &str) -> CoreResult<Value> {
        self.catalog.project(parse_project_id(reference_id)?).await
    }

    fn validate(&self, hard: &ResourceList) -> CoreResult<()> {
        for resource in ResourceName::ALL {
            if !hard.contains(resource) {
                return Err(CoreError::bad_request(format!(
                    "resource {resource} is required in the hard limits"
                )));
            }
        }
        for (resource, value) in hard.iter() {
            if value == UNLIMITED {
                continue;
            }
            if value <= 0 {
                return Err(CoreError::bad_request(format!(
                    "invalid value {value} for resource {resource}, it must be positive or {UNLIMITED}"
                )));
            }
            if value > MAX_LIMITED {
                return Err(CoreError::bad_request(format!(
                    "value {value} for resource {resource} exceeds the maximum {MAX_LIMITED}"
                )));
            }
        }
        Ok(())
    }

    async fn calculate_usage(&self, reference_id: &str) -> CoreResult<ResourceList> {
        let usage = self.catalog.usage(parse_project_id(reference_id)?).await?;
        Ok(ResourceName::ALL
            .into_iter()
            .map(|resource| (resource, usage.get(resource).unwrap_or(0)))
            .collect())
    }
}

/// Catalog that reports the usage already persisted for each project quota.
/// A recount through it never moves `used`, so cache rebuilds and refreshes
/// stay at the last committed value until a registry catalog is wired in.
pub struct StoredUsageCatalog {
    store: Arc<dyn QuotaStore>,
}

impl StoredUsageCatalog {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProjectCatalog for StoredUsageCatalog {
    async fn project(&self, project_id: i64) -> CoreResult<Value> {
        Ok(json!({ "id": project_id }))
    }

    async fn usage(&self, project_id: i64) -> CoreResult<ResourceList> {
        let reference_id = project_id.to_string();
        let quota = blocking(&self.store, move |store| {
            store.get_quota_by_ref(PROJECT_REFERENCE, &reference_id)
        })
        .await?;
        Ok(quota.used)
    }
}

/// Catalog backed by process memory. Projects without recorded usage are
/// reported as not found rather than empty.
#[derive(Default)]
pub struct MemoryProjectCatalog {
    projects: Mutex<HashMap<i64, ResourceList>>,
}

impl MemoryProjectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_usage(&self, project_id: i64, usage: ResourceList) -> CoreResult<()> {
        let mut projects = self
            .projects
            .lock()
            .map_err(|_| CoreError::internal("project catalog mutex poisoned"))?;
        projects.insert(project_id, usage);
        Ok(())
    }
}

#[async_trait]
impl ProjectCatalog for MemoryProjectCatalog {
    async fn project(&self, project_id: i64) -> CoreResult<Value> {
        Ok(json!({ "id": project_id }))
    }

    async fn usage(&self, project_id: i64) -> CoreResult<ResourceList> {
        let projects = self
            .projects
            .lock()
            .map_err(|_| CoreError::internal("project catalog mutex poisoned"))?;
        projects.get(&project_id).cloned().ok_or_else(|| {
            CoreError::not_found(format!("no usage recorded for project {project_id}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> ProjectDriver {
        ProjectDriver::new(Arc::new(MemoryProjectCatalog::new()))
    }

    #[test]
    fn validate_accepts_unlimited_and_positive_values() {
        let hard = ResourceList::new()
            .with(ResourceName::Count, UNLIMITED)
            .with(ResourceName::Storage, 1024);
        assert!(driver().validate(&hard).is_ok());
    }

    #[test]
    fn validate_rejects_zero_missing_and_too_large() {
        let zero = ResourceList::new()
            .with(ResourceName::Count, 0)
            .with(ResourceName::Storage, 1);
        assert!(driver().validate(&zero).is_err());

        let missing = ResourceList::new().with(ResourceName::Storage, 1);
        assert!(driver().validate(&missing).is_err());

        let huge = ResourceList::new()
            .with(ResourceName::Count, 1)
            .with(ResourceName::Storage, MAX_LIMITED + 1);
        assert!(driver().validate(&huge).is_err());
    }

    #[tokio::test]
    async fn calculate_usage_fills_missing_resources() {
        let catalog = Arc::new(MemoryProjectCatalog::new());
        catalog
            .set_usage(3, ResourceList::new().with(ResourceName::Storage, 99))
            .unwrap();
        let usage = ProjectDriver::new(catalog).calculate_usage("3").await.unwrap();
        assert_eq!(usage.get(ResourceName::Count), Some(0));
        assert_eq!(usage.get(ResourceName::Storage), Some(99));
        assert!(driver().calculate_usage("abc").await.unwrap_err().is_abort());
    }

    #[tokio::test]
    async fn unknown_projects_have_no_usage() {
        let error = driver().calculate_usage("5").await.unwrap_err();
        assert_eq!(error.kind, crate::models::CoreErrorKind::NotFound);
    }
}
