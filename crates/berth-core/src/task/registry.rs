use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::{CoreError, CoreResult, StatusChange, Task, TaskStatus};

/// Handles the opaque `check_in` payload a running job reports for its task.
/// The returned value is recorded on the task according to its check-in mode.
#[async_trait]
pub trait CheckInProcessor: Send + Sync {
    async fn process(&self, task: &Task, change: &StatusChange) -> CoreResult<Value>;
}

/// Runs after an execution's rolled-up status changed.
#[async_trait]
pub trait StatusChangeHook: Send + Sync {
    async fn on_status_change(&self, execution_id: i64, status: TaskStatus) -> CoreResult<()>;
}

/// Per-vendor callbacks, filled during startup and read-only afterwards.
#[derive(Default)]
pub struct VendorRegistry {
    check_in_processors: HashMap<String, Arc<dyn CheckInProcessor>>,
    status_change_hooks: HashMap<String, Arc<dyn StatusChangeHook>>,
}

impl VendorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_check_in_processor(
        &mut self,
        vendor_type: &str,
        processor: Arc<dyn CheckInProcessor>,
    ) -> CoreResult<()> {
        if self.check_in_processors.contains_key(vendor_type) {
            return Err(CoreError::conflict(format!(
                "check-in processor for vendor type '{vendor_type}' already registered"
            )));
        }
        self.check_in_processors
            .insert(vendor_type.to_string(), processor);
        Ok(())
    }

    pub fn register_status_change_hook(
        &mut self,
        vendor_type: &str,
        hook: Arc<dyn StatusChangeHook>,
    ) -> CoreResult<()> {
        if self.status_change_hooks.contains_key(vendor_type) {
            return Err(CoreError::conflict(format!(
                "status change hook for vendor type '{vendor_type}' already registered"
            )));
        }
        self.status_change_hooks.insert(vendor_type.to_string(), hook);
        Ok(())
    }

    pub fn check_in_processor(&self, vendor_type: &str) -> Option<Arc<dyn CheckInProcessor>> {
        self.check_in_processors.get(vendor_type).cloned()
    }

    pub fn status_change_hook(&self, vendor_type: &str) -> Option<Arc<dyn StatusChangeHook>> {
        self.status_change_hooks.get(vendor_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CoreErrorKind;

    struct Noop;

    #[async_trait]
    impl StatusChangeHook for Noop {
        async fn on_status_change(&self, _: i64, _: TaskStatus) -> CoreResult<()> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = VendorRegistry::new();
        registry
            .register_status_change_hook("GARBAGE_COLLECTION", Arc::new(Noop))
            .unwrap();
        let error = registry
            .register_status_change_hook("GARBAGE_COLLECTION", Arc::new(Noop))
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Conflict);
        assert!(registry.status_change_hook("GARBAGE_COLLECTION").is_some());
        assert!(registry.status_change_hook("REPLICATION").is_none());
    }
}
