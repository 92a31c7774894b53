use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{CoreError, CoreResult};

/// Work a schedule triggers. `param` is the JSON stored with the schedule.
#[async_trait]
pub trait SchedulerCallback: Send + Sync {
    async fn call(&self, param: &str) -> CoreResult<()>;
}

#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Arc<dyn SchedulerCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, callback: Arc<dyn SchedulerCallback>) -> CoreResult<()> {
        if self.callbacks.contains_key(name) {
            return Err(CoreError::conflict(format!(
                "scheduler callback '{name}' already registered"
            )));
        }
        self.callbacks.insert(name.to_string(), callback);
        Ok(())
    }

    pub fn get(&self, name: &str) -> CoreResult<Arc<dyn SchedulerCallback>> {
        self.callbacks.get(name).cloned().ok_or_else(|| {
            CoreError::bad_request(format!("scheduler callback '{name}' is not registered"))
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.callbacks.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}
