use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::actions::TaskHandler;
use crate::dsl::validate_task_name;
use crate::errors::Result;

pub type TaskFactory = Arc<dyn Fn() -> Box<dyn TaskHandler> + Send + Sync>;

/// Maps stable task identifiers to factories. Populated at process start.
#[derive(Default)]
pub struct TaskRegistry {
    factories: DashMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn TaskHandler> + Send + Sync + 'static,
    {
        validate_task_name(name)?;
        debug!(task = name, "Registering task implementation");
        self.factories.insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Builds a fresh handler instance, or `None` if nothing is registered.
    pub fn resolve(&self, name: &str) -> Option<Box<dyn TaskHandler>> {
        let factory = self.factories.get(name).map(|f| f.value().clone())?;
        Some(factory())
    }
}
