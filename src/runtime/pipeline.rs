use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::errors::{EngineError, Result};

/// Results produced along one sequential chain, keyed by task id.
///
/// The chain owns its pipeline exclusively. A parallel fork hands each branch
/// its own copy and never merges the copies back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultPipeline {
    results: HashMap<Uuid, Value>,
}

impl ResultPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: &Uuid) -> Option<&Value> {
        self.results.get(task_id)
    }

    pub fn record(&mut self, task_id: Uuid, result: Value) {
        self.results.insert(task_id, result);
    }

    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Looks up every `result_params` source for `task_id`. Any miss is fatal
    /// for the task.
    pub fn resolve(
        &self,
        task_id: Uuid,
        result_params: &BTreeMap<String, Uuid>,
    ) -> Result<Map<String, Value>> {
        let mut resolved = Map::new();
        for (local_name, upstream) in result_params {
            let value = self
                .get(upstream)
                .ok_or_else(|| EngineError::DependencyMissing {
                    task_id,
                    local_name: local_name.clone(),
                    upstream: *upstream,
                })?;
            resolved.insert(local_name.clone(), value.clone());
        }
        Ok(resolved)
    }
}
