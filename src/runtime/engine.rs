use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::actions::TaskHandler;
use crate::compiler::core::{MaterializedTree, TreeBuilder};
use crate::config::EngineConfig;
use crate::dsl::Workflow;
use crate::errors::{EngineError, Result};
use crate::runtime::audit::{AuditSink, InMemoryAuditSink};
use crate::runtime::context::{ProgressEvent, ProgressReporter, TaskContext};
use crate::runtime::dispatch::{Dispatcher, LocalDispatcher};
use crate::runtime::pipeline::ResultPipeline;
use crate::runtime::registry::TaskRegistry;
use crate::runtime::storage::{InMemoryStateStore, StateStore};

/// How a step run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failure,
    /// A branch is parked on a `wait_for_params` task.
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRun {
    pub step_id: Uuid,
    pub outcome: StepOutcome,
}

/// Per-run inputs to materialization.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub information_package: Option<String>,
    pub variables: HashMap<String, Value>,
}

/// 引擎上下文 (Engine context)
///
/// Built once per process and cloned freely; every clone shares the same
/// store, dispatcher, audit sink and registries.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) config: Arc<EngineConfig>,
    definitions: Arc<DashMap<String, Arc<Workflow>>>,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// In-memory store, local worker pool, in-memory audit log.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let dispatcher = Arc::new(LocalDispatcher::new(config.worker_concurrency));
        Self::new_with_storage(
            Arc::new(InMemoryStateStore::new()),
            dispatcher,
            Arc::new(InMemoryAuditSink::new()),
            config,
        )
    }

    pub fn new_with_storage(
        store: Arc<dyn StateStore>,
        dispatcher: Arc<dyn Dispatcher>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(config.progress_channel_capacity.max(1));
        Self {
            store,
            dispatcher,
            audit,
            registry: Arc::new(TaskRegistry::new()),
            config: Arc::new(config),
            definitions: Arc::new(DashMap::new()),
            progress_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn register_task<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn TaskHandler> + Send + Sync + 'static,
    {
        self.registry.register(name, factory)
    }

    pub fn register_definition(&self, workflow: Workflow) {
        let id = workflow.id.clone();
        debug!(workflow = %id, "Registering workflow definition");
        self.definitions.insert(id, Arc::new(workflow));
    }

    pub fn definition(&self, name: &str) -> Option<Arc<Workflow>> {
        self.definitions.get(name).map(|d| d.value().clone())
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    pub(crate) fn progress_reporter(&self) -> ProgressReporter {
        ProgressReporter {
            store: self.store.clone(),
            events: self.progress_tx.clone(),
            retry_delay: self.config.lock_retry_delay(),
        }
    }

    /// Builds the rows for `definition_name` without persisting anything.
    pub fn plan(&self, definition_name: &str, options: &RunOptions) -> Result<MaterializedTree> {
        let workflow = self
            .definition(definition_name)
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_name.to_string()))?;
        TreeBuilder::new(&self.registry, self.config.position_gap)
            .with_variables(options.variables.clone())
            .with_package(options.information_package.clone())
            .build(&workflow)
    }

    /// Materializes and persists the tree, returning the root step id.
    pub async fn materialize(&self, definition_name: &str, options: &RunOptions) -> Result<Uuid> {
        let tree = self.plan(definition_name, options)?;
        let root_id = tree.root_id;
        for step in tree.steps {
            self.store.insert_step(step).await?;
        }
        for task in tree.tasks {
            self.store.insert_task(task).await?;
        }
        info!(workflow = definition_name, step_id = %root_id, "Workflow materialized");
        Ok(root_id)
    }

    pub async fn run_step(&self, definition_name: &str) -> Result<StepRun> {
        self.run_step_with(definition_name, RunOptions::default()).await
    }

    pub async fn run_step_with(&self, definition_name: &str, options: RunOptions) -> Result<StepRun> {
        let step_id = self.materialize(definition_name, &options).await?;
        let root = self
            .store
            .get_step(step_id)
            .await?
            .ok_or(EngineError::StepNotFound(step_id))?;

        let mut pipeline = ResultPipeline::new();
        let outcome = self.execute_step(root, &mut pipeline).await?;
        info!(workflow = definition_name, %step_id, ?outcome, "Step run finished");
        Ok(StepRun { step_id, outcome })
    }

    /// Runs an implementation inline: no row, no persistence, no events.
    pub async fn run_eager(&self, name: &str, params: Map<String, Value>) -> Result<Value> {
        let handler = self
            .registry
            .resolve(name)
            .ok_or_else(|| EngineError::UnknownTask(name.to_string()))?;
        let ctx = TaskContext::detached(name, params);
        handler
            .run(&ctx)
            .await
            .map_err(|e| EngineError::task_execution(ctx.task_id, &e))
    }

    pub async fn undo_eager(&self, name: &str, params: Map<String, Value>) -> Result<()> {
        let handler = self
            .registry
            .resolve(name)
            .ok_or_else(|| EngineError::UnknownTask(name.to_string()))?;
        let ctx = TaskContext::detached(name, params);
        handler.undo(&ctx).await.map_err(|e| EngineError::Undo {
            task_id: ctx.task_id,
            message: format!("{:?}", e),
        })
    }
}
