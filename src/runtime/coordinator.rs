use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::runtime::context::TaskContext;
use crate::runtime::dispatch::job;
use crate::runtime::engine::{Engine, StepOutcome, StepRun};
use crate::runtime::pipeline::ResultPipeline;
use crate::runtime::scheduler::BoxFuture;
use crate::runtime::storage::with_lock_retry;
use crate::runtime::task::{
    AttemptRecord, Child, StepPatch, StepRecord, TaskPatch, TaskRecord, TaskStatus,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Every task had already succeeded; nothing ran and no attempt was created.
    NothingToRetry,
    Ran { attempt: u32, outcome: StepOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoFailure {
    pub task_id: Uuid,
    pub message: String,
}

/// Result of an undo cascade. Failures never stop the cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoReport {
    /// In the order `undo` was invoked.
    pub undone: Vec<Uuid>,
    pub failed: Vec<UndoFailure>,
}

impl UndoReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Rows below (and including) one step.
#[derive(Debug, Default)]
struct Subtree {
    steps: Vec<StepRecord>,
    tasks: Vec<TaskRecord>,
}

impl Engine {
    /// Re-runs a failed step in a new attempt.
    ///
    /// SUCCESS rows keep their results and are replayed; every other row goes
    /// back to PENDING with its previous outcome appended to `history`.
    pub async fn retry_step(&self, step_id: Uuid) -> Result<RetryOutcome> {
        let step = self.require_step(step_id).await?;
        let subtree = self.subtree(&step).await?;
        ensure_idle(step_id, &subtree)?;

        if subtree.tasks.iter().all(|t| t.status == TaskStatus::Success) {
            info!(%step_id, "Every task already succeeded, nothing to retry");
            return Ok(RetryOutcome::NothingToRetry);
        }

        let attempt = subtree.steps.iter().map(|s| s.attempt).max().unwrap_or(0) + 1;
        let delay = self.config.lock_retry_delay();

        for sub in &subtree.steps {
            let patch = StepPatch {
                attempt: Some(attempt),
                ..Default::default()
            };
            with_lock_retry(delay, || self.store.patch_step(sub.id, patch.clone())).await?;
        }

        for task in &subtree.tasks {
            let patch = if task.status == TaskStatus::Success {
                TaskPatch::reattempt(attempt)
            } else {
                let mut history = task.history.clone();
                if task.status.is_terminal() {
                    history.push(AttemptRecord {
                        attempt: task.attempt,
                        status: task.status,
                        traceback: task.traceback.clone(),
                        completed_at: task.completed_at,
                    });
                }
                TaskPatch::reset(attempt, history)
            };
            with_lock_retry(delay, || self.store.patch_task(task.id, patch.clone())).await?;
        }

        info!(%step_id, attempt, "Retrying step");
        let step = self.require_step(step_id).await?;
        let mut pipeline = self.seed_pipeline(&step).await?;
        let outcome = self.execute_step(step, &mut pipeline).await?;
        info!(%step_id, attempt, ?outcome, "Retry finished");
        Ok(RetryOutcome::Ran { attempt, outcome })
    }

    /// Walks the step backwards, compensating every task that actually ran.
    ///
    /// With `only_failed`, only tasks executed in their current attempt are
    /// undone; results replayed from earlier attempts are kept.
    pub async fn undo_step(&self, step_id: Uuid, only_failed: bool) -> Result<UndoReport> {
        let step = self.require_step(step_id).await?;
        ensure_idle(step_id, &self.subtree(&step).await?)?;

        let mut report = UndoReport::default();
        let mut warnings: BTreeMap<Uuid, Vec<String>> = BTreeMap::new();
        self.undo_descending(step, only_failed, &mut report, &mut warnings)
            .await?;

        let delay = self.config.lock_retry_delay();
        for (owner, mut new_warnings) in warnings {
            let mut cleanup = self.require_step(owner).await?.cleanup_warnings;
            cleanup.append(&mut new_warnings);
            let patch = StepPatch {
                cleanup_warnings: Some(cleanup),
                ..Default::default()
            };
            with_lock_retry(delay, || self.store.patch_step(owner, patch.clone())).await?;
        }

        info!(
            %step_id,
            only_failed,
            undone = report.undone.len(),
            failed = report.failed.len(),
            "Undo finished"
        );
        Ok(report)
    }

    /// Feeds values into the first task of `step_id` waiting for params and
    /// resumes the whole tree.
    ///
    /// Only keys already declared in the task's params are taken.
    pub async fn continue_step(
        &self,
        step_id: Uuid,
        field_updates: Map<String, Value>,
    ) -> Result<StepRun> {
        let step = self.require_step(step_id).await?;
        if !step.wait_for_params {
            return Err(EngineError::NotWaiting(step_id));
        }

        let root = self.root_of(step.clone()).await?;
        ensure_idle(root.id, &self.subtree(&root).await?)?;

        let tasks = self.store.step_tasks(step_id).await?;
        let mut waiting = tasks
            .iter()
            .filter(|t| t.wait_for_params && t.status == TaskStatus::Pending);
        let task = waiting.next().ok_or(EngineError::NotWaiting(step_id))?;
        let still_waiting = waiting.next().is_some();

        let mut params = task.params.clone();
        for (key, value) in field_updates {
            if params.contains_key(&key) {
                params.insert(key, value);
            } else {
                warn!(task_id = %task.id, %key, "Ignoring undeclared param");
            }
        }

        let delay = self.config.lock_retry_delay();
        let patch = TaskPatch::continued(params);
        with_lock_retry(delay, || self.store.patch_task(task.id, patch.clone())).await?;
        if !still_waiting {
            let patch = StepPatch {
                wait_for_params: Some(false),
                ..Default::default()
            };
            with_lock_retry(delay, || self.store.patch_step(step_id, patch.clone())).await?;
        }

        info!(%step_id, task_id = %task.id, root_id = %root.id, "Continuing workflow");
        let mut pipeline = ResultPipeline::new();
        let outcome = self.execute_step(root.clone(), &mut pipeline).await?;
        Ok(StepRun {
            step_id: root.id,
            outcome,
        })
    }

    async fn require_step(&self, step_id: Uuid) -> Result<StepRecord> {
        self.store
            .get_step(step_id)
            .await?
            .ok_or(EngineError::StepNotFound(step_id))
    }

    pub(crate) async fn root_of(&self, mut step: StepRecord) -> Result<StepRecord> {
        while let Some(parent) = step.parent_step {
            step = self.require_step(parent).await?;
        }
        Ok(step)
    }

    async fn subtree(&self, step: &StepRecord) -> Result<Subtree> {
        let mut subtree = Subtree::default();
        let mut queue = vec![step.clone()];
        while let Some(current) = queue.pop() {
            subtree
                .tasks
                .extend(self.store.step_tasks(current.id).await?);
            queue.extend(self.store.child_steps(current.id).await?);
            subtree.steps.push(current);
        }
        Ok(subtree)
    }

    /// Rebuilds the pipeline a step would have received had the tree run up
    /// to it: earlier siblings under every sequential ancestor contribute
    /// their stored results.
    pub(crate) async fn seed_pipeline(&self, step: &StepRecord) -> Result<ResultPipeline> {
        let mut pipeline = ResultPipeline::new();
        let mut current = step.clone();
        while let Some(parent_id) = current.parent_step {
            let parent = self.require_step(parent_id).await?;
            if !parent.parallel {
                for child in self.children(parent.id).await? {
                    if child.position() >= current.position {
                        break;
                    }
                    match child {
                        Child::Task(task) => replay_into(&mut pipeline, &task),
                        Child::Step(sub) => self.replay_step(sub, &mut pipeline).await?,
                    }
                }
            }
            current = parent;
        }
        Ok(pipeline)
    }

    fn replay_step<'a>(
        &'a self,
        step: StepRecord,
        pipeline: &'a mut ResultPipeline,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // A parallel step never hands its branches' results back.
            if step.parallel {
                return Ok(());
            }
            for child in self.children(step.id).await? {
                match child {
                    Child::Task(task) => replay_into(pipeline, &task),
                    Child::Step(sub) => self.replay_step(sub, pipeline).await?,
                }
            }
            Ok(())
        })
    }

    fn undo_descending<'a>(
        &'a self,
        step: StepRecord,
        only_failed: bool,
        report: &'a mut UndoReport,
        warnings: &'a mut BTreeMap<Uuid, Vec<String>>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut children = self.children(step.id).await?;
            children.reverse();
            for child in children {
                match child {
                    Child::Step(sub) => {
                        self.undo_descending(sub, only_failed, report, warnings)
                            .await?;
                    }
                    Child::Task(task) => {
                        if !should_undo(&task, only_failed) {
                            continue;
                        }
                        if let Err(message) = self.undo_task(&task).await? {
                            warnings
                                .entry(task.step_id)
                                .or_default()
                                .push(format!("undo of {} ({}) failed: {}", task.name, task.id, message));
                            report.failed.push(UndoFailure {
                                task_id: task.id,
                                message,
                            });
                        } else {
                            report.undone.push(task.id);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Runs one `undo`. The outer `Result` carries persistence failures, the
    /// inner one the task's own undo error, which never stops the cascade.
    async fn undo_task(&self, task: &TaskRecord) -> Result<std::result::Result<(), String>> {
        let delay = self.config.lock_retry_delay();
        with_lock_retry(delay, || {
            self.store.patch_task(task.id, TaskPatch::entering_undo())
        })
        .await?;

        let outcome = match self.registry.resolve(&task.name) {
            None => Err(EngineError::UnknownTask(task.name.clone())),
            Some(handler) => {
                let ctx = TaskContext::for_task(task, task.params.clone(), None);
                if task.eager {
                    handler
                        .undo(&ctx)
                        .await
                        .map(|_| Value::Null)
                        .map_err(|e| EngineError::task_execution(task.id, &e))
                } else {
                    let work = job(move |_execution_id| async move {
                        handler
                            .undo(&ctx)
                            .await
                            .map(|_| Value::Null)
                            .map_err(|e| EngineError::task_execution(ctx.task_id, &e))
                    });
                    self.dispatcher.submit(task.id, work).await
                }
            }
        };

        match outcome {
            Ok(_) => {
                with_lock_retry(delay, || {
                    self.store.patch_task(task.id, TaskPatch::revoked(Utc::now()))
                })
                .await?;
                info!(task_id = %task.id, task = %task.name, "Task undone");
                Ok(Ok(()))
            }
            Err(EngineError::TaskExecution {
                message, traceback, ..
            }) => {
                error!(task_id = %task.id, task = %task.name, %message, "Undo failed");
                with_lock_retry(delay, || {
                    self.store
                        .patch_task(task.id, TaskPatch::undo_failed(traceback.clone()))
                })
                .await?;
                Ok(Err(message))
            }
            Err(e @ EngineError::UnknownTask(_)) => {
                error!(task_id = %task.id, error = %e, "Undo impossible");
                with_lock_retry(delay, || {
                    self.store
                        .patch_task(task.id, TaskPatch::undo_failed(e.to_string()))
                })
                .await?;
                Ok(Err(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

fn should_undo(task: &TaskRecord, only_failed: bool) -> bool {
    if !task.was_invoked() || task.status == TaskStatus::Revoked {
        return false;
    }
    !only_failed || task.executed_attempt == Some(task.attempt)
}

fn replay_into(pipeline: &mut ResultPipeline, task: &TaskRecord) {
    if task.status == TaskStatus::Success {
        pipeline.record(task.id, task.result.clone().unwrap_or(Value::Null));
    }
}

fn ensure_idle(step_id: Uuid, subtree: &Subtree) -> Result<()> {
    if subtree.tasks.iter().any(|t| t.status == TaskStatus::Started) {
        return Err(EngineError::StepBusy(step_id));
    }
    Ok(())
}
