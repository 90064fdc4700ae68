use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::runtime::engine::{Engine, StepOutcome};
use crate::runtime::pipeline::ResultPipeline;
use crate::runtime::runner::TaskRun;
use crate::runtime::storage::with_lock_retry;
use crate::runtime::task::{Child, StepRecord, TaskStatus};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What one child of a step ended with, as seen by its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildOutcome {
    Success,
    Failure { tolerated: bool },
    Suspended,
}

impl Engine {
    /// Tasks and sub-steps of `step_id` in one list, ordered by position.
    pub(crate) async fn children(&self, step_id: Uuid) -> Result<Vec<Child>> {
        let mut children: Vec<Child> = self
            .store
            .step_tasks(step_id)
            .await?
            .into_iter()
            .map(Child::Task)
            .collect();
        children.extend(
            self.store
                .child_steps(step_id)
                .await?
                .into_iter()
                .map(Child::Step),
        );
        children.sort_by_key(Child::position);
        Ok(children)
    }

    /// Runs (or resumes) one step. Terminal rows are never re-invoked:
    /// SUCCESS replays its stored result, FAILURE short-circuits.
    pub(crate) fn execute_step<'a>(
        &'a self,
        step: StepRecord,
        pipeline: &'a mut ResultPipeline,
    ) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            debug!(step_id = %step.id, step = %step.name, parallel = step.parallel, "Entering step");
            if step.parallel {
                self.execute_parallel(step, pipeline).await
            } else {
                self.execute_sequential(step, pipeline).await
            }
        })
    }

    async fn execute_sequential(
        &self,
        step: StepRecord,
        pipeline: &mut ResultPipeline,
    ) -> Result<StepOutcome> {
        for child in self.children(step.id).await? {
            let position = child.position();
            match self.execute_child(child, pipeline).await? {
                ChildOutcome::Success => {}
                ChildOutcome::Failure { tolerated: true } => {
                    warn!(step_id = %step.id, position, "Child failed but allows failure, continuing");
                }
                ChildOutcome::Failure { tolerated: false } => {
                    let cascaded = self.cascade_failure(&step, position).await?;
                    info!(step_id = %step.id, position, cascaded, "Step aborted after failure");
                    return Ok(StepOutcome::Failure);
                }
                ChildOutcome::Suspended => {
                    info!(step_id = %step.id, position, "Step suspended, waiting for params");
                    return Ok(StepOutcome::Suspended);
                }
            }
        }
        Ok(StepOutcome::Success)
    }

    /// Every child gets its own fork of `pipeline`; nothing is merged back.
    async fn execute_parallel(
        &self,
        step: StepRecord,
        pipeline: &mut ResultPipeline,
    ) -> Result<StepOutcome> {
        let mut branches = JoinSet::new();
        for child in self.children(step.id).await? {
            let engine = self.clone();
            let mut branch_pipeline = pipeline.fork();
            branches.spawn(async move { engine.execute_child(child, &mut branch_pipeline).await });
        }

        let mut failed = false;
        let mut suspended = false;
        let mut first_error = None;
        // Drain every branch even after an error; dispatched work is never cancelled.
        while let Some(joined) = branches.join_next().await {
            match joined {
                Ok(Ok(ChildOutcome::Success)) => {}
                Ok(Ok(ChildOutcome::Failure { tolerated })) => failed |= !tolerated,
                Ok(Ok(ChildOutcome::Suspended)) => suspended = true,
                Ok(Err(e)) => {
                    error!(step_id = %step.id, error = %e, "Parallel branch aborted");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    error!(step_id = %step.id, error = %join_err, "Parallel branch panicked");
                    if first_error.is_none() {
                        first_error = Some(EngineError::Dispatch(join_err.to_string()));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(if suspended {
            StepOutcome::Suspended
        } else if failed {
            StepOutcome::Failure
        } else {
            StepOutcome::Success
        })
    }

    pub(crate) async fn execute_child(
        &self,
        child: Child,
        pipeline: &mut ResultPipeline,
    ) -> Result<ChildOutcome> {
        let task = match child {
            Child::Step(sub) => {
                return Ok(match self.execute_step(sub, pipeline).await? {
                    StepOutcome::Success => ChildOutcome::Success,
                    StepOutcome::Failure => ChildOutcome::Failure { tolerated: false },
                    StepOutcome::Suspended => ChildOutcome::Suspended,
                });
            }
            Child::Task(task) => task,
        };

        match task.status {
            TaskStatus::Success => {
                debug!(task_id = %task.id, task = %task.name, "Replaying stored result");
                pipeline.record(task.id, task.result.clone().unwrap_or(Value::Null));
                Ok(ChildOutcome::Success)
            }
            TaskStatus::Failure | TaskStatus::Revoked => Ok(ChildOutcome::Failure {
                tolerated: task.allow_failure && !task.rejected,
            }),
            TaskStatus::Pending if task.wait_for_params => {
                debug!(task_id = %task.id, task = %task.name, "Task waits for params");
                Ok(ChildOutcome::Suspended)
            }
            TaskStatus::Pending => Ok(match self.run_task(&task, pipeline).await? {
                TaskRun::Succeeded => ChildOutcome::Success,
                TaskRun::Failed { tolerated } => ChildOutcome::Failure { tolerated },
            }),
            TaskStatus::Started => Err(EngineError::AlreadyStarted(task.id)),
        }
    }

    /// Fails every PENDING sibling after `position`, including everything
    /// inside later sub-steps. Cascaded rows get no traceback.
    async fn cascade_failure(&self, step: &StepRecord, position: u32) -> Result<usize> {
        let delay = self.config.lock_retry_delay();
        let mut changed = with_lock_retry(delay, || {
            self.store
                .fail_pending_after(step.id, step.attempt, Some(position), Utc::now())
        })
        .await?;

        for sub in self.store.child_steps(step.id).await? {
            if sub.position > position {
                changed += self.fail_subtree(sub).await?;
            }
        }
        Ok(changed)
    }

    fn fail_subtree(&self, step: StepRecord) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let delay = self.config.lock_retry_delay();
            let mut changed = with_lock_retry(delay, || {
                self.store
                    .fail_pending_after(step.id, step.attempt, None, Utc::now())
            })
            .await?;
            for sub in self.store.child_steps(step.id).await? {
                changed += self.fail_subtree(sub).await?;
            }
            Ok(changed)
        })
    }
}
