use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::actions::TaskHandler;
use crate::errors::{EngineError, Result};
use crate::runtime::audit::AuditEvent;
use crate::runtime::context::{ProgressReporter, TaskContext};
use crate::runtime::dispatch::job;
use crate::runtime::engine::Engine;
use crate::runtime::pipeline::ResultPipeline;
use crate::runtime::storage::{StateStore, with_lock_retry};
use crate::runtime::task::{TaskPatch, TaskRecord};

/// Terminal result of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskRun {
    Succeeded,
    Failed { tolerated: bool },
}

/// Everything a worker needs to move one row through STARTED and run it.
struct Invocation {
    store: Arc<dyn StateStore>,
    handler: Box<dyn TaskHandler>,
    task: TaskRecord,
    params: Map<String, Value>,
    reporter: Option<ProgressReporter>,
    retry_delay: std::time::Duration,
}

impl Invocation {
    /// Compare-and-set PENDING -> STARTED, then `run`.
    async fn execute(self, execution_id: Option<Uuid>) -> Result<Value> {
        let Invocation {
            store,
            handler,
            task,
            params,
            reporter,
            retry_delay,
        } = self;

        with_lock_retry(retry_delay, || {
            store.patch_task(
                task.id,
                TaskPatch::started(params.clone(), task.attempt, execution_id, Utc::now()),
            )
        })
        .await?;

        let ctx = TaskContext::for_task(&task, params, reporter);
        handler
            .run(&ctx)
            .await
            .map_err(|e| EngineError::task_execution(task.id, &e))
    }
}

impl Engine {
    /// Moves a PENDING row to a terminal state.
    ///
    /// Failures raised by the implementation are recorded and reported as
    /// `TaskRun::Failed`; anything else (persistence, at-most-once
    /// violations) aborts the run.
    pub(crate) async fn run_task(
        &self,
        task: &TaskRecord,
        pipeline: &mut ResultPipeline,
    ) -> Result<TaskRun> {
        let resolved = match pipeline.resolve(task.id, &task.result_params) {
            Ok(resolved) => resolved,
            Err(e @ EngineError::DependencyMissing { .. }) => {
                return self.reject(task, &e).await;
            }
            Err(e) => return Err(e),
        };

        let Some(handler) = self.registry.resolve(&task.name) else {
            let e = EngineError::UnknownTask(task.name.clone());
            return self.reject(task, &e).await;
        };

        let mut params = task.params.clone();
        params.extend(resolved);

        let event_type = if task.eager {
            None
        } else {
            handler.event_type().map(str::to_string)
        };
        if let Some(event_type) = &event_type {
            if task.information_package.is_none() {
                let e = EngineError::MissingPackage {
                    task_id: task.id,
                    event_type: event_type.clone(),
                };
                return self.reject(task, &e).await;
            }
        }
        let event_args = handler.event_args(&params);

        info!(task_id = %task.id, task = %task.name, attempt = task.attempt, eager = task.eager, "Starting task");
        let invocation = Invocation {
            store: self.store.clone(),
            handler,
            task: task.clone(),
            params,
            reporter: (!task.eager).then(|| self.progress_reporter()),
            retry_delay: self.config.lock_retry_delay(),
        };

        let outcome = if task.eager {
            invocation.execute(None).await
        } else {
            let work = job(move |execution_id| invocation.execute(Some(execution_id)));
            self.dispatcher.submit(task.id, work).await
        };

        match outcome {
            Ok(result) => {
                let written = self
                    .persist(task.id, TaskPatch::succeeded(result.clone(), Utc::now()))
                    .await;
                if let Err(e) = written {
                    self.abandon(task, &e).await;
                    return Err(e);
                }
                info!(task_id = %task.id, task = %task.name, "Task succeeded");
                pipeline.record(task.id, result);

                if let (Some(event_type), Some(package)) = (event_type, &task.information_package) {
                    self.emit_event(task, event_type, event_args, package).await;
                }
                Ok(TaskRun::Succeeded)
            }
            Err(EngineError::TaskExecution {
                message, traceback, ..
            }) => {
                let written = self
                    .persist(task.id, TaskPatch::failed(Some(traceback), Utc::now()))
                    .await;
                if let Err(e) = written {
                    self.abandon(task, &e).await;
                    return Err(e);
                }
                if task.allow_failure {
                    warn!(task_id = %task.id, task = %task.name, %message, "Task failed (failure allowed)");
                } else {
                    error!(task_id = %task.id, task = %task.name, %message, "Task failed");
                }
                Ok(TaskRun::Failed {
                    tolerated: task.allow_failure,
                })
            }
            Err(e @ EngineError::AlreadyStarted(_)) => Err(e),
            Err(e) => {
                self.abandon(task, &e).await;
                Err(e)
            }
        }
    }

    /// Marks a row FAILURE without ever invoking it. `allow_failure` does
    /// not apply, now or when the row is replayed.
    async fn reject(&self, task: &TaskRecord, reason: &EngineError) -> Result<TaskRun> {
        error!(task_id = %task.id, task = %task.name, error = %reason, "Task rejected before run");
        self.persist(task.id, TaskPatch::rejected(reason.traceback(), Utc::now()))
            .await?;
        Ok(TaskRun::Failed { tolerated: false })
    }

    /// Best-effort FAILURE for a row the run is about to give up on, so it
    /// is not left STARTED. No-op if the row never left PENDING.
    async fn abandon(&self, task: &TaskRecord, cause: &EngineError) {
        let patch = TaskPatch::abandoned(format!("run aborted: {}", cause.traceback()), Utc::now());
        match self.persist(task.id, patch).await {
            Ok(()) => warn!(task_id = %task.id, task = %task.name, error = %cause, "Task marked failed after aborted run"),
            Err(EngineError::AlreadyStarted(_)) => {}
            Err(e) => error!(task_id = %task.id, error = %e, "Task left STARTED, status write failed"),
        }
    }

    async fn persist(&self, task_id: Uuid, patch: TaskPatch) -> Result<()> {
        with_lock_retry(self.config.lock_retry_delay(), || {
            self.store.patch_task(task_id, patch.clone())
        })
        .await
    }

    async fn emit_event(
        &self,
        task: &TaskRecord,
        event_type: String,
        event_args: Vec<Value>,
        package: &str,
    ) {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            event_type,
            event_args,
            agent: self.config.agent.clone(),
            information_package: package.to_string(),
            task_id: task.id,
            created_at: Utc::now(),
        };
        if let Err(e) = self.audit.append(event).await {
            error!(task_id = %task.id, error = %e, "Failed to append audit event");
        }
    }
}
