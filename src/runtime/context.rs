use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::errors::Result;
use crate::runtime::storage::{StateStore, with_lock_retry};
use crate::runtime::task::{TaskPatch, TaskRecord};

/// Intermediate, non-terminal progress published while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub progress: u8,
}

#[derive(Clone)]
pub(crate) struct ProgressReporter {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) events: broadcast::Sender<ProgressEvent>,
    pub(crate) retry_delay: Duration,
}

/// 任务上下文 (Task Context)
///
/// What a [`TaskHandler`](crate::actions::TaskHandler) sees of its row. Cheap to clone.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub name: String,
    pub attempt: u32,
    pub args: Vec<Value>,
    /// Declared params merged with resolved `result_params`.
    pub params: Map<String, Value>,
    pub information_package: Option<String>,
    reporter: Option<ProgressReporter>,
}

impl TaskContext {
    pub(crate) fn for_task(
        task: &TaskRecord,
        params: Map<String, Value>,
        reporter: Option<ProgressReporter>,
    ) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            attempt: task.attempt,
            args: task.args.clone(),
            params,
            information_package: task.information_package.clone(),
            reporter,
        }
    }

    /// Context for an eager call that has no backing row.
    pub fn detached(name: &str, params: Map<String, Value>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            name: name.to_string(),
            attempt: 0,
            args: Vec::new(),
            params,
            information_package: None,
            reporter: None,
        }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Persists `current/total*100` and publishes it. Status is untouched.
    /// A no-op for eager executions.
    pub async fn set_progress(&self, current: u64, total: u64) -> Result<()> {
        let Some(progress) = progress_percent(current, total) else {
            return Ok(());
        };
        let Some(reporter) = &self.reporter else {
            return Ok(());
        };

        with_lock_retry(reporter.retry_delay, || {
            reporter
                .store
                .patch_task(self.task_id, TaskPatch::progress(progress))
        })
        .await?;

        // No subscribers is fine.
        let _ = reporter.events.send(ProgressEvent {
            task_id: self.task_id,
            progress,
        });
        Ok(())
    }
}

/// Floor of `current/total*100`, clamped to 100. `None` when `total` is zero.
pub fn progress_percent(current: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let pct = (current.min(total) as u128 * 100) / total as u128;
    Some(pct as u8)
}
