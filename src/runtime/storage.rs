use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::try_result::TryResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::runtime::task::{StepPatch, StepRecord, TaskPatch, TaskRecord, TaskStatus};

// --- Interfaces ---

/// Persistence boundary for Step/Task rows.
///
/// Every write touches exactly one row and is atomic for that row. Brief lock
/// contention is reported as [`EngineError::TransientPersistence`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn insert_step(&self, step: StepRecord) -> Result<()>;
    async fn insert_task(&self, task: TaskRecord) -> Result<()>;

    async fn get_step(&self, id: Uuid) -> Result<Option<StepRecord>>;
    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>>;

    /// Tasks directly owned by `step_id`, ordered by position.
    async fn step_tasks(&self, step_id: Uuid) -> Result<Vec<TaskRecord>>;
    /// Sub-steps whose parent is `step_id`, ordered by position.
    async fn child_steps(&self, step_id: Uuid) -> Result<Vec<StepRecord>>;
    /// Root steps bound to an information package.
    async fn package_steps(&self, package: &str) -> Result<Vec<StepRecord>>;

    /// Applies `patch` to one task row. Fails with `AlreadyStarted` when the
    /// patch carries an `expect_status` the row no longer has.
    async fn patch_task(&self, id: Uuid, patch: TaskPatch) -> Result<()>;
    async fn patch_step(&self, id: Uuid, patch: StepPatch) -> Result<()>;

    /// Marks every PENDING task of `step_id` in `attempt` whose position is
    /// greater than `after` (all of them when `None`) as FAILURE, without a
    /// traceback. Returns how many rows changed.
    async fn fail_pending_after(
        &self,
        step_id: Uuid,
        attempt: u32,
        after: Option<u32>,
        at: DateTime<Utc>,
    ) -> Result<usize>;
}

/// Runs a status write, retrying exactly once after `delay` if it hit lock
/// contention. A second contention is escalated as a fatal persistence error.
pub async fn with_lock_retry<T, F, Fut>(delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!(reason = %e, delay_ms = delay.as_millis() as u64, "Status write contended, retrying once");
            tokio::time::sleep(delay).await;
            op().await.map_err(|e| {
                if e.is_transient() {
                    EngineError::Persistence(format!("lock contention persisted after retry: {}", e))
                } else {
                    e
                }
            })
        }
        other => other,
    }
}

// --- In-Memory Implementation ---

#[derive(Default)]
pub struct InMemoryStateStore {
    tasks: DashMap<Uuid, TaskRecord>,
    steps: DashMap<Uuid, StepRecord>,
    // Map<StepID, TaskIDs>
    step_tasks: DashMap<Uuid, Vec<Uuid>>,
    // Map<StepID, ChildStepIDs>
    child_steps: DashMap<Uuid, Vec<Uuid>>,
    // Map<Package, RootStepIDs>
    package_roots: DashMap<String, Vec<Uuid>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn contended(kind: &str, id: Uuid) -> EngineError {
        EngineError::TransientPersistence(format!("{} row {} is locked", kind, id))
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn insert_step(&self, step: StepRecord) -> Result<()> {
        let id = step.id;
        let parent_step = step.parent_step;
        let package = step.information_package.clone();
        match self.steps.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::RowExists { kind: "step", id }),
            Entry::Vacant(slot) => {
                slot.insert(step);
            }
        }
        match parent_step {
            Some(parent) => self.child_steps.entry(parent).or_default().push(id),
            None => {
                if let Some(package) = package {
                    self.package_roots.entry(package).or_default().push(id);
                }
            }
        }
        Ok(())
    }

    async fn insert_task(&self, task: TaskRecord) -> Result<()> {
        let id = task.id;
        let step_id = task.step_id;
        match self.tasks.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::RowExists { kind: "task", id }),
            Entry::Vacant(slot) => {
                slot.insert(task);
            }
        }
        self.step_tasks.entry(step_id).or_default().push(id);
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepRecord>> {
        Ok(self.steps.get(&id).map(|s| s.value().clone()))
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.get(&id).map(|t| t.value().clone()))
    }

    async fn step_tasks(&self, step_id: Uuid) -> Result<Vec<TaskRecord>> {
        // Clone the id list first so no index shard stays locked while rows are read.
        let ids = self
            .step_tasks
            .get(&step_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let mut tasks: Vec<TaskRecord> = ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|t| t.value().clone()))
            .collect();
        tasks.sort_by_key(|t| t.position);
        Ok(tasks)
    }

    async fn child_steps(&self, step_id: Uuid) -> Result<Vec<StepRecord>> {
        let ids = self
            .child_steps
            .get(&step_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let mut steps: Vec<StepRecord> = ids
            .iter()
            .filter_map(|id| self.steps.get(id).map(|s| s.value().clone()))
            .collect();
        steps.sort_by_key(|s| s.position);
        Ok(steps)
    }

    async fn package_steps(&self, package: &str) -> Result<Vec<StepRecord>> {
        let ids = self
            .package_roots
            .get(package)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.steps.get(id).map(|s| s.value().clone()))
            .collect())
    }

    async fn patch_task(&self, id: Uuid, patch: TaskPatch) -> Result<()> {
        match self.tasks.try_get_mut(&id) {
            TryResult::Present(mut row) => {
                if let Some(expected) = patch.expect_status {
                    if row.status != expected {
                        return Err(EngineError::AlreadyStarted(id));
                    }
                }
                row.apply(&patch);
                Ok(())
            }
            TryResult::Absent => Err(EngineError::TaskNotFound(id)),
            TryResult::Locked => Err(Self::contended("task", id)),
        }
    }

    async fn patch_step(&self, id: Uuid, patch: StepPatch) -> Result<()> {
        match self.steps.try_get_mut(&id) {
            TryResult::Present(mut row) => {
                row.apply(&patch);
                Ok(())
            }
            TryResult::Absent => Err(EngineError::StepNotFound(id)),
            TryResult::Locked => Err(Self::contended("step", id)),
        }
    }

    async fn fail_pending_after(
        &self,
        step_id: Uuid,
        attempt: u32,
        after: Option<u32>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let ids = self
            .step_tasks
            .get(&step_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let patch = TaskPatch::failed(None, at);

        let mut changed = 0;
        for id in ids {
            match self.tasks.try_get_mut(&id) {
                TryResult::Present(mut row) => {
                    let in_range = after.is_none_or(|p| row.position > p);
                    if in_range && row.attempt == attempt && row.status == TaskStatus::Pending {
                        row.apply(&patch);
                        changed += 1;
                    }
                }
                TryResult::Absent => {}
                TryResult::Locked => return Err(Self::contended("task", id)),
            }
        }
        Ok(changed)
    }
}
