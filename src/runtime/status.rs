use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::Result;
use crate::runtime::engine::Engine;
use crate::runtime::scheduler::BoxFuture;
use crate::runtime::task::{Child, StepRecord, TaskRecord, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub result: Option<Value>,
    pub traceback: Option<String>,
}

impl From<&TaskRecord> for TaskView {
    fn from(task: &TaskRecord) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            status: task.status,
            progress: task.progress,
            result: task.result.clone(),
            traceback: task.traceback.clone(),
        }
    }
}

/// Derived state of a step. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub id: Uuid,
    pub name: String,
    pub state: TaskStatus,
    pub progress: f64,
    pub attempt: u32,
    pub wait_for_params: bool,
    pub cleanup_warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageView {
    pub package: String,
    pub state: TaskStatus,
    pub progress: f64,
    pub steps: Vec<StepView>,
}

/// A parent package summarized from its generations (child packages).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationsView {
    pub state: TaskStatus,
    pub progress: f64,
    pub generations: Vec<PackageView>,
}

/// FAILURE > STARTED > SUCCESS > PENDING.
///
/// REVOKED counts as PENDING. A mix of finished and unstarted children is
/// reported as STARTED. No children at all is SUCCESS.
pub fn aggregate_state<I>(states: I) -> TaskStatus
where
    I: IntoIterator<Item = TaskStatus>,
{
    let (mut started, mut success, mut pending) = (false, false, false);
    for state in states {
        match state {
            TaskStatus::Failure => return TaskStatus::Failure,
            TaskStatus::Started => started = true,
            TaskStatus::Success => success = true,
            TaskStatus::Pending | TaskStatus::Revoked => pending = true,
        }
    }
    if started || (success && pending) {
        TaskStatus::Started
    } else if pending {
        TaskStatus::Pending
    } else {
        TaskStatus::Success
    }
}

/// Mean of children's progress; an empty step is complete.
pub fn aggregate_progress(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 100.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

impl Engine {
    pub async fn task_status(&self, task_id: Uuid) -> Result<Option<TaskView>> {
        Ok(self.store.get_task(task_id).await?.as_ref().map(TaskView::from))
    }

    pub async fn step_status(&self, step_id: Uuid) -> Result<Option<StepView>> {
        match self.store.get_step(step_id).await? {
            Some(step) => Ok(Some(self.step_view(step).await?)),
            None => Ok(None),
        }
    }

    pub async fn package_status(&self, package: &str) -> Result<PackageView> {
        let mut steps = Vec::new();
        for step in self.store.package_steps(package).await? {
            steps.push(self.step_view(step).await?);
        }
        let progress: Vec<f64> = steps.iter().map(|s| s.progress).collect();
        Ok(PackageView {
            package: package.to_string(),
            state: aggregate_state(steps.iter().map(|s| s.state)),
            progress: aggregate_progress(&progress),
            steps,
        })
    }

    pub async fn package_generations_status(&self, packages: &[&str]) -> Result<GenerationsView> {
        let mut generations = Vec::with_capacity(packages.len());
        for package in packages {
            generations.push(self.package_status(package).await?);
        }
        let progress: Vec<f64> = generations.iter().map(|g| g.progress).collect();
        Ok(GenerationsView {
            state: aggregate_state(generations.iter().map(|g| g.state)),
            progress: aggregate_progress(&progress),
            generations,
        })
    }

    fn step_view(&self, step: StepRecord) -> BoxFuture<'_, Result<StepView>> {
        Box::pin(async move {
            let mut states = Vec::new();
            let mut progress = Vec::new();
            for child in self.children(step.id).await? {
                match child {
                    Child::Task(task) if task.hidden => {}
                    Child::Task(task) => {
                        states.push(task.status);
                        progress.push(f64::from(task.progress));
                    }
                    Child::Step(sub) => {
                        let view = self.step_view(sub).await?;
                        states.push(view.state);
                        progress.push(view.progress);
                    }
                }
            }
            Ok(StepView {
                id: step.id,
                name: step.name,
                state: aggregate_state(states),
                progress: aggregate_progress(&progress),
                attempt: step.attempt,
                wait_for_params: step.wait_for_params,
                cleanup_warnings: step.cleanup_warnings,
            })
        })
    }
}
