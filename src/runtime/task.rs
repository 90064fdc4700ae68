use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Revoked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an earlier attempt, kept when retry resets the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub status: TaskStatus,
    pub traceback: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 任务行 (one persisted Task row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub name: String,
    pub step_id: Uuid,
    pub position: u32,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// local param name -> id of the task whose result feeds it
    #[serde(default)]
    pub result_params: BTreeMap<String, Uuid>,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub execution_id: Option<Uuid>,
    #[serde(default)]
    pub executed_attempt: Option<u32>,
    #[serde(default)]
    pub undo_type: bool,
    /// Failed before `run` was ever entered (unresolvable input, unknown
    /// implementation, missing package). Never tolerated by `allow_failure`.
    #[serde(default)]
    pub rejected: bool,
    #[serde(default)]
    pub undo_traceback: Option<String>,
    #[serde(default)]
    pub information_package: Option<String>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub eager: bool,
    #[serde(default)]
    pub wait_for_params: bool,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(step_id: Uuid, name: &str, position: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            step_id,
            position,
            attempt: 0,
            args: Vec::new(),
            params: Map::new(),
            result_params: BTreeMap::new(),
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            traceback: None,
            execution_id: None,
            executed_attempt: None,
            undo_type: false,
            rejected: false,
            undo_traceback: None,
            information_package: None,
            allow_failure: false,
            hidden: false,
            eager: false,
            wait_for_params: false,
            history: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// True once `run` has actually been entered for this row.
    pub fn was_invoked(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(params) = &patch.params {
            self.params = params.clone();
        }
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(result) = &patch.result {
            self.result = result.clone();
        }
        if let Some(traceback) = &patch.traceback {
            self.traceback = traceback.clone();
        }
        if let Some(execution_id) = patch.execution_id {
            self.execution_id = execution_id;
        }
        if let Some(attempt) = patch.attempt {
            self.attempt = attempt;
        }
        if let Some(executed_attempt) = patch.executed_attempt {
            self.executed_attempt = executed_attempt;
        }
        if let Some(undo_type) = patch.undo_type {
            self.undo_type = undo_type;
        }
        if let Some(rejected) = patch.rejected {
            self.rejected = rejected;
        }
        if let Some(undo_traceback) = &patch.undo_traceback {
            self.undo_traceback = undo_traceback.clone();
        }
        if let Some(wait) = patch.wait_for_params {
            self.wait_for_params = wait;
        }
        if let Some(history) = &patch.history {
            self.history = history.clone();
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = started_at;
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = completed_at;
        }
    }
}

/// Single-row update. Absent fields are left untouched; `Some(None)` clears.
///
/// When `expect_status` is set the store applies the patch only if the row is
/// currently in that status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskPatch {
    #[serde(skip)]
    pub expect_status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Option<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Option<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_attempt: Option<Option<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub undo_type: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub undo_traceback: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_params: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<AttemptRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn started(
        params: Map<String, Value>,
        attempt: u32,
        execution_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            expect_status: Some(TaskStatus::Pending),
            status: Some(TaskStatus::Started),
            params: Some(params),
            execution_id: Some(execution_id),
            executed_attempt: Some(Some(attempt)),
            undo_type: Some(false),
            started_at: Some(Some(at)),
            ..Default::default()
        }
    }

    pub fn succeeded(result: Value, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Success),
            progress: Some(100),
            result: Some(Some(result)),
            traceback: Some(None),
            completed_at: Some(Some(at)),
            ..Default::default()
        }
    }

    pub fn failed(traceback: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Failure),
            traceback: Some(traceback),
            completed_at: Some(Some(at)),
            ..Default::default()
        }
    }

    /// FAILURE without invocation.
    pub fn rejected(traceback: String, at: DateTime<Utc>) -> Self {
        Self {
            rejected: Some(true),
            ..Self::failed(Some(traceback), at)
        }
    }

    /// FAILURE for a row whose terminal write was lost. Applies only while
    /// the row is still STARTED.
    pub fn abandoned(traceback: String, at: DateTime<Utc>) -> Self {
        Self {
            expect_status: Some(TaskStatus::Started),
            ..Self::failed(Some(traceback), at)
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    /// Puts a row back to PENDING for a new attempt, keeping its past in `history`.
    pub fn reset(attempt: u32, history: Vec<AttemptRecord>) -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            attempt: Some(attempt),
            progress: Some(0),
            result: Some(None),
            traceback: Some(None),
            execution_id: Some(None),
            undo_type: Some(false),
            rejected: Some(false),
            undo_traceback: Some(None),
            history: Some(history),
            started_at: Some(None),
            completed_at: Some(None),
            ..Default::default()
        }
    }

    pub fn reattempt(attempt: u32) -> Self {
        Self {
            attempt: Some(attempt),
            ..Default::default()
        }
    }

    pub fn entering_undo() -> Self {
        Self {
            undo_type: Some(true),
            ..Default::default()
        }
    }

    pub fn revoked(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Revoked),
            undo_traceback: Some(None),
            completed_at: Some(Some(at)),
            ..Default::default()
        }
    }

    pub fn undo_failed(traceback: String) -> Self {
        Self {
            undo_traceback: Some(Some(traceback)),
            ..Default::default()
        }
    }

    pub fn continued(params: Map<String, Value>) -> Self {
        Self {
            expect_status: Some(TaskStatus::Pending),
            params: Some(params),
            wait_for_params: Some(false),
            ..Default::default()
        }
    }
}

/// 步骤行 (one persisted Step row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub parent_step: Option<Uuid>,
    #[serde(default)]
    pub position: u32,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub wait_for_params: bool,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub information_package: Option<String>,
    #[serde(default)]
    pub cleanup_warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(name: &str, parent_step: Option<Uuid>, position: u32, parallel: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            parent_step,
            position,
            parallel,
            wait_for_params: false,
            attempt: 0,
            information_package: None,
            cleanup_warnings: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn apply(&mut self, patch: &StepPatch) {
        if let Some(attempt) = patch.attempt {
            self.attempt = attempt;
        }
        if let Some(wait) = patch.wait_for_params {
            self.wait_for_params = wait;
        }
        if let Some(warnings) = &patch.cleanup_warnings {
            self.cleanup_warnings = warnings.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_params: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_warnings: Option<Vec<String>>,
}

/// A step's child, tasks and sub-steps share one position space.
#[derive(Debug, Clone)]
pub enum Child {
    Task(TaskRecord),
    Step(StepRecord),
}

impl Child {
    pub fn position(&self) -> u32 {
        match self {
            Child::Task(t) => t.position,
            Child::Step(s) => s.position,
        }
    }
}
