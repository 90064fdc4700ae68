//! Crate-wide error type.
//!
//! Task implementations return `anyhow::Result`; everything the engine itself
//! raises goes through [`EngineError`].

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Raised inside a task's `run` or `undo`. The traceback is the full
    /// anyhow chain and is persisted on the task row.
    #[error("task {task_id} failed: {message}")]
    TaskExecution {
        task_id: Uuid,
        message: String,
        traceback: String,
    },

    #[error("task {task_id} needs result of {upstream} for param '{local_name}', but it has not been produced")]
    DependencyMissing {
        task_id: Uuid,
        local_name: String,
        upstream: Uuid,
    },

    /// Lock contention on a single-row status write.
    #[error("transient persistence error: {0}")]
    TransientPersistence(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("undo of task {task_id} failed: {message}")]
    Undo { task_id: Uuid, message: String },

    #[error("invalid workflow definition: {0}")]
    Definition(String),

    #[error("task implementation not registered: {0}")]
    UnknownTask(String),

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Inserts never overwrite: rows are kept as the audit record of a run.
    #[error("{kind} row {id} already exists")]
    RowExists { kind: &'static str, id: Uuid },

    #[error("step {0} is not waiting for params")]
    NotWaiting(Uuid),

    #[error("step {0} has tasks in flight")]
    StepBusy(Uuid),

    #[error("task {task_id} declares event type '{event_type}' but no information package is bound")]
    MissingPackage { task_id: Uuid, event_type: String },

    #[error("task {0} is no longer pending")]
    AlreadyStarted(Uuid),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Wraps an error raised by a task implementation, keeping the whole
    /// cause chain as the traceback.
    pub fn task_execution(task_id: Uuid, err: &anyhow::Error) -> Self {
        EngineError::TaskExecution {
            task_id,
            message: err.to_string(),
            traceback: format!("{:?}", err),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientPersistence(_))
    }

    /// Text stored in a task row's `traceback` column.
    pub fn traceback(&self) -> String {
        match self {
            EngineError::TaskExecution { traceback, .. } => traceback.clone(),
            other => other.to_string(),
        }
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout()
            || err.is_connection_dropped()
            || matches!(
                err.kind(),
                redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
            )
        {
            EngineError::TransientPersistence(err.to_string())
        } else {
            EngineError::Persistence(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
