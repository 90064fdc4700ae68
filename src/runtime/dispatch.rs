use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error};
use uuid::Uuid;

use crate::errors::{EngineError, Result};

/// Work handed to the dispatch substrate. It receives the execution handle
/// the substrate assigned to it.
pub type Job = Box<dyn FnOnce(Uuid) -> JobFuture + Send>;
pub type JobFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Boxes an async closure into a [`Job`].
pub fn job<F, Fut>(f: F) -> Job
where
    F: FnOnce(Uuid) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Box::new(move |execution_id| -> JobFuture { Box::pin(f(execution_id)) })
}

/// Dispatch substrate boundary.
///
/// `submit` resolves once the job has finished on some worker. The substrate
/// must deliver each job at most once.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn submit(&self, task_id: Uuid, job: Job) -> Result<Value>;
}

/// Runs jobs on the tokio runtime, at most `concurrency` at a time.
pub struct LocalDispatcher {
    permits: Arc<Semaphore>,
}

impl LocalDispatcher {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn submit(&self, task_id: Uuid, job: Job) -> Result<Value> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Dispatch(e.to_string()))?;

        let execution_id = Uuid::new_v4();
        debug!(%task_id, %execution_id, "Dispatching task");

        let handle = tokio::spawn(async move {
            let _permit = permit;
            job(execution_id).await
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(%task_id, %execution_id, error = %join_err, "Worker died while running task");
                Err(EngineError::TaskExecution {
                    task_id,
                    message: "worker terminated before the task finished".to_string(),
                    traceback: join_err.to_string(),
                })
            }
        }
    }
}
