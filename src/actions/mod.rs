use async_trait::async_trait;
use serde_json::{Map, Value};
use crate::runtime::context::TaskContext;
use anyhow::Result;
use std::fmt::Debug;

pub mod builtin;

/// 任务接口：所有具体任务必须实现此 Trait
///
/// A fresh instance is built by the registry for every invocation, so
/// implementations must not rely on state shared across invocations.
#[async_trait]
pub trait TaskHandler: Send + Sync + Debug {
    /// Checked once when the tree is materialized.
    fn validate(&self, _params: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    /// Invoked at most once per (task id, attempt).
    async fn run(&self, ctx: &TaskContext) -> Result<Value>;

    /// Best-effort compensation for a previous `run`.
    async fn undo(&self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    /// Audit event type recorded when `run` succeeds.
    fn event_type(&self) -> Option<&str> {
        None
    }

    fn event_args(&self, _params: &Map<String, Value>) -> Vec<Value> {
        Vec::new()
    }
}
