use async_trait::async_trait;
use serde_json::{Map, Value, json};
use crate::actions::TaskHandler;
use crate::compiler::core::eval_context;
use crate::runtime::context::TaskContext;
use crate::runtime::registry::TaskRegistry;
use anyhow::{Result, anyhow, bail};
use evalexpr::eval_with_context;
use std::time::Duration;
use tracing::info;

pub const LOG: &str = "archflow.builtin.Log";
pub const EVAL: &str = "archflow.builtin.Eval";
pub const SLEEP: &str = "archflow.builtin.Sleep";

/// Registers the built-in implementations under their stable identifiers.
pub fn register_builtins(registry: &TaskRegistry) -> crate::errors::Result<()> {
    registry.register(LOG, || Box::new(LogTask))?;
    registry.register(EVAL, || Box::new(EvalTask))?;
    registry.register(SLEEP, || Box::new(SleepTask))?;
    Ok(())
}

/// Logs `msg` (or the whole params map) and returns it.
#[derive(Debug)]
pub struct LogTask;

#[async_trait]
impl TaskHandler for LogTask {
    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        if let Some(msg) = ctx.param("msg").and_then(|v| v.as_str()) {
            info!(task_id = %ctx.task_id, "[LOG] {}", msg);
            Ok(Value::String(msg.to_string()))
        } else {
            info!(task_id = %ctx.task_id, "[LOG] {:?}", ctx.params);
            Ok(Value::Object(ctx.params.clone()))
        }
    }
}

/// Evaluates `expression` with every scalar param in scope.
#[derive(Debug)]
pub struct EvalTask;

#[async_trait]
impl TaskHandler for EvalTask {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        match params.get("expression") {
            Some(Value::String(_)) => Ok(()),
            Some(other) => bail!("'expression' must be a string, got {}", other),
            None => bail!("missing 'expression'"),
        }
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        let expr = ctx
            .param("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing 'expression'"))?;

        let eval_ctx = eval_context(ctx.params.iter().filter(|(k, _)| k.as_str() != "expression"));
        let result = eval_with_context(expr, &eval_ctx)
            .map_err(|e| anyhow!("expression '{}' failed: {}", expr, e))?;

        match result {
            evalexpr::Value::String(s) => Ok(Value::String(s)),
            evalexpr::Value::Int(i) => Ok(json!(i)),
            evalexpr::Value::Float(f) => Ok(json!(f)),
            evalexpr::Value::Boolean(b) => Ok(Value::Bool(b)),
            evalexpr::Value::Empty => Ok(Value::Null),
            other => bail!("expression '{}' produced unsupported value {:?}", expr, other),
        }
    }
}

/// Sleeps `ms` milliseconds in `steps` slices, reporting progress after each.
#[derive(Debug)]
pub struct SleepTask;

#[async_trait]
impl TaskHandler for SleepTask {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        if let Some(ms) = params.get("ms") {
            if !ms.is_u64() {
                bail!("'ms' must be a non-negative integer");
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        let ms = ctx.param("ms").and_then(|v| v.as_u64()).unwrap_or(0);
        let steps = ctx.param("steps").and_then(|v| v.as_u64()).unwrap_or(1).max(1);
        let slice = Duration::from_millis(ms / steps);

        for done in 1..=steps {
            tokio::time::sleep(slice).await;
            ctx.set_progress(done, steps).await?;
        }
        Ok(json!(ms))
    }
}
