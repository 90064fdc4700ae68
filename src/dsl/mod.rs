pub mod builder;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::errors::{EngineError, Result};

/// 声明式工作流定义 (declarative workflow definition)
///
/// `root` is materialized into a Step/Task tree by
/// [`TreeBuilder`](crate::compiler::core::TreeBuilder) each time the workflow is run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: String,
    /// Values visible to `if` expressions at build time.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub root: DefinitionNode,
}

/// Build-time condition on a node: either a literal or an `evalexpr` expression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Condition {
    Literal(bool),
    Expr(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub enum DefinitionNode {
    Sequential(StepDef),
    Parallel(StepDef),
    Task(TaskDef),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepDef {
    pub name: String,
    pub condition: Option<Condition>,
    pub children: Vec<DefinitionNode>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskDef {
    /// Dotted identifier of the registered implementation.
    pub name: String,
    /// Label other leaves use in their `result_params`.
    pub label: Option<String>,
    pub args: Vec<Value>,
    pub params: Map<String, Value>,
    pub condition: Option<Condition>,
    pub allow_failure: bool,
    /// local param name -> label of the upstream task
    pub result_params: BTreeMap<String, String>,
    pub hidden: bool,
    pub eager: bool,
    pub wait_for_params: bool,
}

impl DefinitionNode {
    pub fn name(&self) -> &str {
        match self {
            DefinitionNode::Sequential(s) | DefinitionNode::Parallel(s) => &s.name,
            DefinitionNode::Task(t) => &t.name,
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            DefinitionNode::Sequential(s) | DefinitionNode::Parallel(s) => s.condition.as_ref(),
            DefinitionNode::Task(t) => t.condition.as_ref(),
        }
    }
}

/// Wire shape of a node, exactly as it appears in YAML/JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RawNode {
    #[serde(default, skip_serializing_if = "is_false")]
    pub step: bool,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<DefinitionNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_params: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eager: Option<bool>,
    #[serde(alias = "waitForParams", default, skip_serializing_if = "Option::is_none")]
    pub wait_for_params: Option<bool>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl TryFrom<RawNode> for DefinitionNode {
    type Error = EngineError;

    fn try_from(raw: RawNode) -> Result<Self> {
        if raw.name.trim().is_empty() {
            return Err(EngineError::Definition("node without a name".to_string()));
        }

        if raw.step {
            let leaf_only = [
                ("id", raw.id.is_some()),
                ("args", raw.args.is_some()),
                ("params", raw.params.is_some()),
                ("allow_failure", raw.allow_failure.is_some()),
                ("result_params", raw.result_params.is_some()),
                ("hidden", raw.hidden.is_some()),
                ("eager", raw.eager.is_some()),
                ("wait_for_params", raw.wait_for_params.is_some()),
            ];
            if let Some((key, _)) = leaf_only.iter().find(|(_, present)| *present) {
                return Err(EngineError::Definition(format!(
                    "step '{}' carries leaf-only key '{}'",
                    raw.name, key
                )));
            }

            let def = StepDef {
                name: raw.name,
                condition: raw.condition,
                children: raw.children.unwrap_or_default(),
            };
            return Ok(if raw.parallel.unwrap_or(false) {
                DefinitionNode::Parallel(def)
            } else {
                DefinitionNode::Sequential(def)
            });
        }

        if raw.children.is_some() || raw.parallel.is_some() {
            return Err(EngineError::Definition(format!(
                "task '{}' has step-only keys; set `step: true` to declare a step",
                raw.name
            )));
        }
        validate_task_name(&raw.name)?;

        let eager = raw.eager.unwrap_or(false);
        let wait_for_params = raw.wait_for_params.unwrap_or(false);
        if eager && wait_for_params {
            return Err(EngineError::Definition(format!(
                "task '{}' cannot be both eager and wait for params",
                raw.name
            )));
        }

        Ok(DefinitionNode::Task(TaskDef {
            name: raw.name,
            label: raw.id,
            args: raw.args.unwrap_or_default(),
            params: raw.params.unwrap_or_default(),
            condition: raw.condition,
            allow_failure: raw.allow_failure.unwrap_or(false),
            result_params: raw.result_params.unwrap_or_default(),
            hidden: raw.hidden.unwrap_or(false),
            eager,
            wait_for_params,
        }))
    }
}

impl From<DefinitionNode> for RawNode {
    fn from(node: DefinitionNode) -> Self {
        match node {
            DefinitionNode::Sequential(s) => step_to_raw(s, false),
            DefinitionNode::Parallel(s) => step_to_raw(s, true),
            DefinitionNode::Task(t) => RawNode {
                step: false,
                name: t.name,
                id: t.label,
                args: (!t.args.is_empty()).then_some(t.args),
                params: (!t.params.is_empty()).then_some(t.params),
                condition: t.condition,
                allow_failure: t.allow_failure.then_some(true),
                result_params: (!t.result_params.is_empty()).then_some(t.result_params),
                hidden: t.hidden.then_some(true),
                eager: t.eager.then_some(true),
                wait_for_params: t.wait_for_params.then_some(true),
                ..Default::default()
            },
        }
    }
}

fn step_to_raw(step: StepDef, parallel: bool) -> RawNode {
    RawNode {
        step: true,
        name: step.name,
        parallel: parallel.then_some(true),
        children: Some(step.children),
        condition: step.condition,
        ..Default::default()
    }
}

/// Task names are dotted identifiers, e.g. `ingest.ValidateChecksum`.
pub fn validate_task_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(EngineError::Definition(format!(
            "'{}' is not a dotted task identifier",
            name
        )))
    }
}
