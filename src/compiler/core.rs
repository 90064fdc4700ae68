use crate::dsl::{Condition, DefinitionNode, StepDef, TaskDef, Workflow};
use crate::errors::{EngineError, Result};
use crate::runtime::registry::TaskRegistry;
use crate::runtime::task::{StepRecord, TaskRecord};
use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, eval_boolean_with_context};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Rows produced from one definition, parents before children.
#[derive(Debug, Clone)]
pub struct MaterializedTree {
    pub root_id: Uuid,
    pub steps: Vec<StepRecord>,
    pub tasks: Vec<TaskRecord>,
}

/// Turns a [`Workflow`] into Step/Task rows.
///
/// Pass 1 evaluates every `if` and drops false branches, pass 2 assigns task
/// ids to labels, pass 3 emits rows depth-first with gapped positions.
pub struct TreeBuilder<'a> {
    registry: &'a TaskRegistry,
    position_gap: u32,
    variables: HashMap<String, Value>,
    information_package: Option<String>,
    labels: HashMap<String, Uuid>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(registry: &'a TaskRegistry, position_gap: u32) -> Self {
        Self {
            registry,
            position_gap: position_gap.max(1),
            variables: HashMap::new(),
            information_package: None,
            labels: HashMap::new(),
        }
    }

    /// Run-time variables; they shadow the definition's own `variables`.
    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_package(mut self, package: Option<String>) -> Self {
        self.information_package = package;
        self
    }

    pub fn build(mut self, workflow: &Workflow) -> Result<MaterializedTree> {
        let (root_def, parallel) = match &workflow.root {
            DefinitionNode::Sequential(s) => (s, false),
            DefinitionNode::Parallel(s) => (s, true),
            DefinitionNode::Task(t) => {
                return Err(EngineError::Definition(format!(
                    "root of '{}' must be a step, found task '{}'",
                    workflow.id, t.name
                )));
            }
        };
        if root_def.condition.is_some() {
            return Err(EngineError::Definition(format!(
                "root step of '{}' cannot be conditional",
                workflow.id
            )));
        }

        // 1. Pass 1: Prune
        let mut variables = workflow.variables.clone();
        variables.extend(self.variables.drain());
        let eval_ctx = eval_context(&variables);
        let root = prune_step(root_def, &eval_ctx)?;

        // 2. Pass 2: Labels
        self.collect_labels(&root.children)?;

        // 3. Pass 3: Rows
        let mut tree = MaterializedTree {
            root_id: Uuid::nil(),
            steps: Vec::new(),
            tasks: Vec::new(),
        };
        let root_id = self.build_step(&root, parallel, None, 0, &mut tree)?;
        tree.root_id = root_id;

        debug!(
            workflow = %workflow.id,
            steps = tree.steps.len(),
            tasks = tree.tasks.len(),
            "Materialized workflow tree"
        );
        Ok(tree)
    }

    fn collect_labels(&mut self, nodes: &[DefinitionNode]) -> Result<()> {
        for node in nodes {
            match node {
                DefinitionNode::Task(t) => {
                    if let Some(label) = &t.label {
                        // Fresh ids per materialization, even for UUID-shaped labels.
                        if self.labels.insert(label.clone(), Uuid::new_v4()).is_some() {
                            return Err(EngineError::Definition(format!(
                                "duplicate task id '{}'",
                                label
                            )));
                        }
                    }
                }
                DefinitionNode::Sequential(s) | DefinitionNode::Parallel(s) => {
                    self.collect_labels(&s.children)?;
                }
            }
        }
        Ok(())
    }

    fn build_step(
        &self,
        def: &StepDef,
        parallel: bool,
        parent: Option<Uuid>,
        position: u32,
        tree: &mut MaterializedTree,
    ) -> Result<Uuid> {
        let mut step = StepRecord::new(&def.name, parent, position, parallel);
        step.information_package = self.information_package.clone();
        let step_id = step.id;
        let step_index = tree.steps.len();
        tree.steps.push(step);

        for (i, child) in def.children.iter().enumerate() {
            let child_position = u32::try_from(i + 1)
                .ok()
                .and_then(|n| n.checked_mul(self.position_gap))
                .ok_or_else(|| {
                    EngineError::Definition(format!(
                        "step '{}' has too many children for position gap {}",
                        def.name, self.position_gap
                    ))
                })?;
            match child {
                DefinitionNode::Task(t) => {
                    let task = self.build_task(t, step_id, child_position)?;
                    if task.wait_for_params {
                        tree.steps[step_index].wait_for_params = true;
                    }
                    tree.tasks.push(task);
                }
                DefinitionNode::Sequential(s) => {
                    self.build_step(s, false, Some(step_id), child_position, tree)?;
                }
                DefinitionNode::Parallel(s) => {
                    self.build_step(s, true, Some(step_id), child_position, tree)?;
                }
            }
        }
        Ok(step_id)
    }

    fn build_task(&self, def: &TaskDef, step_id: Uuid, position: u32) -> Result<TaskRecord> {
        let handler = self
            .registry
            .resolve(&def.name)
            .ok_or_else(|| EngineError::UnknownTask(def.name.clone()))?;
        handler.validate(&def.params).map_err(|e| {
            EngineError::Definition(format!("params of task '{}' rejected: {}", def.name, e))
        })?;

        let mut task = TaskRecord::new(step_id, &def.name, position);
        if let Some(label) = &def.label {
            if let Some(id) = self.labels.get(label) {
                task.id = *id;
            }
        }

        for (local_name, upstream_label) in &def.result_params {
            let upstream = self.labels.get(upstream_label).copied().ok_or_else(|| {
                EngineError::Definition(format!(
                    "task '{}' takes '{}' from unknown task id '{}'",
                    def.name, local_name, upstream_label
                ))
            })?;
            if upstream == task.id {
                return Err(EngineError::Definition(format!(
                    "task '{}' cannot consume its own result",
                    def.name
                )));
            }
            task.result_params.insert(local_name.clone(), upstream);
        }

        task.args = def.args.clone();
        task.params = def.params.clone();
        task.allow_failure = def.allow_failure;
        task.hidden = def.hidden;
        task.eager = def.eager;
        task.wait_for_params = def.wait_for_params;
        task.information_package = self.information_package.clone();
        Ok(task)
    }
}

fn prune_step(def: &StepDef, eval_ctx: &HashMapContext<DefaultNumericTypes>) -> Result<StepDef> {
    let mut children = Vec::with_capacity(def.children.len());
    for child in &def.children {
        if let Some(condition) = child.condition() {
            if !evaluate_condition(condition, eval_ctx)? {
                debug!(node = child.name(), "Condition false, dropping branch");
                continue;
            }
        }
        children.push(match child {
            DefinitionNode::Task(_) => child.clone(),
            DefinitionNode::Sequential(s) => DefinitionNode::Sequential(prune_step(s, eval_ctx)?),
            DefinitionNode::Parallel(s) => DefinitionNode::Parallel(prune_step(s, eval_ctx)?),
        });
    }
    Ok(StepDef {
        name: def.name.clone(),
        condition: None,
        children,
    })
}

pub fn evaluate_condition(
    condition: &Condition,
    eval_ctx: &HashMapContext<DefaultNumericTypes>,
) -> Result<bool> {
    match condition {
        Condition::Literal(value) => Ok(*value),
        Condition::Expr(raw) => {
            let clean = strip_placeholders(raw);
            eval_boolean_with_context(&clean, eval_ctx).map_err(|e| {
                EngineError::Definition(format!("condition '{}' could not be evaluated: {}", raw, e))
            })
        }
    }
}

/// `${name}` -> `name`. Braces outside a placeholder are left alone.
fn strip_placeholders(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let inner = &rest[start + 2..];
        match inner.find('}') {
            Some(end) => {
                out.push_str(&inner[..end]);
                rest = &inner[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Builds an `evalexpr` context from JSON scalars. Arrays, objects and null
/// are not visible to expressions.
pub fn eval_context<'v>(
    vars: impl IntoIterator<Item = (&'v String, &'v Value)>,
) -> HashMapContext<DefaultNumericTypes> {
    let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (k, v) in vars {
        let ev = match v {
            Value::String(s) => Some(evalexpr::Value::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(evalexpr::Value::Int(i))
                } else {
                    n.as_f64().map(evalexpr::Value::Float)
                }
            }
            Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
            _ => None,
        };
        if let Some(ev) = ev {
            let _ = eval_ctx.set_value(k.clone(), ev);
        }
    }
    eval_ctx
}
