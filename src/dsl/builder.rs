use crate::dsl::{Condition, DefinitionNode, StepDef, TaskDef, Workflow};
use serde_json::Value;
use std::collections::HashMap;

/// Anything a [`TaskBuilder`] can hand its finished leaf back to.
pub trait ChildSink {
    fn push_child(&mut self, node: DefinitionNode);
}

pub struct WorkflowBuilder {
    id: String,
    variables: HashMap<String, Value>,
    root: StepBuilder,
}

impl WorkflowBuilder {
    /// Root is a sequential step named after the workflow id.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            variables: HashMap::new(),
            root: StepBuilder::sequential(id),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.root.name = name.to_string();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.root.parallel = true;
        self
    }

    pub fn var(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    pub fn task(self, name: &str) -> TaskBuilder<Self> {
        TaskBuilder::new(self, name)
    }

    pub fn step(mut self, step: StepBuilder) -> Self {
        self.root.children.push(step.build_node());
        self
    }

    pub fn build(self) -> Workflow {
        Workflow {
            id: self.id,
            variables: self.variables,
            root: self.root.build_node(),
        }
    }
}

impl ChildSink for WorkflowBuilder {
    fn push_child(&mut self, node: DefinitionNode) {
        self.root.children.push(node);
    }
}

pub struct StepBuilder {
    name: String,
    parallel: bool,
    condition: Option<Condition>,
    children: Vec<DefinitionNode>,
}

impl StepBuilder {
    pub fn sequential(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parallel: false,
            condition: None,
            children: Vec::new(),
        }
    }

    pub fn parallel(name: &str) -> Self {
        Self {
            parallel: true,
            ..Self::sequential(name)
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn task(self, name: &str) -> TaskBuilder<Self> {
        TaskBuilder::new(self, name)
    }

    pub fn step(mut self, step: StepBuilder) -> Self {
        self.children.push(step.build_node());
        self
    }

    pub fn build_node(self) -> DefinitionNode {
        let def = StepDef {
            name: self.name,
            condition: self.condition,
            children: self.children,
        };
        if self.parallel {
            DefinitionNode::Parallel(def)
        } else {
            DefinitionNode::Sequential(def)
        }
    }
}

impl ChildSink for StepBuilder {
    fn push_child(&mut self, node: DefinitionNode) {
        self.children.push(node);
    }
}

pub struct TaskBuilder<P> {
    parent: P,
    def: TaskDef,
}

impl<P: ChildSink> TaskBuilder<P> {
    fn new(parent: P, name: &str) -> Self {
        Self {
            parent,
            def: TaskDef {
                name: name.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.def.label = Some(label.to_string());
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.def.args.push(value.into());
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.def.params.insert(key.to_string(), value.into());
        self
    }

    /// Feeds the result of the task labelled `upstream` into param `local_name`.
    pub fn result_param(mut self, local_name: &str, upstream: &str) -> Self {
        self.def
            .result_params
            .insert(local_name.to_string(), upstream.to_string());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.def.condition = Some(condition);
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.def.allow_failure = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.def.hidden = true;
        self
    }

    pub fn eager(mut self) -> Self {
        self.def.eager = true;
        self
    }

    pub fn wait_for_params(mut self) -> Self {
        self.def.wait_for_params = true;
        self
    }

    pub fn build(mut self) -> P {
        self.parent.push_child(DefinitionNode::Task(self.def));
        self.parent
    }
}
