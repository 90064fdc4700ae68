#![allow(dead_code)]

use anyhow::{Result, bail};
use archflow::actions::TaskHandler;
use archflow::config::EngineConfig;
use archflow::runtime::audit::InMemoryAuditSink;
use archflow::runtime::context::TaskContext;
use archflow::runtime::dispatch::LocalDispatcher;
use archflow::runtime::storage::{InMemoryStateStore, StateStore};
use archflow::runtime::task::{TaskRecord, TaskStatus};
use archflow::Engine;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const FIRST: &str = "tests.First";
pub const SECOND: &str = "tests.Second";
pub const THIRD: &str = "tests.Third";
pub const FAIL: &str = "tests.Fail";
pub const ADD: &str = "tests.Add";
pub const ECHO: &str = "tests.Echo";
pub const BROKEN_UNDO: &str = "tests.BrokenUndo";
pub const AUDITED: &str = "tests.Audited";
pub const PROGRESS: &str = "tests.Progress";

/// Ordered log of every `run`/`undo` call, shared by all probes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }
}

#[derive(Debug)]
struct Probe {
    label: &'static str,
    journal: Journal,
    /// `run` fails while this is set.
    broken: Option<Arc<AtomicBool>>,
    undo_broken: bool,
}

#[async_trait]
impl TaskHandler for Probe {
    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        self.journal.push(format!("run:{}", self.label));
        if let Some(broken) = &self.broken {
            if broken.load(Ordering::SeqCst) {
                bail!("precondition for {} not met", self.label);
            }
        }
        Ok(json!({ "task": self.label, "foo": ctx.param("foo").cloned() }))
    }

    async fn undo(&self, _ctx: &TaskContext) -> Result<()> {
        self.journal.push(format!("undo:{}", self.label));
        if self.undo_broken {
            bail!("cannot undo {}", self.label);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Add;

#[async_trait]
impl TaskHandler for Add {
    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        let x = ctx.param("x").and_then(Value::as_i64).unwrap_or(0);
        let y = ctx.param("y").and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(x + y))
    }
}

/// Returns its merged params.
#[derive(Debug)]
struct Echo {
    journal: Journal,
}

#[async_trait]
impl TaskHandler for Echo {
    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        self.journal.push("run:Echo".to_string());
        Ok(Value::Object(ctx.params.clone()))
    }
}

#[derive(Debug)]
struct Audited;

#[async_trait]
impl TaskHandler for Audited {
    async fn run(&self, _ctx: &TaskContext) -> Result<Value> {
        Ok(json!("stored"))
    }

    fn event_type(&self) -> Option<&str> {
        Some("ingest.stored")
    }

    fn event_args(&self, params: &Map<String, Value>) -> Vec<Value> {
        params.get("object").cloned().into_iter().collect()
    }
}

/// Reports progress in quarters.
#[derive(Debug)]
struct Progress;

#[async_trait]
impl TaskHandler for Progress {
    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        for done in 1..=4 {
            ctx.set_progress(done, 4).await?;
        }
        Ok(Value::Null)
    }
}

pub struct Fixture {
    pub engine: Engine,
    pub journal: Journal,
    /// Makes `tests.Fail` fail while set. Starts out set.
    pub broken: Arc<AtomicBool>,
    pub audit: Arc<InMemoryAuditSink>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryStateStore::new()))
    }

    pub fn with_store(store: Arc<dyn StateStore>) -> Self {
        let config = EngineConfig {
            lock_retry_delay_ms: 5,
            ..Default::default()
        };
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = Engine::new_with_storage(
            store,
            Arc::new(LocalDispatcher::new(config.worker_concurrency)),
            audit.clone(),
            config,
        );
        let journal = Journal::default();
        let broken = Arc::new(AtomicBool::new(true));

        for (name, label) in [(FIRST, "First"), (SECOND, "Second"), (THIRD, "Third")] {
            let journal = journal.clone();
            engine
                .register_task(name, move || {
                    Box::new(Probe {
                        label,
                        journal: journal.clone(),
                        broken: None,
                        undo_broken: false,
                    })
                })
                .unwrap();
        }
        {
            let journal = journal.clone();
            let broken = broken.clone();
            engine
                .register_task(FAIL, move || {
                    Box::new(Probe {
                        label: "Fail",
                        journal: journal.clone(),
                        broken: Some(broken.clone()),
                        undo_broken: false,
                    })
                })
                .unwrap();
        }
        {
            let journal = journal.clone();
            engine
                .register_task(BROKEN_UNDO, move || {
                    Box::new(Probe {
                        label: "BrokenUndo",
                        journal: journal.clone(),
                        broken: None,
                        undo_broken: true,
                    })
                })
                .unwrap();
        }
        {
            let journal = journal.clone();
            engine
                .register_task(ECHO, move || Box::new(Echo { journal: journal.clone() }))
                .unwrap();
        }
        engine.register_task(ADD, || Box::new(Add)).unwrap();
        engine.register_task(AUDITED, || Box::new(Audited)).unwrap();
        engine.register_task(PROGRESS, || Box::new(Progress)).unwrap();

        Self {
            engine,
            journal,
            broken,
            audit,
        }
    }

    /// Tasks of a step in position order.
    pub async fn tasks(&self, step_id: Uuid) -> Vec<TaskRecord> {
        self.engine.store().step_tasks(step_id).await.unwrap()
    }

    pub async fn statuses(&self, step_id: Uuid) -> Vec<TaskStatus> {
        self.tasks(step_id).await.iter().map(|t| t.status).collect()
    }
}
