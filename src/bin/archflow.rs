use anyhow::{Context, Result, anyhow, bail};
use archflow::actions::builtin::register_builtins;
use archflow::compiler::loader::{load_config_from_yaml, load_workflow_from_yaml};
use archflow::config::EngineConfig;
use archflow::logging::init_logging;
use archflow::runtime::audit::{AuditSink, HttpAuditSink, InMemoryAuditSink};
use archflow::runtime::coordinator::RetryOutcome;
use archflow::runtime::dispatch::LocalDispatcher;
use archflow::runtime::redis_storage::RedisStateStore;
use archflow::runtime::storage::{InMemoryStateStore, StateStore};
use archflow::{Engine, RunOptions};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about = "Hierarchical task/step orchestration for archival workflows", long_about = None)]
struct Cli {
    /// Engine config file (YAML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize a workflow file and run it to completion or suspension
    Run {
        /// Path to the workflow YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Information package the run is bound to
        #[arg(long, short)]
        package: Option<String>,

        /// Run-time variables for `if` conditions (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,
    },

    /// Parse a workflow file and check it against the registered tasks
    Validate {
        #[arg(long, short)]
        file: PathBuf,
    },

    /// Print the derived state of a step or package as JSON
    Status {
        #[arg(long, conflicts_with = "package")]
        step: Option<Uuid>,

        #[arg(long)]
        package: Option<String>,
    },

    /// Retry a failed step in a new attempt
    Retry { step: Uuid },

    /// Undo a step in descending position order
    Undo {
        step: Uuid,

        /// Only undo tasks executed in the current attempt
        #[arg(long)]
        only_failed: bool,
    },

    /// Supply params to a waiting task and resume its workflow
    Continue {
        step: Uuid,

        /// Field updates (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        fields: Vec<(String, Value)>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

fn build_engine(config: EngineConfig, durable: bool) -> Result<Engine> {
    let store: Arc<dyn StateStore> = match &config.redis_url {
        Some(url) => {
            info!(%url, "Using Redis state store");
            Arc::new(RedisStateStore::open(url)?)
        }
        None if durable => bail!(
            "this command needs persisted state: set redis_url in the config or {}",
            archflow::config::REDIS_URL_ENV
        ),
        None => {
            warn!("No redis_url configured, state lives in memory for this process only");
            Arc::new(InMemoryStateStore::new())
        }
    };
    let audit: Arc<dyn AuditSink> = match &config.audit_url {
        Some(url) => Arc::new(HttpAuditSink::new(url)),
        None => Arc::new(InMemoryAuditSink::new()),
    };
    let dispatcher = Arc::new(LocalDispatcher::new(config.worker_concurrency));

    let engine = Engine::new_with_storage(store, dispatcher, audit, config);
    register_builtins(engine.registry())?;
    Ok(engine)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    let config = match &cli.config {
        Some(path) => load_config_from_yaml(path)?,
        None => EngineConfig::default().with_env_overrides(),
    };

    match cli.command {
        Commands::Run { file, package, vars } => {
            let engine = build_engine(config, false)?;
            let workflow = load_workflow_from_yaml(&file)?;
            let workflow_id = workflow.id.clone();
            engine.register_definition(workflow);

            let options = RunOptions {
                information_package: package,
                variables: vars.into_iter().collect(),
            };
            let run = engine.run_step_with(&workflow_id, options).await?;
            info!(step_id = %run.step_id, outcome = ?run.outcome, "Run finished");
            if let Some(view) = engine.step_status(run.step_id).await? {
                print_json(&view)?;
            }
        }
        Commands::Validate { file } => {
            let engine = build_engine(config, false)?;
            let workflow = load_workflow_from_yaml(&file)?;
            let workflow_id = workflow.id.clone();
            engine.register_definition(workflow);
            let tree = engine
                .plan(&workflow_id, &RunOptions::default())
                .with_context(|| format!("Workflow {} is invalid", workflow_id))?;
            println!(
                "{}: ok ({} steps, {} tasks)",
                workflow_id,
                tree.steps.len(),
                tree.tasks.len()
            );
        }
        Commands::Status { step, package } => {
            let engine = build_engine(config, true)?;
            match (step, package) {
                (Some(step_id), _) => {
                    let view = engine
                        .step_status(step_id)
                        .await?
                        .ok_or_else(|| anyhow!("step {} not found", step_id))?;
                    print_json(&view)?;
                }
                (None, Some(package)) => print_json(&engine.package_status(&package).await?)?,
                (None, None) => bail!("pass --step or --package"),
            }
        }
        Commands::Retry { step } => {
            let engine = build_engine(config, true)?;
            match engine.retry_step(step).await? {
                RetryOutcome::NothingToRetry => println!("{}: nothing to retry", step),
                RetryOutcome::Ran { attempt, outcome } => {
                    println!("{}: attempt {} finished with {:?}", step, attempt, outcome)
                }
            }
        }
        Commands::Undo { step, only_failed } => {
            let engine = build_engine(config, true)?;
            let report = engine.undo_step(step, only_failed).await?;
            print_json(&report)?;
            if !report.is_clean() {
                bail!("{} task(s) could not be undone", report.failed.len());
            }
        }
        Commands::Continue { step, fields } => {
            let engine = build_engine(config, true)?;
            let updates: Map<String, Value> = fields.into_iter().collect();
            let run = engine.continue_step(step, updates).await?;
            println!("{}: resumed, finished with {:?}", run.step_id, run.outcome);
        }
    }

    Ok(())
}
