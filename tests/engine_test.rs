mod common;

use archflow::dsl::Condition;
use archflow::dsl::builder::{StepBuilder, WorkflowBuilder};
use archflow::errors::EngineError;
use archflow::runtime::task::TaskStatus;
use archflow::{RunOptions, StepOutcome};
use common::*;
use serde_json::{Map, json};

#[tokio::test]
async fn test_sequential_step_all_succeed() {
    let fx = Fixture::new();
    let workflow = WorkflowBuilder::new("scenario-a")
        .task(FIRST).param("foo", 1).build()
        .task(SECOND).param("foo", 1).build()
        .task(THIRD).param("foo", 1).build()
        .build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("scenario-a").await.expect("run failed");
    assert_eq!(run.outcome, StepOutcome::Success);

    let view = fx.engine.step_status(run.step_id).await.unwrap().unwrap();
    assert_eq!(view.state, TaskStatus::Success);
    assert_eq!(view.progress, 100.0);
    assert_eq!(fx.journal.entries(), vec!["run:First", "run:Second", "run:Third"]);

    let tasks = fx.tasks(run.step_id).await;
    assert_eq!(tasks.iter().map(|t| t.position).collect::<Vec<_>>(), vec![10, 20, 30]);
    assert_eq!(tasks[0].result, Some(json!({ "task": "First", "foo": 1 })));
    assert!(tasks.iter().all(|t| t.progress == 100 && t.completed_at.is_some()));
}

#[tokio::test]
async fn test_failure_cascades_to_later_siblings() {
    let fx = Fixture::new();
    let workflow = WorkflowBuilder::new("scenario-b")
        .task(FIRST).build()
        .task(FAIL).build()
        .task(THIRD).build()
        .build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("scenario-b").await.unwrap();
    assert_eq!(run.outcome, StepOutcome::Failure);

    let tasks = fx.tasks(run.step_id).await;
    assert_eq!(tasks[0].status, TaskStatus::Success);
    assert_eq!(tasks[1].status, TaskStatus::Failure);
    let traceback = tasks[1].traceback.as_deref().expect("failed task keeps its traceback");
    assert!(traceback.contains("precondition for Fail not met"));
    assert_eq!(tasks[2].status, TaskStatus::Failure);
    assert!(tasks[2].traceback.is_none());
    assert!(tasks[2].started_at.is_none());

    assert_eq!(fx.journal.count("run:Third"), 0);
    let view = fx.engine.step_status(run.step_id).await.unwrap().unwrap();
    assert_eq!(view.state, TaskStatus::Failure);
}

#[tokio::test]
async fn test_allow_failure_keeps_chain_going() {
    let fx = Fixture::new();
    let workflow = WorkflowBuilder::new("tolerant")
        .task(FAIL).allow_failure().build()
        .task(SECOND).build()
        .build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("tolerant").await.unwrap();
    assert_eq!(run.outcome, StepOutcome::Success);
    assert_eq!(
        fx.statuses(run.step_id).await,
        vec![TaskStatus::Failure, TaskStatus::Success]
    );
    assert_eq!(fx.journal.entries(), vec!["run:Fail", "run:Second"]);
}

#[tokio::test]
async fn test_cascade_reaches_into_later_sub_steps() {
    let fx = Fixture::new();
    let workflow = WorkflowBuilder::new("nested")
        .task(FAIL).build()
        .step(
            StepBuilder::sequential("later")
                .task(SECOND).build()
                .step(StepBuilder::parallel("deeper").task(THIRD).build()),
        )
        .build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("nested").await.unwrap();
    assert_eq!(run.outcome, StepOutcome::Failure);

    let later = fx.engine.store().child_steps(run.step_id).await.unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(fx.statuses(later[0].id).await, vec![TaskStatus::Failure]);
    let deeper = fx.engine.store().child_steps(later[0].id).await.unwrap();
    assert_eq!(fx.statuses(deeper[0].id).await, vec![TaskStatus::Failure]);
    assert_eq!(fx.journal.entries(), vec!["run:Fail"]);
}

#[tokio::test]
async fn test_result_params_feed_downstream_task() {
    let fx = Fixture::new();
    let workflow = WorkflowBuilder::new("scenario-d")
        .task(ADD).label("add").param("x", 2).param("y", 3).build()
        .task(ECHO).label("echo").param("note", "sum").result_param("sum", "add").build()
        .build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("scenario-d").await.unwrap();
    assert_eq!(run.outcome, StepOutcome::Success);

    let tasks = fx.tasks(run.step_id).await;
    assert_eq!(tasks[0].result, Some(json!(5)));
    assert_eq!(tasks[1].result, Some(json!({ "note": "sum", "sum": 5 })));
    // The merged params are what the row was started with.
    assert_eq!(tasks[1].params.get("sum"), Some(&json!(5)));
}

#[tokio::test]
async fn test_missing_upstream_result_fails_without_running() {
    let fx = Fixture::new();
    // `echo` consumes a result produced after it, so it is absent at start time.
    let workflow = WorkflowBuilder::new("missing-dep")
        .task(ECHO).allow_failure().result_param("sum", "add").build()
        .task(ADD).label("add").build()
        .build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("missing-dep").await.unwrap();
    assert_eq!(run.outcome, StepOutcome::Failure);

    let tasks = fx.tasks(run.step_id).await;
    assert_eq!(tasks[0].status, TaskStatus::Failure);
    assert!(tasks[0].traceback.as_deref().unwrap().contains("sum"));
    assert_eq!(tasks[1].status, TaskStatus::Failure);
    assert_eq!(fx.journal.count("run:Echo"), 0);
}

#[tokio::test]
async fn test_false_conditions_are_dropped_at_build_time() {
    let fx = Fixture::new();
    let workflow = WorkflowBuilder::new("conditional")
        .var("kind", "sip")
        .var("size", 3)
        .task(FIRST).when(Condition::Expr("kind == \"aip\"".to_string())).build()
        .task(SECOND).when(Condition::Expr("${size} > 2".to_string())).build()
        .step(StepBuilder::sequential("never").when(Condition::Literal(false)).task(THIRD).build())
        .build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("conditional").await.unwrap();
    assert_eq!(run.outcome, StepOutcome::Success);
    assert_eq!(fx.journal.entries(), vec!["run:Second"]);
    assert!(fx.engine.store().child_steps(run.step_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_variables_override_definition_variables() {
    let fx = Fixture::new();
    let workflow = WorkflowBuilder::new("override")
        .var("mode", "full")
        .task(FIRST).when(Condition::Expr("mode == \"quick\"".to_string())).build()
        .build();
    fx.engine.register_definition(workflow);

    let options = RunOptions {
        variables: [("mode".to_string(), json!("quick"))].into_iter().collect(),
        ..Default::default()
    };
    fx.engine.run_step_with("override", options).await.unwrap();
    assert_eq!(fx.journal.entries(), vec!["run:First"]);
}

#[tokio::test]
async fn test_unknown_task_and_definition_are_rejected() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.engine.run_step("nope").await,
        Err(EngineError::DefinitionNotFound(_))
    ));

    fx.engine.register_definition(WorkflowBuilder::new("bad").task("tests.Missing").build().build());
    assert!(matches!(
        fx.engine.run_step("bad").await,
        Err(EngineError::UnknownTask(name)) if name == "tests.Missing"
    ));
}

#[tokio::test]
async fn test_audit_event_requires_information_package() {
    let fx = Fixture::new();
    let workflow = WorkflowBuilder::new("audited")
        .task(AUDITED).param("object", "obj-1").build()
        .build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("audited").await.unwrap();
    assert_eq!(run.outcome, StepOutcome::Failure);
    let tasks = fx.tasks(run.step_id).await;
    assert!(tasks[0].traceback.as_deref().unwrap().contains("ingest.stored"));
    assert!(fx.audit.events().is_empty());

    let options = RunOptions {
        information_package: Some("ip-42".to_string()),
        ..Default::default()
    };
    let run = fx.engine.run_step_with("audited", options).await.unwrap();
    assert_eq!(run.outcome, StepOutcome::Success);

    let events = fx.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "ingest.stored");
    assert_eq!(events[0].information_package, "ip-42");
    assert_eq!(events[0].event_args, vec![json!("obj-1")]);
    assert_eq!(events[0].agent, "system");
}

#[tokio::test]
async fn test_eager_row_runs_inline_without_event() {
    let fx = Fixture::new();
    let workflow = WorkflowBuilder::new("eager")
        .task(AUDITED).eager().build()
        .task(SECOND).build()
        .build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("eager").await.unwrap();
    assert_eq!(run.outcome, StepOutcome::Success);
    let tasks = fx.tasks(run.step_id).await;
    assert_eq!(tasks[0].status, TaskStatus::Success);
    assert!(tasks[0].execution_id.is_none());
    assert!(tasks[1].execution_id.is_some());
    assert!(fx.audit.events().is_empty());
}

#[tokio::test]
async fn test_run_eager_bypasses_persistence() {
    let fx = Fixture::new();
    let mut params = Map::new();
    params.insert("x".to_string(), json!(20));
    params.insert("y".to_string(), json!(22));

    let value = fx.engine.run_eager(ADD, params).await.unwrap();
    assert_eq!(value, json!(42));

    fx.engine.undo_eager(FIRST, Map::new()).await.unwrap();
    assert_eq!(fx.journal.entries(), vec!["undo:First"]);

    let err = fx.engine.undo_eager(BROKEN_UNDO, Map::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Undo { .. }));
}

#[tokio::test]
async fn test_progress_is_persisted_and_published() {
    let fx = Fixture::new();
    let mut progress = fx.engine.subscribe_progress();
    let workflow = WorkflowBuilder::new("progress").task(PROGRESS).build().build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("progress").await.unwrap();
    assert_eq!(run.outcome, StepOutcome::Success);

    let mut seen = Vec::new();
    while let Ok(event) = progress.try_recv() {
        seen.push(event.progress);
    }
    assert_eq!(seen, vec![25, 50, 75, 100]);
    assert_eq!(fx.tasks(run.step_id).await[0].progress, 100);
}

#[tokio::test]
async fn test_hidden_tasks_do_not_count_toward_step_state() {
    let fx = Fixture::new();
    let workflow = WorkflowBuilder::new("hidden")
        .task(FIRST).build()
        .task(FAIL).hidden().allow_failure().build()
        .build();
    fx.engine.register_definition(workflow);

    let run = fx.engine.run_step("hidden").await.unwrap();
    let view = fx.engine.step_status(run.step_id).await.unwrap().unwrap();
    assert_eq!(view.state, TaskStatus::Success);
    assert_eq!(view.progress, 100.0);
}

#[tokio::test]
async fn test_uuid_labels_get_fresh_ids_per_run() {
    let fx = Fixture::new();
    let label = "8f1c2d3e-0000-4000-8000-000000000001";
    fx.engine.register_definition(
        WorkflowBuilder::new("uuid-label")
            .task(ADD).label(label).param("x", 2).param("y", 3).build()
            .task(ECHO).result_param("sum", label).build()
            .build(),
    );

    let first = fx.engine.run_step("uuid-label").await.unwrap();
    let second = fx.engine.run_step("uuid-label").await.unwrap();
    assert_eq!(first.outcome, StepOutcome::Success);
    assert_eq!(second.outcome, StepOutcome::Success);

    let first_rows = fx.tasks(first.step_id).await;
    let second_rows = fx.tasks(second.step_id).await;
    assert_ne!(first_rows[0].id, second_rows[0].id);
    assert_ne!(first_rows[0].id.to_string(), label);
    assert!(first_rows.iter().all(|t| t.step_id == first.step_id));
    assert_eq!(first_rows[1].result_params.get("sum"), Some(&first_rows[0].id));
    assert_eq!(first_rows[1].result, Some(json!({ "sum": 5 })));
    assert_eq!(second_rows[1].result, Some(json!({ "sum": 5 })));
}

#[tokio::test]
async fn test_oversized_position_gap_is_a_definition_error() {
    let config = archflow::config::EngineConfig {
        position_gap: u32::MAX,
        ..Default::default()
    };
    let engine = archflow::Engine::with_config(config);
    archflow::actions::builtin::register_builtins(engine.registry()).unwrap();
    engine.register_definition(
        WorkflowBuilder::new("wide")
            .task(archflow::actions::builtin::LOG).build()
            .task(archflow::actions::builtin::LOG).build()
            .build(),
    );
    assert!(matches!(
        engine.plan("wide", &RunOptions::default()),
        Err(EngineError::Definition(_))
    ));
}

#[test]
fn test_condition_keeps_braces_inside_literals() {
    use archflow::compiler::core::{eval_context, evaluate_condition};
    let mut vars = std::collections::HashMap::new();
    vars.insert("kind".to_string(), json!("a}b"));
    let ctx = eval_context(&vars);
    let cond = Condition::Expr("${kind} == \"a}b\"".to_string());
    assert!(evaluate_condition(&cond, &ctx).unwrap());
    let cond = Condition::Expr("${kind} == \"ab\"".to_string());
    assert!(!evaluate_condition(&cond, &ctx).unwrap());
}
