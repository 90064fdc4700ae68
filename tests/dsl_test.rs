use archflow::compiler::loader::parse_workflow;
use archflow::dsl::builder::{StepBuilder, WorkflowBuilder};
use archflow::dsl::{Condition, DefinitionNode};
use archflow::errors::EngineError;
use archflow::Engine;
use archflow::RunOptions;
use serde_json::json;

const INGEST: &str = r#"
id: ingest
variables:
  checksum: true
root:
  step: true
  name: Ingest package
  children:
    - name: ingest.Receive
      id: receive
      params:
        path: /incoming/pkg.tar
    - step: true
      name: Validate
      parallel: true
      if: "${checksum}"
      children:
        - name: ingest.Checksum
          result_params:
            archive: receive
        - name: ingest.Virus
          allow_failure: true
    - name: ingest.Approve
      waitForParams: true
      params:
        approved: false
"#;

#[test]
fn test_parse_nested_definition() {
    let workflow = parse_workflow(INGEST).expect("Failed to parse workflow");
    assert_eq!(workflow.id, "ingest");
    assert_eq!(workflow.variables.get("checksum"), Some(&json!(true)));

    let DefinitionNode::Sequential(root) = &workflow.root else {
        panic!("root should be a sequential step");
    };
    assert_eq!(root.name, "Ingest package");
    assert_eq!(root.children.len(), 3);

    let DefinitionNode::Task(receive) = &root.children[0] else {
        panic!("first child should be a task");
    };
    assert_eq!(receive.label.as_deref(), Some("receive"));
    assert_eq!(receive.params.get("path"), Some(&json!("/incoming/pkg.tar")));

    let DefinitionNode::Parallel(validate) = &root.children[1] else {
        panic!("second child should be a parallel step");
    };
    assert_eq!(validate.condition, Some(Condition::Expr("${checksum}".to_string())));
    let DefinitionNode::Task(virus) = &validate.children[1] else {
        panic!("expected task");
    };
    assert!(virus.allow_failure);

    let DefinitionNode::Task(approve) = &root.children[2] else {
        panic!("expected task");
    };
    assert!(approve.wait_for_params);
}

#[test]
fn test_unknown_keys_are_rejected() {
    let yaml = r#"
id: typo
root:
  step: true
  name: root
  children:
    - name: ingest.Receive
      parms: {}
"#;
    assert!(parse_workflow(yaml).is_err());
}

#[test]
fn test_step_and_leaf_keys_do_not_mix() {
    let step_with_params = r#"
id: mixed
root:
  step: true
  name: root
  params:
    a: 1
"#;
    let err = parse_workflow(step_with_params).unwrap_err();
    assert!(err.to_string().contains("leaf-only key 'params'"));

    let leaf_with_children = r#"
id: mixed
root:
  step: true
  name: root
  children:
    - name: ingest.Receive
      children: []
"#;
    assert!(parse_workflow(leaf_with_children).is_err());
}

#[test]
fn test_task_names_must_be_dotted_identifiers() {
    let yaml = r#"
id: names
root:
  step: true
  name: root
  children:
    - name: "not a task"
"#;
    assert!(parse_workflow(yaml).is_err());
}

#[test]
fn test_eager_and_wait_for_params_exclude_each_other() {
    let yaml = r#"
id: both
root:
  step: true
  name: root
  children:
    - name: ingest.Approve
      eager: true
      wait_for_params: true
"#;
    assert!(parse_workflow(yaml).is_err());
}

#[test]
fn test_builder_round_trips_through_yaml() {
    let workflow = WorkflowBuilder::new("built")
        .var("fast", false)
        .task("ingest.Receive").label("r").arg("pkg").param("path", "/tmp/x").build()
        .step(
            StepBuilder::parallel("checks")
                .when(Condition::Literal(true))
                .task("ingest.Checksum").result_param("archive", "r").build(),
        )
        .task("ingest.Store").hidden().eager().build()
        .build();

    let yaml = serde_yaml::to_string(&workflow).expect("Failed to serialize");
    let parsed = parse_workflow(&yaml).expect("Failed to parse serialized workflow");
    assert_eq!(parsed, workflow);
}

#[test]
fn test_materialization_assigns_gapped_positions() {
    let engine = Engine::new();
    for name in ["ingest.Receive", "ingest.Checksum", "ingest.Virus", "ingest.Approve"] {
        engine
            .register_task(name, || Box::new(archflow::actions::builtin::LogTask))
            .unwrap();
    }
    engine.register_definition(parse_workflow(INGEST).unwrap());

    let tree = engine.plan("ingest", &RunOptions::default()).unwrap();
    assert_eq!(tree.steps.len(), 2);
    assert_eq!(tree.tasks.len(), 4);

    let root = &tree.steps[0];
    assert_eq!(root.id, tree.root_id);
    assert!(root.parent_step.is_none());
    assert!(root.wait_for_params);

    let validate = &tree.steps[1];
    assert_eq!(validate.parent_step, Some(root.id));
    assert_eq!(validate.position, 20);
    assert!(validate.parallel);

    let receive = tree.tasks.iter().find(|t| t.name == "ingest.Receive").unwrap();
    let checksum = tree.tasks.iter().find(|t| t.name == "ingest.Checksum").unwrap();
    let approve = tree.tasks.iter().find(|t| t.name == "ingest.Approve").unwrap();
    assert_eq!(receive.position, 10);
    assert_eq!(checksum.position, 10);
    assert_eq!(approve.position, 30);
    assert_eq!(checksum.result_params.get("archive"), Some(&receive.id));
}

#[test]
fn test_build_time_definition_errors() {
    let engine = Engine::new();
    engine
        .register_task("ingest.Receive", || Box::new(archflow::actions::builtin::LogTask))
        .unwrap();

    engine.register_definition(
        WorkflowBuilder::new("dangling")
            .task("ingest.Receive").result_param("x", "nowhere").build()
            .build(),
    );
    assert!(matches!(
        engine.plan("dangling", &RunOptions::default()),
        Err(EngineError::Definition(_))
    ));

    engine.register_definition(
        WorkflowBuilder::new("self")
            .task("ingest.Receive").label("me").result_param("x", "me").build()
            .build(),
    );
    assert!(matches!(
        engine.plan("self", &RunOptions::default()),
        Err(EngineError::Definition(_))
    ));

    engine.register_definition(
        WorkflowBuilder::new("dupe")
            .task("ingest.Receive").label("a").build()
            .task("ingest.Receive").label("a").build()
            .build(),
    );
    assert!(matches!(
        engine.plan("dupe", &RunOptions::default()),
        Err(EngineError::Definition(_))
    ));

    let leaf_root = parse_workflow(
        r#"
id: leaf-root
root:
  name: ingest.Receive
"#,
    )
    .unwrap();
    engine.register_definition(leaf_root);
    assert!(matches!(
        engine.plan("leaf-root", &RunOptions::default()),
        Err(EngineError::Definition(_))
    ));
}

#[test]
fn test_params_are_validated_at_build_time() {
    let engine = Engine::new();
    archflow::actions::builtin::register_builtins(engine.registry()).unwrap();
    engine.register_definition(
        WorkflowBuilder::new("bad-eval")
            .task(archflow::actions::builtin::EVAL).param("expression", 5).build()
            .build(),
    );
    assert!(matches!(
        engine.plan("bad-eval", &RunOptions::default()),
        Err(EngineError::Definition(_))
    ));
}
