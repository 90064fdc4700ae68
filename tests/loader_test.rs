use archflow::compiler::loader::{load_config_from_yaml, load_workflow_from_yaml, load_workflows_from_dir};
use archflow::config::EngineConfig;
use std::fs;

const SIMPLE: &str = r#"
id: "simple"
root:
  step: true
  name: "simple"
  children:
    - name: archflow.builtin.Log
      params:
        msg: "Hello from YAML"
"#;

#[test]
fn test_load_workflow_file() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("simple.yaml");
    fs::write(&path, SIMPLE).expect("Failed to write workflow");

    let workflow = load_workflow_from_yaml(&path).expect("Failed to load workflow");
    assert_eq!(workflow.id, "simple");
}

#[test]
fn test_missing_file_reports_path() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("absent.yaml");
    let err = load_workflow_from_yaml(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("absent.yaml"));
}

#[test]
fn test_load_directory_skips_broken_and_foreign_files() {
    let temp_dir = tempfile::tempdir().unwrap();
    fs::write(temp_dir.path().join("b.yaml"), SIMPLE.replace("simple", "b")).unwrap();
    fs::write(temp_dir.path().join("a.yml"), SIMPLE.replace("simple", "a")).unwrap();
    fs::write(temp_dir.path().join("broken.yaml"), "id: [").unwrap();
    fs::write(temp_dir.path().join("notes.txt"), "not a workflow").unwrap();

    let workflows = load_workflows_from_dir(temp_dir.path()).unwrap();
    let ids: Vec<&str> = workflows.iter().map(|w| w.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[test]
fn test_config_defaults_and_overrides() {
    let temp_dir = tempfile::tempdir().unwrap();

    let empty = temp_dir.path().join("empty.yaml");
    fs::write(&empty, "").unwrap();
    let config = load_config_from_yaml(&empty).unwrap();
    assert_eq!(config.position_gap, EngineConfig::default().position_gap);
    assert_eq!(config.lock_retry_delay_ms, 100);

    let partial = temp_dir.path().join("partial.yaml");
    fs::write(&partial, "position_gap: 100\nagent: archivist\n").unwrap();
    let config = load_config_from_yaml(&partial).unwrap();
    assert_eq!(config.position_gap, 100);
    assert_eq!(config.agent, "archivist");
    assert_eq!(config.worker_concurrency, 8);

    let unknown = temp_dir.path().join("bad.yaml");
    fs::write(&unknown, "position_gap: many\n").unwrap();
    assert!(load_config_from_yaml(&unknown).is_err());
}
