use anyhow::{Context as AnyhowContext, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use crate::config::EngineConfig;
use crate::dsl::Workflow;

pub fn parse_workflow(yaml_content: &str) -> crate::errors::Result<Workflow> {
    Ok(serde_yaml::from_str(yaml_content)?)
}

pub fn load_workflow_from_yaml(file_path: &Path) -> Result<Workflow> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path.display()))?;

    let workflow = parse_workflow(&yaml_content)
        .with_context(|| format!("Failed to deserialize workflow from {}", file_path.display()))?;

    Ok(workflow)
}

/// Loads every `*.yaml`/`*.yml` in `dir`. Files that fail to parse are
/// logged and skipped.
pub fn load_workflows_from_dir(dir: &Path) -> Result<Vec<Workflow>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read workflow directory {}", dir.display()))?;

    let mut workflows = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match load_workflow_from_yaml(&path) {
            Ok(wf) => {
                info!(workflow = %wf.id, path = %path.display(), "Loaded workflow");
                workflows.push(wf);
            }
            Err(e) => warn!(path = %path.display(), error = ?e, "Skipping unreadable workflow"),
        }
    }
    workflows.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(workflows)
}

/// Reads an [`EngineConfig`] and applies environment overrides.
pub fn load_config_from_yaml(file_path: &Path) -> Result<EngineConfig> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read config file from {}", file_path.display()))?;

    let config: EngineConfig = if yaml_content.trim().is_empty() {
        EngineConfig::default()
    } else {
        serde_yaml::from_str(&yaml_content)
            .with_context(|| format!("Failed to deserialize config from {}", file_path.display()))?
    };

    Ok(config.with_env_overrides())
}
