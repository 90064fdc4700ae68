use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable that overrides `redis_url` from the config file.
pub const REDIS_URL_ENV: &str = "ARCHFLOW_REDIS_URL";

/// 引擎配置 (Engine configuration)
///
/// Every field has a default so an empty YAML document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Gap between consecutive positions assigned at materialization.
    pub position_gap: u32,
    /// Fixed delay before the single retry of a contended status write.
    pub lock_retry_delay_ms: u64,
    /// Upper bound on tasks the local dispatcher runs at once.
    pub worker_concurrency: usize,
    /// Agent recorded on audit events.
    pub agent: String,
    pub redis_url: Option<String>,
    /// When set, audit events are POSTed here instead of kept in memory.
    pub audit_url: Option<String>,
    pub progress_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            position_gap: 10,
            lock_retry_delay_ms: 100,
            worker_concurrency: 8,
            agent: "system".to_string(),
            redis_url: None,
            audit_url: None,
            progress_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    /// Applies environment overrides on top of file values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(REDIS_URL_ENV) {
            if !url.trim().is_empty() {
                self.redis_url = Some(url);
            }
        }
        self
    }
}
