//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Level priority: the `--log-level` flag, then `ARCHFLOW_LOG`, then `info`.
//! Output goes to stderr so `archflow status` output stays parseable.

use anyhow::{Result, anyhow};
use tracing::Level;

pub const LOG_ENV: &str = "ARCHFLOW_LOG";

pub fn init_logging(cli_level: Option<&str>) -> Result<()> {
    let level = cli_level
        .and_then(parse_level)
        .or_else(|| std::env::var(LOG_ENV).ok().and_then(|s| parse_level(&s)))
        .unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}

pub fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}
