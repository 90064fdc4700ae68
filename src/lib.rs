pub mod actions;
pub mod compiler;
pub mod config;
pub mod dsl;
pub mod errors;
pub mod logging;
pub mod runtime;

pub use errors::{EngineError, Result};
pub use runtime::{Engine, RunOptions, StepOutcome, StepRun};
