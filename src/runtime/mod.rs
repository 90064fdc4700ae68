pub mod audit;
pub mod context;
pub mod coordinator;
pub mod dispatch;
pub mod engine;
pub mod pipeline;
pub mod redis_storage;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod task;

pub use engine::{Engine, RunOptions, StepOutcome, StepRun};
