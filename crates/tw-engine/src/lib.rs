//! # tw-engine
//!
//! Run orchestration for Tunewell: evaluator adapters, run configuration,
//! the run context and the trial scheduler.
//!
//! A run is one coordinator task that owns the trial store and the
//! meta-optimizer. Evaluations happen on worker tasks and come back over a
//! channel; every state change goes through the coordinator.

pub mod config;
pub mod context;
pub mod evaluator;
pub mod report;
pub mod scheduler;

pub use config::{RunConfig, RunFile};
pub use context::RunContext;
pub use evaluator::{parse_score, CommandEvaluator, Evaluation, Evaluator, FnEvaluator};
pub use report::{RunEvent, RunReport, RunState};
pub use scheduler::{run_to_completion, Scheduler};

pub use tokio_util::sync::CancellationToken;
