//! Test execution engine
//!
//! Execution task, result collector and the orchestrator that ties them to
//! the chord queue.

mod collector;
mod orchestrator;
mod task;

pub use collector::ResultCollector;
pub use orchestrator::{Orchestrator, RunRequest};
pub use task::{ExecError, ExecutionTask, RetryPolicy, TestTarget};
