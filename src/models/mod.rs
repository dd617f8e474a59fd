//! Data models for test-run orchestration
//!
//! Runs, execution units and their terminal results.

mod execution;
mod test_run;

pub use execution::{ExecutionUnit, FailureKind, UnitOutcome, UnitResult};
pub use test_run::{
    RunCounts, RunStatus, RunStatusView, TestRun, PURGED_EXECUTION_DETAIL, STUCK_EXECUTION_DETAIL,
};
