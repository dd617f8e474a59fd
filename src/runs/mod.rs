//! Run persistence collaborator
//!
//! Runs are created by the orchestrator and written to a terminal status by
//! exactly two callers: the result collector (normal fan-in) and the health
//! monitor (stuck or purged groups, `failed` only). A terminal run never
//! changes again.

mod memory;

pub use memory::MemoryRunStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{RunCounts, RunStatus, TestRun, UnitResult};

/// Run store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunStoreError {
    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Run already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid transition for run {run_id}: {detail}")]
    InvalidTransition { run_id: String, detail: String },
}

/// Component allowed to write a terminal run status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finalizer {
    ResultCollector,
    HealthMonitor,
}

/// Terminal write applied to a run
#[derive(Clone, Debug)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub counts: RunCounts,
    pub results: Vec<UnitResult>,
    pub error: Option<String>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: TestRun) -> Result<(), RunStoreError>;

    /// Runs of other organizations are invisible inside a tenant scope
    async fn get_run(&self, run_id: &str) -> Result<Option<TestRun>, RunStoreError>;

    async fn mark_in_progress(&self, run_id: &str) -> Result<(), RunStoreError>;

    /// Apply a terminal status; returns `false` if the run was already terminal
    async fn finalize_run(
        &self,
        run_id: &str,
        by: Finalizer,
        finalization: RunFinalization,
    ) -> Result<bool, RunStoreError>;

    async fn list_runs(&self) -> Result<Vec<TestRun>, RunStoreError>;
}
