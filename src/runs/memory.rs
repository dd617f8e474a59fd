//! In-memory run store

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Finalizer, RunFinalization, RunStore, RunStoreError};
use crate::models::{RunStatus, TestRun};
use crate::tenant;

#[derive(Clone, Default)]
pub struct MemoryRunStore {
    runs: Arc<RwLock<BTreeMap<String, TestRun>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run regardless of tenant, for the state file
    pub async fn snapshot(&self) -> Vec<TestRun> {
        self.runs.read().await.values().cloned().collect()
    }

    pub async fn restore(&self, runs: Vec<TestRun>) {
        let mut guard = self.runs.write().await;
        guard.clear();
        for run in runs {
            guard.insert(run.id.clone(), run);
        }
    }

    fn visible(run: &TestRun) -> bool {
        match tenant::current() {
            Some(current) => current.organization_id == run.tenant.organization_id,
            None => true,
        }
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: TestRun) -> Result<(), RunStoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(RunStoreError::AlreadyExists(run.id));
        }
        debug!(run_id = %run.id, total = run.counts.total, "run created");
        runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<TestRun>, RunStoreError> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .filter(|run| Self::visible(run))
            .cloned())
    }

    async fn mark_in_progress(&self, run_id: &str) -> Result<(), RunStoreError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .filter(|run| Self::visible(run))
            .ok_or_else(|| RunStoreError::NotFound(run_id.to_string()))?;
        match run.status {
            RunStatus::Pending => {
                run.status = RunStatus::InProgress;
                Ok(())
            }
            RunStatus::InProgress => Ok(()),
            status => Err(RunStoreError::InvalidTransition {
                run_id: run_id.to_string(),
                detail: format!("{status} -> in_progress"),
            }),
        }
    }

    async fn finalize_run(
        &self,
        run_id: &str,
        by: Finalizer,
        finalization: RunFinalization,
    ) -> Result<bool, RunStoreError> {
        if !finalization.status.is_terminal() {
            return Err(RunStoreError::InvalidTransition {
                run_id: run_id.to_string(),
                detail: format!("{} is not terminal", finalization.status),
            });
        }
        if by == Finalizer::HealthMonitor && finalization.status != RunStatus::Failed {
            return Err(RunStoreError::InvalidTransition {
                run_id: run_id.to_string(),
                detail: "health monitor may only fail a run".to_string(),
            });
        }

        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .filter(|run| Self::visible(run))
            .ok_or_else(|| RunStoreError::NotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            warn!(
                run_id,
                status = %run.status,
                finalizer = ?by,
                "run already terminal, finalization ignored"
            );
            return Ok(false);
        }

        run.status = finalization.status;
        run.counts = finalization.counts;
        run.results = finalization.results;
        run.error = finalization.error;
        run.ended_at = Some(Utc::now());
        info!(
            run_id,
            status = %run.status,
            passed = run.counts.passed,
            failed = run.counts.failed,
            finalizer = ?by,
            "run finalized"
        );
        Ok(true)
    }

    async fn list_runs(&self) -> Result<Vec<TestRun>, RunStoreError> {
        let mut runs: Vec<TestRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|run| Self::visible(run))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }
}
