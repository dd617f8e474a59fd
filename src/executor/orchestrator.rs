//! Fan-out/fan-in orchestrator
//!
//! Expands a triggered run into one execution unit per test, binds the
//! tenant to every member and to the collector callback, and submits the lot
//! as one chord. Trigger returns as soon as the group is enqueued.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::collector::CollectorArgs;
use crate::models::{ExecutionUnit, RunStatusView, TestRun};
use crate::queue::{ChordQueue, GroupMember, GroupMeta};
use crate::runs::{RunStore, RunStoreError};
use crate::store::StoreError;
use crate::tenant::{AuthIdentity, TaskEnvelope, TenantContext, TenantError};

/// Orchestrator errors
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Tenant(#[from] TenantError),

    #[error(transparent)]
    Runs(#[from] RunStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Callback arguments could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Run trigger input
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub test_configuration_id: String,
    pub target_id: String,
    /// Ordered test identities
    pub test_ids: Vec<String>,
    /// Explicit tenant; falls back to the authenticated identity
    pub tenant: Option<TenantContext>,
}

pub struct Orchestrator {
    queue: ChordQueue,
    runs: Arc<dyn RunStore>,
}

impl Orchestrator {
    pub fn new(queue: ChordQueue, runs: Arc<dyn RunStore>) -> Self {
        Self { queue, runs }
    }

    /// Create the run and submit its chord; returns the run id
    pub async fn trigger(
        &self,
        request: RunRequest,
        identity: Option<&AuthIdentity>,
    ) -> Result<String, OrchestratorError> {
        let run_id = crate::utils::new_id();

        // Resolve the tenant once so the run record and every member agree
        let tenant = TaskEnvelope::schedule((), request.tenant.as_ref(), identity)?.tenant()?;

        let members: Vec<TaskEnvelope<ExecutionUnit>> = request
            .test_ids
            .iter()
            .map(|test_id| {
                let unit = ExecutionUnit::new(&run_id, test_id, &request.target_id, tenant.clone());
                TaskEnvelope::schedule(unit, Some(&tenant), None)
            })
            .collect::<Result<_, _>>()?;

        let expected: Vec<GroupMember> = members
            .iter()
            .map(|envelope| GroupMember {
                unit_id: envelope.args.id.clone(),
                test_id: envelope.args.test_id.clone(),
            })
            .collect();

        let args = CollectorArgs {
            run_id: run_id.clone(),
            test_configuration_id: request.test_configuration_id.clone(),
            expected: expected.clone(),
        };
        let callback = TaskEnvelope::schedule(serde_json::to_value(&args)?, Some(&tenant), None)?;

        let run = TestRun::new(
            &run_id,
            &request.test_configuration_id,
            tenant.clone(),
            members.len(),
        );
        self.runs.create_run(run).await?;
        self.runs.mark_in_progress(&run_id).await?;

        let meta = GroupMeta {
            group_id: crate::utils::new_id(),
            run_id: run_id.clone(),
            created_at: Utc::now(),
            members: expected,
            callback,
        };
        info!(
            run_id = %run_id,
            group_id = %meta.group_id,
            organization_id = %tenant.organization_id,
            tests = members.len(),
            "triggering run"
        );
        self.queue.submit_chord(meta, members).await?;
        Ok(run_id)
    }

    /// Read-only status query
    pub async fn status(&self, run_id: &str) -> Result<Option<RunStatusView>, OrchestratorError> {
        Ok(self
            .runs
            .get_run(run_id)
            .await?
            .map(|run| run.status_view()))
    }
}
