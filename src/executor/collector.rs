//! Result collector
//!
//! The fan-in callback of a run's group. It sees every member payload once,
//! in whatever order members finished, and is the normal path by which a run
//! reaches a terminal status.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::models::{RunCounts, RunStatus, UnitResult};
use crate::queue::{ChordCallback, GroupMember};
use crate::runs::{Finalizer, RunFinalization, RunStore};
use crate::tenant::TaskEnvelope;

/// Callback arguments bound at fan-out time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorArgs {
    pub run_id: String,
    pub test_configuration_id: String,
    /// Members in submission order
    pub expected: Vec<GroupMember>,
}

pub struct ResultCollector {
    runs: Arc<dyn RunStore>,
}

impl ResultCollector {
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self { runs }
    }

    /// Match raw payloads to expected members.
    ///
    /// Anything missing, unreadable or not belonging to an expected member
    /// becomes an explicit failure; output follows submission order.
    pub fn normalize(expected: &[GroupMember], raw: Vec<serde_json::Value>) -> Vec<UnitResult> {
        let mut by_unit: HashMap<String, UnitResult> = HashMap::new();
        for value in raw {
            if value.is_null() {
                continue;
            }
            match serde_json::from_value::<UnitResult>(value) {
                Ok(result) => {
                    by_unit.entry(result.unit_id.clone()).or_insert(result);
                }
                Err(err) => warn!(error = %err, "discarding unreadable member result"),
            }
        }

        expected
            .iter()
            .map(|member| {
                by_unit.remove(&member.unit_id).unwrap_or_else(|| {
                    UnitResult::malformed(&member.unit_id, &member.test_id, "no terminal result recorded")
                })
            })
            .collect()
    }

    /// Aggregate and write the terminal run status
    pub async fn collect(&self, args: &CollectorArgs, raw: Vec<serde_json::Value>) -> RunStatus {
        let results = Self::normalize(&args.expected, raw);
        let failed = results.iter().filter(|r| !r.is_success()).count();
        let counts = RunCounts {
            total: results.len(),
            passed: results.len() - failed,
            failed,
        };
        let status = RunStatus::from_counts(counts.total, counts.failed);

        let finalization = RunFinalization {
            status,
            counts,
            results,
            error: None,
        };
        match self
            .runs
            .finalize_run(&args.run_id, Finalizer::ResultCollector, finalization)
            .await
        {
            Ok(true) => info!(
                run_id = %args.run_id,
                status = %status,
                passed = counts.passed,
                failed = counts.failed,
                "run collected"
            ),
            Ok(false) => warn!(run_id = %args.run_id, "run already terminal, collected results dropped"),
            Err(err) => error!(run_id = %args.run_id, error = %err, "failed to finalize run"),
        }
        status
    }
}

#[async_trait]
impl ChordCallback for ResultCollector {
    async fn on_group_complete(
        &self,
        callback: TaskEnvelope<serde_json::Value>,
        results: Vec<serde_json::Value>,
    ) {
        let task_id = callback.task_id().to_string();
        match serde_json::from_value::<CollectorArgs>(callback.args) {
            Ok(args) => {
                self.collect(&args, results).await;
            }
            Err(err) => error!(
                task_id,
                error = %err,
                "unreadable collector arguments"
            ),
        }
    }
}
