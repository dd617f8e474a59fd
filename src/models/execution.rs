//! Execution unit models
//!
//! One execution unit runs one test against one target and always ends with
//! a terminal [`UnitResult`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tenant::TenantContext;

/// A single per-test unit of work fanned out from a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    pub id: String,
    pub run_id: String,
    pub test_id: String,
    pub target_id: String,
    pub tenant: TenantContext,
    #[serde(default)]
    pub retry_count: u32,
}

impl ExecutionUnit {
    pub fn new(
        run_id: impl Into<String>,
        test_id: impl Into<String>,
        target_id: impl Into<String>,
        tenant: TenantContext,
    ) -> Self {
        Self {
            id: crate::utils::new_id(),
            run_id: run_id.into(),
            test_id: test_id.into(),
            target_id: target_id.into(),
            tenant,
            retry_count: 0,
        }
    }
}

/// Why a unit ended in failure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retries exhausted
    #[default]
    Exhausted,
    /// Error marked as not worth retrying
    NonRetryable,
    SoftTimeLimit,
    HardTimeLimit,
    Panicked,
    /// Result payload missing or unreadable at fan-in
    Malformed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Exhausted => "retries exhausted",
            FailureKind::NonRetryable => "non-retryable",
            FailureKind::SoftTimeLimit => "soft time limit",
            FailureKind::HardTimeLimit => "hard time limit",
            FailureKind::Panicked => "panicked",
            FailureKind::Malformed => "malformed result",
        };
        write!(f, "{s}")
    }
}

/// Terminal outcome of a unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UnitOutcome {
    Success {
        output: serde_json::Value,
    },
    Failure {
        error: String,
        #[serde(default)]
        kind: FailureKind,
    },
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Success { .. })
    }
}

/// Terminal result written exactly once per unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit_id: String,
    pub test_id: String,
    #[serde(flatten)]
    pub outcome: UnitOutcome,
    pub duration_ms: u64,
    #[serde(default)]
    pub attempts: u32,
}

impl UnitResult {
    pub fn success(unit: &ExecutionUnit, output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            unit_id: unit.id.clone(),
            test_id: unit.test_id.clone(),
            outcome: UnitOutcome::Success { output },
            duration_ms,
            attempts: unit.retry_count + 1,
        }
    }

    pub fn failure(
        unit: &ExecutionUnit,
        kind: FailureKind,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            unit_id: unit.id.clone(),
            test_id: unit.test_id.clone(),
            outcome: UnitOutcome::Failure {
                error: error.into(),
                kind,
            },
            duration_ms,
            attempts: unit.retry_count + 1,
        }
    }

    /// Failure marker for a result that never arrived or could not be read
    pub fn malformed(unit_id: impl Into<String>, test_id: impl Into<String>, detail: &str) -> Self {
        Self {
            unit_id: unit_id.into(),
            test_id: test_id.into(),
            outcome: UnitOutcome::Failure {
                error: format!("malformed or missing result: {detail}"),
                kind: FailureKind::Malformed,
            },
            duration_ms: 0,
            attempts: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

impl fmt::Display for UnitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            UnitOutcome::Success { .. } => {
                write!(f, "✓ {} [{}ms]", self.test_id, self.duration_ms)
            }
            UnitOutcome::Failure { error, kind } => write!(
                f,
                "✗ {} [{}ms] - {} ({})",
                self.test_id, self.duration_ms, error, kind
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit() -> ExecutionUnit {
        ExecutionUnit::new("run-1", "test-a", "target-1", TenantContext::new("org", "u"))
    }

    #[test]
    fn test_success_wire_shape() {
        let result = UnitResult::success(&unit(), json!({"answer": 42}), 12);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["output"]["answer"], 42);
        assert_eq!(value["duration_ms"], 12);
        assert_eq!(value["attempts"], 1);
    }

    #[test]
    fn test_failure_wire_shape() {
        let result = UnitResult::failure(&unit(), FailureKind::Exhausted, "boom", 7);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["error"], "boom");
        assert_eq!(value["kind"], "exhausted");
        assert!(!result.is_success());
    }

    #[test]
    fn test_failure_kind_defaults_when_absent() {
        let value = json!({
            "unit_id": "u1",
            "test_id": "t1",
            "status": "failure",
            "error": "x",
            "duration_ms": 3
        });
        let result: UnitResult = serde_json::from_value(value).unwrap();
        assert_eq!(
            result.outcome,
            UnitOutcome::Failure {
                error: "x".to_string(),
                kind: FailureKind::Exhausted
            }
        );
    }

    #[test]
    fn test_malformed_marker() {
        let result = UnitResult::malformed("u1", "t1", "null payload");
        assert!(!result.is_success());
        assert!(result.to_string().contains("malformed"));
    }
}
