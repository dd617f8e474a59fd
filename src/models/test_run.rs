//! Test run models
//!
//! Defines the run record, its status lifecycle and the read-only status view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::execution::UnitResult;
use crate::tenant::TenantContext;

/// Detail recorded on runs whose fan-in callback never fired
pub const STUCK_EXECUTION_DETAIL: &str =
    "execution did not complete: fan-in callback never fired (stuck execution)";

/// Detail recorded on runs whose in-flight work was purged
pub const PURGED_EXECUTION_DETAIL: &str =
    "execution did not complete: in-flight work purged by emergency clean";

/// Test run lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    PartiallyFailed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::PartiallyFailed | RunStatus::Failed
        )
    }

    /// Derive the terminal status from failure counts
    pub fn from_counts(total: usize, failed: usize) -> Self {
        if failed == 0 {
            RunStatus::Completed
        } else if failed < total {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Failed
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            RunStatus::Pending => "…",
            RunStatus::InProgress => "▶",
            RunStatus::Completed => "✓",
            RunStatus::PartiallyFailed => "◐",
            RunStatus::Failed => "✗",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::InProgress => write!(f, "in_progress"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::PartiallyFailed => write!(f, "partially_failed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-run result counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// A single triggered test run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub test_configuration_id: String,
    pub tenant: TenantContext,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    pub error: Option<String>,
    #[serde(default)]
    pub results: Vec<UnitResult>,
}

impl TestRun {
    pub fn new(
        id: impl Into<String>,
        test_configuration_id: impl Into<String>,
        tenant: TenantContext,
        total: usize,
    ) -> Self {
        Self {
            id: id.into(),
            test_configuration_id: test_configuration_id.into(),
            tenant,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            counts: RunCounts {
                total,
                ..RunCounts::default()
            },
            error: None,
            results: Vec::new(),
        }
    }

    pub fn status_view(&self) -> RunStatusView {
        RunStatusView {
            run_id: self.id.clone(),
            status: self.status,
            counts: self.counts,
            start: self.started_at,
            end: self.ended_at,
            error: self.error.clone(),
            results: self.results.clone(),
        }
    }
}

/// Read-only run status query result
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: String,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub results: Vec<UnitResult>,
}

impl RunStatusView {
    pub fn pass_rate(&self) -> f64 {
        if self.counts.total == 0 {
            0.0
        } else {
            (self.counts.passed as f64 / self.counts.total as f64) * 100.0
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end.map(|end| (end - self.start).num_milliseconds())
    }
}

impl fmt::Display for RunStatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} - {} {}", self.run_id, self.status.symbol(), self.status)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for result in &self.results {
            writeln!(f, "  {result}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Total: {} | Pass: {} | Fail: {}",
            self.counts.total, self.counts.passed, self.counts.failed
        )?;
        if let Some(error) = &self.error {
            writeln!(f, "Error: {error}")?;
        }
        write!(f, "Pass Rate: {:.1}%", self.pass_rate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_counts() {
        assert_eq!(RunStatus::from_counts(5, 0), RunStatus::Completed);
        assert_eq!(RunStatus::from_counts(5, 1), RunStatus::PartiallyFailed);
        assert_eq!(RunStatus::from_counts(5, 5), RunStatus::Failed);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::InProgress.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::PartiallyFailed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::PartiallyFailed).unwrap();
        assert_eq!(json, "\"partially_failed\"");
        assert_eq!(RunStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = TestRun::new("run-1", "cfg-1", TenantContext::new("org", "user"), 3);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.counts.total, 3);
        assert!(run.ended_at.is_none());
        assert_eq!(run.status_view().pass_rate(), 0.0);
    }
}
