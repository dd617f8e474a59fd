//! Machine-readable monitor reports
//!
//! Each report knows its exit code, renders a human table through `Display`,
//! and flattens to rows for CSV export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{EXIT_CANCELLED, EXIT_ISSUES, EXIT_OK};
use crate::queue::{CloseReason, MemberState};

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Group lifecycle as judged by the monitor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Open,
    Closed,
    Stuck,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::Open => write!(f, "open"),
            GroupState::Closed => write!(f, "closed"),
            GroupState::Stuck => write!(f, "stuck"),
        }
    }
}

/// One group as seen at report time
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupHealth {
    pub group_id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub age_minutes: f64,
    pub members: usize,
    pub pending: i64,
    pub state: GroupState,
    pub closed_reason: Option<CloseReason>,
}

impl GroupHealth {
    fn row(&self) -> Vec<String> {
        vec![
            self.group_id.clone(),
            self.run_id.clone(),
            self.state.to_string(),
            format!("{:.1}", self.age_minutes),
            self.members.to_string(),
            self.pending.to_string(),
            self.closed_reason
                .map(|r| format!("{r:?}").to_lowercase())
                .unwrap_or_default(),
        ]
    }

    const HEADER: [&'static str; 7] = [
        "group_id",
        "run_id",
        "state",
        "age_minutes",
        "members",
        "pending",
        "closed_reason",
    ];
}

impl fmt::Display for GroupHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<36}  {:<7} {:>8.1}m  {:>3}/{:<3} run {}",
            self.group_id,
            self.state,
            self.age_minutes,
            self.pending,
            self.members,
            self.run_id
        )
    }
}

/// Common surface used by the CLI
pub trait MonitorReport: Serialize + fmt::Display {
    fn exit_code(&self) -> i32;

    /// One-line summary
    fn summary(&self) -> String;

    fn csv_header(&self) -> Vec<&'static str>;

    fn csv_rows(&self) -> Vec<Vec<String>>;
}

/// `status`: counts of every group
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub threshold_minutes: u64,
    pub total: usize,
    pub open: usize,
    pub closed: usize,
    pub stuck: usize,
    pub groups: Vec<GroupHealth>,
}

impl MonitorReport for StatusReport {
    fn exit_code(&self) -> i32 {
        if self.stuck > 0 {
            EXIT_ISSUES
        } else {
            EXIT_OK
        }
    }

    fn summary(&self) -> String {
        format!(
            "groups: {} total, {} open, {} closed, {} stuck (threshold {}m)",
            self.total, self.open, self.closed, self.stuck, self.threshold_minutes
        )
    }

    fn csv_header(&self) -> Vec<&'static str> {
        GroupHealth::HEADER.to_vec()
    }

    fn csv_rows(&self) -> Vec<Vec<String>> {
        self.groups.iter().map(GroupHealth::row).collect()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Chord Status")?;
        writeln!(f, "{RULE}")?;
        for group in &self.groups {
            writeln!(f, "  {group}")?;
        }
        writeln!(f, "{RULE}")?;
        write!(f, "{}", self.summary())
    }
}

/// `check`: groups open longer than the threshold
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckReport {
    pub threshold_hours: f64,
    pub stuck: Vec<GroupHealth>,
}

impl MonitorReport for CheckReport {
    fn exit_code(&self) -> i32 {
        if self.stuck.is_empty() {
            EXIT_OK
        } else {
            EXIT_ISSUES
        }
    }

    fn summary(&self) -> String {
        format!(
            "{} stuck group(s) older than {}h",
            self.stuck.len(),
            self.threshold_hours
        )
    }

    fn csv_header(&self) -> Vec<&'static str> {
        GroupHealth::HEADER.to_vec()
    }

    fn csv_rows(&self) -> Vec<Vec<String>> {
        self.stuck.iter().map(GroupHealth::row).collect()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stuck.is_empty() {
            return write!(f, "✓ No stuck groups older than {}h", self.threshold_hours);
        }
        writeln!(f, "Stuck groups (> {}h)", self.threshold_hours)?;
        writeln!(f, "{RULE}")?;
        for group in &self.stuck {
            writeln!(f, "  ✗ {group}")?;
        }
        writeln!(f, "{RULE}")?;
        write!(f, "{}", self.summary())
    }
}

/// What happened to one group on revoke
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RevokeOutcome {
    /// Group forced closed and its run failed
    Revoked {
        members_revoked: usize,
        run_failed: bool,
    },
    /// Dry run: would have been revoked
    WouldRevoke { members_in_flight: usize },
    /// Already closed; nothing to do
    AlreadyClosed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevokedGroup {
    pub group_id: String,
    pub run_id: String,
    #[serde(flatten)]
    pub outcome: RevokeOutcome,
}

/// `revoke`: per-group outcome
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevokeReport {
    pub threshold_hours: f64,
    pub dry_run: bool,
    pub groups: Vec<RevokedGroup>,
}

impl RevokeReport {
    pub fn revoked(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| matches!(g.outcome, RevokeOutcome::Revoked { .. }))
            .count()
    }

    pub fn would_revoke(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| matches!(g.outcome, RevokeOutcome::WouldRevoke { .. }))
            .count()
    }
}

impl MonitorReport for RevokeReport {
    fn exit_code(&self) -> i32 {
        if self.revoked() + self.would_revoke() > 0 {
            EXIT_ISSUES
        } else {
            EXIT_OK
        }
    }

    fn summary(&self) -> String {
        if self.dry_run {
            format!("dry run: {} group(s) would be revoked", self.would_revoke())
        } else {
            format!("{} group(s) revoked", self.revoked())
        }
    }

    fn csv_header(&self) -> Vec<&'static str> {
        vec!["group_id", "run_id", "outcome", "members"]
    }

    fn csv_rows(&self) -> Vec<Vec<String>> {
        self.groups
            .iter()
            .map(|g| {
                let (outcome, members) = match &g.outcome {
                    RevokeOutcome::Revoked {
                        members_revoked, ..
                    } => ("revoked", *members_revoked),
                    RevokeOutcome::WouldRevoke { members_in_flight } => {
                        ("would_revoke", *members_in_flight)
                    }
                    RevokeOutcome::AlreadyClosed => ("already_closed", 0),
                };
                vec![
                    g.group_id.clone(),
                    g.run_id.clone(),
                    outcome.to_string(),
                    members.to_string(),
                ]
            })
            .collect()
    }
}

impl fmt::Display for RevokeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for group in &self.groups {
            match &group.outcome {
                RevokeOutcome::Revoked {
                    members_revoked,
                    run_failed,
                } => writeln!(
                    f,
                    "  ✗ revoked {} ({} member(s) cancelled, run {} {})",
                    group.group_id,
                    members_revoked,
                    group.run_id,
                    if *run_failed { "failed" } else { "unchanged" }
                )?,
                RevokeOutcome::WouldRevoke { members_in_flight } => writeln!(
                    f,
                    "  ○ would revoke {} ({} member(s) in flight)",
                    group.group_id, members_in_flight
                )?,
                RevokeOutcome::AlreadyClosed => {
                    writeln!(f, "  ✓ {} already closed", group.group_id)?
                }
            }
        }
        write!(f, "{}", self.summary())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberReport {
    pub unit_id: String,
    pub test_id: String,
    pub state: Option<MemberState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// `inspect`: per-member detail for one group
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InspectReport {
    pub group: GroupHealth,
    pub verbose: bool,
    pub members: Vec<MemberReport>,
}

impl MonitorReport for InspectReport {
    fn exit_code(&self) -> i32 {
        if self.group.state == GroupState::Stuck {
            EXIT_ISSUES
        } else {
            EXIT_OK
        }
    }

    fn summary(&self) -> String {
        let in_flight = self
            .members
            .iter()
            .filter(|m| m.state.map(|s| s.is_in_flight()).unwrap_or(false))
            .count();
        format!(
            "group {} is {}: {} member(s), {} in flight",
            self.group.group_id,
            self.group.state,
            self.members.len(),
            in_flight
        )
    }

    fn csv_header(&self) -> Vec<&'static str> {
        vec!["unit_id", "test_id", "state", "result"]
    }

    fn csv_rows(&self) -> Vec<Vec<String>> {
        self.members
            .iter()
            .map(|m| {
                vec![
                    m.unit_id.clone(),
                    m.test_id.clone(),
                    m.state.map(|s| s.to_string()).unwrap_or_default(),
                    m.result.as_ref().map(|r| r.to_string()).unwrap_or_default(),
                ]
            })
            .collect()
    }
}

impl fmt::Display for InspectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Group {}", self.group.group_id)?;
        writeln!(f, "{RULE}")?;
        writeln!(f, "  run:      {}", self.group.run_id)?;
        writeln!(f, "  created:  {}", self.group.created_at.to_rfc3339())?;
        writeln!(f, "  state:    {}", self.group.state)?;
        writeln!(f, "  pending:  {}/{}", self.group.pending, self.group.members)?;
        writeln!(f, "{RULE}")?;
        for member in &self.members {
            let state = member
                .state
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            writeln!(f, "  {:<36}  {:<8} {}", member.unit_id, state, member.test_id)?;
            if let Some(result) = &member.result {
                writeln!(f, "      {result}")?;
            }
        }
        write!(f, "{}", self.summary())
    }
}

/// `clean`: emergency purge totals
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CleanReport {
    pub cancelled: bool,
    pub groups_purged: usize,
    pub members_revoked: usize,
    pub runs_failed: usize,
    pub keys_removed: usize,
}

impl MonitorReport for CleanReport {
    fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_CANCELLED
        } else if self.groups_purged > 0 {
            EXIT_ISSUES
        } else {
            EXIT_OK
        }
    }

    fn summary(&self) -> String {
        if self.cancelled {
            "clean cancelled: pass --force to purge all in-flight work".to_string()
        } else {
            format!(
                "purged {} group(s), revoked {} member(s), failed {} run(s)",
                self.groups_purged, self.members_revoked, self.runs_failed
            )
        }
    }

    fn csv_header(&self) -> Vec<&'static str> {
        vec![
            "cancelled",
            "groups_purged",
            "members_revoked",
            "runs_failed",
            "keys_removed",
        ]
    }

    fn csv_rows(&self) -> Vec<Vec<String>> {
        vec![vec![
            self.cancelled.to_string(),
            self.groups_purged.to_string(),
            self.members_revoked.to_string(),
            self.runs_failed.to_string(),
            self.keys_removed.to_string(),
        ]]
    }
}

impl fmt::Display for CleanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit_codes() {
        let cancelled = CleanReport {
            cancelled: true,
            ..CleanReport::default()
        };
        assert_eq!(cancelled.exit_code(), EXIT_CANCELLED);
        assert_eq!(CleanReport::default().exit_code(), EXIT_OK);
    }

    #[test]
    fn test_revoke_outcome_wire_shape() {
        let group = RevokedGroup {
            group_id: "g".to_string(),
            run_id: "r".to_string(),
            outcome: RevokeOutcome::Revoked {
                members_revoked: 2,
                run_failed: true,
            },
        };
        let value = serde_json::to_value(&group).unwrap();
        assert_eq!(value["outcome"], "revoked");
        assert_eq!(value["members_revoked"], 2);
    }

    #[test]
    fn test_already_closed_is_not_an_issue() {
        let report = RevokeReport {
            threshold_hours: 0.5,
            dry_run: false,
            groups: vec![RevokedGroup {
                group_id: "g".to_string(),
                run_id: "r".to_string(),
                outcome: RevokeOutcome::AlreadyClosed,
            }],
        };
        assert_eq!(report.exit_code(), EXIT_OK);
        assert_eq!(report.csv_rows()[0][2], "already_closed");
    }
}
