//! Chord health monitor
//!
//! Finds fan-in groups whose callback never fired and can force them closed.
//! Revocation races normal completion through the group's one-shot close
//! marker: whichever of callback and revoke claims it first wins, and the
//! loser treats the group as already closed.

mod report;

pub use report::{
    CheckReport, CleanReport, GroupHealth, GroupState, InspectReport, MemberReport,
    MonitorReport, RevokeOutcome, RevokeReport, RevokedGroup, StatusReport,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::executor::ResultCollector;
use crate::models::{RunCounts, RunStatus, PURGED_EXECUTION_DETAIL, STUCK_EXECUTION_DETAIL};
use crate::queue::{
    ChordBackend, CloseReason, GroupMeta, MemberState, RevokeNotice, REVOKE_CHANNEL,
};
use crate::runs::{Finalizer, RunFinalization, RunStore, RunStoreError};
use crate::store::{CoordinationStore, StoreError};
use crate::tenant;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ISSUES: i32 = 1;
pub const EXIT_ERROR: i32 = 2;
pub const EXIT_CANCELLED: i32 = 130;

/// Monitor errors
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runs(#[from] RunStoreError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Open groups older than this are stuck
    pub stuck_threshold_minutes: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_minutes: 30,
        }
    }
}

pub struct ChordMonitor {
    backend: ChordBackend,
    runs: Arc<dyn RunStore>,
    config: MonitorConfig,
}

impl ChordMonitor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        runs: Arc<dyn RunStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            backend: ChordBackend::new(store),
            runs,
            config,
        }
    }

    /// Retention applied to groups this monitor closes
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.backend = self.backend.with_retention(retention);
        self
    }

    fn age_minutes(meta: &GroupMeta, now: DateTime<Utc>) -> f64 {
        (now - meta.created_at).num_milliseconds().max(0) as f64 / 60_000.0
    }

    async fn health(
        &self,
        meta: &GroupMeta,
        threshold_minutes: f64,
        now: DateTime<Utc>,
    ) -> Result<GroupHealth, MonitorError> {
        let closed = self.backend.closed_marker(&meta.group_id).await?;
        let age_minutes = Self::age_minutes(meta, now);
        let state = match closed {
            Some(_) => GroupState::Closed,
            None if age_minutes > threshold_minutes => GroupState::Stuck,
            None => GroupState::Open,
        };
        Ok(GroupHealth {
            group_id: meta.group_id.clone(),
            run_id: meta.run_id.clone(),
            created_at: meta.created_at,
            age_minutes,
            members: meta.members.len(),
            pending: self.backend.pending(&meta.group_id).await?,
            state,
            closed_reason: closed.map(|marker| marker.reason),
        })
    }

    async fn all_groups(&self) -> Result<Vec<GroupMeta>, MonitorError> {
        let mut groups = Vec::new();
        for group_id in self.backend.group_ids().await? {
            if let Some(meta) = self.backend.meta(&group_id).await? {
                groups.push(meta);
            }
        }
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(groups)
    }

    async fn survey(&self, threshold_minutes: f64) -> Result<Vec<GroupHealth>, MonitorError> {
        let now = Utc::now();
        let mut report = Vec::new();
        for meta in self.all_groups().await? {
            report.push(self.health(&meta, threshold_minutes, now).await?);
        }
        Ok(report)
    }

    /// Read-only counts of every group
    pub async fn status(&self) -> Result<StatusReport, MonitorError> {
        let groups = self
            .survey(self.config.stuck_threshold_minutes as f64)
            .await?;
        let count = |state: GroupState| groups.iter().filter(|g| g.state == state).count();
        Ok(StatusReport {
            threshold_minutes: self.config.stuck_threshold_minutes,
            total: groups.len(),
            open: count(GroupState::Open),
            closed: count(GroupState::Closed),
            stuck: count(GroupState::Stuck),
            groups,
        })
    }

    /// Groups open longer than `max_age_hours`
    pub async fn check(&self, max_age_hours: f64) -> Result<CheckReport, MonitorError> {
        let stuck = self
            .survey(max_age_hours * 60.0)
            .await?
            .into_iter()
            .filter(|g| g.state == GroupState::Stuck)
            .collect();
        Ok(CheckReport {
            threshold_hours: max_age_hours,
            stuck,
        })
    }

    /// Force every group stuck beyond `max_age_hours` into a terminal state
    pub async fn revoke(
        &self,
        max_age_hours: f64,
        dry_run: bool,
    ) -> Result<RevokeReport, MonitorError> {
        let check = self.check(max_age_hours).await?;
        let mut groups = Vec::with_capacity(check.stuck.len());
        for stuck in check.stuck {
            let outcome = self.revoke_group(&stuck.group_id, dry_run).await?;
            groups.push(RevokedGroup {
                group_id: stuck.group_id,
                run_id: stuck.run_id,
                outcome,
            });
        }
        Ok(RevokeReport {
            threshold_hours: max_age_hours,
            dry_run,
            groups,
        })
    }

    /// Revoke one group. Closed groups are a no-op, so this is idempotent.
    pub async fn revoke_group(
        &self,
        group_id: &str,
        dry_run: bool,
    ) -> Result<RevokeOutcome, MonitorError> {
        let meta = self
            .backend
            .meta(group_id)
            .await?
            .ok_or_else(|| MonitorError::UnknownGroup(group_id.to_string()))?;

        if self.backend.closed_marker(group_id).await?.is_some() {
            return Ok(RevokeOutcome::AlreadyClosed);
        }
        if dry_run {
            let mut members_in_flight = 0;
            for member in &meta.members {
                let state = self.backend.member_state(group_id, &member.unit_id).await?;
                if state.map(|s| s.is_in_flight()).unwrap_or(true) {
                    members_in_flight += 1;
                }
            }
            return Ok(RevokeOutcome::WouldRevoke { members_in_flight });
        }
        if !self
            .backend
            .claim_close(group_id, CloseReason::Revoked)
            .await?
        {
            info!(group_id, "callback closed the group first, revoke skipped");
            return Ok(RevokeOutcome::AlreadyClosed);
        }

        let members_revoked = self.cancel_members(&meta).await?;
        // member states were rewritten after the close applied retention
        self.backend.retain(group_id).await?;
        let run_failed = self.fail_run(&meta, STUCK_EXECUTION_DETAIL).await?;
        warn!(
            group_id,
            run_id = %meta.run_id,
            members_revoked,
            run_failed,
            "stuck group revoked"
        );
        Ok(RevokeOutcome::Revoked {
            members_revoked,
            run_failed,
        })
    }

    /// Mark unfinished members revoked and tell every queue to drop them.
    ///
    /// A member is finished once its result is stored. The result is checked
    /// again after writing `revoked`, since a completion writes its result
    /// before its `done` state and may land in between.
    async fn cancel_members(&self, meta: &GroupMeta) -> Result<usize, MonitorError> {
        let group_id = &meta.group_id;
        let mut unit_ids = Vec::new();
        for member in &meta.members {
            if self.backend.result(group_id, &member.unit_id).await?.is_some() {
                continue;
            }
            self.backend
                .set_member_state(group_id, &member.unit_id, MemberState::Revoked)
                .await?;
            if self.backend.result(group_id, &member.unit_id).await?.is_some() {
                self.backend
                    .set_member_state(group_id, &member.unit_id, MemberState::Done)
                    .await?;
                continue;
            }
            unit_ids.push(member.unit_id.clone());
        }
        if !unit_ids.is_empty() {
            let notice = RevokeNotice {
                group_id: meta.group_id.clone(),
                unit_ids: unit_ids.clone(),
            };
            let delivered = self
                .backend
                .store()
                .publish(REVOKE_CHANNEL, &serde_json::to_string(&notice).map_err(StoreError::from)?)
                .await?;
            info!(group_id = %meta.group_id, members = unit_ids.len(), delivered, "revocation broadcast");
        }
        Ok(unit_ids.len())
    }

    /// Fail the owning run with whatever results did arrive
    async fn fail_run(&self, meta: &GroupMeta, detail: &str) -> Result<bool, MonitorError> {
        let raw = self.backend.results(meta).await?;
        let results = ResultCollector::normalize(&meta.members, raw);
        let passed = results.iter().filter(|r| r.is_success()).count();
        let finalization = RunFinalization {
            status: RunStatus::Failed,
            counts: RunCounts {
                total: results.len(),
                passed,
                failed: results.len() - passed,
            },
            results,
            error: Some(detail.to_string()),
        };

        let write = self
            .runs
            .finalize_run(&meta.run_id, Finalizer::HealthMonitor, finalization);
        let outcome = match meta.callback.tenant() {
            Ok(tenant) => tenant::scope(tenant, write).await,
            Err(_) => write.await,
        };
        match outcome {
            Ok(changed) => Ok(changed),
            Err(RunStoreError::NotFound(run_id)) => {
                warn!(run_id, "run for group not found, nothing to fail");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Per-member report for one group
    pub async fn inspect(&self, group_id: &str, verbose: bool) -> Result<InspectReport, MonitorError> {
        let meta = self
            .backend
            .meta(group_id)
            .await?
            .ok_or_else(|| MonitorError::UnknownGroup(group_id.to_string()))?;
        let group = self
            .health(&meta, self.config.stuck_threshold_minutes as f64, Utc::now())
            .await?;

        let mut members = Vec::with_capacity(meta.members.len());
        for member in &meta.members {
            let state = self.backend.member_state(group_id, &member.unit_id).await?;
            let result = if verbose {
                self.backend.result(group_id, &member.unit_id).await?
            } else {
                None
            };
            members.push(MemberReport {
                unit_id: member.unit_id.clone(),
                test_id: member.test_id.clone(),
                state,
                result,
            });
        }
        Ok(InspectReport {
            group,
            verbose,
            members,
        })
    }

    /// Emergency purge of every group; refuses without `force`
    pub async fn clean(&self, force: bool) -> Result<CleanReport, MonitorError> {
        if !force {
            return Ok(CleanReport {
                cancelled: true,
                ..CleanReport::default()
            });
        }

        let mut report = CleanReport::default();
        for meta in self.all_groups().await? {
            if self
                .backend
                .claim_close(&meta.group_id, CloseReason::Purged)
                .await?
            {
                report.members_revoked += self.cancel_members(&meta).await?;
                if self.fail_run(&meta, PURGED_EXECUTION_DETAIL).await? {
                    report.runs_failed += 1;
                }
            }
            report.keys_removed += self.backend.purge(&meta.group_id).await?;
            report.groups_purged += 1;
        }
        warn!(
            groups = report.groups_purged,
            members = report.members_revoked,
            runs = report.runs_failed,
            "emergency clean complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionUnit, TestRun, UnitResult};
    use crate::queue::GroupMember;
    use crate::runs::MemoryRunStore;
    use crate::store::MemoryStore;
    use crate::tenant::{TaskEnvelope, TenantContext};
    use chrono::Duration;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        runs: Arc<MemoryRunStore>,
        backend: ChordBackend,
        monitor: ChordMonitor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let runs = Arc::new(MemoryRunStore::new());
        Fixture {
            backend: ChordBackend::new(store.clone()),
            monitor: ChordMonitor::new(store.clone(), runs.clone(), MonitorConfig::default()),
            store,
            runs,
        }
    }

    /// Open a group with `n` members created `age_minutes` ago
    async fn open_group(fx: &Fixture, n: usize, age_minutes: i64) -> (GroupMeta, Vec<ExecutionUnit>) {
        let tenant = TenantContext::new("org", "user");
        let run_id = crate::utils::new_id();
        fx.runs
            .create_run(TestRun::new(&run_id, "cfg", tenant.clone(), n))
            .await
            .unwrap();
        fx.runs.mark_in_progress(&run_id).await.unwrap();

        let units: Vec<ExecutionUnit> = (0..n)
            .map(|i| ExecutionUnit::new(&run_id, format!("t{i}"), "target", tenant.clone()))
            .collect();
        let members: Vec<GroupMember> = units
            .iter()
            .map(|u| GroupMember {
                unit_id: u.id.clone(),
                test_id: u.test_id.clone(),
            })
            .collect();
        let meta = GroupMeta {
            group_id: crate::utils::new_id(),
            run_id: run_id.clone(),
            created_at: Utc::now() - Duration::minutes(age_minutes),
            members,
            callback: TaskEnvelope::schedule(json!({ "run_id": run_id }), Some(&tenant), None)
                .unwrap(),
        };
        fx.backend.open_group(&meta).await.unwrap();
        (meta, units)
    }

    #[tokio::test]
    async fn test_stuck_group_detected_and_revoked() {
        let fx = fixture();
        let (meta, _) = open_group(&fx, 3, 40).await;
        let (_fresh, _) = open_group(&fx, 1, 5).await;

        let status = fx.monitor.status().await.unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.stuck, 1);
        assert_eq!(status.open, 1);
        assert_eq!(status.exit_code(), EXIT_ISSUES);

        let check = fx.monitor.check(0.5).await.unwrap();
        assert_eq!(check.stuck.len(), 1);
        assert_eq!(check.stuck[0].group_id, meta.group_id);

        let report = fx.monitor.revoke(0.5, false).await.unwrap();
        assert_eq!(report.revoked(), 1);
        assert_eq!(report.exit_code(), EXIT_ISSUES);

        let run = fx.runs.get_run(&meta.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some(STUCK_EXECUTION_DETAIL));
        assert_eq!(run.counts.failed, 3);
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let fx = fixture();
        let (meta, _) = open_group(&fx, 2, 90).await;

        let first = fx.monitor.revoke_group(&meta.group_id, false).await.unwrap();
        assert!(matches!(first, RevokeOutcome::Revoked { members_revoked: 2, run_failed: true }));
        let ended = fx.runs.get_run(&meta.run_id).await.unwrap().unwrap().ended_at;

        let second = fx.monitor.revoke_group(&meta.group_id, false).await.unwrap();
        assert_eq!(second, RevokeOutcome::AlreadyClosed);
        let again = fx.monitor.revoke(0.5, false).await.unwrap();
        assert!(again.groups.is_empty());
        assert_eq!(again.exit_code(), EXIT_OK);

        let run = fx.runs.get_run(&meta.run_id).await.unwrap().unwrap();
        assert_eq!(run.ended_at, ended);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let fx = fixture();
        let (meta, units) = open_group(&fx, 2, 90).await;
        fx.backend
            .complete_member(&meta.group_id, &UnitResult::success(&units[0], json!({}), 1))
            .await
            .unwrap();

        let report = fx.monitor.revoke(0.5, true).await.unwrap();
        assert_eq!(
            report.groups[0].outcome,
            RevokeOutcome::WouldRevoke { members_in_flight: 1 }
        );
        assert!(fx.backend.closed_marker(&meta.group_id).await.unwrap().is_none());
        let run = fx.runs.get_run(&meta.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn test_callback_that_lands_first_wins() {
        let fx = fixture();
        let (meta, units) = open_group(&fx, 1, 90).await;
        fx.backend
            .complete_member(&meta.group_id, &UnitResult::success(&units[0], json!({}), 1))
            .await
            .unwrap();
        let marker = fx.backend.closed_marker(&meta.group_id).await.unwrap().unwrap();
        assert_eq!(marker.reason, CloseReason::Callback);

        let outcome = fx.monitor.revoke_group(&meta.group_id, false).await.unwrap();
        assert_eq!(outcome, RevokeOutcome::AlreadyClosed);
        assert_eq!(fx.monitor.check(0.5).await.unwrap().stuck.len(), 0);
    }

    #[tokio::test]
    async fn test_revoke_keeps_partial_results_and_broadcasts() {
        let fx = fixture();
        let (meta, units) = open_group(&fx, 3, 90).await;
        fx.backend
            .complete_member(&meta.group_id, &UnitResult::success(&units[1], json!({}), 1))
            .await
            .unwrap();
        let mut revocations = fx.store.subscribe(REVOKE_CHANNEL).await.unwrap();

        fx.monitor.revoke_group(&meta.group_id, false).await.unwrap();

        let notice: RevokeNotice =
            serde_json::from_str(&revocations.next().await.unwrap()).unwrap();
        assert_eq!(notice.unit_ids.len(), 2);
        assert!(!notice.unit_ids.contains(&units[1].id));

        let run = fx.runs.get_run(&meta.run_id).await.unwrap().unwrap();
        assert_eq!(run.counts.passed, 1);
        assert_eq!(run.counts.failed, 2);
        assert_eq!(
            fx.backend.member_state(&meta.group_id, &units[0].id).await.unwrap(),
            Some(MemberState::Revoked)
        );
    }

    #[tokio::test]
    async fn test_revoke_does_not_mark_finished_member_revoked() {
        let fx = fixture();
        let (meta, units) = open_group(&fx, 2, 90).await;
        // result stored but the done state not yet written
        fx.store
            .set(
                &format!("chord:{}:result:{}", meta.group_id, units[0].id),
                &serde_json::to_string(&UnitResult::success(&units[0], json!({}), 1)).unwrap(),
                None,
            )
            .await
            .unwrap();

        let outcome = fx.monitor.revoke_group(&meta.group_id, false).await.unwrap();
        assert!(matches!(outcome, RevokeOutcome::Revoked { members_revoked: 1, .. }));
        let inspect = fx.monitor.inspect(&meta.group_id, true).await.unwrap();
        assert_ne!(inspect.members[0].state, Some(MemberState::Revoked));
        assert!(inspect.members[0].result.is_some());
        assert_eq!(inspect.members[1].state, Some(MemberState::Revoked));
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_group_expires_after_retention() {
        let fx = fixture();
        let monitor = ChordMonitor::new(fx.store.clone(), fx.runs.clone(), MonitorConfig::default())
            .with_retention(std::time::Duration::from_secs(60));
        let (meta, _) = open_group(&fx, 2, 90).await;

        monitor.revoke_group(&meta.group_id, false).await.unwrap();
        assert_eq!(monitor.status().await.unwrap().closed, 1);

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        assert_eq!(monitor.status().await.unwrap().total, 0);
        assert!(fx.store.keys("chord:").await.unwrap().is_empty());
        let run = fx.runs.get_run(&meta.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_inspect_verbose_includes_results() {
        let fx = fixture();
        let (meta, units) = open_group(&fx, 2, 1).await;
        fx.backend
            .complete_member(&meta.group_id, &UnitResult::success(&units[0], json!({"ok": 1}), 1))
            .await
            .unwrap();

        let brief = fx.monitor.inspect(&meta.group_id, false).await.unwrap();
        assert!(brief.members.iter().all(|m| m.result.is_none()));
        assert_eq!(brief.exit_code(), EXIT_OK);

        let verbose = fx.monitor.inspect(&meta.group_id, true).await.unwrap();
        assert_eq!(verbose.members[0].state, Some(MemberState::Done));
        assert_eq!(verbose.members[0].result.as_ref().unwrap()["output"]["ok"], 1);
        assert_eq!(verbose.members[1].state, Some(MemberState::Queued));

        assert!(matches!(
            fx.monitor.inspect("missing", false).await,
            Err(MonitorError::UnknownGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_clean_requires_force() {
        let fx = fixture();
        let (meta, _) = open_group(&fx, 2, 1).await;

        let cancelled = fx.monitor.clean(false).await.unwrap();
        assert_eq!(cancelled.exit_code(), EXIT_CANCELLED);
        assert!(fx.backend.meta(&meta.group_id).await.unwrap().is_some());

        let report = fx.monitor.clean(true).await.unwrap();
        assert_eq!(report.groups_purged, 1);
        assert_eq!(report.members_revoked, 2);
        assert_eq!(report.runs_failed, 1);
        assert!(fx.backend.group_ids().await.unwrap().is_empty());

        let run = fx.runs.get_run(&meta.run_id).await.unwrap().unwrap();
        assert_eq!(run.error.as_deref(), Some(PURGED_EXECUTION_DETAIL));
    }
}
