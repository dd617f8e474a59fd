//! Fan-in group bookkeeping
//!
//! Key layout in the coordination store:
//!
//! - `chord:{group}:meta`           group metadata and callback envelope
//! - `chord:{group}:pending`        outstanding member counter
//! - `chord:{group}:closed`         one-shot close marker (`set_nx`)
//! - `chord:{group}:member:{unit}`  member state
//! - `chord:{group}:result:{unit}`  member terminal result, written once
//!
//! Keys carry no TTL while the group is open. Closing the group puts the
//! retention TTL on all of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::UnitResult;
use crate::store::{CoordinationStore, StoreResult};
use crate::tenant::TaskEnvelope;

pub const GROUP_PREFIX: &str = "chord:";
const META_SUFFIX: &str = ":meta";

/// How long a closed group's keys stay readable
pub const DEFAULT_RESULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// One member of a fan-in group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub unit_id: String,
    pub test_id: String,
}

/// Everything needed to fire the callback without another lookup
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupMeta {
    pub group_id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub members: Vec<GroupMember>,
    pub callback: TaskEnvelope<serde_json::Value>,
}

/// Member lifecycle as seen by the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Queued,
    Running,
    Done,
    Revoked,
}

impl MemberState {
    fn as_str(&self) -> &'static str {
        match self {
            MemberState::Queued => "queued",
            MemberState::Running => "running",
            MemberState::Done => "done",
            MemberState::Revoked => "revoked",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(MemberState::Queued),
            "running" => Some(MemberState::Running),
            "done" => Some(MemberState::Done),
            "revoked" => Some(MemberState::Revoked),
            _ => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, MemberState::Queued | MemberState::Running)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who closed a group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// Last member completed and the callback fired
    Callback,
    /// Forced closed by the health monitor
    Revoked,
    /// Removed by an emergency clean
    Purged,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedMarker {
    pub reason: CloseReason,
    pub closed_at: DateTime<Utc>,
}

/// Result of recording one member completion
#[derive(Debug)]
pub enum Completion {
    /// Members still outstanding
    Pending(i64),
    /// This completion closed the group; fire the callback with these results
    Fire {
        meta: GroupMeta,
        results: Vec<serde_json::Value>,
    },
    /// Counter reached zero but the group was already closed
    AlreadyClosed,
    /// A result for this unit was already recorded
    Duplicate,
    /// Group metadata no longer exists
    Unknown,
}

/// Chord bookkeeping on top of a coordination store
#[derive(Clone)]
pub struct ChordBackend {
    store: Arc<dyn CoordinationStore>,
    retention: Duration,
}

impl ChordBackend {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            retention: DEFAULT_RESULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    fn key(group_id: &str, suffix: &str) -> String {
        format!("{GROUP_PREFIX}{group_id}:{suffix}")
    }

    fn member_key(group_id: &str, unit_id: &str) -> String {
        format!("{GROUP_PREFIX}{group_id}:member:{unit_id}")
    }

    fn result_key(group_id: &str, unit_id: &str) -> String {
        format!("{GROUP_PREFIX}{group_id}:result:{unit_id}")
    }

    /// Record the group, size the counter and mark every member queued.
    ///
    /// Metadata goes first: if a later write fails the group is still listed,
    /// ages into stuck and can be revoked.
    pub async fn open_group(&self, meta: &GroupMeta) -> StoreResult<()> {
        let encoded = serde_json::to_string(meta)?;
        self.store
            .set(&Self::key(&meta.group_id, "meta"), &encoded, None)
            .await?;
        self.store
            .set(
                &Self::key(&meta.group_id, "pending"),
                &meta.members.len().to_string(),
                None,
            )
            .await?;
        for member in &meta.members {
            self.set_member_state(&meta.group_id, &member.unit_id, MemberState::Queued)
                .await?;
        }
        debug!(
            group_id = %meta.group_id,
            run_id = %meta.run_id,
            members = meta.members.len(),
            "opened fan-in group"
        );
        Ok(())
    }

    pub async fn meta(&self, group_id: &str) -> StoreResult<Option<GroupMeta>> {
        match self.store.get(&Self::key(group_id, "meta")).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Ids of every group with metadata, sorted
    pub async fn group_ids(&self) -> StoreResult<Vec<String>> {
        let keys = self.store.keys(GROUP_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(GROUP_PREFIX))
            .filter_map(|rest| rest.strip_suffix(META_SUFFIX))
            .filter(|id| !id.contains(':'))
            .map(str::to_string)
            .collect())
    }

    pub async fn set_member_state(
        &self,
        group_id: &str,
        unit_id: &str,
        state: MemberState,
    ) -> StoreResult<()> {
        self.store
            .set(&Self::member_key(group_id, unit_id), state.as_str(), None)
            .await
    }

    pub async fn member_state(
        &self,
        group_id: &str,
        unit_id: &str,
    ) -> StoreResult<Option<MemberState>> {
        Ok(self
            .store
            .get(&Self::member_key(group_id, unit_id))
            .await?
            .and_then(|raw| MemberState::parse(&raw)))
    }

    pub async fn pending(&self, group_id: &str) -> StoreResult<i64> {
        Ok(self
            .store
            .get(&Self::key(group_id, "pending"))
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    pub async fn closed_marker(&self, group_id: &str) -> StoreResult<Option<ClosedMarker>> {
        match self.store.get(&Self::key(group_id, "closed")).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Move the group from open to closed. Only the first caller wins.
    pub async fn claim_close(&self, group_id: &str, reason: CloseReason) -> StoreResult<bool> {
        let marker = ClosedMarker {
            reason,
            closed_at: Utc::now(),
        };
        let claimed = self
            .store
            .set_nx(
                &Self::key(group_id, "closed"),
                &serde_json::to_string(&marker)?,
                None,
            )
            .await?;
        if claimed {
            info!(group_id, reason = ?reason, "fan-in group closed");
            // the claim stands even if the TTLs cannot be applied
            if let Err(err) = self.retain(group_id).await {
                warn!(group_id, error = %err, "failed to apply retention to closed group");
            }
        }
        Ok(claimed)
    }

    /// Put the retention TTL on every key of a group; returns how many
    pub async fn retain(&self, group_id: &str) -> StoreResult<usize> {
        let prefix = format!("{GROUP_PREFIX}{group_id}:");
        let mut retained = 0;
        for key in self.store.keys(&prefix).await? {
            if self.store.expire(&key, self.retention).await? {
                retained += 1;
            }
        }
        debug!(group_id, retained, retention_secs = self.retention.as_secs(), "group keys retained");
        Ok(retained)
    }

    async fn is_closed(&self, group_id: &str) -> StoreResult<bool> {
        self.store.exists(&Self::key(group_id, "closed")).await
    }

    /// Late writes to a closed group expire with it
    async fn retain_member(&self, group_id: &str, unit_id: &str) -> StoreResult<()> {
        self.store
            .expire(&Self::result_key(group_id, unit_id), self.retention)
            .await?;
        self.store
            .expire(&Self::member_key(group_id, unit_id), self.retention)
            .await?;
        Ok(())
    }

    /// Stored result for one member, as raw JSON
    pub async fn result(&self, group_id: &str, unit_id: &str) -> StoreResult<Option<serde_json::Value>> {
        Ok(self
            .store
            .get(&Self::result_key(group_id, unit_id))
            .await?
            .map(|raw| serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))))
    }

    /// Results in member order; members without a result yield `null`
    pub async fn results(&self, meta: &GroupMeta) -> StoreResult<Vec<serde_json::Value>> {
        let mut results = Vec::with_capacity(meta.members.len());
        for member in &meta.members {
            results.push(
                self.result(&meta.group_id, &member.unit_id)
                    .await?
                    .unwrap_or(serde_json::Value::Null),
            );
        }
        Ok(results)
    }

    /// Record a terminal member result and decrement the counter.
    ///
    /// The completion that brings the counter to zero claims the close marker
    /// and is the only one told to fire the callback.
    pub async fn complete_member(
        &self,
        group_id: &str,
        result: &UnitResult,
    ) -> StoreResult<Completion> {
        let encoded = serde_json::to_string(result)?;
        let first = self
            .store
            .set_nx(&Self::result_key(group_id, &result.unit_id), &encoded, None)
            .await?;
        if !first {
            warn!(group_id, unit_id = %result.unit_id, "duplicate member completion ignored");
            return Ok(Completion::Duplicate);
        }
        self.set_member_state(group_id, &result.unit_id, MemberState::Done)
            .await?;

        let remaining = self
            .store
            .incr_by(&Self::key(group_id, "pending"), -1)
            .await?;
        if remaining > 0 {
            if self.is_closed(group_id).await? {
                self.retain_member(group_id, &result.unit_id).await?;
            }
            return Ok(Completion::Pending(remaining));
        }

        let Some(meta) = self.meta(group_id).await? else {
            // metadata expired or was purged; drop what this completion wrote
            self.purge(group_id).await?;
            return Ok(Completion::Unknown);
        };
        if !self.claim_close(group_id, CloseReason::Callback).await? {
            self.retain_member(group_id, &result.unit_id).await?;
            return Ok(Completion::AlreadyClosed);
        }
        let results = self.results(&meta).await?;
        Ok(Completion::Fire { meta, results })
    }

    /// Delete every key belonging to a group
    pub async fn purge(&self, group_id: &str) -> StoreResult<usize> {
        let prefix = format!("{GROUP_PREFIX}{group_id}:");
        let keys = self.store.keys(&prefix).await?;
        let mut removed = 0;
        for key in keys {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
