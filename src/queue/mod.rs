//! Task queue runtime
//!
//! Runs execution units on a bounded worker pool and tracks fan-in group
//! completion in the coordination store. The callback of a group is invoked
//! exactly once, by whichever member completion brings the outstanding
//! counter to zero.

mod backend;
mod worker;

pub use backend::{ChordBackend, CloseReason, GroupMember, GroupMeta, MemberState};
pub use worker::{ChordQueue, QueueConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ExecutionUnit, UnitResult};
use crate::tenant::TaskEnvelope;

/// Channel carrying revocation broadcasts to every queue
pub const REVOKE_CHANNEL: &str = "queue:revoke";

/// Executes one unit; implementations must always return a terminal result
#[async_trait]
pub trait UnitHandler: Send + Sync {
    async fn execute(&self, unit: ExecutionUnit) -> UnitResult;
}

/// Fan-in callback invoked once per group
#[async_trait]
pub trait ChordCallback: Send + Sync {
    /// `results` holds the raw stored member payloads, in no guaranteed order
    async fn on_group_complete(
        &self,
        callback: TaskEnvelope<serde_json::Value>,
        results: Vec<serde_json::Value>,
    );
}

/// Broadcast asking every queue to drop the listed members
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeNotice {
    pub group_id: String,
    pub unit_ids: Vec<String>,
}
