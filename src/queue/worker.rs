//! Worker pool
//!
//! Members are spawned onto tokio tasks and gated by a semaphore sized to the
//! configured concurrency. Each member runs inside its tenant scope under a
//! hard time limit, then records its terminal result with the chord backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::backend::{
    ChordBackend, CloseReason, Completion, GroupMeta, MemberState, DEFAULT_RESULT_RETENTION,
};
use super::{ChordCallback, RevokeNotice, UnitHandler, REVOKE_CHANNEL};
use crate::models::{ExecutionUnit, FailureKind, UnitResult};
use crate::store::{CoordinationStore, StoreResult};
use crate::tenant::{self, TaskEnvelope};
use crate::utils::Timer;

/// Worker pool settings
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub hard_time_limit: Duration,
    /// Lifetime of a group's keys once it closes
    pub result_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            hard_time_limit: Duration::from_secs(600),
            result_retention: DEFAULT_RESULT_RETENTION,
        }
    }
}

/// Queue runtime with chord support
#[derive(Clone)]
pub struct ChordQueue {
    backend: ChordBackend,
    handler: Arc<dyn UnitHandler>,
    callback: Arc<dyn ChordCallback>,
    semaphore: Arc<Semaphore>,
    config: QueueConfig,
    in_flight: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl ChordQueue {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        handler: Arc<dyn UnitHandler>,
        callback: Arc<dyn ChordCallback>,
        config: QueueConfig,
    ) -> Self {
        Self {
            backend: ChordBackend::new(store).with_retention(config.result_retention),
            handler,
            callback,
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn backend(&self) -> &ChordBackend {
        &self.backend
    }

    /// Members spawned on this queue that have not finished
    pub fn in_flight(&self) -> usize {
        self.in_flight_guard().len()
    }

    fn in_flight_guard(&self) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the group and enqueue every member.
    ///
    /// Returns once members are enqueued; the callback runs later, on the
    /// task that completes the last member.
    pub async fn submit_chord(
        &self,
        meta: GroupMeta,
        members: Vec<TaskEnvelope<ExecutionUnit>>,
    ) -> StoreResult<()> {
        self.backend.open_group(&meta).await?;
        info!(
            group_id = %meta.group_id,
            run_id = %meta.run_id,
            members = members.len(),
            "submitted chord"
        );

        if members.is_empty() {
            if self
                .backend
                .claim_close(&meta.group_id, CloseReason::Callback)
                .await?
            {
                self.fire(meta, Vec::new()).await;
            }
            return Ok(());
        }

        let mut in_flight = self.in_flight_guard();
        for envelope in members {
            let unit_id = envelope.args.id.clone();
            let queue = self.clone();
            let group_id = meta.group_id.clone();
            let handle = tokio::spawn(async move { queue.run_member(group_id, envelope).await });
            in_flight.insert(unit_id, handle.abort_handle());
        }
        Ok(())
    }

    async fn run_member(self, group_id: String, envelope: TaskEnvelope<ExecutionUnit>) {
        let unit = envelope.args.clone();
        let Ok(_permit) = self.semaphore.clone().acquire_owned().await else {
            warn!(unit_id = %unit.id, "worker pool closed, member dropped");
            return;
        };

        if self.is_revoked(&group_id, &unit.id).await {
            debug!(group_id, unit_id = %unit.id, "skipping revoked member");
            self.forget(&unit.id);
            return;
        }

        if let Err(err) = self
            .backend
            .set_member_state(&group_id, &unit.id, MemberState::Running)
            .await
        {
            warn!(unit_id = %unit.id, error = %err, "failed to mark member running");
        }

        let timer = Timer::start(format!("unit {}", unit.id));
        let result = match envelope.tenant() {
            Ok(tenant) => {
                let execution = tenant::scope(tenant, self.handler.execute(unit.clone()));
                match tokio::time::timeout(self.config.hard_time_limit, execution).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            unit_id = %unit.id,
                            limit_ms = self.config.hard_time_limit.as_millis() as u64,
                            "hard time limit exceeded, member terminated"
                        );
                        UnitResult::failure(
                            &unit,
                            FailureKind::HardTimeLimit,
                            format!(
                                "hard time limit of {:?} exceeded",
                                self.config.hard_time_limit
                            ),
                            timer.elapsed_ms(),
                        )
                    }
                }
            }
            Err(err) => UnitResult::failure(&unit, FailureKind::NonRetryable, err.to_string(), 0),
        };
        timer.stop();

        self.record(&group_id, result).await;
        self.forget(&unit.id);
    }

    async fn is_revoked(&self, group_id: &str, unit_id: &str) -> bool {
        match self.backend.member_state(group_id, unit_id).await {
            Ok(Some(MemberState::Revoked)) => true,
            Ok(_) => false,
            Err(err) => {
                warn!(unit_id, error = %err, "could not read member state, running anyway");
                false
            }
        }
    }

    fn forget(&self, unit_id: &str) {
        self.in_flight_guard().remove(unit_id);
    }

    async fn record(&self, group_id: &str, result: UnitResult) {
        match self.backend.complete_member(group_id, &result).await {
            Ok(Completion::Fire { meta, results }) => self.fire(meta, results).await,
            Ok(Completion::Pending(remaining)) => {
                debug!(group_id, unit_id = %result.unit_id, remaining, "member recorded");
            }
            Ok(Completion::AlreadyClosed) => {
                info!(group_id, "group already closed, callback suppressed");
            }
            Ok(Completion::Duplicate) => {}
            Ok(Completion::Unknown) => {
                warn!(group_id, "completion for unknown group");
            }
            Err(err) => {
                error!(
                    group_id,
                    unit_id = %result.unit_id,
                    error = %err,
                    "failed to record member result, group may stall"
                );
            }
        }
    }

    async fn fire(&self, meta: GroupMeta, results: Vec<serde_json::Value>) {
        let callback = meta.callback;
        match callback.tenant() {
            Ok(tenant) => {
                info!(group_id = %meta.group_id, run_id = %meta.run_id, "firing chord callback");
                tenant::scope(tenant, self.callback.on_group_complete(callback, results)).await;
            }
            Err(err) => {
                error!(group_id = %meta.group_id, error = %err, "callback envelope has no tenant, not run");
            }
        }
    }

    /// Abort the listed members if this queue is running them
    pub fn apply_revoke(&self, notice: &RevokeNotice) -> usize {
        let mut in_flight = self.in_flight_guard();
        let mut aborted = 0;
        for unit_id in &notice.unit_ids {
            if let Some(handle) = in_flight.remove(unit_id) {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            info!(group_id = %notice.group_id, aborted, "revoked in-flight members");
        }
        aborted
    }

    /// Listen for revocation broadcasts until shutdown
    pub async fn start_revoke_listener(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> StoreResult<JoinHandle<()>> {
        let mut subscription = self.backend.store().subscribe(REVOKE_CHANNEL).await?;
        let queue = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = subscription.next() => match message {
                        Some(raw) => match serde_json::from_str::<RevokeNotice>(&raw) {
                            Ok(notice) => {
                                queue.apply_revoke(&notice);
                            }
                            Err(err) => warn!(error = %err, "failed to decode revoke notice"),
                        },
                        None => {
                            warn!("revoke subscription ended");
                            break;
                        }
                    },
                    _ = shutdown.changed() => {
                        info!("shutdown signal, stopping revoke listener");
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::GroupMember;
    use crate::store::MemoryStore;
    use crate::tenant::TenantContext;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Sleeps a per-test amount, then succeeds with the tenant it observed
    struct SleepyHandler {
        delays_ms: HashMap<String, u64>,
    }

    #[async_trait]
    impl UnitHandler for SleepyHandler {
        async fn execute(&self, unit: ExecutionUnit) -> UnitResult {
            let delay = self.delays_ms.get(&unit.test_id).copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let org = tenant::current().map(|t| t.organization_id);
            UnitResult::success(&unit, json!({ "org": org }), delay)
        }
    }

    struct RecordingCallback {
        calls: AtomicUsize,
        tx: mpsc::UnboundedSender<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl ChordCallback for RecordingCallback {
        async fn on_group_complete(
            &self,
            _callback: TaskEnvelope<serde_json::Value>,
            results: Vec<serde_json::Value>,
        ) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.send(results);
        }
    }

    fn tenant() -> TenantContext {
        TenantContext::new("org-1", "user-1")
    }

    fn chord(tests: &[&str]) -> (GroupMeta, Vec<TaskEnvelope<ExecutionUnit>>) {
        let envelopes: Vec<_> = tests
            .iter()
            .map(|t| {
                let unit = ExecutionUnit::new("run-1", *t, "target", tenant());
                TaskEnvelope::schedule(unit, Some(&tenant()), None).unwrap()
            })
            .collect();
        let meta = GroupMeta {
            group_id: crate::utils::new_id(),
            run_id: "run-1".to_string(),
            created_at: Utc::now(),
            members: envelopes
                .iter()
                .map(|e| GroupMember {
                    unit_id: e.args.id.clone(),
                    test_id: e.args.test_id.clone(),
                })
                .collect(),
            callback: TaskEnvelope::schedule(json!({"run_id": "run-1"}), Some(&tenant()), None)
                .unwrap(),
        };
        (meta, envelopes)
    }

    fn queue(
        delays: &[(&str, u64)],
        hard_limit: Duration,
    ) -> (
        ChordQueue,
        Arc<RecordingCallback>,
        mpsc::UnboundedReceiver<Vec<serde_json::Value>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = Arc::new(RecordingCallback {
            calls: AtomicUsize::new(0),
            tx,
        });
        let handler = Arc::new(SleepyHandler {
            delays_ms: delays.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        });
        let queue = ChordQueue::new(
            Arc::new(MemoryStore::new()),
            handler,
            callback.clone(),
            QueueConfig {
                concurrency: 3,
                hard_time_limit: hard_limit,
                ..QueueConfig::default()
            },
        );
        (queue, callback, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_runs_exactly_once_regardless_of_order() {
        let delays = [("a", 50), ("b", 10), ("c", 30), ("d", 5), ("e", 40)];
        let (queue, callback, mut rx) = queue(&delays, Duration::from_secs(60));
        let (meta, members) = chord(&["a", "b", "c", "d", "e"]);

        queue.submit_chord(meta, members).await.unwrap();
        let results = rx.recv().await.unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r["status"] == "success"));
        assert!(results.iter().all(|r| r["output"]["org"] == "org-1"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(callback.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_empty_group_fires_immediately() {
        let (queue, callback, mut rx) = queue(&[], Duration::from_secs(60));
        let (meta, members) = chord(&[]);
        queue.submit_chord(meta, members).await.unwrap();
        assert!(rx.recv().await.unwrap().is_empty());
        assert_eq!(callback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_time_limit_produces_terminal_failure() {
        let (queue, _callback, mut rx) = queue(&[("slow", 10_000)], Duration::from_millis(100));
        let (meta, members) = chord(&["slow", "fast"]);
        queue.submit_chord(meta, members).await.unwrap();

        let results = rx.recv().await.unwrap();
        let slow = results
            .iter()
            .find(|r| r["test_id"] == "slow")
            .unwrap();
        assert_eq!(slow["status"], "failure");
        assert_eq!(slow["kind"], "hard_time_limit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_members_are_aborted_and_callback_suppressed() {
        let (queue, callback, _rx) = queue(&[("a", 10_000), ("b", 10_000)], Duration::from_secs(60));
        let (meta, members) = chord(&["a", "b"]);
        let group_id = meta.group_id.clone();
        let unit_ids: Vec<String> = meta.members.iter().map(|m| m.unit_id.clone()).collect();
        queue.submit_chord(meta, members).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.in_flight(), 2);

        assert!(queue
            .backend()
            .claim_close(&group_id, CloseReason::Revoked)
            .await
            .unwrap());
        let aborted = queue.apply_revoke(&RevokeNotice {
            group_id,
            unit_ids,
        });
        assert_eq!(aborted, 2);
        assert_eq!(queue.in_flight(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(callback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_revoke_listener_receives_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let queue = ChordQueue::new(
            store.clone(),
            Arc::new(SleepyHandler {
                delays_ms: HashMap::from([("a".to_string(), 60_000)]),
            }),
            Arc::new(RecordingCallback {
                calls: AtomicUsize::new(0),
                tx,
            }),
            QueueConfig::default(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = queue.start_revoke_listener(shutdown_rx).await.unwrap();

        let (meta, members) = chord(&["a"]);
        let notice = RevokeNotice {
            group_id: meta.group_id.clone(),
            unit_ids: vec![meta.members[0].unit_id.clone()],
        };
        queue.submit_chord(meta, members).await.unwrap();
        assert_eq!(queue.in_flight(), 1);

        let delivered = store
            .publish(REVOKE_CHANNEL, &serde_json::to_string(&notice).unwrap())
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        for _ in 0..50 {
            if queue.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.in_flight(), 0);

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap();
    }
}
