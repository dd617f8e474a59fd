//! Execution task
//!
//! Runs one test against one target. Whatever the target does (errors,
//! panics, hangs past the soft limit) the task hands back a terminal
//! [`UnitResult`]; nothing escapes to the queue.

use async_trait::async_trait;
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{ExecutionUnit, FailureKind, UnitResult};
use crate::queue::UnitHandler;
use crate::tenant;
use crate::utils::Timer;

/// Error from one attempt against a test target
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Worth retrying
    #[error("{0}")]
    Transient(String),

    /// Retrying cannot help
    #[error("{0}")]
    Fatal(String),
}

/// The thing a test runs against
#[async_trait]
pub trait TestTarget: Send + Sync {
    async fn execute(&self, unit: &ExecutionUnit) -> Result<serde_json::Value, ExecError>;

    /// Cleanup hook run once when the soft time limit interrupts the unit
    async fn on_soft_timeout(&self, _unit: &ExecutionUnit) {}
}

/// Bounded exponential backoff
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Capped backoff before retry number `attempt + 1`
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.min(20);
        self.base_delay_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_delay_ms)
    }

    /// Backoff with jitter in [50%, 100%] of the capped value
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.backoff_ms(attempt);
        if !self.jitter || capped <= 1 {
            return Duration::from_millis(capped);
        }
        let low = capped / 2;
        Duration::from_millis(rand::rng().random_range(low..=capped))
    }
}

/// Queue handler wrapping a [`TestTarget`] with retry and a soft time limit
pub struct ExecutionTask {
    target: Arc<dyn TestTarget>,
    retry: RetryPolicy,
    soft_time_limit: Duration,
}

impl ExecutionTask {
    pub fn new(target: Arc<dyn TestTarget>, retry: RetryPolicy, soft_time_limit: Duration) -> Self {
        Self {
            target,
            retry,
            soft_time_limit,
        }
    }

    async fn run_attempts(
        &self,
        unit: &ExecutionUnit,
        attempts: &AtomicU32,
    ) -> Result<serde_json::Value, (FailureKind, String)> {
        let mut current = unit.clone();
        loop {
            attempts.store(current.retry_count + 1, Ordering::SeqCst);
            let outcome = AssertUnwindSafe(self.target.execute(&current))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(ExecError::Fatal(message))) => {
                    warn!(unit_id = %unit.id, error = %message, "non-retryable failure");
                    return Err((FailureKind::NonRetryable, message));
                }
                Ok(Err(ExecError::Transient(message))) => {
                    if current.retry_count >= self.retry.max_retries {
                        warn!(
                            unit_id = %unit.id,
                            attempts = current.retry_count + 1,
                            error = %message,
                            "retries exhausted"
                        );
                        return Err((FailureKind::Exhausted, message));
                    }
                    let delay = self.retry.delay_for(current.retry_count);
                    debug!(
                        unit_id = %unit.id,
                        retry = current.retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    current.retry_count += 1;
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(unit_id = %unit.id, panic = %message, "test target panicked");
                    return Err((FailureKind::Panicked, message));
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[async_trait]
impl UnitHandler for ExecutionTask {
    async fn execute(&self, unit: ExecutionUnit) -> UnitResult {
        if tenant::current().is_none() {
            warn!(unit_id = %unit.id, "executing without an active tenant scope");
        }
        let timer = Timer::start(format!("unit {}", unit.id));
        let attempts = AtomicU32::new(1);

        let outcome =
            match tokio::time::timeout(self.soft_time_limit, self.run_attempts(&unit, &attempts))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(unit_id = %unit.id, "soft time limit exceeded, running cleanup");
                    let _ = AssertUnwindSafe(self.target.on_soft_timeout(&unit))
                        .catch_unwind()
                        .await;
                    Err((
                        FailureKind::SoftTimeLimit,
                        format!("soft time limit of {:?} exceeded", self.soft_time_limit),
                    ))
                }
            };

        let duration_ms = timer.stop();
        let mut result = match outcome {
            Ok(output) => UnitResult::success(&unit, output, duration_ms),
            Err((kind, message)) => UnitResult::failure(&unit, kind, message, duration_ms),
        };
        result.attempts = attempts.load(Ordering::SeqCst);
        info!(unit_id = %unit.id, test_id = %unit.test_id, "{}", result);
        result
    }
}
