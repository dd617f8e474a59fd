//! Shared coordination store
//!
//! Key/value with TTL expiry, atomic counters and publish/subscribe. This is
//! the only mutable resource shared between instances: connection markers,
//! RPC request/response channels and fan-in bookkeeping all live here.

mod memory;

pub use memory::{MemoryStore, StoreSnapshot};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Coordination store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Value at {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write `value`, replacing any previous value and TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Write `value` only if `key` is absent; returns whether it was written
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remove `key`; returns whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Reset the TTL of an existing key; returns whether it existed
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomically add `delta` (missing keys start at zero)
    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// All live keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Publish to `channel`; returns how many subscribers received it
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize>;

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;
}

/// Live subscription to one channel
pub struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    pub(crate) fn new(channel: impl Into<String>, receiver: broadcast::Receiver<String>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    /// Next message, or `None` once the channel is gone
    pub async fn next(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
