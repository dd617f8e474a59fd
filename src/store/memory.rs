//! In-process coordination store
//!
//! Mutex-guarded key map with lazy TTL expiry on tokio's clock and a
//! broadcast channel per pub/sub channel. Cloning shares the same state, so
//! several simulated instances can point at one store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::{CoordinationStore, StoreError, StoreResult, Subscription};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    unavailable: AtomicBool,
}

/// Shared in-memory store
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

/// Serializable copy of the key space, used by the CLI state file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub entries: BTreeMap<String, SnapshotEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub value: String,
    /// Remaining TTL at snapshot time
    pub ttl_ms: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage; every operation fails while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked down".to_string()))
        } else {
            Ok(())
        }
    }

    fn entries(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.check_available()?;
        self.inner
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("entry map poisoned".to_string()))
    }

    fn channels(&self) -> StoreResult<MutexGuard<'_, HashMap<String, broadcast::Sender<String>>>> {
        self.check_available()?;
        self.inner
            .channels
            .lock()
            .map_err(|_| StoreError::Unavailable("channel map poisoned".to_string()))
    }

    /// Fetch a live entry, evicting it if expired
    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).map(|e| !e.is_live(now)).unwrap_or(false) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    pub fn snapshot(&self) -> StoreResult<StoreSnapshot> {
        let now = Instant::now();
        let entries = self.entries()?;
        let entries = entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| {
                let ttl_ms = entry
                    .expires_at
                    .map(|at| at.saturating_duration_since(now).as_millis() as u64);
                (
                    key.clone(),
                    SnapshotEntry {
                        value: entry.value.clone(),
                        ttl_ms,
                    },
                )
            })
            .collect();
        Ok(StoreSnapshot { entries })
    }

    /// Replace the key space with `snapshot`, aged by `elapsed` since it was
    /// taken; entries whose TTL ran out in the meantime are dropped.
    pub fn restore(&self, snapshot: StoreSnapshot, elapsed: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        entries.clear();
        for (key, entry) in snapshot.entries {
            let remaining = entry
                .ttl_ms
                .map(|ms| Duration::from_millis(ms).checked_sub(elapsed));
            let expires_at = match remaining {
                None => None,
                Some(Some(left)) if !left.is_zero() => Some(now + left),
                Some(_) => continue,
            };
            entries.insert(
                key,
                Entry {
                    value: entry.value,
                    expires_at,
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        self.entries()?.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries()?;
        Ok(Self::live(&mut entries, key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.entries()?;
        Ok(Self::live(&mut entries, key, Instant::now()).is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        Ok(entries.remove(key).map(|e| e.is_live(now)).unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        match Self::live(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        let current = match Self::live(&mut entries, key, now) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::NotAnInteger {
                    key: key.to_string(),
                })?,
            None => 0,
        };
        let next = current + delta;
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        entries.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        let mut channels = self.channels()?;
        let delivered = match channels.get(channel) {
            Some(sender) => sender.send(message.to_string()).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            channels.remove(channel);
        }
        debug!(channel, delivered, "published message");
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut channels = self.channels()?;
        channels.retain(|_, sender| sender.receiver_count() > 0);
        let receiver = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(Subscription::new(channel, receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_and_refresh() {
        let store = MemoryStore::new();
        store
            .set("conn:a", "instance-1", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(store.exists("conn:a").await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.expire("conn:a", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.exists("conn:a").await.unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!store.exists("conn:a").await.unwrap());
        assert!(!store.expire("conn:a", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_claims_once() {
        let store = MemoryStore::new();
        assert!(store.set_nx("claim", "first", None).await.unwrap());
        assert!(!store.set_nx("claim", "second", None).await.unwrap());
        assert_eq!(store.get("claim").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_counter() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("pending", 3).await.unwrap(), 3);
        assert_eq!(store.incr_by("pending", -1).await.unwrap(), 2);
        store.set("text", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr_by("text", 1).await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test]
    async fn test_pubsub_delivery() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("chan", "lost").await.unwrap(), 0);

        let mut first = store.subscribe("chan").await.unwrap();
        let mut second = store.subscribe("chan").await.unwrap();
        assert_eq!(store.publish("chan", "hello").await.unwrap(), 2);
        assert_eq!(first.next().await.as_deref(), Some("hello"));
        assert_eq!(second.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let store = MemoryStore::new();
        store.set("chord:b:meta", "{}", None).await.unwrap();
        store.set("chord:a:meta", "{}", None).await.unwrap();
        store.set("conn:x", "i", None).await.unwrap();
        let keys = store.keys("chord:").await.unwrap();
        assert_eq!(keys, vec!["chord:a:meta", "chord:b:meta"]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("x").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        store
            .set("ttl", "v", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let snapshot = store.snapshot().unwrap();

        let restored = MemoryStore::new();
        restored.restore(snapshot.clone(), Duration::ZERO).unwrap();
        assert_eq!(restored.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(restored.exists("ttl").await.unwrap());

        // an hour between processes outlives the 60s TTL
        let later = MemoryStore::new();
        later.restore(snapshot, Duration::from_secs(3600)).unwrap();
        assert!(later.exists("k").await.unwrap());
        assert!(!later.exists("ttl").await.unwrap());
    }
}
