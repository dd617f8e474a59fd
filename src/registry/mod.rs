//! Connection registry
//!
//! Two tiers: the instance's own map of live client connections, which is
//! authoritative for that instance, and a TTL record per connection in the
//! coordination store, which is how every other instance learns who owns it.
//! A local miss never means "not connected anywhere".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{CoordinationStore, StoreResult};

pub const CONNECTION_PREFIX: &str = "conn:";

/// Logical connection key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub subject: String,
    pub environment: String,
}

impl ConnectionKey {
    pub fn new(subject: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            environment: environment.into(),
        }
    }

    pub fn store_key(&self) -> String {
        format!("{CONNECTION_PREFIX}{}:{}", self.subject, self.environment)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject, self.environment)
    }
}

/// Errors raised by a live client connection
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Capability failed: {0}")]
    Failed(String),
}

/// A long-lived connection to a client that exposes capabilities
#[async_trait]
pub trait ClientConnection: Send + Sync {
    async fn invoke(
        &self,
        capability: &str,
        inputs: serde_json::Value,
    ) -> Result<serde_json::Value, ConnectionError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Lifetime of the mirrored record without a refresh
    pub ttl_secs: u64,
    /// How often held connections refresh their record
    pub refresh_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            refresh_interval_secs: 300,
        }
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Where a connection is held, from this instance's point of view
#[derive(Clone)]
pub enum Locality {
    Local(Arc<dyn ClientConnection>),
    /// Held by the named instance
    Remote(String),
    Absent,
}

type LocalMap = HashMap<ConnectionKey, Arc<dyn ClientConnection>>;

pub struct ConnectionRegistry {
    instance_id: String,
    store: Arc<dyn CoordinationStore>,
    config: RegistryConfig,
    local: RwLock<LocalMap>,
}

impl ConnectionRegistry {
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            config,
            local: RwLock::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LocalMap> {
        self.local.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LocalMap> {
        self.local.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold a new connection locally and advertise it.
    ///
    /// Returns whether the record was mirrored; the local entry is kept
    /// either way.
    pub async fn register(&self, key: ConnectionKey, connection: Arc<dyn ClientConnection>) -> bool {
        self.write().insert(key.clone(), connection);
        match self
            .store
            .set(&key.store_key(), &self.instance_id, Some(self.config.ttl()))
            .await
        {
            Ok(()) => {
                info!(connection = %key, instance_id = %self.instance_id, "connection registered");
                true
            }
            Err(err) => {
                warn!(
                    connection = %key,
                    error = %err,
                    "connection held locally only, other instances cannot reach it"
                );
                false
            }
        }
    }

    /// Drop a connection on graceful disconnect.
    ///
    /// The mirrored record is only removed while it still names this
    /// instance, so a reconnect elsewhere is not clobbered.
    pub async fn unregister(&self, key: &ConnectionKey) -> bool {
        let removed = self.write().remove(key).is_some();
        let store_key = key.store_key();
        match self.store.get(&store_key).await {
            Ok(Some(owner)) if owner == self.instance_id => {
                if let Err(err) = self.store.delete(&store_key).await {
                    warn!(connection = %key, error = %err, "failed to delete connection record");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(connection = %key, error = %err, "failed to read connection record"),
        }
        if removed {
            info!(connection = %key, instance_id = %self.instance_id, "connection unregistered");
        }
        removed
    }

    pub fn local(&self, key: &ConnectionKey) -> Option<Arc<dyn ClientConnection>> {
        self.read().get(key).cloned()
    }

    pub fn local_keys(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<_> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Where `key` is held; a record naming this instance with nothing
    /// behind it is stale and reads as absent
    pub async fn lookup(&self, key: &ConnectionKey) -> StoreResult<Locality> {
        if let Some(connection) = self.local(key) {
            return Ok(Locality::Local(connection));
        }
        match self.store.get(&key.store_key()).await? {
            Some(owner) if owner == self.instance_id => {
                debug!(connection = %key, "stale record for this instance ignored");
                Ok(Locality::Absent)
            }
            Some(owner) => Ok(Locality::Remote(owner)),
            None => Ok(Locality::Absent),
        }
    }

    /// Best effort: a store failure reads as not connected
    pub async fn is_connected(&self, key: &ConnectionKey) -> bool {
        let held = self.read().contains_key(key);
        if held {
            return true;
        }
        match self.store.exists(&key.store_key()).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!(connection = %key, error = %err, "cannot reach coordination store, reporting not connected");
                false
            }
        }
    }

    /// Refresh the TTL of every held connection, recreating lapsed records
    pub async fn refresh(&self) -> StoreResult<usize> {
        let ttl = self.config.ttl();
        let keys = self.local_keys();
        for key in &keys {
            let store_key = key.store_key();
            if !self.store.expire(&store_key, ttl).await? {
                debug!(connection = %key, "connection record lapsed, recreating");
                self.store.set(&store_key, &self.instance_id, Some(ttl)).await?;
            }
        }
        Ok(keys.len())
    }

    /// Periodic [`refresh`](Self::refresh) until shutdown
    pub fn spawn_keepalive(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = Duration::from_secs(self.config.refresh_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => match registry.refresh().await {
                        Ok(count) => debug!(instance_id = %registry.instance_id, count, "connection records refreshed"),
                        Err(err) => warn!(instance_id = %registry.instance_id, error = %err, "connection keepalive failed"),
                    },
                    _ = shutdown.changed() => {
                        info!(instance_id = %registry.instance_id, "stopping connection keepalive");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct Echo;

    #[async_trait]
    impl ClientConnection for Echo {
        async fn invoke(
            &self,
            _capability: &str,
            inputs: serde_json::Value,
        ) -> Result<serde_json::Value, ConnectionError> {
            Ok(inputs)
        }
    }

    fn pair(config: RegistryConfig) -> (Arc<MemoryStore>, ConnectionRegistry, ConnectionRegistry) {
        let store = Arc::new(MemoryStore::new());
        let a = ConnectionRegistry::new("instance-a", store.clone(), config.clone());
        let b = ConnectionRegistry::new("instance-b", store.clone(), config);
        (store, a, b)
    }

    fn key() -> ConnectionKey {
        ConnectionKey::new("proj1", "staging")
    }

    #[tokio::test]
    async fn test_register_visible_on_both_instances() {
        let (_store, a, b) = pair(RegistryConfig::default());
        assert!(a.register(key(), Arc::new(Echo)).await);

        assert!(a.is_connected(&key()).await);
        assert!(b.is_connected(&key()).await);
        assert!(b.local(&key()).is_none());
        assert!(matches!(b.lookup(&key()).await.unwrap(), Locality::Remote(owner) if owner == "instance-a"));
        assert!(matches!(a.lookup(&key()).await.unwrap(), Locality::Local(_)));

        assert!(a.unregister(&key()).await);
        assert!(!a.is_connected(&key()).await);
        assert!(!b.is_connected(&key()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_without_refresh() {
        let config = RegistryConfig {
            ttl_secs: 30,
            refresh_interval_secs: 10,
        };
        let (_store, a, b) = pair(config);
        a.register(key(), Arc::new(Echo)).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!b.is_connected(&key()).await);
        // local copy stays authoritative for its own instance
        assert!(a.is_connected(&key()).await);

        assert_eq!(a.refresh().await.unwrap(), 1);
        assert!(b.is_connected(&key()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_keeps_record_alive() {
        let config = RegistryConfig {
            ttl_secs: 30,
            refresh_interval_secs: 10,
        };
        let (_store, a, b) = pair(config);
        let a = Arc::new(a);
        a.register(key(), Arc::new(Echo)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let keepalive = a.spawn_keepalive(shutdown_rx);

        for _ in 0..12 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert!(b.is_connected(&key()).await);
        }

        shutdown_tx.send(true).unwrap();
        keepalive.await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_leaves_foreign_record() {
        let (store, a, b) = pair(RegistryConfig::default());
        a.register(key(), Arc::new(Echo)).await;
        // reconnect landed on b
        b.register(key(), Arc::new(Echo)).await;

        assert!(a.unregister(&key()).await);
        assert_eq!(
            store.get(&key().store_key()).await.unwrap().as_deref(),
            Some("instance-b")
        );
    }

    #[tokio::test]
    async fn test_store_outage_degrades_to_local() {
        let (store, a, b) = pair(RegistryConfig::default());
        store.set_unavailable(true);
        assert!(!a.register(key(), Arc::new(Echo)).await);
        assert!(a.is_connected(&key()).await);
        assert!(!b.is_connected(&key()).await);
        assert!(b.lookup(&key()).await.is_err());
    }
}
