//! Cross-instance invocation router
//!
//! A capability call goes straight to the connection when this instance
//! holds it. Otherwise the request is published on the shared request
//! channel and the caller waits on a response channel scoped to a fresh
//! exchange id; only the owning instance answers.

mod messages;

pub use messages::{
    response_channel, ErrorDetail, InvocationRequest, InvocationResult, RpcRequest, RpcResponse,
    RpcResult, DEFAULT_REQUEST_CHANNEL,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::{ConnectionError, ConnectionKey, ConnectionRegistry, Locality};
use crate::store::{CoordinationStore, StoreError, StoreResult};
use crate::utils::Timer;

/// Routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// No instance holds the connection
    #[error("No instance holds a connection for {0}")]
    NotConnected(ConnectionKey),

    /// An owner exists but did not answer in time
    #[error("No response for {key} within {timeout_ms}ms")]
    Timeout { key: ConnectionKey, timeout_ms: u64 },

    #[error("Invocation failed: {0}")]
    Connection(#[from] ConnectionError),

    /// Error relayed from the owning instance
    #[error("{code}: {message}")]
    Remote { code: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RouterError {
    /// Stable code returned to callers
    pub fn code(&self) -> &str {
        match self {
            RouterError::NotConnected(_) => "sdk_not_connected",
            RouterError::Timeout { .. } => "sdk_timeout",
            RouterError::Connection(_) => "sdk_invocation_failed",
            RouterError::Remote { code, .. } => code,
            RouterError::Store(_) => "coordination_store_unavailable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Single hard timeout on the cross-instance wait
    pub timeout_ms: u64,
    pub request_channel: String,
    /// Background runners never hold connections and always route remotely
    pub holds_connections: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            request_channel: DEFAULT_REQUEST_CHANNEL.to_string(),
            holds_connections: true,
        }
    }
}

impl RouterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub struct InvocationRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn CoordinationStore>,
    config: RouterConfig,
}

impl InvocationRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn CoordinationStore>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Invoke and fold the outcome into a result object
    pub async fn invoke(&self, request: InvocationRequest) -> InvocationResult {
        let key = request.key();
        let timer = Timer::start(format!("invoke {key} {}", request.capability_name));
        let outcome = self
            .route(&key, &request.capability_name, request.inputs)
            .await;
        let duration_ms = timer.stop();
        match outcome {
            Ok(output) => InvocationResult::success(output, duration_ms),
            Err(err) => {
                debug!(connection = %key, code = err.code(), error = %err, "invocation failed");
                InvocationResult::error(err.code(), err.to_string(), duration_ms)
            }
        }
    }

    /// Dispatch by locality: held here, held by a named instance, or nowhere.
    ///
    /// A record naming this instance without a live local connection is left
    /// over from a restart and counts as nowhere.
    pub async fn route(
        &self,
        key: &ConnectionKey,
        capability: &str,
        inputs: serde_json::Value,
    ) -> Result<serde_json::Value, RouterError> {
        let locality = self
            .registry
            .lookup(key)
            .await
            .map_err(|err| Self::store_down(key, err))?;
        match locality {
            Locality::Local(connection) if self.config.holds_connections => {
                debug!(connection = %key, capability, "dispatching locally");
                Ok(connection.invoke(capability, inputs).await?)
            }
            Locality::Local(_) | Locality::Absent => Err(RouterError::NotConnected(key.clone())),
            Locality::Remote(owner) => match self.remote(key, &owner, capability, inputs).await {
                Err(RouterError::Store(err)) => Err(Self::store_down(key, err)),
                other => other,
            },
        }
    }

    fn store_down(key: &ConnectionKey, err: StoreError) -> RouterError {
        warn!(
            connection = %key,
            error = %err,
            "coordination store unavailable, only local connections reachable"
        );
        RouterError::Store(err)
    }

    async fn remote(
        &self,
        key: &ConnectionKey,
        owner: &str,
        capability: &str,
        inputs: serde_json::Value,
    ) -> Result<serde_json::Value, RouterError> {
        let exchange_id = crate::utils::new_id();
        // subscribe before publishing so the answer cannot be missed
        let mut responses = self.store.subscribe(&response_channel(&exchange_id)).await?;
        let request = RpcRequest {
            exchange_id: exchange_id.clone(),
            target: key.clone(),
            capability: capability.to_string(),
            inputs,
            origin_instance: self.registry.instance_id().to_string(),
        };
        let encoded = serde_json::to_string(&request).map_err(StoreError::from)?;
        let delivered = self
            .store
            .publish(&self.config.request_channel, &encoded)
            .await?;
        if delivered == 0 {
            warn!(exchange_id, connection = %key, "no instance listening for requests");
            return Err(RouterError::NotConnected(key.clone()));
        }
        debug!(exchange_id, connection = %key, owner, delivered, "request published");

        let wait = async {
            while let Some(raw) = responses.next().await {
                match serde_json::from_str::<RpcResponse>(&raw) {
                    Ok(response) if response.exchange_id == exchange_id => return Some(response),
                    Ok(_) => {}
                    Err(err) => warn!(exchange_id, error = %err, "unreadable response"),
                }
            }
            None
        };

        match tokio::time::timeout(self.config.timeout(), wait).await {
            Ok(Some(response)) => {
                debug!(exchange_id, responder = %response.responder_instance, "response received");
                match response.result {
                    RpcResult::Success { output } => Ok(output),
                    RpcResult::Error { error } => Err(RouterError::Remote {
                        code: error.code,
                        message: error.message,
                    }),
                }
            }
            Ok(None) => Err(RouterError::NotConnected(key.clone())),
            Err(_) => {
                warn!(exchange_id, connection = %key, owner, "cross-instance invocation timed out");
                Err(RouterError::Timeout {
                    key: key.clone(),
                    timeout_ms: self.config.timeout_ms,
                })
            }
        }
    }

    /// Answer requests for connections held here, until shutdown
    pub async fn start_listener(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> StoreResult<JoinHandle<()>> {
        let mut requests = self.store.subscribe(&self.config.request_channel).await?;
        let router = Arc::clone(self);
        Ok(tokio::spawn(async move {
            info!(instance_id = %router.registry.instance_id(), "request listener started");
            loop {
                tokio::select! {
                    message = requests.next() => match message {
                        Some(raw) => {
                            let router = Arc::clone(&router);
                            tokio::spawn(async move { router.handle_request(&raw).await });
                        }
                        None => {
                            warn!("request channel closed");
                            break;
                        }
                    },
                    _ = shutdown.changed() => {
                        info!(instance_id = %router.registry.instance_id(), "shutdown signal, stopping request listener");
                        break;
                    }
                }
            }
        }))
    }

    async fn handle_request(&self, raw: &str) {
        let request = match serde_json::from_str::<RpcRequest>(raw) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "unreadable rpc request");
                return;
            }
        };
        let Some(connection) = self.registry.local(&request.target) else {
            return;
        };

        info!(
            exchange_id = %request.exchange_id,
            connection = %request.target,
            origin = %request.origin_instance,
            "forwarding request to local connection"
        );
        let result = match connection.invoke(&request.capability, request.inputs).await {
            Ok(output) => RpcResult::Success { output },
            Err(err) => {
                let err = RouterError::Connection(err);
                RpcResult::Error {
                    error: ErrorDetail {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    },
                }
            }
        };
        let response = RpcResponse {
            exchange_id: request.exchange_id.clone(),
            responder_instance: self.registry.instance_id().to_string(),
            result,
        };

        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(exchange_id = %request.exchange_id, error = %err, "failed to encode response");
                return;
            }
        };
        match self
            .store
            .publish(&response_channel(&request.exchange_id), &encoded)
            .await
        {
            Ok(0) => debug!(exchange_id = %request.exchange_id, "requester no longer waiting"),
            Ok(_) => {}
            Err(err) => warn!(exchange_id = %request.exchange_id, error = %err, "failed to publish response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClientConnection, RegistryConfig};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl ClientConnection for Doubler {
        async fn invoke(
            &self,
            capability: &str,
            inputs: serde_json::Value,
        ) -> Result<serde_json::Value, ConnectionError> {
            match capability {
                "double" => Ok(json!(inputs["n"].as_i64().unwrap_or(0) * 2)),
                "stall" => std::future::pending().await,
                other => Err(ConnectionError::UnknownCapability(other.to_string())),
            }
        }
    }

    fn router(store: &Arc<MemoryStore>, instance: &str, holds: bool) -> Arc<InvocationRouter> {
        let registry = Arc::new(ConnectionRegistry::new(
            instance,
            store.clone(),
            RegistryConfig::default(),
        ));
        Arc::new(InvocationRouter::new(
            registry,
            store.clone(),
            RouterConfig {
                timeout_ms: 2_000,
                holds_connections: holds,
                ..RouterConfig::default()
            },
        ))
    }

    fn request(capability: &str) -> InvocationRequest {
        InvocationRequest {
            subject: "proj1".to_string(),
            environment: "staging".to_string(),
            capability_name: capability.to_string(),
            inputs: json!({ "n": 21 }),
        }
    }

    #[tokio::test]
    async fn test_local_dispatch() {
        let store = Arc::new(MemoryStore::new());
        let a = router(&store, "a", true);
        a.registry().register(request("double").key(), Arc::new(Doubler)).await;

        let result = a.invoke(request("double")).await;
        assert!(result.is_success());
        assert_eq!(result.output, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_remote_dispatch_through_owner() {
        let store = Arc::new(MemoryStore::new());
        let a = router(&store, "a", true);
        let worker = router(&store, "worker", false);
        a.registry().register(request("double").key(), Arc::new(Doubler)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = a.start_listener(shutdown_rx).await.unwrap();

        let result = worker.invoke(request("double")).await;
        assert_eq!(result.output, Some(json!(42)), "{result}");

        let failed = worker.invoke(request("nope")).await;
        assert_eq!(failed.error_code(), Some("sdk_invocation_failed"));

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_owner_is_not_connected() {
        let store = Arc::new(MemoryStore::new());
        let b = router(&store, "b", true);
        let err = b
            .route(&request("double").key(), "double", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "sdk_not_connected");
    }

    #[tokio::test]
    async fn test_stale_record_without_listener_is_not_connected() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(&request("double").key().store_key(), "gone-instance", None)
            .await
            .unwrap();
        let b = router(&store, "b", true);
        let result = b.invoke(request("double")).await;
        assert_eq!(result.error_code(), Some("sdk_not_connected"));
    }

    #[tokio::test]
    async fn test_stale_self_record_is_not_connected_without_waiting() {
        let store = Arc::new(MemoryStore::new());
        // left behind by a previous process of instance "a"
        store
            .set(&request("double").key().store_key(), "a", None)
            .await
            .unwrap();
        let a = router(&store, "a", true);
        let b = router(&store, "b", true);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        a.start_listener(shutdown_rx.clone()).await.unwrap();
        b.start_listener(shutdown_rx).await.unwrap();

        assert!(matches!(
            a.registry().lookup(&request("double").key()).await.unwrap(),
            Locality::Absent
        ));
        let outcome = tokio::time::timeout(
            Duration::from_millis(500),
            a.route(&request("double").key(), "double", json!({})),
        )
        .await
        .expect("stale record must not wait for the rpc timeout");
        assert_eq!(outcome.unwrap_err().code(), "sdk_not_connected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_owner_times_out() {
        let store = Arc::new(MemoryStore::new());
        let a = router(&store, "a", true);
        let b = router(&store, "b", true);
        a.registry().register(request("stall").key(), Arc::new(Doubler)).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        a.start_listener(shutdown_rx).await.unwrap();

        let err = b
            .route(&request("stall").key(), "stall", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Timeout { timeout_ms: 2_000, .. }));
        assert_eq!(err.code(), "sdk_timeout");
    }

    #[tokio::test]
    async fn test_store_outage_keeps_local_path() {
        let store = Arc::new(MemoryStore::new());
        let a = router(&store, "a", true);
        a.registry().register(request("double").key(), Arc::new(Doubler)).await;
        store.set_unavailable(true);

        assert!(a.invoke(request("double")).await.is_success());
        let other = InvocationRequest {
            subject: "elsewhere".to_string(),
            ..request("double")
        };
        assert_eq!(
            a.invoke(other).await.error_code(),
            Some("coordination_store_unavailable")
        );
    }
}
