//! Server instance wiring
//!
//! One instance owns a connection registry, an invocation router, the
//! router's request listener and the registry keepalive. Several instances
//! sharing one coordination store behave like a horizontally scaled cluster.

pub mod sim;

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::{ClientConnection, ConnectionKey, ConnectionRegistry, RegistryConfig};
use crate::router::{InvocationRequest, InvocationResult, InvocationRouter, RouterConfig};
use crate::store::CoordinationStore;

pub struct ServerInstance {
    router: Arc<InvocationRouter>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerInstance {
    /// Start background tasks. A store outage at startup leaves the instance
    /// serving its own connections only.
    pub async fn start(
        instance_id: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        registry_config: RegistryConfig,
        router_config: RouterConfig,
    ) -> Self {
        let instance_id = instance_id.into();
        let holds_connections = router_config.holds_connections;
        let registry = Arc::new(ConnectionRegistry::new(
            instance_id.clone(),
            store.clone(),
            registry_config,
        ));
        let router = Arc::new(InvocationRouter::new(registry.clone(), store, router_config));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        if holds_connections {
            tasks.push(registry.spawn_keepalive(shutdown_rx.clone()));
            match router.start_listener(shutdown_rx).await {
                Ok(handle) => tasks.push(handle),
                Err(err) => warn!(
                    instance_id,
                    error = %err,
                    "request listener not started, remote callers cannot reach this instance"
                ),
            }
        }
        info!(instance_id, holds_connections, "server instance started");

        Self {
            router,
            shutdown,
            tasks,
        }
    }

    pub fn instance_id(&self) -> &str {
        self.router.registry().instance_id()
    }

    pub async fn connect(
        &self,
        subject: &str,
        environment: &str,
        connection: Arc<dyn ClientConnection>,
    ) -> bool {
        self.router
            .registry()
            .register(ConnectionKey::new(subject, environment), connection)
            .await
    }

    pub async fn disconnect(&self, subject: &str, environment: &str) -> bool {
        self.router
            .registry()
            .unregister(&ConnectionKey::new(subject, environment))
            .await
    }

    pub async fn is_connected(&self, subject: &str, environment: &str) -> bool {
        self.router
            .registry()
            .is_connected(&ConnectionKey::new(subject, environment))
            .await
    }

    pub async fn invoke(&self, request: InvocationRequest) -> InvocationResult {
        self.router.invoke(request).await
    }

    /// Disconnect everything held here and stop background tasks
    pub async fn shutdown(self) {
        let registry = self.router.registry().clone();
        for key in registry.local_keys() {
            registry.unregister(&key).await;
        }
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!(instance_id = %registry.instance_id(), "server instance stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::sim::LoopbackConnection;
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn cluster() -> (Arc<MemoryStore>, ServerInstance, ServerInstance) {
        let store = Arc::new(MemoryStore::new());
        let a = ServerInstance::start(
            "instance-a",
            store.clone(),
            RegistryConfig::default(),
            RouterConfig::default(),
        )
        .await;
        let b = ServerInstance::start(
            "instance-b",
            store.clone(),
            RegistryConfig::default(),
            RouterConfig::default(),
        )
        .await;
        (store, a, b)
    }

    fn sum_request() -> InvocationRequest {
        InvocationRequest {
            subject: "proj1".to_string(),
            environment: "staging".to_string(),
            capability_name: "sum".to_string(),
            inputs: json!({ "values": [1, 2, 3] }),
        }
    }

    #[tokio::test]
    async fn test_invocation_crosses_instances() {
        let (_store, a, b) = cluster().await;
        assert!(a.connect("proj1", "staging", Arc::new(LoopbackConnection)).await);
        assert!(b.is_connected("proj1", "staging").await);

        let result = b.invoke(sum_request()).await;
        assert!(result.is_success(), "{result}");
        assert_eq!(result.output, Some(json!(6)));

        assert!(a.disconnect("proj1", "staging").await);
        assert!(!b.is_connected("proj1", "staging").await);
        let result = b.invoke(sum_request()).await;
        assert_eq!(result.error_code(), Some("sdk_not_connected"));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_runner_always_routes_remotely() {
        let store = Arc::new(MemoryStore::new());
        let a = ServerInstance::start(
            "instance-a",
            store.clone(),
            RegistryConfig::default(),
            RouterConfig::default(),
        )
        .await;
        let runner = ServerInstance::start(
            "runner",
            store.clone(),
            RegistryConfig::default(),
            RouterConfig {
                holds_connections: false,
                ..RouterConfig::default()
            },
        )
        .await;
        a.connect("proj1", "staging", Arc::new(LoopbackConnection)).await;

        let result = runner.invoke(sum_request()).await;
        assert_eq!(result.output, Some(json!(6)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_connections() {
        let (_store, a, b) = cluster().await;
        a.connect("proj1", "staging", Arc::new(LoopbackConnection)).await;
        a.shutdown().await;
        assert!(!b.is_connected("proj1", "staging").await);
    }
}
