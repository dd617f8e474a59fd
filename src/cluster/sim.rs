//! Simulated collaborators
//!
//! A loopback client connection and a scripted test target, used by the CLI
//! demos and by tests in place of real SDK clients and LLM endpoints.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::executor::{ExecError, TestTarget};
use crate::models::ExecutionUnit;
use crate::registry::{ClientConnection, ConnectionError};

/// Client connection exposing `echo`, `sum` and `sleep`
pub struct LoopbackConnection;

#[async_trait]
impl ClientConnection for LoopbackConnection {
    async fn invoke(
        &self,
        capability: &str,
        inputs: serde_json::Value,
    ) -> Result<serde_json::Value, ConnectionError> {
        match capability {
            "echo" => Ok(inputs),
            "sum" => {
                let values = inputs["values"]
                    .as_array()
                    .ok_or_else(|| ConnectionError::Failed("`values` must be an array".to_string()))?;
                Ok(json!(values.iter().filter_map(|v| v.as_f64()).sum::<f64>() as i64))
            }
            "sleep" => {
                let ms = inputs["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms }))
            }
            other => Err(ConnectionError::UnknownCapability(other.to_string())),
        }
    }
}

/// Test target with scripted outcomes per test id
#[derive(Default)]
pub struct ScriptedTarget {
    /// Always fail transiently
    failing: HashSet<String>,
    /// Fail without retry, as a misconfigured test would
    broken: HashSet<String>,
    /// Fail transiently this many times before passing
    flaky: HashMap<String, u32>,
    latency: Duration,
    seen: Mutex<HashMap<String, u32>>,
}

impl ScriptedTarget {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn failing(mut self, test_ids: impl IntoIterator<Item = String>) -> Self {
        self.failing.extend(test_ids);
        self
    }

    pub fn broken(mut self, test_ids: impl IntoIterator<Item = String>) -> Self {
        self.broken.extend(test_ids);
        self
    }

    pub fn flaky(mut self, test_id: impl Into<String>, failures: u32) -> Self {
        self.flaky.insert(test_id.into(), failures);
        self
    }

    fn attempt(&self, unit_id: &str) -> u32 {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let count = seen.entry(unit_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl TestTarget for ScriptedTarget {
    async fn execute(&self, unit: &ExecutionUnit) -> Result<serde_json::Value, ExecError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let attempt = self.attempt(&unit.id);
        if self.broken.contains(&unit.test_id) {
            return Err(ExecError::Fatal(format!(
                "{} cannot run against {}",
                unit.test_id, unit.target_id
            )));
        }
        if self.failing.contains(&unit.test_id) {
            return Err(ExecError::Transient(format!(
                "{} did not meet expectations",
                unit.test_id
            )));
        }
        if let Some(failures) = self.flaky.get(&unit.test_id) {
            if attempt <= *failures {
                return Err(ExecError::Transient(format!("flaky failure {attempt}")));
            }
        }
        Ok(json!({
            "test_id": unit.test_id,
            "target_id": unit.target_id,
            "attempt": attempt,
        }))
    }
}
