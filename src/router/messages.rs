//! Invocation and RPC wire types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::registry::ConnectionKey;

/// Shared channel every instance listens on
pub const DEFAULT_REQUEST_CHANNEL: &str = "rpc:requests";

/// Per-exchange response channel
pub fn response_channel(exchange_id: &str) -> String {
    format!("rpc:response:{exchange_id}")
}

/// Published on the request channel by the instance that lacks the connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub exchange_id: String,
    pub target: ConnectionKey,
    pub capability: String,
    pub inputs: serde_json::Value,
    pub origin_instance: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RpcResult {
    Success { output: serde_json::Value },
    Error { error: ErrorDetail },
}

/// Published by the owning instance on the exchange's response channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub exchange_id: String,
    pub responder_instance: String,
    #[serde(flatten)]
    pub result: RpcResult,
}

/// Invocation of a client-registered capability
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub subject: String,
    pub environment: String,
    pub capability_name: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
}

impl InvocationRequest {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(&self.subject, &self.environment)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub duration_ms: u64,
}

impl InvocationResult {
    pub fn success(output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            status: InvocationStatus::Success,
            output: Some(output),
            error: None,
            duration_ms,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: InvocationStatus::Error,
            output: None,
            error: Some(ErrorDetail {
                code: code.into(),
                message: message.into(),
            }),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Success
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

impl fmt::Display for InvocationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.output, &self.error) {
            (Some(output), _) => write!(f, "✓ success [{}ms] {}", self.duration_ms, output),
            (None, Some(error)) => write!(f, "✗ error [{}ms] {}", self.duration_ms, error),
            (None, None) => write!(f, "✗ error [{}ms]", self.duration_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_wire_shape() {
        let response = RpcResponse {
            exchange_id: "x1".to_string(),
            responder_instance: "a".to_string(),
            result: RpcResult::Error {
                error: ErrorDetail {
                    code: "sdk_invocation_failed".to_string(),
                    message: "boom".to_string(),
                },
            },
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"]["code"], "sdk_invocation_failed");
        let decoded: RpcResponse = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_invocation_result_omits_empty_fields() {
        let value = serde_json::to_value(InvocationResult::success(json!(3), 4)).unwrap();
        assert_eq!(value["status"], "success");
        assert!(value.get("error").is_none());

        let error = InvocationResult::error("sdk_not_connected", "nobody home", 1);
        assert_eq!(error.error_code(), Some("sdk_not_connected"));
        assert!(!error.is_success());
    }

    #[test]
    fn test_response_channel_is_scoped() {
        assert_eq!(response_channel("abc"), "rpc:response:abc");
        assert_ne!(response_channel("a"), response_channel("b"));
    }
}
