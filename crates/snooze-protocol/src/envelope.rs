//! JSON-RPC 2.0 envelope used on every snooze connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes plus the snooze-specific range.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Instance id not present in the registry.
    pub const UNKNOWN_INSTANCE: i64 = -32000;
    /// Request was well-formed but refused by policy.
    pub const REFUSED: i64 = -32001;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = RpcRequest::new(7, "instance.heartbeat", json!({"instance_id": "i-1"}));
        let wire: Value = serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();

        assert_eq!(wire["jsonrpc"], "2.0");
        assert_eq!(wire["id"], 7);
        assert_eq!(wire["method"], "instance.heartbeat");
        assert_eq!(wire["params"]["instance_id"], "i-1");
    }

    #[test]
    fn test_success_response_omits_error() {
        let resp = RpcResponse::success(1, json!({"ok": true}));
        let wire = serde_json::to_string(&resp).unwrap();
        assert!(!wire.contains("error"));
        assert!(resp.is_success());
    }

    #[test]
    fn test_failure_response_omits_result() {
        let resp = RpcResponse::failure(2, codes::UNKNOWN_INSTANCE, "instance 'i-9' not found");
        let wire = serde_json::to_string(&resp).unwrap();
        assert!(!wire.contains("result"));
        assert!(!resp.is_success());
        assert_eq!(resp.error.unwrap().code, codes::UNKNOWN_INSTANCE);
    }
}
