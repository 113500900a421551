//! JSON-RPC 2.0 wire format shared by both MCP transports
//!
//! Both the stdio and HTTP transports exchange these messages; the stdio
//! framing is newline-delimited JSON, HTTP posts one message per request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parse error (malformed JSON)
pub const PARSE_ERROR: i64 = -32700;
/// Invalid request shape
pub const INVALID_REQUEST: i64 = -32600;
/// Method not found
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid params
pub const INVALID_PARAMS: i64 = -32602;
/// Internal error
pub const INTERNAL_ERROR: i64 = -32603;
/// Access denied by policy
pub const ACCESS_DENIED: i64 = -32000;
/// Policy violation during enforcement
pub const POLICY_VIOLATION: i64 = -32001;
/// Rate limited
pub const RATE_LIMITED: i64 = -32002;

/// A JSON-RPC 2.0 request or notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version, always "2.0"
    pub jsonrpc: String,

    /// Request id; absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    /// Method name, e.g. `tools/call`
    pub method: String,

    /// Method parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Create a new request with the given id
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Create a notification (no id, no response expected)
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Whether this message is a notification
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Validate the JSON-RPC envelope shape
    pub fn validate(&self) -> std::result::Result<(), RpcError> {
        if self.jsonrpc != "2.0" {
            return Err(RpcError::invalid_request("jsonrpc must be \"2.0\""));
        }
        if self.method.is_empty() {
            return Err(RpcError::invalid_request("method must not be empty"));
        }
        Ok(())
    }
}

/// A JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version, always "2.0"
    pub jsonrpc: String,

    /// Id of the request being answered
    pub id: Value,

    /// Result on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Build a success response
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response
    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Whether the response carries an error
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code from the table in the protocol spec
    pub code: i64,

    /// Short human-readable message
    pub message: String,

    /// Structured error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create an error with code and message
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Parse error (-32700)
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message)
    }

    /// Invalid request (-32600)
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    /// Method not found (-32601)
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {}", method))
    }

    /// Invalid params (-32602)
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// Internal error (-32603)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    /// Access denied by policy (-32000), with reason and optional policy id
    pub fn access_denied(
        reason: impl Into<String>,
        policy_id: Option<&str>,
        suggestions: Option<Vec<String>>,
    ) -> Self {
        let reason = reason.into();
        let mut data = serde_json::json!({ "reason": reason });
        if let Some(id) = policy_id {
            data["policyId"] = Value::String(id.to_string());
        }
        if let Some(hints) = suggestions {
            data["suggestions"] = serde_json::json!(hints);
        }
        Self::new(ACCESS_DENIED, "access denied by policy").with_data(data)
    }

    /// Policy violation during enforcement (-32001)
    pub fn policy_violation(message: impl Into<String>) -> Self {
        Self::new(POLICY_VIOLATION, message)
    }

    /// Rate limited (-32002) with retry hint
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::new(RATE_LIMITED, "rate limited")
            .with_data(serde_json::json!({ "retryAfterMs": retry_after_ms }))
    }
}
