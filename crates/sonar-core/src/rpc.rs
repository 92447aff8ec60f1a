//! JSON-RPC 2.0 message model and classification.
//!
//! All transports normalise their wire format into [`RpcMessage`] before
//! handing it to the dispatcher. Classification follows strict rules, in
//! order:
//!
//! 1. **Response** — `id` present and (`result` present or `error` present).
//! 2. **Request** — `id` present and `method` present.
//! 3. **Notification** — `method` present, `id` absent.
//!
//! Anything else is malformed; malformed messages are logged and treated
//! as notifications so they never block the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// The protocol version string sent in every response.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes used by the dispatcher and transports.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The request was cancelled before completion.
    pub const REQUEST_CANCELLED: i64 = -32800;

    // Application range (above -32000).
    /// A tool, resource, or prompt with the same name is already registered.
    pub const DUPLICATE_REGISTRATION: i64 = -32010;
    /// The named tool is not registered.
    pub const UNKNOWN_TOOL: i64 = -32011;
    /// An operation was attempted in a state that does not permit it.
    pub const ILLEGAL_STATE: i64 = -32012;
    /// Content-addressed integrity verification failed (dist or lock drift).
    pub const INTEGRITY_ERROR: i64 = -32013;
    /// A required plugin signature is missing.
    pub const UNSIGNED: i64 = -32014;
    /// A plugin signature failed verification.
    pub const BAD_SIGNATURE: i64 = -32015;
}

/// A JSON-RPC request or response ID.
///
/// JSON-RPC 2.0 allows numbers and strings; we preserve whichever the
/// client sent so responses echo it byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Numeric ID.
    Number(i64),
    /// String ID.
    String(String),
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// A request carrying an ID: the caller expects exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version; always `"2.0"`.
    pub jsonrpc: String,
    /// Request ID, echoed in the response.
    pub id: RpcId,
    /// Method name, e.g. `tools/call`.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A response to a request: exactly one of `result` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version; always `"2.0"`.
    pub jsonrpc: String,
    /// The ID of the request being answered.
    pub id: RpcId,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Build a success response.
    #[must_use]
    pub fn success(id: RpcId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    #[must_use]
    pub fn failure(id: RpcId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A notification: fire-and-forget, never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    /// Protocol version; always `"2.0"`.
    pub jsonrpc: String,
    /// Method name, e.g. `notifications/tools/list_changed`.
    pub method: String,
    /// Notification parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    /// Build a notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code (see [`codes`]).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional machine-readable detail (e.g. a failure subtype tag).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error with a code and message.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach machine-readable detail.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32700` parse error.
    #[must_use]
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, format!("Parse error: {}", detail.into()))
    }

    /// `-32600` invalid request.
    #[must_use]
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, detail)
    }

    /// `-32601` method not found.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// `-32602` invalid params, carrying the collected schema violations.
    #[must_use]
    pub fn invalid_params(violations: Vec<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, "Invalid params")
            .with_data(Value::from(violations))
    }

    /// `-32603` internal error with a subtype tag in `data`.
    #[must_use]
    pub fn internal(subtype: &str, detail: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, detail)
            .with_data(serde_json::json!({ "subtype": subtype }))
    }

    /// `-32800` request cancelled.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(codes::REQUEST_CANCELLED, "Request cancelled")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Message kind per the strict classification rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `id` present and `result` or `error` present.
    Response,
    /// `id` and `method` present, no `result`/`error`.
    Request,
    /// `method` present, `id` absent — or malformed.
    Notification,
}

impl MessageKind {
    /// Classify a raw JSON value.
    ///
    /// The ordering matters: a message carrying `id`, `method` *and*
    /// `result` is a response, not a request.
    #[must_use]
    pub fn classify(value: &Value) -> Self {
        let has_id = value.get("id").is_some_and(|v| !v.is_null());
        let has_result = value.get("result").is_some();
        let has_error = value.get("error").is_some();
        let has_method = value.get("method").is_some_and(Value::is_string);

        if has_id && (has_result || has_error) {
            Self::Response
        } else if has_id && has_method {
            Self::Request
        } else {
            Self::Notification
        }
    }
}

/// A classified message, the dispatcher's input type.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// A request expecting a response.
    Request(RpcRequest),
    /// A response to a request this server issued.
    Response(RpcResponse),
    /// A fire-and-forget notification.
    Notification(RpcNotification),
}

impl RpcMessage {
    /// Classify and parse a raw JSON value.
    ///
    /// Malformed messages (bad ID type, non-string method, missing both
    /// `method` and `result`/`error`) are logged and degraded to a
    /// notification with the method `"_malformed"` so they flow through
    /// the pipeline without blocking it.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let kind = MessageKind::classify(&value);
        let parsed = match kind {
            MessageKind::Response => {
                serde_json::from_value::<RpcResponse>(value.clone()).map(Self::Response)
            },
            MessageKind::Request => {
                serde_json::from_value::<RpcRequest>(value.clone()).map(Self::Request)
            },
            MessageKind::Notification => {
                serde_json::from_value::<RpcNotification>(value.clone()).map(Self::Notification)
            },
        };

        match parsed {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Malformed message, treating as notification");
                Self::Notification(RpcNotification::new("_malformed", Some(value)))
            },
        }
    }

    /// Serialize back to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (practically unreachable
    /// for these types).
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Self::Request(r) => serde_json::to_value(r),
            Self::Response(r) => serde_json::to_value(r),
            Self::Notification(n) => serde_json::to_value(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification_order_response_beats_request() {
        // id + method + result must classify as a response.
        let v = json!({"jsonrpc": "2.0", "id": 1, "method": "x", "result": {}});
        assert_eq!(MessageKind::classify(&v), MessageKind::Response);
    }

    #[test]
    fn classification_request() {
        let v = json!({"jsonrpc": "2.0", "id": "a", "method": "tools/list"});
        assert_eq!(MessageKind::classify(&v), MessageKind::Request);
    }

    #[test]
    fn classification_notification() {
        let v = json!({"jsonrpc": "2.0", "method": "notifications/cancelled"});
        assert_eq!(MessageKind::classify(&v), MessageKind::Notification);
    }

    #[test]
    fn classification_error_response() {
        let v = json!({"jsonrpc": "2.0", "id": 7, "error": {"code": -32601, "message": "nope"}});
        assert_eq!(MessageKind::classify(&v), MessageKind::Response);
    }

    #[test]
    fn malformed_becomes_notification() {
        let v = json!({"jsonrpc": "2.0", "id": 1});
        let msg = RpcMessage::from_value(v);
        match msg {
            RpcMessage::Notification(n) => assert_eq!(n.method, "_malformed"),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn request_round_trips() {
        let v = json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "tools/call",
            "params": {"name": "ping", "arguments": {"host": "10.0.0.1"}}
        });
        let msg = RpcMessage::from_value(v.clone());
        assert_eq!(msg.to_value().unwrap(), v);
    }

    #[test]
    fn id_preserves_string_and_number() {
        let n: RpcId = serde_json::from_value(json!(5)).unwrap();
        assert_eq!(n, RpcId::Number(5));
        let s: RpcId = serde_json::from_value(json!("abc")).unwrap();
        assert_eq!(s, RpcId::String("abc".into()));
        assert_eq!(serde_json::to_value(&n).unwrap(), json!(5));
    }

    #[test]
    fn invalid_params_carries_violations() {
        let err = RpcError::invalid_params(vec!["host: expected string".into()]);
        assert_eq!(err.code, codes::INVALID_PARAMS);
        assert_eq!(err.data, Some(json!(["host: expected string"])));
    }

    #[test]
    fn response_constructors() {
        let ok = RpcResponse::success(RpcId::Number(1), json!({"x": 1}));
        assert!(ok.error.is_none());
        let bad = RpcResponse::failure(RpcId::Number(1), RpcError::method_not_found("nope"));
        assert!(bad.result.is_none());
        assert_eq!(bad.error.unwrap().code, codes::METHOD_NOT_FOUND);
    }
}
