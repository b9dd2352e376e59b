//! Message types and classification
//!
//! Inbound frames are discriminated by field presence: `id` + `method` is
//! a request, `id` + (`result` xor `error`) is a response, `method`
//! without `id` is a notification. Anything else is a protocol violation
//! and fatal to the binding that received it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// Method of the cancellation notification
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

/// Error types for JSON-RPC message handling
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unclassifiable JSON-RPC message: {0}")]
    UnknownShape(String),

    #[error("response carries both result and error")]
    ResultAndError,

    #[error("response carries neither result nor error")]
    NeitherResultNorError,
}

/// Client-issued request identifier.
///
/// A fresh UUID per request; never reused while the request is
/// outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    /// Whether the code lies in the implementation-defined server range
    pub fn is_server_error(&self) -> bool {
        (-32099..=-32000).contains(&self.code)
    }
}

/// Outbound JSON-RPC request
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// Outbound JSON-RPC response (to a server-initiated request)
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Build an outbound notification as a raw JSON value
pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut message = serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    });
    if let Some(params) = params {
        message["params"] = params;
    }
    message
}

/// Build the `$/cancelRequest` notification for an id
pub fn cancel_notification(id: &RequestId) -> Value {
    notification(
        CANCEL_REQUEST_METHOD,
        Some(serde_json::json!({ "id": id.as_str() })),
    )
}

/// Classified inbound JSON-RPC message
#[derive(Debug, Clone)]
pub enum Message {
    /// Server-initiated request (has method + non-null id)
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Notification (has method, id null or missing)
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Response to one of our requests (no method, has non-null id)
    Response {
        id: Value,
        result: Option<Value>,
        error: Option<ErrorObject>,
    },
}

impl Message {
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            Message::Response { .. } => None,
        }
    }
}

/// Classify a raw frame body according to JSON-RPC 2.0
pub fn classify(body: &str) -> Result<Message, ProtocolError> {
    let parsed: Value = serde_json::from_str(body)?;

    let method = parsed
        .get("method")
        .and_then(|m| m.as_str())
        .map(|s| s.to_string());
    let id = parsed.get("id").cloned();
    let params = parsed.get("params").cloned();

    match (method, id) {
        (Some(method), Some(id)) if !id.is_null() => Ok(Message::Request { id, method, params }),
        (Some(method), _) => Ok(Message::Notification { method, params }),
        (None, Some(id)) if !id.is_null() => {
            let has_result = parsed.get("result").is_some();
            let error = match parsed.get("error") {
                Some(Value::Null) | None => None,
                Some(raw) => Some(serde_json::from_value::<ErrorObject>(raw.clone())?),
            };

            match (has_result, &error) {
                (true, Some(_)) => Err(ProtocolError::ResultAndError),
                (false, None) => Err(ProtocolError::NeitherResultNorError),
                _ => Ok(Message::Response {
                    id,
                    result: parsed.get("result").cloned(),
                    error,
                }),
            }
        }
        _ => Err(ProtocolError::UnknownShape(body.to_string())),
    }
}

/// Normalize a response id to the string key used by the pending table
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestId::fresh();
        let b = RequestId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn test_classify_response_with_result() {
        let body = r#"{"jsonrpc":"2.0","id":"abc","result":{"ok":true}}"#;
        match classify(body).unwrap() {
            Message::Response { id, result, error } => {
                assert_eq!(id, Value::String("abc".to_string()));
                assert!(result.is_some());
                assert!(error.is_none());
            }
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_response_with_null_result() {
        // "result": null is a valid success response (e.g. shutdown)
        let body = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        match classify(body).unwrap() {
            Message::Response { result, error, .. } => {
                assert_eq!(result, Some(Value::Null));
                assert!(error.is_none());
            }
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_response() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#;
        match classify(body).unwrap() {
            Message::Response { error, .. } => {
                let error = error.unwrap();
                assert_eq!(error.code, ErrorObject::METHOD_NOT_FOUND);
                assert_eq!(error.message, "nope");
            }
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_server_request() {
        let body = r#"{"jsonrpc":"2.0","id":7,"method":"workspace/configuration","params":{"items":[]}}"#;
        match classify(body).unwrap() {
            Message::Request { id, method, params } => {
                assert_eq!(id, serde_json::json!(7));
                assert_eq!(method, "workspace/configuration");
                assert!(params.is_some());
            }
            other => panic!("Expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification() {
        let body = r#"{"jsonrpc":"2.0","method":"window/logMessage","params":{"type":3,"message":"hi"}}"#;
        match classify(body).unwrap() {
            Message::Notification { method, .. } => {
                assert_eq!(method, "window/logMessage");
            }
            other => panic!("Expected notification, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_rejects_result_and_error() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#;
        assert!(matches!(
            classify(body),
            Err(ProtocolError::ResultAndError)
        ));
    }

    #[test]
    fn test_classify_rejects_bare_object() {
        let body = r#"{"jsonrpc":"2.0"}"#;
        assert!(matches!(
            classify(body),
            Err(ProtocolError::UnknownShape(_))
        ));
    }

    #[test]
    fn test_classify_rejects_invalid_json() {
        assert!(matches!(classify("not json"), Err(ProtocolError::Parse(_))));
    }

    #[test]
    fn test_cancel_notification_shape() {
        let id = RequestId::fresh();
        let value = cancel_notification(&id);
        assert_eq!(value["method"], CANCEL_REQUEST_METHOD);
        assert_eq!(value["params"]["id"], id.as_str());
    }

    #[test]
    fn test_request_serialization_skips_missing_params() {
        let request = Request::new(RequestId::fresh(), "shutdown", None);
        let text = serde_json::to_string(&request).unwrap();
        assert!(!text.contains("params"));
        assert!(text.contains("\"method\":\"shutdown\""));
    }

    #[test]
    fn test_success_response_shape() {
        let response = Response::success(serde_json::json!(3), serde_json::json!({"ok": true}));
        let text = serde_json::to_string(&response).unwrap();
        assert!(text.contains("\"result\""));
        assert!(!text.contains("\"error\""));
    }

    #[test]
    fn test_method_not_found_shape() {
        let response = Response::error(
            serde_json::json!(1),
            ErrorObject::method_not_found("foo/bar"),
        );
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorObject::METHOD_NOT_FOUND);
        assert!(error.message.contains("foo/bar"));
    }

    #[test]
    fn test_is_server_error() {
        assert!(ErrorObject::new(-32000, "server").is_server_error());
        assert!(ErrorObject::new(-32099, "server").is_server_error());
        assert!(!ErrorObject::method_not_found("x").is_server_error());
        assert!(!ErrorObject::new(0, "zero").is_server_error());
    }

    #[test]
    fn test_id_key_normalization() {
        assert_eq!(id_key(&Value::String("abc".into())), "abc");
        assert_eq!(id_key(&serde_json::json!(42)), "42");
    }
}
