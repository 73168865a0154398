//! JSON-RPC 2.0 envelope types
//!
//! Wire-level message definitions shared by both endpoints: request,
//! notification, and response envelopes, plus the error catalogue defined
//! by the JSON-RPC 2.0 specification (https://www.jsonrpc.org/specification).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// JSON-RPC 2.0 version identifier
pub const VERSION: &str = "2.0";

// ============================================================================
// Error Catalogue
// ============================================================================

/// JSON-RPC 2.0 error codes as defined in the specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Invalid JSON was received by the peer
    ParseError = -32700,
    /// The JSON sent is not a valid Request object
    InvalidRequest = -32600,
    /// The method does not exist / is not available
    MethodNotFound = -32601,
    /// Invalid method parameter(s)
    InvalidParams = -32602,
    /// Internal JSON-RPC error
    InternalError = -32603,
    /// Implementation-defined server error (handler failure)
    ServerError = -32000,
}

impl ErrorCode {
    /// Built-in default message for this code
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::ServerError => "Server error",
        }
    }

    /// Check if the given code is in the reserved server error range (-32099 to -32000)
    pub fn is_server_error(code: i32) -> bool {
        (-32099..=-32000).contains(&code)
    }
}

/// JSON-RPC error object carried in an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create an error object with the catalogue default message
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code: code as i32,
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Override the default message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach supplementary data
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Parse a well-formed error object out of a raw value
    ///
    /// Returns `None` unless `code` is an integer and `message` a string,
    /// the minimum shape required by the specification.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let code = obj.get("code")?.as_i64()?;
        let message = obj.get("message")?.as_str()?;
        Some(Self {
            code: code as i32,
            message: message.to_string(),
            data: obj.get("data").cloned(),
        })
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{} ({}): {}", self.message, self.code, data),
            None => write!(f, "{} ({})", self.message, self.code),
        }
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// JSON-RPC 2.0 request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version (always "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Optional parameters (object or array)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Request identifier (string, number, or null)
    pub id: Value,
}

impl Request {
    /// Build a request envelope
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params,
            id: id.into(),
        }
    }
}

/// JSON-RPC 2.0 notification envelope (a request without an id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Protocol version (always "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Optional parameters (object or array)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Build a notification envelope
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version (always "2.0")
    pub jsonrpc: String,

    /// Result (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,

    /// Identifier of the request this answers
    pub id: Value,
}

// ============================================================================
// Raw Envelope Builders
// ============================================================================

/// Build a success response as a raw value
///
/// Raw construction keeps `"result": null` on the wire, which the typed
/// `Response` would drop through its optional field.
pub fn success_response(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": VERSION,
        "result": result,
        "id": id,
    })
}

/// Build an error response as a raw value
pub fn error_response(id: &Value, error: &ErrorObject) -> Value {
    json!({
        "jsonrpc": VERSION,
        "error": error,
        "id": id,
    })
}

/// Classify an envelope as a response
///
/// An envelope is a response iff the `id` key is present and either the
/// `result` or the `error` key is present. Everything else is a call
/// (request when `id` is present, notification otherwise).
pub fn is_response(item: &Value) -> bool {
    match item.as_object() {
        Some(obj) => {
            obj.contains_key("id") && (obj.contains_key("result") || obj.contains_key("error"))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_object_defaults() {
        let err = ErrorObject::new(ErrorCode::MethodNotFound);
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found");
        assert!(err.data.is_none());
    }

    #[test]
    fn error_object_override_and_data() {
        let err = ErrorObject::new(ErrorCode::ServerError)
            .with_message("TypeError")
            .with_data("boom");
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "TypeError");
        assert_eq!(err.data, Some(json!("boom")));
    }

    #[test]
    fn error_object_data_absent_when_not_supplied() {
        let serialized = serde_json::to_value(ErrorObject::new(ErrorCode::ParseError)).unwrap();
        assert!(serialized.get("data").is_none());
    }

    #[test]
    fn error_object_from_value_requires_shape() {
        assert!(ErrorObject::from_value(&json!({"code": -32601, "message": "nope"})).is_some());
        assert!(ErrorObject::from_value(&json!({"code": "x", "message": "nope"})).is_none());
        assert!(ErrorObject::from_value(&json!({"message": "nope"})).is_none());
        assert!(ErrorObject::from_value(&json!("not an object")).is_none());
    }

    #[test]
    fn request_round_trip() {
        let req = Request::new(7, "sum", Some(json!([1, 2])));
        let text = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&text).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn notification_has_no_id_key() {
        let note = Notification::new("ping", None);
        let value = serde_json::to_value(&note).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("params").is_none());
    }

    #[test]
    fn response_round_trip() {
        let resp = Response {
            jsonrpc: VERSION.to_string(),
            result: Some(json!({"a": 1})),
            error: None,
            id: json!(3),
        };
        let text = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&text).unwrap();
        assert_eq!(resp, back);
    }

    #[test]
    fn success_response_keeps_null_result() {
        let value = success_response(&json!(1), Value::Null);
        assert!(value.as_object().unwrap().contains_key("result"));
    }

    #[test]
    fn classification_rules() {
        assert!(is_response(&json!({"id": 1, "result": "ok"})));
        assert!(is_response(&json!({"id": null, "error": {"code": -32700, "message": "x"}})));
        // A request has an id but neither result nor error.
        assert!(!is_response(&json!({"id": 1, "method": "m"})));
        // A stray result without an id is not a response.
        assert!(!is_response(&json!({"method": "m", "result": "stray"})));
        assert!(!is_response(&json!([1, 2])));
    }
}
