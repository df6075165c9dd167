use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON‑RPC 2.0 core types shared by the editor and the external applications.
///
/// These structs mirror the [JSON‑RPC 2.0 spec](https://www.jsonrpc.org/specification).
/// They are **transport‑agnostic**: the same envelope travels over the socket
/// channel (possibly chunked) and over the window channel.
///
/// ```ignore
/// use serde_json::json;
/// use bridge_protocol::jsonrpc::{Id, Request};
///
/// let req = Request::call(Id::Number(1), "dataflow_run", Some(json!({"dataflow": {}})));
/// let s = serde_json::to_string(&req).unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Server-defined codes
pub const EXTERNAL_APPLICATION_NOT_CONNECTED: i64 = -32001;
pub const INVALID_RESULT: i64 = -32002;
pub const DISCONNECTED: i64 = -32003;

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl Id {
    /// Key used by the pending-request table. Numbers and strings never collide
    /// because the key keeps the JSON quoting.
    pub fn key(&self) -> String {
        match self {
            Id::Number(n) => n.to_string(),
            Id::String(s) => format!("\"{s}\""),
            Id::Null => "null".to_owned(),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => f.write_str(s),
            Id::Null => f.write_str("null"),
        }
    }
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for *notifications*.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// JSON‑RPC 2.0 Error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON‑RPC 2.0 Response object.
/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

/// Lets callers `serde_json::from_str::<Message>()` without inspecting the type first.
/// `Request` is tried first, so anything carrying a `method` is a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// What a response means once it is matched to its call.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    Success(Value),
    Failure(Error),
}

// -----------------------------------------------------------------------------
// Helper constructors
// -----------------------------------------------------------------------------
impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Create a *call* expecting a response.
    pub fn call(id: Id, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

impl Response {
    /// Convenience helper for a successful result.
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Convenience helper for an error result.
    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(Error {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    /// Collapse the two optional fields into a single outcome. A response with
    /// neither field is a successful `null`.
    pub fn into_outcome(self) -> RpcOutcome {
        match (self.error, self.result) {
            (Some(err), _) => RpcOutcome::Failure(err),
            (None, Some(result)) => RpcOutcome::Success(result),
            (None, None) => RpcOutcome::Success(Value::Null),
        }
    }
}
