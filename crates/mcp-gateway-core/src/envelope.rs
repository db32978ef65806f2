//! JSON-RPC 2.0 envelopes as exchanged between MCP peers.
//!
//! Every message crossing the gateway is classified once, at decode time,
//! into one of [`Envelope::Request`], [`Envelope::Notification`] or
//! [`Envelope::Response`]. Bridges then route on the variant instead of
//! probing raw JSON for the presence of fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// JSON-RPC protocol tag written on every outgoing envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol version used for gateway-originated `initialize` requests.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Method name of the MCP handshake request.
pub const INITIALIZE_METHOD: &str = "initialize";

/// Method name of the notification that completes the MCP handshake.
pub const INITIALIZED_METHOD: &str = "notifications/initialized";

/// Standard and gateway-specific JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    /// Generic gateway/server error (`-32000`).
    ServerError,
    /// Session id not known to a stateful endpoint (`-32001`).
    SessionNotFound,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError => -32000,
            Self::SessionNotFound => -32001,
        }
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// A request identifier. Kept in its original JSON form so that a response
/// carries back exactly what the requester sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
    /// Only legal on error responses to unparseable requests.
    Null,
}

impl RequestId {
    /// JSON text of the id; distinguishes `1` from `"1"`.
    pub fn to_json(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::String(s) => Value::String(s.clone()).to_string(),
            Self::Null => "null".to_string(),
        }
    }

    /// Parse an id back from its [`to_json`](Self::to_json) form.
    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|v| Self::from_value(&v))
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self::Number(n.clone())),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Null => Some(Self::Null),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
            Self::Null => Value::Null,
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
            Self::Null => f.write_str("null"),
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: impl Into<i64>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Why a decoded JSON value is not a JSON-RPC envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope must be a JSON object")]
    NotAnObject,
    #[error("`method` must be a string")]
    InvalidMethod,
    #[error("`id` must be a string, number or null")]
    InvalidId,
    #[error("response carries neither `result` nor `error`")]
    NotAnEnvelope,
    #[error("response `error` member is malformed: {0}")]
    InvalidError(String),
}

/// One JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Envelope {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Result<Value, ErrorObject>,
    },
}

impl Envelope {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn success(id: RequestId, result: Value) -> Self {
        Self::Response {
            id,
            result: Ok(result),
        }
    }

    pub fn failure(id: RequestId, error: ErrorObject) -> Self {
        Self::Response {
            id,
            result: Err(error),
        }
    }

    /// Build an error response from a code and message.
    pub fn error_response(id: RequestId, code: impl Into<i64>, message: impl Into<String>) -> Self {
        Self::failure(id, ErrorObject::new(code, message))
    }

    /// Classify a decoded JSON value.
    ///
    /// A `method` member makes it a request (when `id` is present) or a
    /// notification; otherwise a `result` or `error` member makes it a
    /// response. A missing `jsonrpc` tag is tolerated.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut obj) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(EnvelopeError::InvalidMethod);
            };
            let params = obj.remove("params");
            return match obj.remove("id") {
                Some(id) => Ok(Self::Request {
                    id: RequestId::from_value(&id).ok_or(EnvelopeError::InvalidId)?,
                    method,
                    params,
                }),
                None => Ok(Self::Notification { method, params }),
            };
        }

        let id = match obj.remove("id") {
            Some(id) => RequestId::from_value(&id).ok_or(EnvelopeError::InvalidId)?,
            None => RequestId::Null,
        };
        if let Some(error) = obj.remove("error") {
            let error: ErrorObject = serde_json::from_value(error)
                .map_err(|e| EnvelopeError::InvalidError(e.to_string()))?;
            return Ok(Self::failure(id, error));
        }
        match obj.remove("result") {
            Some(result) => Ok(Self::success(id, result)),
            None => Err(EnvelopeError::NotAnEnvelope),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            Self::Request { id, method, params } => {
                obj.insert("id".into(), id.to_value());
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification { method, params } => {
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, result } => {
                obj.insert("id".into(), id.to_value());
                match result {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        obj.insert(
                            "error".into(),
                            serde_json::to_value(error).unwrap_or(Value::Null),
                        );
                    }
                }
            }
        }
        Value::Object(obj)
    }

    /// Compact single-line JSON text, suitable for newline-delimited framing.
    pub fn to_line(&self) -> String {
        self.to_value().to_string()
    }

    /// The id of a request or response.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    pub fn is_initialize_request(&self) -> bool {
        matches!(self, Self::Request { method, .. } if method == INITIALIZE_METHOD)
    }

    /// Replace the id of a request or response, returning the previous one.
    pub fn replace_id(&mut self, new_id: RequestId) -> Option<RequestId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => {
                Some(std::mem::replace(id, new_id))
            }
            Self::Notification { .. } => None,
        }
    }
}

impl TryFrom<Value> for Envelope {
    type Error = EnvelopeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Envelope> for Value {
    fn from(envelope: Envelope) -> Self {
        envelope.to_value()
    }
}

/// Build the `initialize` request the gateway sends on behalf of a client
/// that skipped the handshake.
pub fn initialize_request(id: RequestId, protocol_version: &str, client_name: &str) -> Envelope {
    Envelope::request(
        id,
        INITIALIZE_METHOD,
        Some(json!({
            "protocolVersion": protocol_version,
            "capabilities": {
                "roots": { "listChanged": true },
                "sampling": {}
            },
            "clientInfo": {
                "name": client_name,
                "version": env!("CARGO_PKG_VERSION")
            }
        })),
    )
}

pub fn initialized_notification() -> Envelope {
    Envelope::notification(INITIALIZED_METHOD, None)
}

/// Fresh id for a gateway-originated `initialize` request.
pub fn auto_initialize_id() -> RequestId {
    RequestId::String(format!("init_{}", uuid::Uuid::new_v4().simple()))
}

/// Remove a leading `MCP error <code>:` decoration from an error message.
pub fn strip_mcp_error_prefix(code: i64, message: &str) -> String {
    let prefix = format!("MCP error {code}:");
    match message.strip_prefix(&prefix) {
        Some(rest) => rest.trim_start().to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> Result<Envelope, EnvelopeError> {
        Envelope::from_value(serde_json::from_str(text).unwrap())
    }

    #[test]
    fn classifies_request_notification_and_response() {
        let req = classify(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert!(req.is_request());
        assert_eq!(req.id(), Some(&RequestId::from(1)));

        let note = classify(r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#).unwrap();
        assert!(matches!(note, Envelope::Notification { .. }));
        assert!(note.id().is_none());

        let ok = classify(r#"{"jsonrpc":"2.0","id":"a","result":{"x":1}}"#).unwrap();
        assert_eq!(ok, Envelope::success("a".into(), json!({"x":1})));

        let err = classify(r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"bad"}}"#).unwrap();
        match err {
            Envelope::Response { id, result: Err(e) } => {
                assert_eq!(id, RequestId::Null);
                assert_eq!(e.code, -32700);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_non_envelopes() {
        assert_eq!(classify("[1,2]"), Err(EnvelopeError::NotAnObject));
        assert_eq!(classify(r#"{"level":"info"}"#), Err(EnvelopeError::NotAnEnvelope));
        assert_eq!(classify(r#"{"method":5}"#), Err(EnvelopeError::InvalidMethod));
        assert_eq!(classify(r#"{"id":{},"method":"x"}"#), Err(EnvelopeError::InvalidId));
    }

    #[test]
    fn null_id_request_is_still_a_request() {
        let env = classify(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap();
        assert!(env.is_request());
    }

    #[test]
    fn to_value_writes_jsonrpc_tag_and_keeps_id_type() {
        let env = Envelope::request("7", "ping", None);
        let v = env.to_value();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], "7");
        assert!(v.get("params").is_none());

        let env = Envelope::request(7, "ping", Some(json!({})));
        assert_eq!(env.to_value()["id"], 7);
    }

    #[test]
    fn serde_round_trips_through_value() {
        let env: Envelope =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"nope","data":[1]}}"#)
                .unwrap();
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn request_id_json_form_distinguishes_types() {
        let n = RequestId::from(1);
        let s = RequestId::from("1");
        assert_eq!(n.to_json(), "1");
        assert_eq!(s.to_json(), "\"1\"");
        assert_eq!(RequestId::from_json(&n.to_json()), Some(n));
        assert_eq!(RequestId::from_json(&s.to_json()), Some(s));
        assert_eq!(RequestId::from_json("{}"), None);
    }

    #[test]
    fn initialize_request_shape() {
        let env = initialize_request("init_x".into(), DEFAULT_PROTOCOL_VERSION, "mcp-gateway");
        assert!(env.is_initialize_request());
        let v = env.to_value();
        assert_eq!(v["params"]["protocolVersion"], "2024-11-05");
        assert_eq!(v["params"]["capabilities"]["roots"]["listChanged"], true);
        assert_eq!(v["params"]["clientInfo"]["name"], "mcp-gateway");
    }

    #[test]
    fn auto_initialize_ids_are_unique_and_prefixed() {
        let a = auto_initialize_id();
        let b = auto_initialize_id();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("init_"));
    }

    #[test]
    fn strips_mcp_error_prefix() {
        assert_eq!(strip_mcp_error_prefix(-32601, "MCP error -32601: Method not found"), "Method not found");
        assert_eq!(strip_mcp_error_prefix(-32601, "Method not found"), "Method not found");
        assert_eq!(strip_mcp_error_prefix(-32000, "MCP error -32601: x"), "MCP error -32601: x");
    }

    #[test]
    fn replace_id_on_request() {
        let mut env = Envelope::request(1, "ping", None);
        let old = env.replace_id("c:1".into());
        assert_eq!(old, Some(RequestId::from(1)));
        assert_eq!(env.id(), Some(&RequestId::from("c:1")));
        let mut note = initialized_notification();
        assert_eq!(note.replace_id(1.into()), None);
    }
}
