//! Protocol envelopes and error codes

use std::fmt;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use super::codec::WireValue;

/// Error object carried in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: &'static str,
}

impl RpcError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const UNKNOWN_OBJECT: i32 = -32002;
    pub const PERMISSION_DENIED: i32 = -32003;
    pub const UNKNOWN_PROPERTY: i32 = -32004;
    pub const INVALID_PROPERTY_ACCESS: i32 = -32005;

    const fn new(code: i32, message: &'static str) -> Self {
        Self { code, message }
    }

    pub const fn parse_error() -> Self {
        Self::new(Self::PARSE_ERROR, "Parse Error")
    }

    pub const fn invalid_request() -> Self {
        Self::new(Self::INVALID_REQUEST, "Invalid Request")
    }

    pub const fn method_not_found() -> Self {
        Self::new(Self::METHOD_NOT_FOUND, "Method not found")
    }

    pub const fn invalid_params() -> Self {
        Self::new(Self::INVALID_PARAMS, "Invalid params")
    }

    pub const fn internal_error() -> Self {
        Self::new(Self::INTERNAL_ERROR, "Internal error")
    }

    pub const fn unknown_session() -> Self {
        Self::new(Self::UNKNOWN_OBJECT, "Unknown session")
    }

    pub const fn unknown_channel() -> Self {
        Self::new(Self::UNKNOWN_OBJECT, "Unknown channel")
    }

    pub const fn permission_denied() -> Self {
        Self::new(Self::PERMISSION_DENIED, "Permission denied")
    }

    pub const fn unknown_property() -> Self {
        Self::new(Self::UNKNOWN_PROPERTY, "Unknown property")
    }

    pub const fn not_writable() -> Self {
        Self::new(Self::INVALID_PROPERTY_ACCESS, "Property not writable")
    }

    pub fn to_json(self) -> Value {
        json!({ "code": self.code, "message": self.message })
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// A validated inbound request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Echoed verbatim in the response, `null` when absent
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl Request {
    /// Check the envelope shape
    ///
    /// On failure the error comes with the id to answer with, or `None` when
    /// the message was not an object at all.
    pub fn from_message(message: Value) -> Result<Self, (Option<Value>, RpcError)> {
        let Value::Object(mut object) = message else {
            return Err((None, RpcError::invalid_request()));
        };
        let id = object.remove("id").unwrap_or(Value::Null);
        let method = match object.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err((Some(id), RpcError::invalid_request())),
        };
        let params = object.remove("params").unwrap_or(Value::Null);
        Ok(Self { id, method, params })
    }
}

pub fn response(id: Value, result: Result<Value, RpcError>) -> Value {
    match result {
        Ok(result) => json!({ "id": id, "result": result }),
        Err(error) => json!({ "id": id, "error": error.to_json() }),
    }
}

/// Error for a frame that could not be matched to any request
pub fn error_without_id(error: RpcError) -> Value {
    let mut object = Map::new();
    object.insert("error".to_string(), error.to_json());
    Value::Object(object)
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({ "method": method, "params": params })
}

/// Frame queued for a connection's writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(Value),
    Binary(WireValue),
}

/// Sending half of a connection's single-writer queue
#[derive(Debug, Clone)]
pub struct Outbound(mpsc::UnboundedSender<Outgoing>);

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Queue a frame; false once the writer is gone
    pub fn send(&self, frame: Outgoing) -> bool {
        self.0.send(frame).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}
