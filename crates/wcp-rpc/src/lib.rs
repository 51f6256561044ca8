//! JSON-RPC 2.0 wire types for the WCP protocol.
//!
//! Every message that crosses the relay is a JSON-RPC request or response.
//! This crate owns the envelope types, the protocol method constants, and
//! the decode path; it knows nothing about topics, keys, or state.

pub mod methods;

use serde::{Deserialize, Serialize};

/// Protocol version string carried in every payload.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes used on the wire.
pub mod error_codes {
    /// Payload was not valid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Payload was JSON but not a valid request.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Method is unknown or not admitted by the receiver's permissions.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Params did not validate.
    pub const INVALID_PARAMS: i64 = -32602;
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("payload is not valid JSON-RPC: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("payload is not valid UTF-8")]
    Encoding,
}

/// Request identifier. Generated once per outbound request and echoed by the
/// responder; response correlation is keyed on it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Fresh random nonzero id.
    pub fn generate() -> Self {
        loop {
            let mut buf = [0u8; 8];
            // getrandom only fails when the OS entropy source is unusable,
            // at which point nothing in this protocol can run anyway.
            getrandom::getrandom(&mut buf).ok();
            let id = u64::from_be_bytes(buf);
            if id != 0 {
                return RequestId(id);
            }
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Request {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: RequestId::generate(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

impl ErrorObject {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
        }
    }
}

/// Successful JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: serde_json::Value,
}

/// Failed JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: ErrorObject,
}

/// Either half of a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Success(SuccessResponse),
    Error(ErrorResponse),
}

impl Response {
    pub fn ok(id: RequestId, result: serde_json::Value) -> Self {
        Response::Success(SuccessResponse {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result,
        })
    }

    pub fn err(id: RequestId, error: ErrorObject) -> Self {
        Response::Error(ErrorResponse {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            error,
        })
    }

    pub fn id(&self) -> RequestId {
        match self {
            Response::Success(r) => r.id,
            Response::Error(r) => r.id,
        }
    }

    /// Unwrap into `Result`, cloning out the payload halves.
    pub fn into_result(self) -> Result<serde_json::Value, ErrorObject> {
        match self {
            Response::Success(r) => Ok(r.result),
            Response::Error(r) => Err(r.error),
        }
    }
}

/// Any JSON-RPC payload arriving on a topic.
///
/// Decode order matters for the untagged representation: a request is the
/// only shape carrying `method`, so it is tried first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Request(Request),
    Response(Response),
}

impl Payload {
    pub fn from_json(bytes: &[u8]) -> Result<Self, RpcError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Serialization of these closed types cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn id(&self) -> RequestId {
        match self {
            Payload::Request(r) => r.id,
            Payload::Response(r) => r.id(),
        }
    }
}
