//! Rust struct definitions that ser/de to/from JSON-RPC 2.0 messages, plus the
//! request identifier type the rest of the crate is built around.
//!
//! The envelope shapes are exactly what the JSON-RPC spec prescribes, with one
//! MCP-specific tightening: request and response IDs are never null.  An ID is
//! either a non-empty string or a non-zero integer, and that rule is enforced
//! at the decode boundary so nothing downstream ever has to re-check it.
use std::fmt::Display;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Result};

/// Re-export the pieces of the JSON-RPC protocol that other crates already get
/// right.
///
/// `TwoPointZero` is a zero-sized version tag that serializes as the literal
/// string `"2.0"` and refuses to deserialize from anything else, which is
/// exactly the version rule the protocol wants.  `ErrorCode` covers the
/// standard numeric codes; the MCP server-defined codes live as constants in
/// [`crate::error`].
pub use jsonrpsee_types::{error::ErrorCode, params::TwoPointZero};
pub use serde_json::Value as JsonValue;

/// Counter backing the generated request IDs.
///
/// Deliberately process-wide, not per-session: two sessions in the same
/// process will never mint the same generated ID, and the generated sequence
/// is monotonic across threads without any coordination beyond the atomic.
/// Callers who need stricter scoping construct their IDs explicitly.
static ID_COUNTER: AtomicI64 = AtomicI64::new(0);

/// Request ID
///
/// Either kind serializes as its bare primitive.  Unlike base JSON-RPC there
/// is no null variant: a null ID is invalid in every position this crate deals
/// with, so it is rejected when decoding rather than represented.
#[derive(Debug, PartialEq, Clone, Hash, Eq, Serialize, PartialOrd, Ord)]
#[serde(untagged)]
pub enum Id {
    /// String id
    Str(String),
    /// Numeric id
    Number(i64),
}

impl Id {
    /// True if the value is the zero value of its kind (`""` or `0`).
    ///
    /// Empty IDs are forbidden on the wire; this predicate is what the decode
    /// path and the lifecycle manager use to enforce that.
    pub fn is_empty(&self) -> bool {
        match self {
            Id::Str(s) => s.is_empty(),
            Id::Number(n) => *n == 0,
        }
    }

    /// Decode an ID from an already-parsed JSON value.
    ///
    /// This is the one place the ID rules live:
    /// - strings and integers are the only accepted kinds; null, floats,
    ///   booleans, objects and arrays fail with [`ProtocolError::InvalidId`];
    /// - the kind's zero value fails with [`ProtocolError::EmptyRequestId`].
    ///
    /// The `Deserialize` impl routes through here; call this directly when the
    /// distinction between the two failure kinds matters.
    pub fn from_value(value: &JsonValue) -> Result<Self> {
        match value {
            JsonValue::String(s) => {
                if s.is_empty() {
                    Err(ProtocolError::EmptyRequestId)
                } else {
                    Ok(Id::Str(s.clone()))
                }
            }
            JsonValue::Number(n) => match n.as_i64() {
                Some(0) => Err(ProtocolError::EmptyRequestId),
                Some(value) => Ok(Id::Number(value)),
                None => Err(ProtocolError::InvalidId {
                    reason: format!("id must be a string or an integer, got {n}"),
                }),
            },
            JsonValue::Null => Err(ProtocolError::InvalidId {
                reason: "id must not be null".to_string(),
            }),
            other => Err(ProtocolError::InvalidId {
                reason: format!("id must be a string or an integer, got {other}"),
            }),
        }
    }

    /// Mint the next integer ID from the process-wide counter.
    pub fn next_int() -> Self {
        Id::Number(ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Mint the next string ID (`req-1`, `req-2`, ...) from the same
    /// process-wide counter as [`Id::next_int`].
    pub fn next_string() -> Self {
        Id::Str(format!("req-{}", ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1))
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Id::Str(string) => write!(f, "{}", string),
            Id::Number(num) => write!(f, "{}", num),
        }
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Str(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::Str(value)
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Number(value)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        Id::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Serializable [JSON-RPC request object](https://www.jsonrpc.org/specification#request_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Request ID
    pub id: Id,
    /// Name of the method to be invoked.
    pub method: String,
    /// Parameter values of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Request {
    /// Create a serializable JSON-RPC method call.
    pub fn new(id: impl Into<Id>, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            id: id.into(),
            method: method.into(),
            params: params.into(),
        }
    }

    /// Check the request against the protocol rules that the type system does
    /// not already enforce.
    pub fn validate(&self) -> Result<()> {
        if self.method.trim().is_empty() {
            return Err(ProtocolError::Validation {
                reason: "method name cannot be empty or whitespace".to_string(),
            });
        }
        // Method names beginning with "rpc." are reserved for rpc-internal
        // methods and extensions per the JSON-RPC spec.
        if self.method.starts_with("rpc.") {
            return Err(ProtocolError::Validation {
                reason: "method names starting with 'rpc.' are reserved".to_string(),
            });
        }
        if self.id.is_empty() {
            return Err(ProtocolError::Validation {
                reason: "id must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Serializable [JSON-RPC notification object](https://www.jsonrpc.org/specification#notification).
///
/// Differs from the request object in that it does not have an `id` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notification {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Name of the method to be invoked.
    pub method: String,
    /// Parameter values of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Notification {
    /// Create a serializable JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            method: method.into(),
            params: params.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.method.trim().is_empty() {
            return Err(ProtocolError::Validation {
                reason: "method cannot be empty".to_string(),
            });
        }
        if self.method.starts_with("rpc.") {
            return Err(ProtocolError::Validation {
                reason: "method names starting with 'rpc.' are reserved".to_string(),
            });
        }
        Ok(())
    }
}

/// JSON-RPC response object as defined in the [spec](https://www.jsonrpc.org/specification#response_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Payload which can be result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
    /// Request ID
    pub id: Id,
}

impl Response {
    /// Create a new response with some payload already constructed
    pub fn new(id: Id, payload: ResponsePayload) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            payload,
            id,
        }
    }

    /// Create an owned successful response
    pub fn success(id: impl Into<Id>, result: JsonValue) -> Self {
        Self::new(id.into(), ResponsePayload::success(result))
    }

    /// Create an error response
    pub fn error(
        id: impl Into<Id>,
        code: ErrorCode,
        message: impl Into<String>,
        data: impl Into<Option<JsonValue>>,
    ) -> Self {
        Self::new(
            id.into(),
            ResponsePayload::Error(ErrorResponse {
                error: ErrorDetails {
                    code,
                    message: message.into(),
                    data: data.into(),
                },
            }),
        )
    }

    /// Create an error response from already-constructed error details
    pub fn error_details(id: impl Into<Id>, details: ErrorDetails) -> Self {
        Self::new(id.into(), ResponsePayload::Error(details.into()))
    }

    pub fn is_success(&self) -> bool {
        matches!(self.payload, ResponsePayload::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    /// Check the response against the protocol rules that the type system does
    /// not already enforce.
    ///
    /// The result-xor-error rule is structural (see [`ResponsePayload`]), so
    /// what is left is the ID and the error-object contents: a present error
    /// must carry a non-zero code and a non-empty message.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ProtocolError::Validation {
                reason: "response ID must not be empty".to_string(),
            });
        }
        if let ResponsePayload::Error(ErrorResponse { error }) = &self.payload {
            if error.code.code() == 0 {
                return Err(ProtocolError::Validation {
                    reason: "error code must be a non-zero integer".to_string(),
                });
            }
            if error.message.is_empty() {
                return Err(ProtocolError::Validation {
                    reason: "error message must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Possible payloads of a JSON-RPC response
///
/// This is an `untagged` enum so that serde will try to deserialize into each
/// variant in order until one succeeds.  This works because success responses
/// have `result` and error responses have `error`, and a message carrying both
/// or neither is rejected before it ever reaches this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Corresponds to a failed JSON-RPC response with an `error` field.
    Error(ErrorResponse),
    /// Corresponds to a successful JSON-RPC response with a `result` field.
    Success(SuccessResponse),
}

impl ResponsePayload {
    /// Create a successful response payload
    pub fn success(result: JsonValue) -> Self {
        ResponsePayload::Success(SuccessResponse { result })
    }

    /// Create an error response payload
    pub fn error(details: impl Into<ErrorDetails>) -> Self {
        ResponsePayload::Error(details.into().into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub result: JsonValue,
}

impl From<JsonValue> for SuccessResponse {
    fn from(result: JsonValue) -> Self {
        Self { result }
    }
}

/// [Failed JSON-RPC response object](https://www.jsonrpc.org/specification#error_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

impl From<ErrorDetails> for ErrorResponse {
    fn from(error: ErrorDetails) -> Self {
        Self { error }
    }
}

/// [JSON-RPC error object details](https://www.jsonrpc.org/specification#error_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Code
    pub code: ErrorCode,
    /// Message
    pub message: String,
    /// Optional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ParseError, message, data)
    }
    pub fn invalid_request(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, data)
    }
    pub fn method_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message, data)
    }
    pub fn invalid_params(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, data)
    }
    pub fn internal_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InternalError, message, data)
    }
    pub fn capability_disabled(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(
            ErrorCode::ServerError(crate::error::CAPABILITY_DISABLED),
            message,
            data,
        )
    }
    pub fn resource_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(
            ErrorCode::ServerError(crate::error::RESOURCE_NOT_FOUND),
            message,
            data,
        )
    }
    pub fn server_error(code: i32, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ServerError(code), message, data)
    }
}
