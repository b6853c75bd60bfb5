use thiserror::Error;

use crate::types;

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Server-defined JSON-RPC error code: a requested capability is not enabled
/// on this server.
pub const CAPABILITY_DISABLED: i32 = -32001;

/// Server-defined JSON-RPC error code: the requested resource does not exist.
pub const RESOURCE_NOT_FOUND: i32 = -32002;

/// Everything that can go wrong inside this crate.
///
/// The variants are stable shapes: callers are expected to test them with
/// `matches!` (or `assert_matches!` in tests) the way one would test Go
/// sentinel errors with `errors.Is`.  Variants that in other implementations
/// would be a sentinel plus a wrapping struct are a single payload-carrying
/// variant here.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The request ID is not one of the two permitted kinds (string or
    /// integer).  Null IDs land here: the protocol forbids them outright.
    #[error("invalid request ID: {reason}")]
    InvalidId { reason: String },

    /// The request ID decoded to its kind's zero value (`""` or `0`).
    #[error("request ID cannot be empty")]
    EmptyRequestId,

    #[error("soft timeout must be greater than zero")]
    SoftTimeoutNotPositive,

    #[error("maximum timeout must be greater than zero")]
    MaximumTimeoutNotPositive,

    #[error("soft timeout exceeds maximum timeout")]
    SoftTimeoutExceedsMaximum,

    /// The ID was already registered in this session, possibly by a request
    /// that has long since terminated.  IDs are never reusable within a
    /// session.
    #[error("request ID already used in this session")]
    DuplicateRequestId,

    #[error("request not found")]
    RequestNotFound,

    /// A message failed envelope-level validation (wrong protocol version,
    /// empty or reserved method name, malformed result/error combination).
    #[error("{reason}")]
    Validation { reason: String },

    #[error("empty JSON data")]
    EmptyJsonData,

    /// The JSON was well-formed but is not a request, notification, response,
    /// or batch of those.
    #[error("message is not a request, notification, or response")]
    UnsupportedMessageType,

    #[error("batch must contain at least one message")]
    InvalidBatch,

    #[error("invalid message in batch at index {index}")]
    InvalidMessageInBatch {
        index: usize,
        #[source]
        source: Box<ProtocolError>,
    },

    #[error("error parsing JSON")]
    Parse {
        #[source]
        source: serde_json::Error,
    },

    #[error("error serializing message to JSON")]
    Ser {
        #[source]
        source: serde_json::Error,
    },

    /// A timeout callback panicked.  The panic was contained; this is what the
    /// installed error sink receives, with the recovered payload rendered into
    /// the message.
    #[error("callback panic: {message}")]
    CallbackPanic { message: String },
}

/// Any error this crate produces should be representable on the wire as a
/// JSON-RPC error object, so the surrounding server can answer the peer
/// without inventing codes at every call site.
///
/// Internal conditions deliberately map to a bland `InternalError`; the remote
/// peer has no business learning which invariant we tripped over.
impl From<ProtocolError> for types::ErrorDetails {
    fn from(val: ProtocolError) -> Self {
        match val {
            ProtocolError::Parse { .. } => types::ErrorDetails::parse_error("Invalid JSON", None),
            ProtocolError::EmptyJsonData => types::ErrorDetails::parse_error("Empty JSON data", None),
            ProtocolError::InvalidId { .. } | ProtocolError::EmptyRequestId => {
                types::ErrorDetails::invalid_request("Invalid request ID", None)
            }
            ProtocolError::Validation { reason } => types::ErrorDetails::invalid_request(reason, None),
            ProtocolError::DuplicateRequestId => {
                types::ErrorDetails::invalid_request("Duplicate request ID", None)
            }
            ProtocolError::UnsupportedMessageType
            | ProtocolError::InvalidBatch
            | ProtocolError::InvalidMessageInBatch { .. } => {
                types::ErrorDetails::invalid_request(val.to_string(), None)
            }
            ProtocolError::SoftTimeoutNotPositive
            | ProtocolError::MaximumTimeoutNotPositive
            | ProtocolError::SoftTimeoutExceedsMaximum
            | ProtocolError::RequestNotFound
            | ProtocolError::Ser { .. }
            | ProtocolError::CallbackPanic { .. } => {
                types::ErrorDetails::internal_error("Internal error", None)
            }
        }
    }
}

/// Render a recovered panic payload into something useful for logging.
///
/// Only `String` and `&'static str` payloads carry a message; anything else
/// gets described by its type.  Same approach tokio takes internally when it
/// reports panics from spawned tasks.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        format!("panic of type {}", std::any::type_name_of_val(&*payload))
    }
}
