//! The protocol core of an MCP (Model Context Protocol) implementation: the
//! JSON-RPC 2.0 message types it speaks, and the machinery that tracks every
//! in-flight request within a session.
//!
//! There are two halves here.  The message half ([`Request`], [`Response`],
//! [`Notification`], [`Message`]) gives transports strongly typed envelopes
//! with the protocol's validation
//! rules applied at the decode boundary, including the MCP tightening that
//! request IDs are never null and never empty.  The lifecycle half
//! ([`RequestLifecycleManager`]) enforces per-session ID uniqueness and drives
//! a two-stage timeout (a soft advisory deadline and a hard maximum) for every
//! tracked request, with panic-contained callback dispatch and a shutdown that
//! can either detach or join outstanding callbacks.
//!
//! Transports, service registries, and server wiring live elsewhere; this
//! crate never sends anything itself, it only tells the surrounding code when
//! and how to react.

mod error;
mod lifecycle;
mod message;
#[cfg(test)]
pub mod testing;
mod types;

pub use error::{ProtocolError, Result, CAPABILITY_DISABLED, RESOURCE_NOT_FOUND};
pub use lifecycle::{
    ErrorCallback, RequestLifecycleManager, RequestLifecycleManagerBuilder, TimeoutCallback,
    TimeoutType,
};
pub use message::Message;
pub use types::{
    ErrorCode, ErrorDetails, ErrorResponse, Id, JsonValue, Notification, Request, Response,
    ResponsePayload, SuccessResponse, TwoPointZero,
};
