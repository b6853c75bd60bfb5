//! Classification of raw JSON into typed protocol messages.
//!
//! Everything that arrives on the wire is one of four things: a request, a
//! notification, a response, or a batch of those.  The discrimination itself
//! is done over the parsed [`JsonValue`] by field presence (the only rules the
//! JSON-RPC spec gives us), and from there each candidate is deserialized into
//! its typed struct and validated.  Serde's untagged-enum guessing is
//! deliberately not used for inbound classification: it cannot tell a caller
//! *why* a message failed, and the error taxonomy here cares about the
//! difference between "not JSON", "not a message", and "message number three
//! in your batch is garbage".
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::types::{Id, Notification, Request, Response};
use crate::{ProtocolError, Result};

/// Every possible (valid) JSON-RPC message that can be sent over the wire.
///
/// Batches hold only the three leaf kinds; a batch nested inside a batch is
/// not a valid message.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// A request with method, id, and optional params
    Request(Request),
    /// A notification with method and optional params but no id
    Notification(Notification),
    /// A response containing either a result or an error
    Response(Response),
    /// A batch of requests, notifications, and responses
    Batch(Vec<Message>),
}

impl Message {
    /// Classify and validate a message from its wire form.
    ///
    /// Transport implementations should prefer this over their own
    /// interpretation; every protocol rule about message shape is applied
    /// here, and the returned errors distinguish all the ways input can be
    /// unacceptable.
    pub fn from_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(ProtocolError::EmptyJsonData);
        }
        let value: JsonValue =
            serde_json::from_str(text).map_err(|source| ProtocolError::Parse { source })?;
        Self::from_value(value)
    }

    /// Classify an already-parsed JSON value.
    pub fn from_value(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(map) => Self::classify_object(map),
            JsonValue::Array(items) => {
                if items.is_empty() {
                    return Err(ProtocolError::InvalidBatch);
                }
                let mut messages = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let element = match item {
                        JsonValue::Object(map) => Self::classify_object(map),
                        // No nested batches, and no bare primitives either
                        _ => Err(ProtocolError::UnsupportedMessageType),
                    };
                    match element {
                        Ok(message) => messages.push(message),
                        Err(source) => {
                            return Err(ProtocolError::InvalidMessageInBatch {
                                index,
                                source: Box::new(source),
                            });
                        }
                    }
                }
                Ok(Message::Batch(messages))
            }
            _ => Err(ProtocolError::UnsupportedMessageType),
        }
    }

    /// Classify a single JSON object by field presence, then deserialize and
    /// validate it as the kind the fields say it is.
    fn classify_object(map: Map<String, JsonValue>) -> Result<Self> {
        check_version(&map)?;

        let has_method = map.contains_key("method");
        let has_id = map.contains_key("id");
        let has_result = map.contains_key("result");
        let has_error = map.contains_key("error");

        if has_method {
            if has_id {
                // Fail on the ID first so empty and malformed IDs surface as
                // their own error kinds rather than a generic shape complaint.
                if let Some(raw_id) = map.get("id") {
                    Id::from_value(raw_id)?;
                }
                let request: Request = deserialize_shape(map)?;
                request.validate()?;
                Ok(Message::Request(request))
            } else {
                let notification: Notification = deserialize_shape(map)?;
                notification.validate()?;
                Ok(Message::Notification(notification))
            }
        } else if has_result && has_error {
            Err(ProtocolError::Validation {
                reason: "response must not contain both result and error".to_string(),
            })
        } else if (has_result || has_error) && has_id {
            if let Some(raw_id) = map.get("id") {
                Id::from_value(raw_id)?;
            }
            let response: Response = deserialize_shape(map)?;
            response.validate()?;
            Ok(Message::Response(response))
        } else {
            Err(ProtocolError::UnsupportedMessageType)
        }
    }

    /// Attempt to serialize this message into a UTF-8 string for the wire.
    ///
    /// This is fallible but unlikely to fail barring memory issues.
    pub fn into_string(self) -> Result<String> {
        serde_json::to_string(&self).map_err(|source| ProtocolError::Ser { source })
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(request) => Some(request),
            _ => None,
        }
    }

    pub fn as_notification(&self) -> Option<&Notification> {
        match self {
            Message::Notification(notification) => Some(notification),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(response) => Some(response),
            _ => None,
        }
    }

    pub fn as_batch(&self) -> Option<&[Message]> {
        match self {
            Message::Batch(messages) => Some(messages),
            _ => None,
        }
    }
}

/// The version tag must be exactly `"2.0"`.
///
/// Checked over the raw map before typed deserialization so the failure
/// carries a readable reason; the typed structs then re-enforce it
/// structurally through [`crate::types::TwoPointZero`].
fn check_version(map: &Map<String, JsonValue>) -> Result<()> {
    match map.get("jsonrpc") {
        Some(JsonValue::String(version)) if version == "2.0" => Ok(()),
        Some(other) => Err(ProtocolError::Validation {
            reason: format!("invalid JSON-RPC version: expected \"2.0\", got {other}"),
        }),
        None => Err(ProtocolError::Validation {
            reason: "missing jsonrpc version field".to_string(),
        }),
    }
}

/// Deserialize a classified object into its typed struct, reporting shape
/// problems (unknown fields, wrong field types) as validation failures.
fn deserialize_shape<T: serde::de::DeserializeOwned>(map: Map<String, JsonValue>) -> Result<T> {
    serde_json::from_value(JsonValue::Object(map)).map_err(|e| ProtocolError::Validation {
        reason: e.to_string(),
    })
}
