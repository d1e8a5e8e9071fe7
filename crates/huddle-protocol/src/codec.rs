//! Codec for encoding and decoding Huddle events.
//!
//! Inbound frames are decoded in two stages: the outer [`Envelope`] first,
//! then the `data` sub-document according to the `eventType` tag. Outbound
//! events are serialized to JSON and sent verbatim by the transport.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{
    ClientEvent, ErrorCode, EventType, LeaveRequest, ReconnectRequest, RoomRequest,
    SendMessageRequest, ServerEvent,
};

/// Maximum frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The outer envelope is not well-formed.
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// The envelope tag is not a known client event.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The `data` sub-document does not match the tag's shape.
    #[error("Invalid {event_type} payload: {reason}")]
    InvalidPayload {
        event_type: EventType,
        reason: String,
    },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// The error code reported to the client.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Malformed(_) | ProtocolError::FrameTooLarge { .. } => {
                ErrorCode::MalformedEvent
            }
            ProtocolError::UnknownEventType(_) => ErrorCode::UnknownEventType,
            ProtocolError::InvalidPayload { .. } => ErrorCode::InvalidPayload,
            ProtocolError::Encode(_) => ErrorCode::Internal,
        }
    }

    /// Whether the stream is no longer interpretable and the read loop
    /// should stop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Malformed(_) | ProtocolError::FrameTooLarge { .. }
        )
    }
}

/// The outer `{eventType, data}` wrapper shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Decode the outer envelope without interpreting `data`.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if the bytes are not a JSON object
/// with a string `eventType`, or [`ProtocolError::FrameTooLarge`] if the
/// frame exceeds [`MAX_FRAME_SIZE`].
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, ProtocolError> {
    decode_envelope_with_limit(data, MAX_FRAME_SIZE)
}

/// Like [`decode_envelope`], with a caller-chosen size limit.
///
/// # Errors
///
/// See [`decode_envelope`].
pub fn decode_envelope_with_limit(data: &[u8], max: usize) -> Result<Envelope, ProtocolError> {
    if data.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max,
        });
    }

    // A derived struct also deserializes from a JSON array
    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed(
            "envelope must be a JSON object".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn payload<T: DeserializeOwned>(
    event_type: EventType,
    data: serde_json::Value,
) -> Result<T, ProtocolError> {
    if !data.is_object() {
        return Err(ProtocolError::InvalidPayload {
            event_type,
            reason: "data must be a JSON object".to_string(),
        });
    }
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        event_type,
        reason: e.to_string(),
    })
}

fn checked<T>(
    event_type: EventType,
    value: T,
    validate: impl FnOnce(&T) -> Result<(), String>,
) -> Result<T, ProtocolError> {
    validate(&value).map_err(|reason| ProtocolError::InvalidPayload { event_type, reason })?;
    Ok(value)
}

/// Decode a client event from a raw frame.
///
/// # Errors
///
/// Returns an error if the envelope is malformed, the tag is unknown, or
/// the payload does not match the tag.
pub fn decode(data: &[u8]) -> Result<ClientEvent, ProtocolError> {
    decode_with_limit(data, MAX_FRAME_SIZE)
}

/// Decode a client event, enforcing `max` instead of [`MAX_FRAME_SIZE`].
///
/// Servers that accept larger messages at the transport pass their own
/// limit here so the two checks agree.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_with_limit(data: &[u8], max: usize) -> Result<ClientEvent, ProtocolError> {
    let envelope = decode_envelope_with_limit(data, max)?;
    let event_type = EventType::from_tag(&envelope.event_type)
        .ok_or_else(|| ProtocolError::UnknownEventType(envelope.event_type.clone()))?;
    let data = envelope.data;

    let event = match event_type {
        EventType::CreateRoom => ClientEvent::CreateRoom(checked(
            event_type,
            payload(event_type, data)?,
            |p: &RoomRequest| p.validate(),
        )?),
        EventType::JoinRoom => ClientEvent::JoinRoom(checked(
            event_type,
            payload(event_type, data)?,
            |p: &RoomRequest| p.validate(),
        )?),
        EventType::LeaveRoom => ClientEvent::LeaveRoom(checked(
            event_type,
            payload(event_type, data)?,
            |p: &LeaveRequest| p.validate(),
        )?),
        EventType::ReconnectRoom => ClientEvent::ReconnectRoom(checked(
            event_type,
            payload(event_type, data)?,
            |p: &ReconnectRequest| p.validate(),
        )?),
        EventType::SendMessage => ClientEvent::SendMessage(checked(
            event_type,
            payload(event_type, data)?,
            |p: &SendMessageRequest| p.validate(),
        )?),
    };

    Ok(event)
}

/// Encode a server event to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(event: &ServerEvent) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(event).map_err(ProtocolError::Encode)?;
    Ok(Bytes::from(payload))
}

/// Decode a server event, as a client would.
///
/// # Errors
///
/// Returns an error if the bytes are not a known server event.
pub fn decode_server_event(data: &[u8]) -> Result<ServerEvent, ProtocolError> {
    serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a client event, as a client would.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_client_event(event: &ClientEvent) -> Result<Bytes, ProtocolError> {
    let data = match event {
        ClientEvent::CreateRoom(p) | ClientEvent::JoinRoom(p) => serde_json::to_value(p),
        ClientEvent::LeaveRoom(p) => serde_json::to_value(p),
        ClientEvent::ReconnectRoom(p) => serde_json::to_value(p),
        ClientEvent::SendMessage(p) => serde_json::to_value(p),
    }
    .map_err(ProtocolError::Encode)?;

    let envelope = Envelope {
        event_type: event.event_type().as_str().to_string(),
        data,
    };
    let payload = serde_json::to_vec(&envelope).map_err(ProtocolError::Encode)?;
    Ok(Bytes::from(payload))
}
