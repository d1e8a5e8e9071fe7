//! Event types for the Huddle protocol.
//!
//! Every message on the wire is an envelope `{"eventType": ..., "data": {...}}`.
//! Client events are decoded in two stages (see [`crate::codec`]); server
//! events are serialized directly from [`ServerEvent`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum room or user name length, in characters.
pub const MAX_NAME_LENGTH: usize = 64;

/// Client event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    CreateRoom,
    JoinRoom,
    LeaveRoom,
    ReconnectRoom,
    SendMessage,
}

impl EventType {
    /// Wire name of the tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::CreateRoom => "create_room",
            EventType::JoinRoom => "join_room",
            EventType::LeaveRoom => "leave_room",
            EventType::ReconnectRoom => "reconnect_room",
            EventType::SendMessage => "send_message",
        }
    }

    /// Look up a tag by its wire name.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "create_room" => Some(EventType::CreateRoom),
            "join_room" => Some(EventType::JoinRoom),
            "leave_room" => Some(EventType::LeaveRoom),
            "reconnect_room" => Some(EventType::ReconnectRoom),
            "send_message" => Some(EventType::SendMessage),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable error codes carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    MalformedEvent,
    UnknownEventType,
    InvalidPayload,
    RoomNotFound,
    RoomAlreadyExists,
    UsernameTaken,
    InvalidToken,
    Internal,
}

impl ErrorCode {
    /// Wire name of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MalformedEvent => "MalformedEvent",
            ErrorCode::UnknownEventType => "UnknownEventType",
            ErrorCode::InvalidPayload => "InvalidPayload",
            ErrorCode::RoomNotFound => "RoomNotFound",
            ErrorCode::RoomAlreadyExists => "RoomAlreadyExists",
            ErrorCode::UsernameTaken => "UsernameTaken",
            ErrorCode::InvalidToken => "InvalidToken",
            ErrorCode::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a room or user name.
///
/// # Errors
///
/// Returns an error message if the name is empty, too long, or contains
/// control characters.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err("name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("name contains control characters");
    }
    Ok(())
}

fn require(field: &'static str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    Ok(())
}

fn require_name(field: &'static str, value: &str) -> Result<(), String> {
    validate_name(value).map_err(|reason| format!("{field}: {reason}"))
}

/// Payload of `create_room` and `join_room`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub room_name: String,
    pub username: String,
}

impl RoomRequest {
    pub(crate) fn validate(&self) -> Result<(), String> {
        require_name("roomName", &self.room_name)?;
        require_name("username", &self.username)
    }
}

/// Payload of `leave_room`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub room_name: String,
    pub username: String,
    pub token: String,
}

impl LeaveRequest {
    pub(crate) fn validate(&self) -> Result<(), String> {
        require("roomName", &self.room_name)?;
        require("username", &self.username)?;
        require("token", &self.token)
    }
}

/// Payload of `reconnect_room`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectRequest {
    pub token: String,
}

impl ReconnectRequest {
    pub(crate) fn validate(&self) -> Result<(), String> {
        require("token", &self.token)
    }
}

/// Payload of `send_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub room_name: String,
    pub username: String,
    pub body: String,
}

impl SendMessageRequest {
    pub(crate) fn validate(&self) -> Result<(), String> {
        require("roomName", &self.room_name)?;
        require("username", &self.username)?;
        require("body", &self.body)
    }
}

/// A decoded client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    CreateRoom(RoomRequest),
    JoinRoom(RoomRequest),
    LeaveRoom(LeaveRequest),
    ReconnectRoom(ReconnectRequest),
    SendMessage(SendMessageRequest),
}

impl ClientEvent {
    /// Get the event tag.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            ClientEvent::CreateRoom(_) => EventType::CreateRoom,
            ClientEvent::JoinRoom(_) => EventType::JoinRoom,
            ClientEvent::LeaveRoom(_) => EventType::LeaveRoom,
            ClientEvent::ReconnectRoom(_) => EventType::ReconnectRoom,
            ClientEvent::SendMessage(_) => EventType::SendMessage,
        }
    }

    /// Create a `create_room` event.
    #[must_use]
    pub fn create_room(room_name: impl Into<String>, username: impl Into<String>) -> Self {
        ClientEvent::CreateRoom(RoomRequest {
            room_name: room_name.into(),
            username: username.into(),
        })
    }

    /// Create a `join_room` event.
    #[must_use]
    pub fn join_room(room_name: impl Into<String>, username: impl Into<String>) -> Self {
        ClientEvent::JoinRoom(RoomRequest {
            room_name: room_name.into(),
            username: username.into(),
        })
    }

    /// Create a `leave_room` event.
    #[must_use]
    pub fn leave_room(
        room_name: impl Into<String>,
        username: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        ClientEvent::LeaveRoom(LeaveRequest {
            room_name: room_name.into(),
            username: username.into(),
            token: token.into(),
        })
    }

    /// Create a `reconnect_room` event.
    #[must_use]
    pub fn reconnect_room(token: impl Into<String>) -> Self {
        ClientEvent::ReconnectRoom(ReconnectRequest {
            token: token.into(),
        })
    }

    /// Create a `send_message` event.
    #[must_use]
    pub fn send_message(
        room_name: impl Into<String>,
        username: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        ClientEvent::SendMessage(SendMessageRequest {
            room_name: room_name.into(),
            username: username.into(),
            body: body.into(),
        })
    }
}

/// A session acknowledgement: `room_created`, `room_joined`, `room_left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub token: String,
    pub room_name: String,
}

/// Payload of `room_reconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectedData {
    pub token: String,
    pub room_name: String,
    pub username: String,
}

/// Payload of `message_received`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    pub username: String,
    pub body: String,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: String,
}

/// An event sent from the server to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomCreated(SessionData),
    RoomJoined(SessionData),
    RoomLeft(SessionData),
    RoomReconnected(ReconnectedData),
    MessageReceived(MessageData),
    Error(ErrorData),
}

impl ServerEvent {
    /// Wire name of the tag.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            ServerEvent::RoomCreated(_) => "room_created",
            ServerEvent::RoomJoined(_) => "room_joined",
            ServerEvent::RoomLeft(_) => "room_left",
            ServerEvent::RoomReconnected(_) => "room_reconnected",
            ServerEvent::MessageReceived(_) => "message_received",
            ServerEvent::Error(_) => "error",
        }
    }

    #[must_use]
    pub fn room_created(token: impl Into<String>, room_name: impl Into<String>) -> Self {
        ServerEvent::RoomCreated(SessionData {
            token: token.into(),
            room_name: room_name.into(),
        })
    }

    #[must_use]
    pub fn room_joined(token: impl Into<String>, room_name: impl Into<String>) -> Self {
        ServerEvent::RoomJoined(SessionData {
            token: token.into(),
            room_name: room_name.into(),
        })
    }

    #[must_use]
    pub fn room_left(token: impl Into<String>, room_name: impl Into<String>) -> Self {
        ServerEvent::RoomLeft(SessionData {
            token: token.into(),
            room_name: room_name.into(),
        })
    }

    #[must_use]
    pub fn room_reconnected(
        token: impl Into<String>,
        room_name: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        ServerEvent::RoomReconnected(ReconnectedData {
            token: token.into(),
            room_name: room_name.into(),
            username: username.into(),
        })
    }

    #[must_use]
    pub fn message_received(username: impl Into<String>, body: impl Into<String>) -> Self {
        ServerEvent::MessageReceived(MessageData {
            username: username.into(),
            body: body.into(),
        })
    }

    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorData {
            code,
            message: message.into(),
        })
    }
}
