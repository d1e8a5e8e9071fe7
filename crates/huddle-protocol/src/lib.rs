//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle chat relay.
//!
//! Both directions use the same JSON envelope:
//!
//! ```text
//! { "eventType": "<tag>", "data": { ...tag-specific fields... } }
//! ```
//!
//! ## Client events
//!
//! - `create_room` / `join_room` - Open a session in a room
//! - `leave_room` - End a session
//! - `reconnect_room` - Rebind a new connection to a session by token
//! - `send_message` - Broadcast a message to a room
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientEvent, ServerEvent};
//!
//! let raw = br#"{"eventType":"join_room","data":{"roomName":"r1","username":"bob"}}"#;
//! assert_eq!(codec::decode(raw).unwrap(), ClientEvent::join_room("r1", "bob"));
//!
//! let encoded = codec::encode(&ServerEvent::message_received("bob", "hi")).unwrap();
//! let envelope = codec::decode_envelope(&encoded).unwrap();
//! assert_eq!(envelope.event_type, "message_received");
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, decode_with_limit, encode, Envelope, ProtocolError, MAX_FRAME_SIZE};
pub use events::{
    validate_name, ClientEvent, ErrorCode, EventType, ServerEvent, MAX_NAME_LENGTH,
};
