//! # huddle-transport
//!
//! Transport boundary for the Huddle chat relay.
//!
//! The core never touches sockets directly. It sees a connection as a
//! [`ConnectionId`] handle plus a [`FrameSink`] registered under that handle;
//! the task serving the connection owns the matching [`FrameStream`].
//!
//! ```rust,ignore
//! use huddle_transport::{websocket, ConnectionId, FrameStream};
//!
//! async fn serve(socket: axum::extract::ws::WebSocket) {
//!     let id = ConnectionId::generate();
//!     let (sink, mut stream) = websocket::split(socket, websocket::DEFAULT_MAX_MESSAGE_SIZE);
//!     while let Ok(Some(frame)) = stream.recv().await {
//!         // Hand the frame to the command handler
//!     }
//! }
//! ```

pub mod traits;
pub mod websocket;

pub use traits::{ConnectionId, FrameSink, FrameStream, TransportError};
pub use websocket::{WebSocketSink, WebSocketStream};
