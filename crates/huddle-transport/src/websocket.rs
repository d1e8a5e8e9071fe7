//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] into the [`FrameSink`] /
//! [`FrameStream`] halves used by the rest of Huddle.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::ProtocolError;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::traits::{FrameSink, FrameStream, TransportError};

/// Default maximum inbound message size (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Split an upgraded WebSocket into its write and read halves.
#[must_use]
pub fn split(socket: WebSocket, max_message_size: usize) -> (WebSocketSink, WebSocketStream) {
    let (sink, stream) = socket.split();
    (
        WebSocketSink {
            sink: Mutex::new(sink),
            is_open: AtomicBool::new(true),
        },
        WebSocketStream {
            stream,
            max_message_size,
        },
    )
}

/// Write half of a WebSocket connection.
///
/// Payloads are JSON, so they are sent as text frames.
pub struct WebSocketSink {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    is_open: AtomicBool,
}

impl WebSocketSink {
    /// Check if the sink is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let text = String::from_utf8(payload.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text)).await.map_err(|e| {
            self.is_open.store(false, Ordering::SeqCst);
            TransportError::SendFailed(e.to_string())
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}

/// Read half of a WebSocket connection.
pub struct WebSocketStream {
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

fn check_size(len: usize, max: usize) -> Result<(), TransportError> {
    if len > max {
        warn!("Message too large: {} bytes (max: {})", len, max);
        return Err(TransportError::Protocol(ProtocolError::FrameTooLarge {
            size: len,
            max,
        }));
    }
    Ok(())
}

#[async_trait]
impl FrameStream for WebSocketStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    check_size(text.len(), self.max_message_size)?;
                    return Ok(Some(Bytes::from(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    // Accepted for clients that send JSON as binary
                    check_size(data.len(), self.max_message_size)?;
                    return Ok(Some(Bytes::from(data)));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    trace!("Control frame");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
