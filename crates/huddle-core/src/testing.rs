//! Test doubles.

use async_trait::async_trait;
use bytes::Bytes;
use huddle_protocol::{codec, ServerEvent};
use huddle_transport::{FrameSink, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A sink that records every payload written to it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    payloads: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
    fail: bool,
}

impl RecordingSink {
    /// A sink whose writes always fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.payloads.lock().unwrap().clone()
    }

    /// Recorded payloads decoded as server events.
    pub fn events(&self) -> Vec<ServerEvent> {
        self.payloads()
            .iter()
            .map(|p| codec::decode_server_event(p).unwrap())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::SendFailed("broken pipe".to_string()));
        }
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.payloads.lock().unwrap().push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
