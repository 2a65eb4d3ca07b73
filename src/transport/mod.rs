//! # Transport Capabilities
//!
//! The latency engine never talks to the network directly. It calls into the
//! capability traits defined here:
//!
//! - [`MethodInvoker`]: direct method call with a status-coded response
//! - [`EventPublisher`]: fire-and-forget event with an out-of-band correlation token
//! - [`InboundHandler`]: callback the transport dispatches inbound events to
//! - [`Transport`]: the above plus handler registration and connection teardown
//!
//! [`tcp::TcpTransport`] is the concrete implementation used by the binary.
//! Frames on the wire are length-prefixed `bincode` encodings of [`Frame`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod tcp;

pub use tcp::TcpTransport;

/// Largest frame accepted on the wire
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Status code a peer returns for a successful method call
pub const STATUS_OK: u16 = 200;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_NOT_IMPLEMENTED: u16 = 501;

/// Errors raised by a transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("frame codec error")]
    Codec(#[from] bincode::Error),
    #[error("remote returned status {status}")]
    Remote { status: u16 },
}

/// Wire frame exchanged between the monitor and its peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    MethodRequest {
        request_id: u64,
        target: String,
        method: String,
        payload: Vec<u8>,
    },
    MethodResponse {
        request_id: u64,
        status: u16,
        payload: Vec<u8>,
    },
    Event {
        channel: String,
        correlation_id: Option<String>,
        body: Vec<u8>,
    },
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Result of a direct method call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResponse {
    pub status: u16,
    pub payload: Vec<u8>,
}

impl MethodResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// An inbound event as handed to an [`InboundHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: String,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

/// What a handler reports back to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Completed,
    Abandoned,
}

/// Body exchanged by both request patterns: the peer's current UTC time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePayload {
    #[serde(rename = "UtcTime")]
    pub utc_time: DateTime<Utc>,
}

impl TimePayload {
    pub fn now() -> Self {
        Self {
            utc_time: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Serializing a single timestamp field cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[async_trait]
pub trait MethodInvoker: Send + Sync {
    /// Invoke `method` on `target` and wait for its response
    async fn invoke_method(
        &self,
        target: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<MethodResponse, TransportError>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event; returns once it has been handed to the connection
    async fn send_event(
        &self,
        channel: &str,
        payload: Vec<u8>,
        correlation_id: &str,
    ) -> Result<(), TransportError>;
}

/// Callback for inbound events. Must not block.
pub trait InboundHandler: Send + Sync {
    fn handle(&self, message: InboundMessage) -> AckOutcome;
}

#[async_trait]
pub trait Transport: MethodInvoker + EventPublisher {
    /// Route inbound events on `channel` to `handler`, replacing any previous one
    fn register_inbound_handler(&self, channel: &str, handler: Arc<dyn InboundHandler>);

    /// Release the connection. Safe to call more than once.
    async fn close(&self) -> Result<(), TransportError>;

    /// Get transport name for identification
    fn name(&self) -> &'static str;
}
