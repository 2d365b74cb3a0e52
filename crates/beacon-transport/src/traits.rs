//! Transport abstraction traits for Beacon.
//!
//! A connection only needs the write half of its transport; the read half is
//! driven by whichever task owns the socket.

use async_trait::async_trait;
use beacon_protocol::FrameType;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{:016x}", rand::random::<u64>()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Payload cannot be carried by the requested frame type.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Value could not be serialized.
    #[error("Encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The write half of a client transport.
///
/// Implementations are not required to tolerate concurrent use; callers
/// serialize access (see [`ClientConnection`](crate::ClientConnection)).
#[async_trait]
pub trait MessageSink: Send {
    /// Write one complete frame.
    ///
    /// For [`FrameType::Close`], `data` is an optional big-endian status code
    /// followed by a UTF-8 reason.
    async fn write_message(&mut self, frame_type: FrameType, data: Bytes)
        -> Result<(), TransportError>;

    /// Get the sink name (e.g., "axum", "tungstenite").
    fn name(&self) -> &'static str;
}
