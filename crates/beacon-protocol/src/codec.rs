//! Codec for encoding relay messages and decoding client messages.
//!
//! Messages travel as JSON text, one envelope per transport frame.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::frames::{ClientMessage, RelayMessage};

/// Maximum inbound message size (512 KiB).
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {0} exceeds maximum {MAX_MESSAGE_SIZE}")]
    MessageTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope label is not one this relay understands.
    #[error("Unknown envelope: {0}")]
    UnknownEnvelope(String),

    /// Structurally invalid message.
    #[error("Invalid message: {0}")]
    Invalid(String),

    /// Event failed validation.
    #[error("Invalid event: {0}")]
    InvalidEvent(&'static str),
}

/// Encode a relay message to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &RelayMessage) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode a client message from bytes.
///
/// # Errors
///
/// Returns an error if the data is too large, not a JSON array, or not a known envelope.
pub fn decode(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(data.len()));
    }

    let values: Vec<Value> = serde_json::from_slice(data)?;
    ClientMessage::try_from(values)
}
