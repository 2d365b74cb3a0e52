//! WebSocket sinks.
//!
//! [`MessageSink`] for the write half of an axum WebSocket and, behind the
//! `websocket` feature, of a tokio-tungstenite stream.

use async_trait::async_trait;
use axum::extract::ws::{self, WebSocket};
use beacon_protocol::FrameType;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::borrow::Cow;

use crate::traits::{MessageSink, TransportError};

/// Split a close payload into its status code and reason.
///
/// An empty payload means "no status"; a single byte is malformed.
pub fn parse_close_payload(data: &[u8]) -> Result<Option<(u16, String)>, TransportError> {
    match data {
        [] => Ok(None),
        [_] => Err(TransportError::InvalidPayload(
            "close payload shorter than a status code".into(),
        )),
        [hi, lo, reason @ ..] => {
            let reason = std::str::from_utf8(reason).map_err(|_| {
                TransportError::InvalidPayload("close reason is not UTF-8".into())
            })?;
            Ok(Some((u16::from_be_bytes([*hi, *lo]), reason.to_string())))
        }
    }
}

/// Build a close payload from a status code and reason.
#[must_use]
pub fn close_payload(code: u16, reason: &str) -> Bytes {
    let mut buf = Vec::with_capacity(2 + reason.len());
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(reason.as_bytes());
    Bytes::from(buf)
}

fn text(data: Bytes) -> Result<String, TransportError> {
    String::from_utf8(data.to_vec())
        .map_err(|_| TransportError::InvalidPayload("text frame is not UTF-8".into()))
}

/// Convert a frame into an axum WebSocket message.
pub fn to_axum_message(frame_type: FrameType, data: Bytes) -> Result<ws::Message, TransportError> {
    Ok(match frame_type {
        FrameType::Text => ws::Message::Text(text(data)?),
        FrameType::Binary => ws::Message::Binary(data.to_vec()),
        FrameType::Ping => ws::Message::Ping(data.to_vec()),
        FrameType::Pong => ws::Message::Pong(data.to_vec()),
        FrameType::Close => ws::Message::Close(parse_close_payload(&data)?.map(|(code, reason)| {
            ws::CloseFrame {
                code,
                reason: Cow::Owned(reason),
            }
        })),
    })
}

#[async_trait]
impl MessageSink for SplitSink<WebSocket, ws::Message> {
    async fn write_message(
        &mut self,
        frame_type: FrameType,
        data: Bytes,
    ) -> Result<(), TransportError> {
        let message = to_axum_message(frame_type, data)?;
        self.send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "axum"
    }
}

#[cfg(feature = "websocket")]
mod tungstenite_sink {
    use super::*;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::WebSocketStream;

    /// Convert a frame into a tungstenite message.
    pub fn to_tungstenite_message(
        frame_type: FrameType,
        data: Bytes,
    ) -> Result<Message, TransportError> {
        Ok(match frame_type {
            FrameType::Text => Message::Text(text(data)?),
            FrameType::Binary => Message::Binary(data.to_vec()),
            FrameType::Ping => Message::Ping(data.to_vec()),
            FrameType::Pong => Message::Pong(data.to_vec()),
            FrameType::Close => {
                Message::Close(parse_close_payload(&data)?.map(|(code, reason)| CloseFrame {
                    code: CloseCode::from(code),
                    reason: Cow::Owned(reason),
                }))
            }
        })
    }

    #[async_trait]
    impl<S> MessageSink for SplitSink<WebSocketStream<S>, Message>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        async fn write_message(
            &mut self,
            frame_type: FrameType,
            data: Bytes,
        ) -> Result<(), TransportError> {
            let message = to_tungstenite_message(frame_type, data)?;
            self.send(message).await.map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    TransportError::ConnectionClosed
                }
                WsError::Io(io) => TransportError::Io(io),
                other => TransportError::SendFailed(other.to_string()),
            })
        }

        fn name(&self) -> &'static str {
            "tungstenite"
        }
    }
}

#[cfg(feature = "websocket")]
pub use tungstenite_sink::to_tungstenite_message;
