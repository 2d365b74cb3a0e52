//! # beacon-transport
//!
//! Client connections for the Beacon relay.
//!
//! A [`ClientConnection`] wraps the write half of one duplex transport and
//! makes it safe to write from any number of tasks. It also carries the
//! connection's authentication challenge and settle-once auth state.
//!
//! ```rust,ignore
//! use beacon_transport::{ClientConnection, RequestInfo};
//!
//! let conn = Arc::new(ClientConnection::new(sink, RequestInfo::default()));
//! conn.write_json(&RelayMessage::auth(conn.challenge())).await?;
//! conn.send_event("sub-1", &event).await?;
//! ```

pub mod auth;
pub mod connection;
pub mod traits;
pub mod websocket;

pub use auth::{AuthError, AuthVerifier};
pub use connection::{AuthPhase, ClientConnection, RequestInfo};
pub use traits::{ConnectionId, MessageSink, TransportError};
