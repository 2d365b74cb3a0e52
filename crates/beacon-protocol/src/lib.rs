//! # beacon-protocol
//!
//! Event model and wire envelopes for the Beacon relay.
//!
//! ## Envelopes
//!
//! - `EVENT` - Publish (client) or deliver (relay) an event
//! - `AUTH` - Challenge (relay) and signed response (client)
//! - `REQ` / `CLOSE` - Subscription requests
//! - `OK` / `NOTICE` / `CLOSED` / `EOSE` - Relay replies
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, RelayMessage};
//!
//! let encoded = codec::encode(&RelayMessage::auth("challenge")).unwrap();
//! assert_eq!(&encoded[..], br#"["AUTH","challenge"]"#);
//! ```

pub mod codec;
pub mod event;
pub mod frames;

pub use codec::{decode, encode, ProtocolError, MAX_MESSAGE_SIZE};
pub use event::{Event, KIND_CLIENT_AUTH, KIND_DELETION};
pub use frames::{reason, ClientMessage, FrameType, RelayMessage};
