//! Frame types and message envelopes for the Beacon relay.
//!
//! Every message is a JSON array whose first element names the envelope,
//! e.g. `["EVENT", "sub-1", {...}]` or `["OK", "<id>", true, ""]`.

use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;

use crate::codec::ProtocolError;
use crate::event::Event;

/// Transport frame kinds, numbered after the WebSocket opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Text = 0x01,
    Binary = 0x02,
    Close = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
}

impl FrameType {
    /// Whether this is a control frame.
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, FrameType::Close | FrameType::Ping | FrameType::Pong)
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Text),
            0x02 => Ok(FrameType::Binary),
            0x08 => Ok(FrameType::Close),
            0x09 => Ok(FrameType::Ping),
            0x0A => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Machine-readable prefixes for `OK` and `CLOSED` messages.
pub mod reason {
    pub const INVALID: &str = "invalid";
    pub const ERROR: &str = "error";
    pub const AUTH_REQUIRED: &str = "auth-required";
    pub const RESTRICTED: &str = "restricted";
    pub const BLOCKED: &str = "blocked";
    pub const DUPLICATE: &str = "duplicate";

    /// Format `prefix: message`.
    #[must_use]
    pub fn format(prefix: &str, message: impl std::fmt::Display) -> String {
        format!("{prefix}: {message}")
    }
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Event delivery, optionally scoped to a subscription.
    Event {
        subscription_id: Option<String>,
        event: Event,
    },
    /// Result of an `EVENT` or `AUTH` submission.
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// Human-readable notice.
    Notice { message: String },
    /// Authentication challenge.
    Auth { challenge: String },
    /// Subscription closed by the relay.
    Closed {
        subscription_id: String,
        message: String,
    },
    /// End of stored events.
    Eose { subscription_id: String },
}

impl RelayMessage {
    /// Event delivery for a subscription.
    #[must_use]
    pub fn event(subscription_id: impl Into<String>, event: Event) -> Self {
        RelayMessage::Event {
            subscription_id: Some(subscription_id.into()),
            event,
        }
    }

    /// Accepting `OK`.
    #[must_use]
    pub fn ok(event_id: impl Into<String>) -> Self {
        RelayMessage::Ok {
            event_id: event_id.into(),
            accepted: true,
            message: String::new(),
        }
    }

    /// Rejecting `OK` with a `prefix: message` reason.
    #[must_use]
    pub fn rejected(
        event_id: impl Into<String>,
        prefix: &str,
        message: impl std::fmt::Display,
    ) -> Self {
        RelayMessage::Ok {
            event_id: event_id.into(),
            accepted: false,
            message: reason::format(prefix, message),
        }
    }

    /// Notice.
    #[must_use]
    pub fn notice(message: impl Into<String>) -> Self {
        RelayMessage::Notice {
            message: message.into(),
        }
    }

    /// Authentication challenge.
    #[must_use]
    pub fn auth(challenge: impl Into<String>) -> Self {
        RelayMessage::Auth {
            challenge: challenge.into(),
        }
    }

    /// Subscription closed.
    #[must_use]
    pub fn closed(subscription_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayMessage::Closed {
            subscription_id: subscription_id.into(),
            message: message.into(),
        }
    }

    /// The envelope label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            RelayMessage::Event { .. } => "EVENT",
            RelayMessage::Ok { .. } => "OK",
            RelayMessage::Notice { .. } => "NOTICE",
            RelayMessage::Auth { .. } => "AUTH",
            RelayMessage::Closed { .. } => "CLOSED",
            RelayMessage::Eose { .. } => "EOSE",
        }
    }
}

impl Serialize for RelayMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        seq.serialize_element(self.label())?;
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if let Some(id) = subscription_id {
                    seq.serialize_element(id)?;
                }
                seq.serialize_element(event)?;
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                seq.serialize_element(event_id)?;
                seq.serialize_element(accepted)?;
                seq.serialize_element(message)?;
            }
            RelayMessage::Notice { message } => seq.serialize_element(message)?,
            RelayMessage::Auth { challenge } => seq.serialize_element(challenge)?,
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(message)?;
            }
            RelayMessage::Eose { subscription_id } => seq.serialize_element(subscription_id)?,
        }
        seq.end()
    }
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Publish an event.
    Event(Box<Event>),
    /// Authentication response.
    Auth(Box<Event>),
    /// Open a subscription. Filters are carried uninterpreted.
    Req {
        subscription_id: String,
        filters: Vec<Value>,
    },
    /// Close a subscription.
    Close { subscription_id: String },
}

impl ClientMessage {
    /// The envelope label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ClientMessage::Event(_) => "EVENT",
            ClientMessage::Auth(_) => "AUTH",
            ClientMessage::Req { .. } => "REQ",
            ClientMessage::Close { .. } => "CLOSE",
        }
    }
}

fn string_at(values: &[Value], index: usize, what: &str) -> Result<String, ProtocolError> {
    values
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::Invalid(format!("missing {what}")))
}

fn event_at(values: &[Value], index: usize) -> Result<Box<Event>, ProtocolError> {
    let value = values
        .get(index)
        .cloned()
        .ok_or_else(|| ProtocolError::Invalid("missing event".into()))?;
    Ok(Box::new(serde_json::from_value(value)?))
}

impl TryFrom<Vec<Value>> for ClientMessage {
    type Error = ProtocolError;

    fn try_from(values: Vec<Value>) -> Result<Self, Self::Error> {
        let label = values
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Invalid("missing envelope label".into()))?;

        match label {
            "EVENT" => Ok(ClientMessage::Event(event_at(&values, 1)?)),
            "AUTH" => Ok(ClientMessage::Auth(event_at(&values, 1)?)),
            "REQ" => Ok(ClientMessage::Req {
                subscription_id: string_at(&values, 1, "subscription id")?,
                filters: values[2..].to_vec(),
            }),
            "CLOSE" => Ok(ClientMessage::Close {
                subscription_id: string_at(&values, 1, "subscription id")?,
            }),
            other => Err(ProtocolError::UnknownEnvelope(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Event {
        Event {
            id: "abc".into(),
            pubkey: "p1".into(),
            created_at: 1000,
            kind: 1,
            tags: vec![],
            content: "hi".into(),
            sig: "s".into(),
        }
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(1), Ok(FrameType::Text));
        assert_eq!(u8::from(FrameType::Close), 8);
        assert!(FrameType::try_from(3).is_err());
        assert!(FrameType::Ping.is_control());
        assert!(!FrameType::Binary.is_control());
    }

    #[test]
    fn test_event_envelope_with_subscription() {
        let value = serde_json::to_value(RelayMessage::event("sub-1", event())).unwrap();
        assert_eq!(value[0], "EVENT");
        assert_eq!(value[1], "sub-1");
        assert_eq!(value[2]["id"], "abc");
    }

    #[test]
    fn test_event_envelope_without_subscription() {
        let message = RelayMessage::Event {
            subscription_id: None,
            event: event(),
        };
        let value = serde_json::to_value(message).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
        assert_eq!(value[1]["content"], "hi");
    }

    #[test]
    fn test_ok_envelopes() {
        let value = serde_json::to_value(RelayMessage::ok("abc")).unwrap();
        assert_eq!(value, json!(["OK", "abc", true, ""]));

        let value =
            serde_json::to_value(RelayMessage::rejected("abc", reason::INVALID, "bad sig")).unwrap();
        assert_eq!(value, json!(["OK", "abc", false, "invalid: bad sig"]));
    }

    #[test]
    fn test_auth_and_closed_envelopes() {
        assert_eq!(
            serde_json::to_value(RelayMessage::auth("chal")).unwrap(),
            json!(["AUTH", "chal"])
        );
        assert_eq!(
            serde_json::to_value(RelayMessage::closed("s", "error: nope")).unwrap(),
            json!(["CLOSED", "s", "error: nope"])
        );
    }

    #[test]
    fn test_parse_client_messages() {
        let values = vec![json!("EVENT"), serde_json::to_value(event()).unwrap()];
        let msg = ClientMessage::try_from(values).unwrap();
        assert_eq!(msg, ClientMessage::Event(Box::new(event())));

        let values = vec![json!("REQ"), json!("s1"), json!({"kinds": [1]}), json!({})];
        match ClientMessage::try_from(values).unwrap() {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                assert_eq!(subscription_id, "s1");
                assert_eq!(filters.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        let values = vec![json!("CLOSE"), json!("s1")];
        assert_eq!(ClientMessage::try_from(values).unwrap().label(), "CLOSE");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ClientMessage::try_from(vec![]).is_err());
        assert!(ClientMessage::try_from(vec![json!("EVENT")]).is_err());
        assert!(ClientMessage::try_from(vec![json!("CLOSE"), json!(5)]).is_err());
        assert!(matches!(
            ClientMessage::try_from(vec![json!("COUNT"), json!("s")]),
            Err(ProtocolError::UnknownEnvelope(_))
        ));
    }
}
