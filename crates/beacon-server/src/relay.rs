//! Relay message handling.
//!
//! Decodes one inbound client message, applies relay policy, and replies on
//! the originating connection. The only error returned is a failed reply
//! write, which the caller treats as the end of that connection.

use beacon_core::{EventIndex, WriteError};
use beacon_protocol::{codec, reason, ClientMessage, Event, RelayMessage};
use beacon_transport::{AuthError, AuthVerifier, ClientConnection, TransportError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::metrics;

/// Relay policy over a shared event index.
pub struct Relay {
    index: Arc<EventIndex>,
    verifier: AuthVerifier,
    auth_required: bool,
}

impl Relay {
    /// Create a relay.
    #[must_use]
    pub fn new(index: Arc<EventIndex>, config: &RelayConfig) -> Self {
        Self {
            index,
            verifier: AuthVerifier::new(config.url.as_deref()),
            auth_required: config.auth_required,
        }
    }

    /// The event index.
    #[must_use]
    pub fn index(&self) -> &Arc<EventIndex> {
        &self.index
    }

    /// Handle one inbound message from `conn`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the reply could not be written.
    pub async fn handle_message(
        &self,
        conn: &ClientConnection,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let message = match codec::decode(data) {
            Ok(message) => message,
            Err(e) => {
                debug!(conn_id = %conn.id(), error = %e, "Undecodable message");
                metrics::record_error("decode");
                return conn
                    .write_json(&RelayMessage::notice(reason::format(reason::ERROR, e)))
                    .await;
            }
        };

        match message {
            ClientMessage::Event(event) => self.handle_event(conn, &event).await,
            ClientMessage::Auth(event) => self.handle_auth(conn, &event).await,
            ClientMessage::Req {
                subscription_id, ..
            } => {
                conn.write_json(&RelayMessage::closed(
                    subscription_id,
                    reason::format(reason::ERROR, "subscriptions are not served by this relay"),
                ))
                .await
            }
            ClientMessage::Close { subscription_id } => {
                debug!(conn_id = %conn.id(), subscription_id = %subscription_id, "Ignoring CLOSE");
                Ok(())
            }
        }
    }

    async fn handle_event(&self, conn: &ClientConnection, event: &Event) -> Result<(), TransportError> {
        if let Err(e) = event.verify() {
            return conn
                .write_json(&RelayMessage::rejected(&event.id, reason::INVALID, e))
                .await;
        }

        if self.auth_required {
            match conn.authed_pubkey() {
                None => {
                    return conn
                        .write_json(&RelayMessage::rejected(
                            &event.id,
                            reason::AUTH_REQUIRED,
                            "authenticate to publish",
                        ))
                        .await;
                }
                Some(pubkey) if pubkey != event.pubkey => {
                    return conn
                        .write_json(&RelayMessage::rejected(
                            &event.id,
                            reason::RESTRICTED,
                            "events must be signed by the authenticated key",
                        ))
                        .await;
                }
                Some(_) => {}
            }
        }

        if event.is_ephemeral() {
            return conn.write_json(&RelayMessage::ok(&event.id)).await;
        }

        let result = if event.is_deletion() {
            self.apply_deletion(event).await
        } else {
            self.save(event).await
        };

        let reply = match result {
            Ok(()) => RelayMessage::ok(&event.id),
            Err(e) => {
                warn!(conn_id = %conn.id(), event_id = %event.id, error = %e, "Event not stored");
                RelayMessage::rejected(&event.id, reason::ERROR, e)
            }
        };
        conn.write_json(&reply).await
    }

    async fn save(&self, event: &Event) -> Result<(), WriteError> {
        let start = Instant::now();
        let result = self.index.save_event(event).await;
        metrics::record_index_operation("save", result.is_ok(), start.elapsed());
        result
    }

    /// Delete every `e`-tagged event owned by the author, then store the
    /// deletion request itself.
    async fn apply_deletion(&self, deletion: &Event) -> Result<(), WriteError> {
        for target in deletion.tag_values("e") {
            if let Some(existing) = self.index.get_event(target).await? {
                if existing.pubkey != deletion.pubkey {
                    debug!(target_id = %target, "Skipping deletion of another author's event");
                    continue;
                }
            }
            let start = Instant::now();
            let result = self.index.delete_event(target, &deletion.pubkey).await;
            metrics::record_index_operation("delete", result.is_ok(), start.elapsed());
            result?;
        }
        self.save(deletion).await
    }

    async fn handle_auth(&self, conn: &ClientConnection, event: &Event) -> Result<(), TransportError> {
        let outcome = conn.authenticate(&self.verifier, event).await;
        metrics::record_auth(outcome.is_ok());

        let reply = match outcome {
            Ok(_) => RelayMessage::ok(&event.id),
            Err(e @ AuthError::AlreadyAuthenticated) => {
                RelayMessage::rejected(&event.id, reason::DUPLICATE, e)
            }
            Err(e) => RelayMessage::rejected(&event.id, reason::INVALID, e),
        };
        conn.write_json(&reply).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beacon_core::{IndexConfig, MemoryStore};
    use beacon_protocol::{FrameType, KIND_CLIENT_AUTH, KIND_DELETION};
    use beacon_transport::{MessageSink, RequestInfo};
    use bytes::Bytes;
    use secp256k1::{Keypair, Secp256k1};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn write_message(&mut self, _: FrameType, data: Bytes) -> Result<(), TransportError> {
            self.frames
                .lock()
                .unwrap()
                .push(serde_json::from_slice(&data).unwrap());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    impl RecordingSink {
        fn last(&self) -> Value {
            self.frames.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn keys(seed: u8) -> Keypair {
        Keypair::from_seckey_slice(&Secp256k1::new(), &[seed; 32]).unwrap()
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    async fn setup(auth_required: bool) -> (Relay, ClientConnection, RecordingSink) {
        let index = EventIndex::init(Arc::new(MemoryStore::new()), fast_index())
            .await
            .unwrap();
        let relay = Relay::new(
            Arc::new(index),
            &RelayConfig {
                url: Some("wss://relay.example.com".into()),
                auth_required,
                ..RelayConfig::default()
            },
        );
        let sink = RecordingSink::default();
        let conn = ClientConnection::new(sink.clone(), RequestInfo::default());
        (relay, conn, sink)
    }

    fn fast_index() -> IndexConfig {
        let mut config = IndexConfig::default();
        config.bulk.flush_interval_ms = 10;
        config
    }

    async fn send(relay: &Relay, conn: &ClientConnection, message: Value) {
        relay
            .handle_message(conn, message.to_string().as_bytes())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_event_is_stored_and_acknowledged() {
        let (relay, conn, sink) = setup(false).await;
        let event = Event::sign(&keys(1), 1000, 1, vec![], "hi");

        send(&relay, &conn, json!(["EVENT", event])).await;

        assert_eq!(sink.last(), json!(["OK", event.id, true, ""]));
        assert_eq!(relay.index().get_event(&event.id).await.unwrap(), Some(event));
    }

    #[tokio::test]
    async fn test_invalid_event_rejected() {
        let (relay, conn, sink) = setup(false).await;
        let mut event = Event::sign(&keys(1), 1000, 1, vec![], "hi");
        event.content = "changed".into();

        send(&relay, &conn, json!(["EVENT", event])).await;

        let reply = sink.last();
        assert_eq!(reply[2], false);
        assert!(reply[3].as_str().unwrap().starts_with("invalid:"));
        assert!(relay.index().get_event(&event.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ephemeral_event_not_stored() {
        let (relay, conn, sink) = setup(false).await;
        let event = Event::sign(&keys(1), 1000, 20_001, vec![], "typing");

        send(&relay, &conn, json!(["EVENT", event])).await;

        assert_eq!(sink.last()[2], true);
        assert!(relay.index().get_event(&event.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletion_removes_only_own_events() {
        let (relay, conn, sink) = setup(false).await;
        let mine = Event::sign(&keys(1), 1000, 1, vec![], "mine");
        let theirs = Event::sign(&keys(2), 1000, 1, vec![], "theirs");
        send(&relay, &conn, json!(["EVENT", mine])).await;
        send(&relay, &conn, json!(["EVENT", theirs])).await;

        let deletion = Event::sign(
            &keys(1),
            1001,
            KIND_DELETION,
            vec![
                vec!["e".into(), mine.id.clone()],
                vec!["e".into(), theirs.id.clone()],
                vec!["e".into(), "missing-id".into()],
            ],
            "",
        );
        send(&relay, &conn, json!(["EVENT", deletion])).await;

        assert_eq!(sink.last(), json!(["OK", deletion.id, true, ""]));
        assert!(relay.index().get_event(&mine.id).await.unwrap().is_none());
        assert!(relay.index().get_event(&theirs.id).await.unwrap().is_some());
        assert!(relay.index().get_event(&deletion.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_auth_flow() {
        let (relay, conn, sink) = setup(true).await;
        let author = keys(3);
        let note = Event::sign(&author, 1000, 1, vec![], "hi");

        send(&relay, &conn, json!(["EVENT", note])).await;
        assert!(sink.last()[3]
            .as_str()
            .unwrap()
            .starts_with("auth-required:"));

        let auth = Event::sign(
            &author,
            now(),
            KIND_CLIENT_AUTH,
            vec![
                vec!["relay".into(), "wss://relay.example.com".into()],
                vec!["challenge".into(), conn.challenge().into()],
            ],
            "",
        );
        send(&relay, &conn, json!(["AUTH", auth])).await;
        assert_eq!(sink.last(), json!(["OK", auth.id, true, ""]));
        assert_eq!(conn.authed_pubkey(), Some(auth.pubkey.as_str()));

        send(&relay, &conn, json!(["AUTH", auth])).await;
        assert!(sink.last()[3].as_str().unwrap().starts_with("duplicate:"));

        send(&relay, &conn, json!(["EVENT", note])).await;
        assert_eq!(sink.last()[2], true);

        let foreign = Event::sign(&keys(4), 1000, 1, vec![], "not mine");
        send(&relay, &conn, json!(["EVENT", foreign])).await;
        assert!(sink.last()[3].as_str().unwrap().starts_with("restricted:"));
    }

    #[tokio::test]
    async fn test_bad_auth_leaves_connection_unauthenticated() {
        let (relay, conn, sink) = setup(false).await;
        let auth = Event::sign(
            &keys(3),
            now(),
            KIND_CLIENT_AUTH,
            vec![vec!["challenge".into(), "wrong".into()]],
            "",
        );

        send(&relay, &conn, json!(["AUTH", auth])).await;

        assert!(sink.last()[3].as_str().unwrap().starts_with("invalid:"));
        assert!(!conn.is_authed());
    }

    #[tokio::test]
    async fn test_req_close_and_garbage() {
        let (relay, conn, sink) = setup(false).await;

        send(&relay, &conn, json!(["REQ", "sub-1", {"kinds": [1]}])).await;
        let reply = sink.last();
        assert_eq!(reply[0], "CLOSED");
        assert_eq!(reply[1], "sub-1");

        send(&relay, &conn, json!(["CLOSE", "sub-1"])).await;
        assert_eq!(sink.frames.lock().unwrap().len(), 1);

        relay.handle_message(&conn, b"not json").await.unwrap();
        assert_eq!(sink.last()[0], "NOTICE");
    }
}
