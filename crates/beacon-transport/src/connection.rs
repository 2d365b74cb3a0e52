//! Client connections.
//!
//! A [`ClientConnection`] owns the write half of one transport. All writes go
//! through a single async mutex, so any number of tasks may share the
//! connection behind an `Arc` without interleaving frames.

use axum::http::{HeaderMap, Uri};
use beacon_protocol::{Event, FrameType, RelayMessage};
use bytes::Bytes;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::auth::{AuthError, AuthVerifier};
use crate::traits::{ConnectionId, MessageSink, TransportError};

/// Request metadata captured when the connection was upgraded.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    uri: Uri,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
}

impl RequestInfo {
    /// Capture request metadata.
    #[must_use]
    pub fn new(uri: Uri, headers: HeaderMap, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            uri,
            headers,
            remote_addr,
        }
    }

    /// Request URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Request headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value, if present and valid ASCII.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Peer socket address.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Client IP, preferring proxy headers over the peer address.
    ///
    /// `X-Forwarded-For` and `X-Real-Ip` are taken as sent, so a client not
    /// behind a trusted proxy can forge them. Use this for logging only.
    #[must_use]
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
            .or_else(|| {
                self.header("x-real-ip")
                    .and_then(|v| v.trim().parse().ok())
            })
            .or_else(|| self.remote_addr.map(|addr| addr.ip()))
    }
}

/// Authentication state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthPhase {
    Unauthenticated = 0,
    Authenticating = 1,
    /// Terminal.
    Authenticated = 2,
}

impl AuthPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AuthPhase::Authenticating,
            2 => AuthPhase::Authenticated,
            _ => AuthPhase::Unauthenticated,
        }
    }
}

/// One live client session.
pub struct ClientConnection {
    id: ConnectionId,
    sink: Mutex<Box<dyn MessageSink>>,
    request: RequestInfo,
    challenge: String,
    phase: AtomicU8,
    authed_pubkey: OnceLock<String>,
    authed: watch::Sender<bool>,
    auth_lock: Mutex<()>,
}

impl ClientConnection {
    /// Wrap a sink, issuing a fresh challenge.
    pub fn new(sink: impl MessageSink + 'static, request: RequestInfo) -> Self {
        Self::from_boxed(Box::new(sink), request)
    }

    /// Wrap an already boxed sink.
    #[must_use]
    pub fn from_boxed(sink: Box<dyn MessageSink>, request: RequestInfo) -> Self {
        let (authed, _) = watch::channel(false);
        Self {
            id: ConnectionId::generate(),
            sink: Mutex::new(sink),
            request,
            challenge: hex::encode(rand::random::<[u8; 16]>()),
            phase: AtomicU8::new(AuthPhase::Unauthenticated as u8),
            authed_pubkey: OnceLock::new(),
            authed,
            auth_lock: Mutex::new(()),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Metadata of the upgrade request.
    #[must_use]
    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    /// The challenge a client must sign to authenticate.
    #[must_use]
    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    /// Serialize `value` as JSON and write it as one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the transport write fails.
    pub async fn write_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), TransportError> {
        let data = serde_json::to_vec(value)?;
        self.write_message(FrameType::Text, data).await
    }

    /// Write one pre-serialized frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport write fails. The connection is left
    /// open; closing it is up to the caller.
    pub async fn write_message(
        &self,
        frame_type: FrameType,
        data: impl Into<Bytes>,
    ) -> Result<(), TransportError> {
        let data = data.into();
        let mut sink = self.sink.lock().await;
        let name = sink.name();
        sink.write_message(frame_type, data).await.map_err(|e| {
            debug!(conn_id = %self.id, sink = name, error = %e, "Write failed");
            e
        })
    }

    /// Deliver an event for a subscription.
    ///
    /// # Errors
    ///
    /// Same as [`write_json`](Self::write_json).
    pub async fn send_event(&self, subscription_id: &str, event: &Event) -> Result<(), TransportError> {
        self.write_json(&RelayMessage::event(subscription_id, event.clone()))
            .await
    }

    /// Current authentication phase.
    #[must_use]
    pub fn auth_phase(&self) -> AuthPhase {
        AuthPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Whether authentication has settled.
    #[must_use]
    pub fn is_authed(&self) -> bool {
        self.auth_phase() == AuthPhase::Authenticated
    }

    /// The verified public key, once authenticated.
    #[must_use]
    pub fn authed_pubkey(&self) -> Option<&str> {
        self.authed_pubkey.get().map(String::as_str)
    }

    /// Wait until the connection is authenticated.
    ///
    /// Resolves immediately if it already is. Never resolves for a
    /// connection that does not authenticate.
    pub async fn authed(&self) -> Option<&str> {
        let mut rx = self.authed.subscribe();
        // The sender lives as long as `self`, so this only returns once settled.
        let _ = rx.wait_for(|settled| *settled).await;
        self.authed_pubkey()
    }

    /// Verify a NIP-42 auth event against this connection's challenge.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::AlreadyAuthenticated`] once settled, or the
    /// verifier's error.
    pub async fn authenticate(
        &self,
        verifier: &AuthVerifier,
        event: &Event,
    ) -> Result<String, AuthError> {
        self.authenticate_with(|challenge| verifier.verify(challenge, event))
            .await
    }

    /// Run `verify` against the challenge and settle on success.
    ///
    /// Attempts are serialized through the auth lock. A failed attempt leaves
    /// the connection unauthenticated and does not fire the signal.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::AlreadyAuthenticated`] once settled, or the
    /// error produced by `verify`.
    pub async fn authenticate_with<F>(&self, verify: F) -> Result<String, AuthError>
    where
        F: FnOnce(&str) -> Result<String, AuthError>,
    {
        let _guard = self.auth_lock.lock().await;

        if self
            .phase
            .compare_exchange(
                AuthPhase::Unauthenticated as u8,
                AuthPhase::Authenticating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(AuthError::AlreadyAuthenticated);
        }

        match verify(&self.challenge) {
            Ok(pubkey) => {
                if self.authed_pubkey.set(pubkey.clone()).is_err() {
                    return Err(AuthError::AlreadyAuthenticated);
                }
                self.phase
                    .store(AuthPhase::Authenticated as u8, Ordering::Release);
                self.authed.send_replace(true);
                info!(conn_id = %self.id, pubkey = %pubkey, "Client authenticated");
                Ok(pubkey)
            }
            Err(e) => {
                self.phase
                    .store(AuthPhase::Unauthenticated as u8, Ordering::Release);
                debug!(conn_id = %self.id, error = %e, "Authentication failed");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("challenge", &self.challenge)
            .field("phase", &self.auth_phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// Writes each frame in small chunks, yielding between them, so that
    /// unserialized writers would interleave.
    #[derive(Clone, Default)]
    struct ChunkedSink {
        wire: Arc<std::sync::Mutex<Vec<u8>>>,
    }

    #[async_trait]
    impl MessageSink for ChunkedSink {
        async fn write_message(
            &mut self,
            _frame_type: FrameType,
            data: Bytes,
        ) -> Result<(), TransportError> {
            for chunk in data.chunks(3) {
                self.wire.lock().unwrap().extend_from_slice(chunk);
                tokio::task::yield_now().await;
            }
            self.wire.lock().unwrap().push(b'\n');
            Ok(())
        }

        fn name(&self) -> &'static str {
            "chunked"
        }
    }

    struct ClosedSink;

    #[async_trait]
    impl MessageSink for ClosedSink {
        async fn write_message(&mut self, _: FrameType, _: Bytes) -> Result<(), TransportError> {
            Err(TransportError::ConnectionClosed)
        }

        fn name(&self) -> &'static str {
            "closed"
        }
    }

    #[test]
    fn test_challenge_is_unique_hex() {
        let a = ClientConnection::new(ChunkedSink::default(), RequestInfo::default());
        let b = ClientConnection::new(ChunkedSink::default(), RequestInfo::default());
        assert_eq!(a.challenge().len(), 32);
        assert!(a.challenge().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.challenge(), b.challenge());
        assert_eq!(a.auth_phase(), AuthPhase::Unauthenticated);
        assert!(a.authed_pubkey().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_do_not_interleave() {
        let sink = ChunkedSink::default();
        let wire = sink.wire.clone();
        let conn = Arc::new(ClientConnection::new(sink, RequestInfo::default()));

        let handles: Vec<_> = (0..8)
            .map(|writer| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    for seq in 0..25 {
                        conn.write_json(&serde_json::json!({ "writer": writer, "seq": seq, "pad": "x".repeat(40) }))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let wire = wire.lock().unwrap().clone();
        let lines: Vec<&[u8]> = wire.split(|b| *b == b'\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 200);
        for line in lines {
            let value: serde_json::Value = serde_json::from_slice(line).unwrap();
            assert!(value["writer"].is_u64());
        }
    }

    #[tokio::test]
    async fn test_write_error_is_reported() {
        let conn = ClientConnection::new(ClosedSink, RequestInfo::default());
        assert!(matches!(
            conn.write_message(FrameType::Text, "x").await,
            Err(TransportError::ConnectionClosed)
        ));
        // The connection itself stays usable for auth state.
        assert_eq!(conn.auth_phase(), AuthPhase::Unauthenticated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_auth_settles_once() {
        let conn = Arc::new(ClientConnection::new(ChunkedSink::default(), RequestInfo::default()));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    conn.authenticate_with(|_| Ok(format!("pubkey-{i}"))).await
                })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(pubkey) => winners.push(pubkey),
                Err(e) => assert!(matches!(e, AuthError::AlreadyAuthenticated)),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(conn.authed_pubkey(), Some(winners[0].as_str()));
        assert_eq!(conn.auth_phase(), AuthPhase::Authenticated);
    }

    #[tokio::test]
    async fn test_failed_auth_does_not_settle() {
        let conn = ClientConnection::new(ChunkedSink::default(), RequestInfo::default());

        let err = conn
            .authenticate_with(|_| Err(AuthError::ChallengeMismatch))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ChallengeMismatch));
        assert_eq!(conn.auth_phase(), AuthPhase::Unauthenticated);
        assert!(conn.authed_pubkey().is_none());
        assert!(tokio::time::timeout(Duration::from_millis(20), conn.authed())
            .await
            .is_err());

        // A later attempt may still succeed.
        let challenge = conn.challenge().to_string();
        let pubkey = conn
            .authenticate_with(|c| {
                assert_eq!(c, challenge);
                Ok("p1".into())
            })
            .await
            .unwrap();
        assert_eq!(pubkey, "p1");
        assert!(conn.is_authed());
    }

    #[tokio::test]
    async fn test_authed_wakes_waiters() {
        let conn = Arc::new(ClientConnection::new(ChunkedSink::default(), RequestInfo::default()));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.authed().await.map(str::to_string) })
            })
            .collect();
        tokio::task::yield_now().await;

        conn.authenticate_with(|_| Ok("p1".into())).await.unwrap();

        for waiter in waiters {
            let pubkey = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(pubkey.as_deref(), Some("p1"));
        }
        // Late waiters resolve immediately.
        assert_eq!(conn.authed().await, Some("p1"));
    }

    #[test]
    fn test_client_ip_prefers_proxy_headers() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.2".parse().unwrap());
        let info = RequestInfo::new(Uri::from_static("/"), headers, Some(peer));
        assert_eq!(info.client_ip(), Some("203.0.113.7".parse().unwrap()));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.3".parse().unwrap());
        let info = RequestInfo::new(Uri::from_static("/"), headers, Some(peer));
        assert_eq!(info.client_ip(), Some("198.51.100.3".parse().unwrap()));

        let info = RequestInfo::new(Uri::from_static("/"), HeaderMap::new(), Some(peer));
        assert_eq!(info.client_ip(), Some(peer.ip()));
    }
}
