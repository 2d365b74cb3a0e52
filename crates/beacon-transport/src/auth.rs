//! NIP-42 client authentication.

use axum::http::Uri;
use beacon_protocol::{Event, ProtocolError, KIND_CLIENT_AUTH};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default tolerance between an auth event's timestamp and the relay clock.
pub const DEFAULT_MAX_SKEW: Duration = Duration::from_secs(600);

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The connection has already authenticated.
    #[error("already authenticated")]
    AlreadyAuthenticated,

    /// Not an auth event.
    #[error("wrong event kind {0}")]
    WrongKind(u16),

    /// The `challenge` tag is missing or does not match.
    #[error("challenge mismatch")]
    ChallengeMismatch,

    /// The `relay` tag is missing or names another relay.
    #[error("relay mismatch")]
    RelayMismatch,

    /// `created_at` is too far from now.
    #[error("created_at {0} is out of range")]
    Stale(i64),

    /// Bad id or signature.
    #[error(transparent)]
    InvalidEvent(#[from] ProtocolError),
}

/// Checks auth events against a connection's challenge.
#[derive(Debug, Clone)]
pub struct AuthVerifier {
    relay_host: Option<String>,
    max_skew: Duration,
}

impl Default for AuthVerifier {
    fn default() -> Self {
        Self {
            relay_host: None,
            max_skew: DEFAULT_MAX_SKEW,
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    url.parse::<Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_ascii_lowercase))
}

impl AuthVerifier {
    /// A verifier that also requires the `relay` tag to name `relay_url`'s host.
    ///
    /// An unparseable or hostless URL disables the relay check.
    #[must_use]
    pub fn new(relay_url: Option<&str>) -> Self {
        Self {
            relay_host: relay_url.and_then(host_of),
            ..Self::default()
        }
    }

    /// Override the accepted clock skew.
    #[must_use]
    pub fn with_max_skew(mut self, max_skew: Duration) -> Self {
        self.max_skew = max_skew;
        self
    }

    /// The host the `relay` tag must match, if any.
    #[must_use]
    pub fn relay_host(&self) -> Option<&str> {
        self.relay_host.as_deref()
    }

    /// Verify `event` against `challenge`, returning the authenticated pubkey.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn verify(&self, challenge: &str, event: &Event) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        self.verify_at(challenge, event, now)
    }

    /// Like [`verify`](Self::verify) with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn verify_at(&self, challenge: &str, event: &Event, now: i64) -> Result<String, AuthError> {
        if event.kind != KIND_CLIENT_AUTH {
            return Err(AuthError::WrongKind(event.kind));
        }

        if event.created_at.abs_diff(now) > self.max_skew.as_secs() {
            return Err(AuthError::Stale(event.created_at));
        }

        if event.tag_value("challenge") != Some(challenge) {
            return Err(AuthError::ChallengeMismatch);
        }

        if let Some(expected) = &self.relay_host {
            let host = event.tag_value("relay").and_then(host_of);
            if host.as_deref() != Some(expected.as_str()) {
                return Err(AuthError::RelayMismatch);
            }
        }

        event.verify()?;
        Ok(event.pubkey.clone())
    }
}
