//! Event data model.
//!
//! An event is an immutable, signed record. Its `id` is the SHA-256 of the
//! canonical serialization and its `sig` is a BIP-340 Schnorr signature of
//! that id by `pubkey`.

use secp256k1::{schnorr, Keypair, Message, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::ProtocolError;

/// Event kind for deletion requests.
pub const KIND_DELETION: u16 = 5;

/// Event kind for client authentication.
pub const KIND_CLIENT_AUTH: u16 = 22242;

/// A signed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Author public key (32-byte x-only key, hex).
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: i64,
    /// Event kind.
    pub kind: u16,
    /// Tag sequences.
    pub tags: Vec<Vec<String>>,
    /// Arbitrary content.
    pub content: String,
    /// Schnorr signature of `id` (hex).
    pub sig: String,
}

impl Event {
    /// Build and sign an event with the given keypair.
    #[must_use]
    pub fn sign(
        keypair: &Keypair,
        created_at: i64,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: impl Into<String>,
    ) -> Self {
        let (pubkey, _) = keypair.x_only_public_key();
        let mut event = Self {
            id: String::new(),
            pubkey: hex::encode(pubkey.serialize()),
            created_at,
            kind,
            tags,
            content: content.into(),
            sig: String::new(),
        };
        let digest = event.digest();
        event.id = hex::encode(digest);
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(digest), keypair);
        event.sig = sig.to_string();
        event
    }

    fn digest(&self) -> [u8; 32] {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        Sha256::digest(canonical.to_string().as_bytes()).into()
    }

    /// Compute the id this event should have.
    #[must_use]
    pub fn compute_id(&self) -> String {
        hex::encode(self.digest())
    }

    /// Check that `id` matches the canonical hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not match.
    pub fn check_id(&self) -> Result<(), ProtocolError> {
        if self.id != self.compute_id() {
            return Err(ProtocolError::InvalidEvent("id does not match content hash"));
        }
        Ok(())
    }

    /// Check that `sig` is a valid signature of `id` by `pubkey`.
    ///
    /// # Errors
    ///
    /// Returns an error if any field is malformed or the signature is invalid.
    pub fn verify_signature(&self) -> Result<(), ProtocolError> {
        let pubkey = hex::decode(&self.pubkey)
            .ok()
            .and_then(|b| XOnlyPublicKey::from_slice(&b).ok())
            .ok_or(ProtocolError::InvalidEvent("malformed pubkey"))?;
        let sig = hex::decode(&self.sig)
            .ok()
            .and_then(|b| schnorr::Signature::from_slice(&b).ok())
            .ok_or(ProtocolError::InvalidEvent("malformed signature"))?;
        let id: [u8; 32] = hex::decode(&self.id)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::InvalidEvent("malformed id"))?;

        SECP256K1
            .verify_schnorr(&sig, &Message::from_digest(id), &pubkey)
            .map_err(|_| ProtocolError::InvalidEvent("signature verification failed"))
    }

    /// Check both the id and the signature.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        self.check_id()?;
        self.verify_signature()
    }

    /// Values of every tag named `name` (the second element of the tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// First value of the tag named `name`.
    #[must_use]
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|tag| match tag.as_slice() {
            [tag_name, value, ..] if tag_name == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// Whether this is a deletion request.
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.kind == KIND_DELETION
    }

    /// Ephemeral events are relayed but never stored.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        (20_000..30_000).contains(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Secp256k1;

    fn keypair() -> Keypair {
        Keypair::from_seckey_slice(&Secp256k1::new(), &[7u8; 32]).unwrap()
    }

    #[test]
    fn test_signed_event_verifies() {
        let event = Event::sign(&keypair(), 1000, 1, vec![], "hi");
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert!(event.verify().is_ok());
    }

    #[test]
    fn test_tampered_content_fails_id_check() {
        let mut event = Event::sign(&keypair(), 1000, 1, vec![], "hi");
        event.content = "bye".into();
        assert!(matches!(
            event.check_id(),
            Err(ProtocolError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let other = Keypair::from_seckey_slice(&Secp256k1::new(), &[9u8; 32]).unwrap();
        let mut event = Event::sign(&keypair(), 1000, 1, vec![], "hi");
        let forged = Event::sign(&other, 1000, 1, vec![], "hi");
        event.sig = forged.sig;
        assert!(event.check_id().is_ok());
        assert!(event.verify_signature().is_err());
    }

    #[test]
    fn test_malformed_pubkey() {
        let mut event = Event::sign(&keypair(), 1000, 1, vec![], "hi");
        event.pubkey = "zz".into();
        assert!(event.verify_signature().is_err());
    }

    #[test]
    fn test_tag_values() {
        let event = Event::sign(
            &keypair(),
            1000,
            KIND_DELETION,
            vec![
                vec!["e".into(), "abc".into()],
                vec!["p".into(), "p1".into()],
                vec!["e".into(), "def".into()],
                vec!["e".into()],
            ],
            "",
        );
        let ids: Vec<_> = event.tag_values("e").collect();
        assert_eq!(ids, vec!["abc", "def"]);
        assert_eq!(event.tag_value("p"), Some("p1"));
        assert_eq!(event.tag_value("e"), Some("abc"));
        assert_eq!(event.tag_value("relay"), None);
        assert!(event.is_deletion());
    }

    #[test]
    fn test_tag_value_outlives_name() {
        let event = Event::sign(
            &keypair(),
            1000,
            1,
            vec![vec!["e".into()], vec!["e".into(), "abc".into()]],
            "",
        );
        let value = {
            let name = String::from("e");
            event.tag_value(&name)
        };
        assert_eq!(value, Some("abc"));
    }

    #[test]
    fn test_ephemeral_range() {
        let mut event = Event::sign(&keypair(), 1000, 20_001, vec![], "");
        assert!(event.is_ephemeral());
        event.kind = 1;
        assert!(!event.is_ephemeral());
    }

    #[test]
    fn test_json_field_names() {
        let event = Event::sign(&keypair(), 1000, 1, vec![], "hi");
        let value = serde_json::to_value(&event).unwrap();
        for field in ["id", "pubkey", "created_at", "kind", "tags", "content", "sig"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }
}
