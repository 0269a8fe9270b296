//! Relay events and subscription filters (NIP-01).

use std::str::FromStr;

use bitcoin::secp256k1::{schnorr, Message, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::keys::{secp, Keys};
use crate::{RelayError, Result};

/// Kind of an encrypted direct message.
pub const KIND_ENCRYPTED_DM: u16 = 4;

/// A signed relay event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

fn compute_id(
    pubkey: &str,
    created_at: i64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    Sha256::digest(canonical.to_string().as_bytes()).into()
}

impl Event {
    /// Check the id against the event body and the signature against the id.
    pub fn verify(&self) -> Result<()> {
        let id = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(id) != self.id {
            return Err(RelayError::Protocol(format!("event {} has a wrong id", self.id)));
        }
        let pubkey = XOnlyPublicKey::from_str(&self.pubkey)
            .map_err(|e| RelayError::Protocol(format!("bad event pubkey: {}", e)))?;
        let sig = schnorr::Signature::from_str(&self.sig)
            .map_err(|e| RelayError::Protocol(format!("bad event signature: {}", e)))?;
        secp()
            .verify_schnorr(&sig, &Message::from_digest(id), &pubkey)
            .map_err(|_| RelayError::Protocol(format!("event {} has an invalid signature", self.id)))
    }

    /// Author's public key.
    pub fn author(&self) -> Result<XOnlyPublicKey> {
        XOnlyPublicKey::from_str(&self.pubkey)
            .map_err(|e| RelayError::Protocol(format!("bad event pubkey: {}", e)))
    }

    /// Values of every `name` tag, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Value of the first `name` tag.
    pub fn first_tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}

/// An event waiting to be signed.
#[derive(Clone, Debug)]
pub struct EventBuilder {
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    created_at: Option<i64>,
}

impl EventBuilder {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            content: content.into(),
            created_at: None,
        }
    }

    /// Append a `[name, value]` tag.
    pub fn tag(mut self, name: &str, value: impl Into<String>) -> Self {
        self.tags.push(vec![name.to_string(), value.into()]);
        self
    }

    /// Override the creation time (defaults to now).
    pub fn created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn sign(self, keys: &Keys) -> Event {
        let pubkey = keys.public_key_hex();
        let created_at = self.created_at.unwrap_or_else(crate::unix_now);
        let id = compute_id(&pubkey, created_at, self.kind, &self.tags, &self.content);
        let sig = keys.sign(&id);
        Event {
            id: hex::encode(id),
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.to_string(),
        }
    }
}

/// Subscription filter. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub pubkeys: Vec<String>,
    #[serde(rename = "#e", default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.push(pubkey.into());
        self
    }

    /// Match events tagging any of `pubkeys` with `p`.
    pub fn pubkeys(mut self, pubkeys: impl IntoIterator<Item = String>) -> Self {
        self.pubkeys.extend(pubkeys);
        self
    }

    /// Match events tagging `id` with `e`.
    pub fn event(mut self, id: impl Into<String>) -> Self {
        self.events.push(id.into());
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if !self.pubkeys.is_empty() && !event.tag_values("p").any(|p| self.pubkeys.iter().any(|k| k == p)) {
            return false;
        }
        if !self.events.is_empty() && !event.tag_values("e").any(|e| self.events.iter().any(|k| k == e)) {
            return false;
        }
        self.since.map_or(true, |since| event.created_at >= since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_event_verifies() {
        let keys = Keys::generate();
        let event = EventBuilder::new(KIND_ENCRYPTED_DM, "hello")
            .tag("p", "abcd")
            .sign(&keys);

        assert_eq!(event.pubkey, keys.public_key_hex());
        assert_eq!(event.id.len(), 64);
        assert!(event.verify().is_ok());
        assert_eq!(event.first_tag("p"), Some("abcd"));
        assert_eq!(event.first_tag("e"), None);
    }

    #[test]
    fn test_tampered_event_fails() {
        let keys = Keys::generate();
        let event = EventBuilder::new(KIND_ENCRYPTED_DM, "hello").sign(&keys);

        let mut content = event.clone();
        content.content = "bye".into();
        assert!(content.verify().is_err());

        let mut sig = event.clone();
        sig.pubkey = Keys::generate().public_key_hex();
        assert!(sig.verify().is_err());
    }

    #[test]
    fn test_id_uses_canonical_serialization() {
        let keys = Keys::generate();
        let event = EventBuilder::new(1, "line\nbreak \"quoted\"")
            .created_at(1_700_000_000)
            .sign(&keys);
        let expected = format!(
            "[0,\"{}\",1700000000,1,[],\"line\\nbreak \\\"quoted\\\"\"]",
            keys.public_key_hex()
        );
        assert_eq!(event.id, hex::encode(Sha256::digest(expected.as_bytes())));
    }

    #[test]
    fn test_filter_matching() {
        let keys = Keys::generate();
        let event = EventBuilder::new(KIND_ENCRYPTED_DM, "x")
            .tag("p", "aa")
            .tag("e", "ee")
            .created_at(100)
            .sign(&keys);

        assert!(Filter::new().matches(&event));
        assert!(Filter::new().kind(4).pubkeys(["bb".to_string(), "aa".to_string()]).matches(&event));
        assert!(!Filter::new().kind(1).matches(&event));
        assert!(Filter::new().author(keys.public_key_hex()).event("ee").matches(&event));
        assert!(!Filter::new().event("ff").matches(&event));
        assert!(Filter::new().since(100).matches(&event));
        assert!(!Filter::new().since(101).matches(&event));
    }

    #[test]
    fn test_filter_wire_form() {
        let filter = Filter::new().kind(4).pubkeys(["aa".to_string()]).since(5);
        assert_eq!(
            serde_json::to_string(&filter).unwrap(),
            r##"{"kinds":[4],"#p":["aa"],"since":5}"##
        );
    }
}
