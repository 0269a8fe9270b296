//! Receiver key material.
//!
//! A receiver answers on one long-lived static key plus any number of
//! short-lived "active" keys, one per advertised payment endpoint. Keys are
//! indexed by their hex x-only public key, which is also what senders put in
//! the `p` tag of their requests.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{OnceLock, RwLock};

use bitcoin::secp256k1::{self, schnorr, All, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use tracing::debug;

use crate::{RelayError, Result};

pub(crate) fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

/// A secp256k1 key pair used for signing events and NIP-04 encryption.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public_key: XOnlyPublicKey,
}

impl Keys {
    /// Fresh random keys.
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut secp256k1::rand::thread_rng());
        Self::from_secret_key(secret)
    }

    pub fn from_secret_key(secret: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(secp(), &secret);
        let (public_key, _) = keypair.x_only_public_key();
        Self {
            keypair,
            public_key,
        }
    }

    /// Parse a hex-encoded secret key.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let secret =
            SecretKey::from_str(secret).map_err(|e| RelayError::Crypto(e.to_string()))?;
        Ok(Self::from_secret_key(secret))
    }

    pub fn public_key(&self) -> XOnlyPublicKey {
        self.public_key
    }

    /// Hex form of the public key, as used in events and tags.
    pub fn public_key_hex(&self) -> String {
        self.public_key.to_string()
    }

    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    /// BIP340 signature over a 32-byte event id.
    pub fn sign(&self, id: &[u8; 32]) -> schnorr::Signature {
        let msg = Message::from_digest(*id);
        secp().sign_schnorr(&msg, &self.keypair)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// An endpoint key and when it stops being honoured.
#[derive(Clone, Debug)]
pub struct ActiveKey {
    pub keys: Keys,
    /// Unix time after which requests to this key are ignored.
    pub expiry: Option<i64>,
}

impl ActiveKey {
    pub fn new(keys: Keys, expiry: Option<i64>) -> Self {
        Self { keys, expiry }
    }

    pub fn identifier(&self) -> String {
        self.keys.public_key_hex()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiry.is_some_and(|expiry| expiry < now)
    }
}

/// The static key plus every active endpoint key.
pub struct KeyTable {
    static_keys: Keys,
    active: RwLock<HashMap<String, ActiveKey>>,
}

impl KeyTable {
    pub fn new(static_keys: Keys) -> Self {
        Self {
            static_keys,
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn static_keys(&self) -> &Keys {
        &self.static_keys
    }

    /// Register an active key and return its identifier.
    pub fn insert(&self, key: ActiveKey) -> String {
        let identifier = key.identifier();
        self.active
            .write()
            .expect("lock poisoned")
            .insert(identifier.clone(), key);
        identifier
    }

    pub fn remove(&self, identifier: &str) -> Option<ActiveKey> {
        self.active
            .write()
            .expect("lock poisoned")
            .remove(identifier)
    }

    /// The key a message tagged with `identifier` was sent to.
    ///
    /// Active keys take precedence; the static key never expires.
    pub fn resolve(&self, identifier: &str) -> Option<ActiveKey> {
        if let Some(key) = self.active.read().expect("lock poisoned").get(identifier) {
            return Some(key.clone());
        }
        (identifier == self.static_keys.public_key_hex())
            .then(|| ActiveKey::new(self.static_keys.clone(), None))
    }

    /// Every identifier the receiver answers on, static key last.
    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self
            .active
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        identifiers.sort_unstable();
        identifiers.push(self.static_keys.public_key_hex());
        identifiers
    }

    /// Drop keys that expired before `now`, returning their identifiers.
    pub fn remove_expired(&self, now: i64) -> Vec<String> {
        let mut active = self.active.write().expect("lock poisoned");
        let expired: Vec<String> = active
            .iter()
            .filter(|(_, key)| key.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            active.remove(id);
            debug!(key = %id, "endpoint key expired");
        }
        expired
    }

    /// Number of active keys.
    pub fn len(&self) -> usize {
        self.active.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
