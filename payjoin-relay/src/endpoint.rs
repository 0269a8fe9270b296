//! `nostr:` payjoin endpoints.
//!
//! Format: `nostr:<nprofile|npub|hex>[?expiry=<unix seconds>]`. The receiver
//! always advertises an `nprofile` so senders learn its relays; senders
//! accept all three forms.

use std::fmt;
use std::str::FromStr;

use bitcoin::secp256k1::XOnlyPublicKey;
use url::Url;

use crate::nip19::{self, Profile};
use crate::{RelayError, Result};

/// URI scheme of relay endpoints.
pub const SCHEME: &str = "nostr";

const INVALID: &str =
    "the payjoin endpoint was not a valid nostr endpoint (npub/nprofile/public key hex)";

/// A parsed relay endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub public_key: XOnlyPublicKey,
    pub relays: Vec<Url>,
    pub expiry: Option<i64>,
}

impl RelayEndpoint {
    pub fn new(public_key: XOnlyPublicKey, relays: Vec<Url>, expiry: Option<i64>) -> Self {
        Self {
            public_key,
            relays,
            expiry,
        }
    }

    /// Parse a `nostr:` URL. Relay entries that are not URLs are skipped.
    pub fn parse(url: &Url) -> Result<Self> {
        if url.scheme() != SCHEME {
            return Err(RelayError::InvalidEndpoint(format!(
                "unexpected scheme {}",
                url.scheme()
            )));
        }
        let target = url.path();
        let (public_key, relays) = if target.starts_with("npub") || target.starts_with("nprofile") {
            let entity = nip19::decode(target)?;
            let relays = entity
                .relays()
                .iter()
                .filter_map(|relay| Url::parse(relay).ok())
                .collect();
            (entity.public_key(), relays)
        } else {
            let key = XOnlyPublicKey::from_str(target)
                .map_err(|_| RelayError::InvalidEndpoint(INVALID.to_string()))?;
            (key, Vec::new())
        };

        let mut expiry = None;
        for (key, value) in url.query_pairs() {
            if key == "expiry" {
                expiry = Some(value.parse::<i64>().map_err(|_| {
                    RelayError::InvalidEndpoint(format!("invalid expiry: {}", value))
                })?);
            }
        }

        Ok(Self {
            public_key,
            relays,
            expiry,
        })
    }

    /// Hex public key the endpoint addresses.
    pub fn identifier(&self) -> String {
        self.public_key.to_string()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiry.is_some_and(|expiry| expiry < now)
    }

    /// The endpoint as an `nprofile` URL.
    pub fn to_url(&self) -> Result<Url> {
        let profile = Profile {
            public_key: self.public_key,
            relays: self.relays.iter().map(|r| r.to_string()).collect(),
        };
        let mut uri = format!("{}:{}", SCHEME, nip19::encode_nprofile(&profile)?);
        if let Some(expiry) = self.expiry {
            uri.push_str(&format!("?expiry={}", expiry));
        }
        Url::parse(&uri).map_err(|e| RelayError::InvalidEndpoint(e.to_string()))
    }
}

impl FromStr for RelayEndpoint {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|e| RelayError::InvalidEndpoint(e.to_string()))?;
        Self::parse(&url)
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_url() {
            Ok(url) => write!(f, "{}", url),
            Err(_) => write!(f, "{}:{}", SCHEME, self.identifier()),
        }
    }
}
