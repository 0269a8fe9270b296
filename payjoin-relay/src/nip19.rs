//! NIP-19 bech32 entities: `npub` and `nprofile`.

use bech32::{Bech32, Hrp};
use bitcoin::secp256k1::XOnlyPublicKey;

const NPUB: &str = "npub";
const NPROFILE: &str = "nprofile";

const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Nip19Error {
    #[error("bech32 error: {0}")]
    Bech32(String),
    #[error("unexpected prefix {0}")]
    UnexpectedPrefix(String),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("malformed TLV data")]
    MalformedTlv,
    #[error("relay URL too long")]
    RelayTooLong,
}

/// A public key with relays it can be reached on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    pub public_key: XOnlyPublicKey,
    pub relays: Vec<String>,
}

/// A decoded `npub` or `nprofile`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Nip19Entity {
    Pubkey(XOnlyPublicKey),
    Profile(Profile),
}

impl Nip19Entity {
    pub fn public_key(&self) -> XOnlyPublicKey {
        match self {
            Self::Pubkey(key) => *key,
            Self::Profile(profile) => profile.public_key,
        }
    }

    pub fn relays(&self) -> &[String] {
        match self {
            Self::Pubkey(_) => &[],
            Self::Profile(profile) => &profile.relays,
        }
    }
}

fn hrp(prefix: &str) -> Result<Hrp, Nip19Error> {
    Hrp::parse(prefix).map_err(|e| Nip19Error::Bech32(e.to_string()))
}

fn encode(prefix: &str, data: &[u8]) -> Result<String, Nip19Error> {
    bech32::encode::<Bech32>(hrp(prefix)?, data).map_err(|e| Nip19Error::Bech32(e.to_string()))
}

fn public_key(bytes: &[u8]) -> Result<XOnlyPublicKey, Nip19Error> {
    XOnlyPublicKey::from_slice(bytes).map_err(|_| Nip19Error::InvalidPublicKey)
}

pub fn encode_npub(key: &XOnlyPublicKey) -> Result<String, Nip19Error> {
    encode(NPUB, &key.serialize())
}

pub fn encode_nprofile(profile: &Profile) -> Result<String, Nip19Error> {
    let mut data = vec![TLV_SPECIAL, 32];
    data.extend_from_slice(&profile.public_key.serialize());
    for relay in &profile.relays {
        let len = u8::try_from(relay.len()).map_err(|_| Nip19Error::RelayTooLong)?;
        data.push(TLV_RELAY);
        data.push(len);
        data.extend_from_slice(relay.as_bytes());
    }
    encode(NPROFILE, &data)
}

/// Decode an `npub` or `nprofile`.
pub fn decode(s: &str) -> Result<Nip19Entity, Nip19Error> {
    let (prefix, data) = bech32::decode(s).map_err(|e| Nip19Error::Bech32(e.to_string()))?;
    match prefix.to_lowercase().as_str() {
        NPUB => Ok(Nip19Entity::Pubkey(public_key(&data)?)),
        NPROFILE => decode_profile(&data).map(Nip19Entity::Profile),
        other => Err(Nip19Error::UnexpectedPrefix(other.to_string())),
    }
}

fn decode_profile(mut data: &[u8]) -> Result<Profile, Nip19Error> {
    let mut key = None;
    let mut relays = Vec::new();
    while !data.is_empty() {
        let [kind, len, rest @ ..] = data else {
            return Err(Nip19Error::MalformedTlv);
        };
        let len = *len as usize;
        if rest.len() < len {
            return Err(Nip19Error::MalformedTlv);
        }
        let (value, tail) = rest.split_at(len);
        match *kind {
            TLV_SPECIAL => key = Some(public_key(value)?),
            TLV_RELAY => relays.push(
                String::from_utf8(value.to_vec()).map_err(|_| Nip19Error::MalformedTlv)?,
            ),
            _ => {}
        }
        data = tail;
    }
    Ok(Profile {
        public_key: key.ok_or(Nip19Error::MalformedTlv)?,
        relays,
    })
}
