//! BIP21 payment URIs carrying a payjoin endpoint.
//!
//! Format: `bitcoin:<address>?amount=<btc>&pj=<endpoint>[&pjos=0]`.
//! Query values are percent-decoded; parameters this module does not
//! interpret are kept in order so callers can read them back.
//!
//! # Examples
//!
//! ```no_run
//! use payjoin_lib::uri::PayjoinUri;
//!
//! let uri = PayjoinUri::parse(
//!     "bitcoin:bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080?amount=0.001&pj=https://example.com/pj",
//!     bitcoin::Network::Regtest,
//! ).unwrap();
//! assert_eq!(uri.endpoint().map(|u| u.scheme()), Some("https"));
//! ```

use std::fmt;
use std::str::FromStr;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Amount, Denomination, Network, ScriptBuf};
use thiserror::Error;
use url::Url;

use crate::errors::PayjoinError;

/// Query key naming the payjoin endpoint.
pub const PJ_KEY: &str = "pj";

/// Query key carrying the output substitution flag.
pub const PJOS_KEY: &str = "pjos";

/// Error parsing a payment URI.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UriError {
    #[error("not a bitcoin: URI")]
    NotBitcoinScheme,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address is not valid for {0}")]
    WrongNetwork(Network),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid payjoin endpoint: {0}")]
    InvalidEndpoint(String),
}

impl From<UriError> for PayjoinError {
    fn from(err: UriError) -> Self {
        PayjoinError::Precondition(err.to_string())
    }
}

/// A parsed BIP21 URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayjoinUri {
    address: Address,
    amount: Option<Amount>,
    endpoint: Option<Url>,
    output_substitution_disabled: bool,
    extras: Vec<(String, String)>,
}

impl PayjoinUri {
    /// Parse a URI and check its address against `network`.
    pub fn parse(uri: &str, network: Network) -> Result<Self, UriError> {
        let (address, query) = split(uri)?;
        let address = address
            .require_network(network)
            .map_err(|_| UriError::WrongNetwork(network))?;
        Self::from_parts(address, query)
    }

    fn from_parts(address: Address, query: &str) -> Result<Self, UriError> {
        let mut amount = None;
        let mut endpoint = None;
        let mut output_substitution_disabled = false;
        let mut extras = Vec::new();

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(raw)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| raw.to_string());

            match key {
                "amount" => {
                    amount = Some(
                        Amount::from_str_in(&value, Denomination::Bitcoin)
                            .map_err(|e| UriError::InvalidAmount(e.to_string()))?,
                    );
                }
                PJ_KEY => {
                    endpoint = Some(
                        Url::parse(&value).map_err(|e| UriError::InvalidEndpoint(e.to_string()))?,
                    );
                }
                PJOS_KEY => {
                    output_substitution_disabled = value == "0";
                    extras.push((key.to_string(), value));
                }
                _ => extras.push((key.to_string(), value)),
            }
        }

        Ok(Self {
            address,
            amount,
            endpoint,
            output_substitution_disabled,
            extras,
        })
    }

    /// Build a URI from its parts.
    pub fn new(address: Address, amount: Option<Amount>, endpoint: Option<Url>) -> Self {
        Self {
            address,
            amount,
            endpoint,
            output_substitution_disabled: false,
            extras: Vec::new(),
        }
    }

    /// Mark output substitution as disabled (`pjos=0`).
    pub fn with_output_substitution_disabled(mut self) -> Self {
        self.output_substitution_disabled = true;
        self
    }

    /// Destination address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Script the payment must go to.
    pub fn payment_script(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// Requested amount.
    pub fn amount(&self) -> Option<Amount> {
        self.amount
    }

    /// Payjoin endpoint, if the URI supports payjoin.
    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    /// Whether `pjos=0` was present.
    pub fn output_substitution_disabled(&self) -> bool {
        self.output_substitution_disabled
    }

    /// A parameter this module does not interpret, by key.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.extras
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn split(uri: &str) -> Result<(Address<NetworkUnchecked>, &str), UriError> {
    let uri = uri.trim();
    let rest = uri
        .get(..8)
        .filter(|scheme| scheme.eq_ignore_ascii_case("bitcoin:"))
        .map(|_| &uri[8..])
        .ok_or(UriError::NotBitcoinScheme)?;
    let (address, query) = rest.split_once('?').unwrap_or((rest, ""));
    let address = Address::from_str(address).map_err(|e| UriError::InvalidAddress(e.to_string()))?;
    Ok((address, query))
}

/// Parses without checking the address network.
impl FromStr for PayjoinUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, query) = split(s)?;
        Self::from_parts(address.assume_checked(), query)
    }
}

impl fmt::Display for PayjoinUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bitcoin:{}", self.address)?;
        let mut params = Vec::new();
        if let Some(amount) = self.amount {
            params.push(format!("amount={}", amount.to_btc()));
        }
        if let Some(endpoint) = &self.endpoint {
            params.push(format!("{}={}", PJ_KEY, urlencoding::encode(endpoint.as_str())));
        }
        if self.output_substitution_disabled && self.param(PJOS_KEY).is_none() {
            params.push(format!("{}=0", PJOS_KEY));
        }
        for (key, value) in &self.extras {
            params.push(format!("{}={}", key, urlencoding::encode(value)));
        }
        if !params.is_empty() {
            write!(f, "?{}", params.join("&"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::p2wpkh_script;

    fn regtest_address() -> String {
        Address::from_script(&p2wpkh_script(0xbb), Network::Regtest)
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_parse_http_endpoint() {
        let uri = PayjoinUri::parse(
            &format!(
                "bitcoin:{}?amount=0.0006&pj=https%3A%2F%2Fexample.com%2Fpj%3Fid%3D7",
                regtest_address()
            ),
            Network::Regtest,
        )
        .unwrap();

        assert_eq!(uri.amount(), Some(Amount::from_sat(60_000)));
        assert_eq!(uri.endpoint().unwrap().as_str(), "https://example.com/pj?id=7");
        assert!(!uri.output_substitution_disabled());
    }

    #[test]
    fn test_parse_relay_endpoint_and_pjos() {
        let uri = PayjoinUri::parse(
            &format!(
                "BITCOIN:{}?pj=nostr:npub1abc?expiry=1700000000&pjos=0&label=shop",
                regtest_address()
            ),
            Network::Regtest,
        )
        .unwrap();

        let endpoint = uri.endpoint().unwrap();
        assert_eq!(endpoint.scheme(), "nostr");
        assert_eq!(endpoint.query(), Some("expiry=1700000000"));
        assert!(uri.output_substitution_disabled());
        assert_eq!(uri.param("label"), Some("shop"));
        assert_eq!(uri.param("pjos"), Some("0"));
    }

    #[test]
    fn test_wrong_network_rejected() {
        let err = PayjoinUri::parse(&format!("bitcoin:{}", regtest_address()), Network::Bitcoin)
            .unwrap_err();
        assert_eq!(err, UriError::WrongNetwork(Network::Bitcoin));
    }

    #[test]
    fn test_missing_endpoint() {
        let uri: PayjoinUri = format!("bitcoin:{}?amount=1", regtest_address()).parse().unwrap();
        assert!(uri.endpoint().is_none());
        assert_eq!(uri.amount(), Some(Amount::from_sat(100_000_000)));
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert_eq!(
            "lightning:lnbc1".parse::<PayjoinUri>().unwrap_err(),
            UriError::NotBitcoinScheme
        );
        assert!(matches!(
            "bitcoin:notanaddress".parse::<PayjoinUri>().unwrap_err(),
            UriError::InvalidAddress(_)
        ));
    }

    #[test]
    fn test_display_round_trip() {
        let original = format!(
            "bitcoin:{}?amount=0.001&pj=https://example.com/pj&pjos=0",
            regtest_address()
        );
        let uri: PayjoinUri = original.parse().unwrap();
        let reparsed: PayjoinUri = uri.to_string().parse().unwrap();
        assert_eq!(reparsed, uri);
    }
}
