//! Relay endpoint generation and decoding

use std::str::FromStr;

use anyhow::{Context, Result};
use bitcoin::{Address, Amount, Denomination};
use chrono::{TimeZone, Utc};
use payjoin_lib::config::BitcoinNetwork;
use payjoin_lib::PayjoinUri;
use payjoin_relay::{nip19, Keys, RelayConfig, RelayEndpoint};
use url::Url;

use crate::ui;

/// Options for `endpoint new`.
pub struct NewEndpoint {
    pub expires_in: Option<u64>,
    pub secret: Option<String>,
    pub address: Option<String>,
    pub amount: Option<String>,
    pub qr: bool,
}

/// Human-readable fields of a relay endpoint.
pub fn describe(endpoint: &RelayEndpoint) -> Vec<(String, String)> {
    let mut fields = vec![("Public key".to_string(), endpoint.identifier())];
    if let Ok(npub) = nip19::encode_npub(&endpoint.public_key) {
        fields.push(("npub".into(), npub));
    }
    let relays = if endpoint.relays.is_empty() {
        "none (sender's relays)".to_string()
    } else {
        endpoint
            .relays
            .iter()
            .map(Url::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };
    fields.push(("Relays".into(), relays));
    let expiry = match endpoint.expiry {
        None => "never".to_string(),
        Some(ts) => {
            let when = Utc
                .timestamp_opt(ts, 0)
                .single()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| ts.to_string());
            if endpoint.is_expired_at(Utc::now().timestamp()) {
                format!("{} (expired)", when)
            } else {
                when
            }
        }
    };
    fields.push(("Expires".into(), expiry));
    fields
}

/// Build the endpoint and, when an address is given, its payment URI.
pub fn build(
    relays: &RelayConfig,
    keys: &Keys,
    options: &NewEndpoint,
    network: BitcoinNetwork,
) -> Result<(RelayEndpoint, Option<PayjoinUri>)> {
    let expiry = options
        .expires_in
        .map(|secs| Utc::now().timestamp() + secs as i64);
    let endpoint = RelayEndpoint::new(keys.public_key(), relays.relays.clone(), expiry);

    let uri = match &options.address {
        None => None,
        Some(address) => {
            let address = Address::from_str(address)
                .context("Invalid address")?
                .require_network(network.to_network())
                .with_context(|| format!("Address is not a {} address", network.as_str()))?;
            let amount = options
                .amount
                .as_deref()
                .map(|a| Amount::from_str_in(a, Denomination::Bitcoin))
                .transpose()
                .context("Invalid amount")?;
            Some(PayjoinUri::new(address, amount, Some(endpoint.to_url()?)))
        }
    };
    Ok((endpoint, uri))
}

pub fn new(relays: &RelayConfig, options: NewEndpoint, network: BitcoinNetwork) -> Result<()> {
    let keys = match &options.secret {
        Some(secret) => Keys::from_hex(secret).context("Invalid secret key")?,
        None => Keys::generate(),
    };
    let (endpoint, uri) = build(relays, &keys, &options, network)?;

    ui::header("Relay Endpoint");
    ui::field("Endpoint", endpoint.to_url()?.as_str());
    for (key, value) in describe(&endpoint) {
        ui::field(&key, &value);
    }
    if options.secret.is_none() {
        ui::field("Secret key", keys.secret_key().display_secret());
        ui::warning("Keep the secret key: it decrypts every request sent to this endpoint");
    }
    if endpoint.relays.is_empty() {
        ui::warning("No relays configured; pass --relay or set PAYJOIN_RELAYS");
    }
    ui::info("Requests are answered by a wallet running a relay payjoin receiver with this key");

    if let Some(uri) = uri {
        ui::separator();
        ui::field("Payment URI", &uri);
        if options.qr {
            ui::qr_code(&uri.to_string())?;
        }
    } else if options.qr {
        ui::qr_code(endpoint.to_url()?.as_str())?;
    }
    Ok(())
}

pub fn decode(endpoint: &str, _verbose: bool) -> Result<()> {
    let endpoint = RelayEndpoint::from_str(endpoint).context("Invalid relay endpoint")?;

    ui::header("Relay Endpoint");
    for (key, value) in describe(&endpoint) {
        ui::field(&key, &value);
    }
    Ok(())
}
