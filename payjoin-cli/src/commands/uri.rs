//! BIP21 URI parsing

use anyhow::{Context, Result};
use payjoin_lib::config::BitcoinNetwork;
use payjoin_lib::PayjoinUri;
use payjoin_relay::RelayEndpoint;

use crate::ui;

/// Human-readable fields of a payment URI.
pub fn describe(uri: &PayjoinUri) -> Result<Vec<(String, String)>> {
    let mut fields = vec![("Address".to_string(), uri.address().to_string())];
    if let Some(amount) = uri.amount() {
        fields.push(("Amount".into(), format!("{} BTC", amount.to_btc())));
    }

    let Some(endpoint) = uri.endpoint() else {
        fields.push(("Payjoin".into(), "not supported".into()));
        return Ok(fields);
    };
    fields.push(("Endpoint".into(), endpoint.to_string()));
    fields.push((
        "Output substitution".into(),
        if uri.output_substitution_disabled() {
            "disabled"
        } else {
            "allowed"
        }
        .into(),
    ));

    match endpoint.scheme() {
        "http" | "https" => fields.push(("Transport".into(), "direct (HTTP)".into())),
        payjoin_relay::endpoint::SCHEME => {
            let relay = RelayEndpoint::parse(endpoint).context("Invalid relay endpoint")?;
            fields.push(("Transport".into(), "relay".into()));
            fields.extend(super::endpoint::describe(&relay));
        }
        other => fields.push(("Transport".into(), format!("unsupported ({})", other))),
    }
    Ok(fields)
}

pub fn run(uri: &str, network: BitcoinNetwork, _verbose: bool) -> Result<()> {
    let parsed = PayjoinUri::parse(uri, network.to_network())
        .with_context(|| format!("Invalid payment URI for {}", network.as_str()))?;

    ui::header("Payment URI");
    for (key, value) in describe(&parsed)? {
        ui::field(&key, &value);
    }
    if parsed.endpoint().is_none() {
        ui::warning("The receiver does not support payjoin; pay normally");
    }
    Ok(())
}
