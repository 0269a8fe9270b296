//! Sender-side payjoin request

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bitcoin::bip32::Fingerprint;
use bitcoin::Amount;
use payjoin_lib::communicator::HttpCommunicator;
use payjoin_lib::config::{BitcoinNetwork, HttpCommunicatorConfig};
use payjoin_lib::{
    CompositeCommunicator, PayjoinClient, PayjoinUri, PsbtExt, ScriptType, SenderConfig,
    WalletDescriptor,
};
use payjoin_relay::{RelayCommunicator, RelayConfig, WebSocketConnector};
use tokio_util::sync::CancellationToken;

use crate::ui;

/// Arguments of `send`.
pub struct SendArgs {
    pub uri: String,
    pub psbt: String,
    pub script_type: String,
    pub fingerprint: String,
    pub max_fee_contribution: Option<u64>,
    pub min_fee_rate: Option<f64>,
    pub disable_output_substitution: bool,
    pub timeout: u64,
}

pub fn sender_config(args: &SendArgs, network: BitcoinNetwork) -> SenderConfig {
    let mut config = SenderConfig::default().with_network(network);
    if let Some(sat) = args.max_fee_contribution {
        config = config.with_max_fee_bump_contribution(Amount::from_sat(sat));
    }
    if let Some(rate) = args.min_fee_rate {
        config = config.with_min_fee_rate(rate);
    }
    if args.disable_output_substitution {
        config = config.with_output_substitution_disabled();
    }
    config
}

pub fn wallet(args: &SendArgs) -> Result<WalletDescriptor> {
    let script_type = ScriptType::from_str(&args.script_type)
        .map_err(|e| anyhow!("Invalid script type: {}", e))?;
    let fingerprint =
        Fingerprint::from_str(&args.fingerprint).context("Invalid master fingerprint")?;
    Ok(WalletDescriptor::new(script_type, fingerprint))
}

/// HTTP for `http`/`https` endpoints, websocket relays for `nostr:`.
pub fn communicator(relays: RelayConfig, timeout_secs: u64) -> Result<CompositeCommunicator> {
    let http = Arc::new(HttpCommunicator::new(
        HttpCommunicatorConfig::default().with_timeout(timeout_secs),
    )?);
    let relay = Arc::new(RelayCommunicator::new(Arc::new(WebSocketConnector), relays));
    Ok(CompositeCommunicator::new()
        .with_transport("http", http.clone())
        .with_transport("https", http)
        .with_transport(payjoin_relay::endpoint::SCHEME, relay))
}

pub async fn run(
    relays: RelayConfig,
    args: SendArgs,
    network: BitcoinNetwork,
    verbose: bool,
) -> Result<()> {
    let uri = PayjoinUri::parse(&args.uri, network.to_network())
        .with_context(|| format!("Invalid payment URI for {}", network.as_str()))?;
    let signed = super::read_psbt(&args.psbt)?;
    let wallet = wallet(&args)?;
    let client = PayjoinClient::new(
        Arc::new(communicator(relays, args.timeout)?),
        sender_config(&args, network),
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let spinner = ui::waiting("Waiting for the receiver's proposal...");
    let result = client
        .request_payjoin(&uri, &wallet, &signed, &cancel)
        .await;
    spinner.finish_and_clear();

    let proposal = match result {
        Ok(proposal) => proposal,
        Err(e) => {
            ui::error(&format!("Payjoin failed: {}", e));
            if let Some(receiver) = e.receiver_error() {
                ui::field("Receiver code", &receiver.code);
            }
            if e.is_retryable() {
                ui::info("The receiver may accept a retry later");
            }
            ui::info("Broadcast the original signed transaction to complete the payment");
            return Err(e.into());
        }
    };

    ui::success("Receiver proposal verified");
    if verbose {
        ui::field("Inputs", proposal.inputs.len());
        ui::field("Outputs", proposal.outputs.len());
    }
    if let (Some(original), Some(payjoin)) = (signed.fee_amount(), proposal.fee_amount()) {
        ui::field(
            "Fee",
            format!("{} (was {})", ui::sats(payjoin.to_sat()), ui::sats(original.to_sat())),
        );
    }
    ui::separator();
    ui::info("Sign and broadcast this PSBT:");
    println!("{}", proposal);
    Ok(())
}
