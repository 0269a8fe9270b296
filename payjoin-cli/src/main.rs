//! Payjoin CLI
//!
//! Inspect PSBTs and payjoin URIs, create relay endpoints and send payjoin
//! requests over HTTP or relays.

use anyhow::Result;
use clap::{Parser, Subcommand};
use payjoin_lib::config::BitcoinNetwork;
use url::Url;

mod commands;
mod ui;

#[derive(Parser)]
#[command(name = "payjoin")]
#[command(about = "Payjoin (BIP78) sender and relay endpoint tooling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Bitcoin network (mainnet, testnet, signet, regtest)
    #[arg(long, global = true, env = "PAYJOIN_NETWORK", default_value = "mainnet")]
    network: BitcoinNetwork,

    /// Relay URL, repeatable (defaults to PAYJOIN_RELAYS)
    #[arg(long = "relay", global = true)]
    relays: Vec<Url>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the inputs, outputs and fee of a PSBT
    Inspect {
        /// Base64 PSBT, or @path to a file holding one
        psbt: String,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse a BIP21 payment URI
    Uri {
        /// The URI
        uri: String,
    },

    /// Create and decode relay endpoints
    Endpoint {
        #[command(subcommand)]
        action: EndpointAction,
    },

    /// Send a payjoin request and print the proposal to sign
    Send {
        /// BIP21 URI with a pj= endpoint
        #[arg(long)]
        uri: String,

        /// Signed, finalized PSBT (base64 or @path)
        #[arg(long)]
        psbt: String,

        /// Script type of the wallet's inputs
        #[arg(long, default_value = "p2wpkh")]
        script_type: String,

        /// Master key fingerprint of the wallet (8 hex characters)
        #[arg(long)]
        fingerprint: String,

        /// Most the receiver may take from our change, in satoshis
        #[arg(long)]
        max_fee_contribution: Option<u64>,

        /// Minimum fee rate of the payjoin, in sat/vB
        #[arg(long)]
        min_fee_rate: Option<f64>,

        /// Forbid the receiver from substituting the payment output
        #[arg(long)]
        disable_output_substitution: bool,

        /// Seconds to wait for the receiver
        #[arg(long, default_value = "60")]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum EndpointAction {
    /// Generate a relay endpoint key
    ///
    /// This tool only mints the endpoint. Requests sent to it are answered
    /// by a wallet running `RelayPayjoinReceiver` with the printed secret key.
    #[command(after_help = "Requests to this endpoint are answered only by a wallet \
running a relay payjoin receiver with the printed secret key.")]
    New {
        /// Seconds until the endpoint expires
        #[arg(long)]
        expires_in: Option<u64>,

        /// Use this secret key (hex) instead of a fresh one
        #[arg(long)]
        secret: Option<String>,

        /// Address to build a BIP21 URI for
        #[arg(long)]
        address: Option<String>,

        /// Amount in BTC for the BIP21 URI
        #[arg(long)]
        amount: Option<String>,

        /// Show the URI as a QR code
        #[arg(long)]
        qr: bool,
    },

    /// Decode a nostr: endpoint
    Decode {
        /// The endpoint
        endpoint: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("payjoin_cli=debug,payjoin_lib=debug,payjoin_relay=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("payjoin_cli=info,payjoin_lib=warn,payjoin_relay=warn")
            .init();
    }

    let relays = commands::relay_config(&cli.relays);

    match cli.command {
        Commands::Inspect { psbt, json } => {
            commands::inspect::run(&psbt, json, cli.verbose)?;
        }
        Commands::Uri { uri } => {
            commands::uri::run(&uri, cli.network, cli.verbose)?;
        }
        Commands::Endpoint { action } => match action {
            EndpointAction::New {
                expires_in,
                secret,
                address,
                amount,
                qr,
            } => {
                commands::endpoint::new(
                    &relays,
                    commands::endpoint::NewEndpoint {
                        expires_in,
                        secret,
                        address,
                        amount,
                        qr,
                    },
                    cli.network,
                )?;
            }
            EndpointAction::Decode { endpoint } => {
                commands::endpoint::decode(&endpoint, cli.verbose)?;
            }
        },
        Commands::Send {
            uri,
            psbt,
            script_type,
            fingerprint,
            max_fee_contribution,
            min_fee_rate,
            disable_output_substitution,
            timeout,
        } => {
            commands::send::run(
                relays.with_response_timeout(timeout),
                commands::send::SendArgs {
                    uri,
                    psbt,
                    script_type,
                    fingerprint,
                    max_fee_contribution,
                    min_fee_rate,
                    disable_output_substitution,
                    timeout,
                },
                cli.network,
                cli.verbose,
            )
            .await?;
        }
    }

    Ok(())
}
