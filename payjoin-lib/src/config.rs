//! Configuration types for payjoin senders, receivers and their transports.

use std::time::Duration;

use bitcoin::{Amount, FeeRate};
use serde::{Deserialize, Serialize};

use crate::params::fee_rate_from_sat_per_vb;

/// Bitcoin network selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitcoinNetwork {
    /// Bitcoin mainnet.
    #[default]
    Mainnet,
    /// Bitcoin testnet (testnet3).
    Testnet,
    /// Bitcoin signet.
    Signet,
    /// Bitcoin regtest (local development).
    Regtest,
}

impl BitcoinNetwork {
    /// Get the network name as used by most APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Signet => "signet",
            Self::Regtest => "regtest",
        }
    }

    /// The matching `bitcoin` crate network.
    pub fn to_network(self) -> bitcoin::Network {
        match self {
            Self::Mainnet => bitcoin::Network::Bitcoin,
            Self::Testnet => bitcoin::Network::Testnet,
            Self::Signet => bitcoin::Network::Signet,
            Self::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl std::str::FromStr for BitcoinNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "bitcoin" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "signet" => Ok(Self::Signet),
            "regtest" => Ok(Self::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Sender-side payjoin configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Network payment URIs must belong to.
    #[serde(default)]
    pub network: BitcoinNetwork,

    /// Override for `maxadditionalfeecontribution`, in satoshis.
    ///
    /// When unset, the cost of one extra input of the wallet's script type at
    /// the original fee rate is used.
    #[serde(default)]
    pub max_fee_bump_contribution: Option<u64>,

    /// Minimum fee rate of the payjoin transaction, in sat/vB.
    #[serde(default)]
    pub min_fee_rate: Option<f64>,

    /// Require receiver inputs to use the sender's script type.
    #[serde(default = "default_true")]
    pub enforce_uniform_input_type: bool,

    /// Never let the receiver substitute the payment output.
    #[serde(default)]
    pub disable_output_substitution: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            network: BitcoinNetwork::default(),
            max_fee_bump_contribution: None,
            min_fee_rate: None,
            enforce_uniform_input_type: default_true(),
            disable_output_substitution: false,
        }
    }
}

impl SenderConfig {
    /// Set the network.
    pub fn with_network(mut self, network: BitcoinNetwork) -> Self {
        self.network = network;
        self
    }

    /// Cap the receiver's fee contribution.
    pub fn with_max_fee_bump_contribution(mut self, amount: Amount) -> Self {
        self.max_fee_bump_contribution = Some(amount.to_sat());
        self
    }

    /// Require a minimum fee rate in sat/vB.
    pub fn with_min_fee_rate(mut self, sat_per_vb: f64) -> Self {
        self.min_fee_rate = Some(sat_per_vb);
        self
    }

    /// Toggle the uniform input type check on receiver inputs.
    pub fn with_uniform_input_type(mut self, enforce: bool) -> Self {
        self.enforce_uniform_input_type = enforce;
        self
    }

    /// Forbid output substitution.
    pub fn with_output_substitution_disabled(mut self) -> Self {
        self.disable_output_substitution = true;
        self
    }

    /// The contribution override as an amount.
    pub fn max_fee_bump_amount(&self) -> Option<Amount> {
        self.max_fee_bump_contribution.map(Amount::from_sat)
    }

    /// The minimum fee rate as a [`FeeRate`]. Invalid values are ignored.
    pub fn min_fee_rate(&self) -> Option<FeeRate> {
        self.min_fee_rate.and_then(fee_rate_from_sat_per_vb)
    }
}

/// Receiver-side payjoin configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Delay before the original transaction is broadcast as a fallback.
    #[serde(default = "default_fallback_delay")]
    pub fallback_delay_secs: u64,
}

fn default_fallback_delay() -> u64 {
    120
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            fallback_delay_secs: default_fallback_delay(),
        }
    }
}

impl ReceiverConfig {
    /// Set the fallback broadcast delay.
    pub fn with_fallback_delay(mut self, secs: u64) -> Self {
        self.fallback_delay_secs = secs;
        self
    }

    /// The fallback broadcast delay.
    pub fn fallback_delay(&self) -> Duration {
        Duration::from_secs(self.fallback_delay_secs)
    }
}

/// Configuration for the HTTP communicator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCommunicatorConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// User-Agent header sent with requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("payjoin-lib/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for HttpCommunicatorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpCommunicatorConfig {
    /// Set the timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the User-Agent header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Configuration for the Esplora broadcaster.
///
/// `from_env` reads:
///
/// | Variable | Description | Default |
/// |----------|-------------|---------|
/// | `PAYJOIN_ESPLORA_URL` | API base URL | `https://blockstream.info/api` |
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsploraConfig {
    /// API base URL (e.g., `https://blockstream.info/api`).
    pub api_url: String,

    /// Network the explorer is on.
    #[serde(default)]
    pub network: BitcoinNetwork,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl EsploraConfig {
    /// Create a new Esplora configuration.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            network: BitcoinNetwork::default(),
            timeout_secs: default_timeout(),
        }
    }

    /// Read the API URL from `PAYJOIN_ESPLORA_URL`, falling back to Blockstream mainnet.
    pub fn from_env() -> Self {
        match std::env::var("PAYJOIN_ESPLORA_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::blockstream_mainnet(),
        }
    }

    /// Create config for Blockstream mainnet.
    pub fn blockstream_mainnet() -> Self {
        Self::new("https://blockstream.info/api").with_network(BitcoinNetwork::Mainnet)
    }

    /// Create config for Blockstream testnet.
    pub fn blockstream_testnet() -> Self {
        Self::new("https://blockstream.info/testnet/api").with_network(BitcoinNetwork::Testnet)
    }

    /// Create config for mempool.space mainnet.
    pub fn mempool_mainnet() -> Self {
        Self::new("https://mempool.space/api").with_network(BitcoinNetwork::Mainnet)
    }

    /// Create config for mempool.space testnet.
    pub fn mempool_testnet() -> Self {
        Self::new("https://mempool.space/testnet/api").with_network(BitcoinNetwork::Testnet)
    }

    /// Set the network.
    pub fn with_network(mut self, network: BitcoinNetwork) -> Self {
        self.network = network;
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}
