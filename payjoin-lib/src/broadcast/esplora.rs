//! Esplora broadcaster.
//!
//! Connects to Esplora-compatible APIs (Blockstream, mempool.space) to
//! submit original transactions and check whether a payjoin transaction has
//! already propagated.
//!
//! # Feature Flags
//!
//! This module requires the `http-client` feature flag to be enabled for actual
//! HTTP requests. Without it, all requests return an `Unimplemented` error.
//!
//! # Example
//!
//! ```rust,ignore
//! use payjoin_lib::broadcast::{EsploraBroadcaster, FallbackScheduler};
//!
//! let broadcaster = Arc::new(EsploraBroadcaster::blockstream_testnet()?);
//! let scheduler = FallbackScheduler::new(broadcaster);
//! scheduler.schedule(original_tx, Some(payjoin_txid), Duration::from_secs(120));
//! ```

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde::Deserialize;
#[cfg(feature = "http-client")]
use std::time::Duration;
use tracing::instrument;

use super::Broadcaster;
use crate::config::EsploraConfig;
use crate::{PayjoinError, Result};

/// Broadcasts through an Esplora HTTP API.
pub struct EsploraBroadcaster {
    config: EsploraConfig,
    #[cfg(feature = "http-client")]
    client: reqwest::Client,
}

/// Confirmation status as reported by `/tx/{txid}/status`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct TxStatus {
    /// Whether the transaction is in a block.
    pub confirmed: bool,
    /// Block height, when confirmed.
    #[serde(default)]
    pub block_height: Option<u64>,
}

impl EsploraBroadcaster {
    /// Create a new Esplora broadcaster with the given configuration.
    #[cfg(feature = "http-client")]
    pub fn new(config: EsploraConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PayjoinError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Create a new Esplora broadcaster with the given configuration (stub when feature disabled).
    #[cfg(not(feature = "http-client"))]
    pub fn new(config: EsploraConfig) -> Result<Self> {
        Ok(Self { config })
    }

    /// Create a broadcaster for Blockstream mainnet.
    pub fn blockstream_mainnet() -> Result<Self> {
        Self::new(EsploraConfig::blockstream_mainnet())
    }

    /// Create a broadcaster for Blockstream testnet.
    pub fn blockstream_testnet() -> Result<Self> {
        Self::new(EsploraConfig::blockstream_testnet())
    }

    /// Create a broadcaster for mempool.space mainnet.
    pub fn mempool_mainnet() -> Result<Self> {
        Self::new(EsploraConfig::mempool_mainnet())
    }

    /// Create a broadcaster for mempool.space testnet.
    pub fn mempool_testnet() -> Result<Self> {
        Self::new(EsploraConfig::mempool_testnet())
    }

    /// Get the configuration.
    pub fn config(&self) -> &EsploraConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// GET `path`, returning `None` on 404.
    #[cfg(feature = "http-client")]
    async fn get_optional<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(map_status_error(status.as_u16(), &error_text));
        }

        response.json::<T>().await.map(Some).map_err(|e| {
            PayjoinError::Serialization(format!("Failed to parse Esplora response: {}", e))
        })
    }

    #[cfg(not(feature = "http-client"))]
    async fn get_optional<T: for<'de> Deserialize<'de>>(&self, _path: &str) -> Result<Option<T>> {
        Err(PayjoinError::Unimplemented(
            "Esplora HTTP client not compiled - enable the 'http-client' feature",
        ))
    }

    #[cfg(feature = "http-client")]
    async fn post_text(&self, path: &str, body: String) -> Result<String> {
        let response = self
            .client
            .post(self.url(path))
            .header("Content-Type", "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PayjoinError::Serialization(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(map_status_error(status.as_u16(), &text));
        }
        Ok(text)
    }

    #[cfg(not(feature = "http-client"))]
    async fn post_text(&self, _path: &str, _body: String) -> Result<String> {
        Err(PayjoinError::Unimplemented(
            "Esplora HTTP client not compiled - enable the 'http-client' feature",
        ))
    }

    #[cfg(feature = "http-client")]
    fn map_reqwest_error(&self, e: reqwest::Error) -> PayjoinError {
        if e.is_timeout() {
            PayjoinError::ConnectionTimeout {
                operation: "Esplora request".to_string(),
                timeout_ms: self.config.timeout_secs * 1000,
            }
        } else if e.is_connect() {
            PayjoinError::ConnectionFailed {
                target: self.config.api_url.clone(),
                reason: e.to_string(),
            }
        } else {
            PayjoinError::Transport(format!("Esplora request failed: {}", e))
        }
    }

    /// Confirmation status of `txid`, or `None` if the explorer has never seen it.
    pub async fn tx_status(&self, txid: &Txid) -> Result<Option<TxStatus>> {
        self.get_optional(&format!("tx/{}/status", txid)).await
    }
}

#[cfg_attr(not(feature = "http-client"), allow(dead_code))]
fn map_status_error(status: u16, error_text: &str) -> PayjoinError {
    match status {
        400 => PayjoinError::Precondition(format!("transaction rejected: {}", error_text)),
        500..=599 => {
            PayjoinError::Transport(format!("Esplora server error ({}): {}", status, error_text))
        }
        _ => PayjoinError::Transport(format!(
            "Esplora request failed ({}): {}",
            status, error_text
        )),
    }
}

#[async_trait]
impl Broadcaster for EsploraBroadcaster {
    #[instrument(skip_all, fields(txid = %tx.compute_txid()))]
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let hex = bitcoin::consensus::encode::serialize_hex(tx);
        let body = self.post_text("tx", hex).await?;
        body.trim().parse::<Txid>().map_err(|e| {
            PayjoinError::Serialization(format!("Esplora returned an invalid txid: {}", e))
        })
    }

    async fn is_known(&self, txid: &Txid) -> Result<bool> {
        Ok(self.tx_status(txid).await?.is_some())
    }
}
