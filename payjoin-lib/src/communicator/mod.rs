//! Transport abstraction between a payjoin sender and a receiver.
//!
//! A [`PayjoinServerCommunicator`] delivers the original PSBT to an endpoint
//! and returns the receiver's proposal. [`CompositeCommunicator`] picks a
//! transport by endpoint scheme so senders can accept any URI.

mod http;

pub use http::HttpCommunicator;

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::{PayjoinError, ReceiverError};
use crate::params::ClientParameters;
use crate::Result;

/// Sends an original PSBT to a payjoin endpoint.
#[async_trait]
pub trait PayjoinServerCommunicator: Send + Sync {
    /// Whether this communicator can reach `endpoint`.
    fn supports(&self, endpoint: &Url) -> bool;

    /// Send the original PSBT and wait for the receiver's proposal.
    ///
    /// Structured receiver errors surface as [`PayjoinError::Receiver`].
    /// Cancelling `cancel` aborts the request with [`PayjoinError::Cancelled`].
    async fn request_payjoin(
        &self,
        endpoint: &Url,
        original_psbt: &Psbt,
        params: &ClientParameters,
        cancel: &CancellationToken,
    ) -> Result<Psbt>;
}

/// Dispatches requests to a transport chosen by endpoint scheme.
#[derive(Clone, Default)]
pub struct CompositeCommunicator {
    transports: HashMap<String, Arc<dyn PayjoinServerCommunicator>>,
    fallback: Option<Arc<dyn PayjoinServerCommunicator>>,
}

impl CompositeCommunicator {
    /// Create a communicator with no transports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a communicator that serves `http` and `https` endpoints.
    pub fn with_http() -> Result<Self> {
        let http: Arc<dyn PayjoinServerCommunicator> = Arc::new(HttpCommunicator::new(
            crate::config::HttpCommunicatorConfig::default(),
        )?);
        Ok(Self::new()
            .with_transport("http", http.clone())
            .with_transport("https", http))
    }

    /// Route `scheme` to `transport`.
    pub fn with_transport(
        mut self,
        scheme: impl Into<String>,
        transport: Arc<dyn PayjoinServerCommunicator>,
    ) -> Self {
        self.register(scheme, transport);
        self
    }

    /// Use `transport` for schemes without a registered transport.
    pub fn with_fallback(mut self, transport: Arc<dyn PayjoinServerCommunicator>) -> Self {
        self.fallback = Some(transport);
        self
    }

    /// Route `scheme` to `transport`, replacing any previous registration.
    pub fn register(&mut self, scheme: impl Into<String>, transport: Arc<dyn PayjoinServerCommunicator>) {
        self.transports
            .insert(scheme.into().to_ascii_lowercase(), transport);
    }

    /// Schemes with a registered transport.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.transports.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    fn resolve(&self, endpoint: &Url) -> Result<&Arc<dyn PayjoinServerCommunicator>> {
        self.transports
            .get(endpoint.scheme())
            .or(self.fallback.as_ref())
            .filter(|transport| transport.supports(endpoint))
            .ok_or_else(|| PayjoinError::UnsupportedEndpoint(endpoint.to_string()))
    }
}

#[async_trait]
impl PayjoinServerCommunicator for CompositeCommunicator {
    fn supports(&self, endpoint: &Url) -> bool {
        self.resolve(endpoint).is_ok()
    }

    async fn request_payjoin(
        &self,
        endpoint: &Url,
        original_psbt: &Psbt,
        params: &ClientParameters,
        cancel: &CancellationToken,
    ) -> Result<Psbt> {
        let transport = self.resolve(endpoint)?;
        transport
            .request_payjoin(endpoint, original_psbt, params, cancel)
            .await
    }
}

/// Decode a receiver reply: a base64 PSBT, or a `{errorCode, message}` object.
pub fn parse_proposal_response(body: &str) -> Result<Psbt> {
    let body = body.trim();
    if let Ok(psbt) = Psbt::from_str(body) {
        return Ok(psbt);
    }
    match ReceiverError::from_json(body) {
        Some(err) => Err(PayjoinError::Receiver(err)),
        None => Err(PayjoinError::Serialization(
            "receiver reply is neither a PSBT nor an error object".to_string(),
        )),
    }
}

/// Run `fut` unless `cancel` fires first.
pub async fn with_cancellation<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(PayjoinError::Cancelled),
        result = fut => result,
    }
}
