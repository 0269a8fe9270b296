//! Direct HTTP transport.
//!
//! The original PSBT is POSTed as base64 `text/plain` to the endpoint with
//! the parameters appended to its query string. A success status carries the
//! proposal; any other status should carry a `{errorCode, message}` object.
//!
//! Requires the `http-client` feature. Without it, every request fails with
//! [`PayjoinError::Unimplemented`].

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
#[cfg(feature = "http-client")]
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

use super::PayjoinServerCommunicator;
use crate::config::HttpCommunicatorConfig;
use crate::errors::PayjoinError;
use crate::params::ClientParameters;
use crate::Result;

/// Sends payjoin requests over plain HTTP(S).
pub struct HttpCommunicator {
    config: HttpCommunicatorConfig,
    #[cfg(feature = "http-client")]
    client: reqwest::Client,
}

impl HttpCommunicator {
    /// Create a communicator with the given configuration.
    #[cfg(feature = "http-client")]
    pub fn new(config: HttpCommunicatorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PayjoinError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Create a communicator with the given configuration (stub when feature disabled).
    #[cfg(not(feature = "http-client"))]
    pub fn new(config: HttpCommunicatorConfig) -> Result<Self> {
        Ok(Self { config })
    }

    /// Get the configuration.
    pub fn config(&self) -> &HttpCommunicatorConfig {
        &self.config
    }

    /// Endpoint URL with the payjoin parameters appended to any existing query.
    pub fn request_url(endpoint: &Url, params: &ClientParameters) -> Url {
        let mut url = endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params.to_query_pairs() {
                query.append_pair(key, &value);
            }
        }
        url
    }

    #[cfg(feature = "http-client")]
    async fn post(&self, url: Url, body: String) -> Result<(u16, String)> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| PayjoinError::Transport(format!("Failed to read response: {}", e)))?;
        Ok((status, text))
    }

    #[cfg(not(feature = "http-client"))]
    async fn post(&self, _url: Url, _body: String) -> Result<(u16, String)> {
        Err(PayjoinError::Unimplemented(
            "HTTP communicator not compiled - enable the 'http-client' feature",
        ))
    }

    #[cfg(feature = "http-client")]
    fn map_reqwest_error(&self, e: reqwest::Error) -> PayjoinError {
        if e.is_timeout() {
            PayjoinError::ConnectionTimeout {
                operation: "payjoin request".to_string(),
                timeout_ms: self.config.timeout_secs * 1000,
            }
        } else if e.is_connect() {
            PayjoinError::ConnectionFailed {
                target: e.url().map(|u| u.to_string()).unwrap_or_default(),
                reason: e.to_string(),
            }
        } else {
            PayjoinError::Transport(format!("payjoin request failed: {}", e))
        }
    }
}

/// Map a non-success reply to an error.
fn status_error(status: u16, body: &str) -> PayjoinError {
    match crate::errors::ReceiverError::from_json(body) {
        Some(err) => PayjoinError::Receiver(err),
        None => PayjoinError::Transport(format!("payjoin endpoint returned status {}", status)),
    }
}

#[async_trait]
impl PayjoinServerCommunicator for HttpCommunicator {
    fn supports(&self, endpoint: &Url) -> bool {
        matches!(endpoint.scheme(), "http" | "https")
    }

    #[instrument(skip_all, fields(endpoint = %endpoint))]
    async fn request_payjoin(
        &self,
        endpoint: &Url,
        original_psbt: &Psbt,
        params: &ClientParameters,
        cancel: &CancellationToken,
    ) -> Result<Psbt> {
        let url = Self::request_url(endpoint, params);
        let body = original_psbt.to_string();

        let (status, text) = super::with_cancellation(cancel, self.post(url, body)).await?;
        tracing::debug!(status, "payjoin endpoint replied");

        if (200..300).contains(&status) {
            super::parse_proposal_response(&text)
        } else {
            Err(status_error(status, &text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use bitcoin::Amount;

    #[test]
    fn test_request_url_keeps_existing_query() {
        let endpoint = Url::parse("https://example.com/pj?invoice=42").unwrap();
        let params = ClientParameters {
            max_additional_fee_contribution: Some(Amount::from_sat(680)),
            additional_fee_output_index: Some(1),
            ..ClientParameters::default()
        };

        let url = HttpCommunicator::request_url(&endpoint, &params);
        assert_eq!(
            url.as_str(),
            "https://example.com/pj?invoice=42&v=1&additionalfeeoutputindex=1&maxadditionalfeecontribution=680"
        );
        let parsed = ClientParameters::from_query(url.query().unwrap()).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn test_status_error_mapping() {
        let err = status_error(
            400,
            r#"{"errorCode":"original-psbt-rejected","message":"The receiver rejected the original PSBT."}"#,
        );
        assert_eq!(
            err.receiver_error().unwrap().code,
            ErrorCode::OriginalPsbtRejected
        );

        let err = status_error(502, "Bad Gateway");
        assert!(matches!(err, PayjoinError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_supports_http_only() {
        let communicator = HttpCommunicator::new(HttpCommunicatorConfig::default()).unwrap();
        assert!(communicator.supports(&Url::parse("http://localhost/pj").unwrap()));
        assert!(communicator.supports(&Url::parse("https://example.com/pj").unwrap()));
        assert!(!communicator.supports(&Url::parse("nostr:npub1xyz").unwrap()));
    }

    #[cfg(not(feature = "http-client"))]
    #[tokio::test]
    async fn test_unimplemented_without_feature() {
        use crate::test_utils::fixtures::PayjoinScenario;

        let communicator = HttpCommunicator::new(HttpCommunicatorConfig::default()).unwrap();
        let err = communicator
            .request_payjoin(
                &Url::parse("https://example.com/pj").unwrap(),
                &PayjoinScenario::new().original_psbt(),
                &ClientParameters::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PayjoinError::Unimplemented(_)));
    }
}
