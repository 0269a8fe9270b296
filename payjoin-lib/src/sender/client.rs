use std::sync::Arc;

use bitcoin::psbt::Psbt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::{PayjoinWallet, RequestContext, SenderBuilder};
use crate::communicator::PayjoinServerCommunicator;
use crate::config::SenderConfig;
use crate::errors::PayjoinError;
use crate::uri::PayjoinUri;
use crate::Result;

/// Runs a complete sender-side payjoin negotiation.
pub struct PayjoinClient {
    communicator: Arc<dyn PayjoinServerCommunicator>,
    builder: SenderBuilder,
}

impl PayjoinClient {
    pub fn new(communicator: Arc<dyn PayjoinServerCommunicator>, config: SenderConfig) -> Self {
        Self {
            communicator,
            builder: SenderBuilder::new(config),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &SenderConfig {
        self.builder.config()
    }

    /// Build the request without sending it.
    pub fn prepare(
        &self,
        uri: &PayjoinUri,
        wallet: &dyn PayjoinWallet,
        signed_psbt: &Psbt,
    ) -> Result<RequestContext> {
        self.builder.build(uri, wallet, signed_psbt)
    }

    /// Send the original PSBT derived from `signed_psbt` and verify the answer.
    ///
    /// Returns the proposal with the sender's UTXO and key data restored, ready
    /// to be signed. Preconditions fail before anything is sent; an unsupported
    /// endpoint fails before the original PSBT leaves the process.
    #[instrument(skip_all, fields(endpoint))]
    pub async fn request_payjoin(
        &self,
        uri: &PayjoinUri,
        wallet: &dyn PayjoinWallet,
        signed_psbt: &Psbt,
        cancel: &CancellationToken,
    ) -> Result<Psbt> {
        let context = self.prepare(uri, wallet, signed_psbt)?;
        tracing::Span::current().record("endpoint", tracing::field::display(context.endpoint()));

        if !self.communicator.supports(context.endpoint()) {
            return Err(PayjoinError::UnsupportedEndpoint(
                context.endpoint().to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(PayjoinError::Cancelled);
        }

        let proposal = self
            .communicator
            .request_payjoin(
                context.endpoint(),
                context.original_psbt(),
                context.params(),
                cancel,
            )
            .await?;

        let psbt = context.process_proposal(proposal)?;
        info!(
            inputs = psbt.inputs.len(),
            outputs = psbt.outputs.len(),
            "payjoin proposal accepted"
        );
        Ok(psbt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorCode, ReceiverError};
    use crate::sender::ValidationError;
    use crate::test_utils::fixtures::PayjoinScenario;
    use crate::test_utils::MockCommunicator;
    use bitcoin::Amount;

    fn uri(scenario: &PayjoinScenario) -> PayjoinUri {
        scenario.bip21("https://example.com/pj").parse().unwrap()
    }

    #[tokio::test]
    async fn test_request_payjoin_accepts_valid_proposal() {
        let scenario = PayjoinScenario::new();
        let proposal = scenario.proposal(scenario.one_input_fee());
        let communicator = Arc::new(MockCommunicator::replying(Ok(proposal)));
        let client = PayjoinClient::new(communicator.clone(), SenderConfig::default());

        let psbt = client
            .request_payjoin(
                &uri(&scenario),
                &scenario.wallet(),
                &scenario.signed_psbt(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(psbt.inputs.len(), 2);
        assert!(psbt.inputs[0].witness_utxo.is_some());
        assert!(!psbt.inputs[0].bip32_derivation.is_empty());
        assert_eq!(communicator.calls(), 1);

        let params = communicator.last_params().unwrap();
        assert_eq!(
            params.additional_fee_output_index,
            Some(PayjoinScenario::CHANGE_INDEX)
        );
    }

    #[tokio::test]
    async fn test_request_payjoin_rejects_tampered_proposal() {
        let scenario = PayjoinScenario::new();
        let proposal = scenario.proposal(scenario.one_input_fee() + Amount::from_sat(5_000));
        let client = PayjoinClient::new(
            Arc::new(MockCommunicator::replying(Ok(proposal))),
            SenderConfig::default(),
        );

        let err = client
            .request_payjoin(
                &uri(&scenario),
                &scenario.wallet(),
                &scenario.signed_psbt(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PayjoinError::Validation(ValidationError::ContributionExceedsMax)
        ));
    }

    #[tokio::test]
    async fn test_receiver_error_passes_through() {
        let scenario = PayjoinScenario::new();
        let client = PayjoinClient::new(
            Arc::new(MockCommunicator::replying(Err(ReceiverError::unavailable(
                "We do not have any proposal for payjoin",
            )))),
            SenderConfig::default(),
        );

        let err = client
            .request_payjoin(
                &uri(&scenario),
                &scenario.wallet(),
                &scenario.signed_psbt(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        let receiver = err.receiver_error().unwrap();
        assert_eq!(receiver.code, ErrorCode::Unavailable);
        assert_eq!(receiver.message, "We do not have any proposal for payjoin");
    }

    #[tokio::test]
    async fn test_precondition_and_cancellation_skip_the_network() {
        let scenario = PayjoinScenario::new();
        let communicator = Arc::new(MockCommunicator::replying(Ok(scenario.original_psbt())));
        let client = PayjoinClient::new(communicator.clone(), SenderConfig::default());

        let no_pj: PayjoinUri = scenario
            .bip21("https://example.com/pj")
            .split("&pj=")
            .next()
            .unwrap()
            .parse()
            .unwrap();
        let err = client
            .request_payjoin(
                &no_pj,
                &scenario.wallet(),
                &scenario.signed_psbt(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PayjoinError::Precondition(_)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .request_payjoin(
                &uri(&scenario),
                &scenario.wallet(),
                &scenario.signed_psbt(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PayjoinError::Cancelled));
        assert_eq!(communicator.calls(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_endpoint() {
        let scenario = PayjoinScenario::new();
        let communicator = Arc::new(MockCommunicator::replying(Ok(scenario.original_psbt())));
        let client = PayjoinClient::new(
            Arc::new(crate::communicator::CompositeCommunicator::new()),
            SenderConfig::default(),
        );
        let uri: PayjoinUri = scenario.bip21("ftp://example.com/pj").parse().unwrap();

        let err = client
            .request_payjoin(
                &uri,
                &scenario.wallet(),
                &scenario.signed_psbt(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PayjoinError::UnsupportedEndpoint(_)));
        assert_eq!(communicator.calls(), 0);
    }
}
