//! Shared helpers for payjoin-lib integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
use payjoin_lib::communicator::parse_proposal_response;
use payjoin_lib::receiver::handle_http_request;
use payjoin_lib::test_utils::fixtures::PayjoinScenario;
use payjoin_lib::test_utils::MockReceiverWallet;
use payjoin_lib::{
    ClientParameters, PayjoinReceiver, PayjoinServerCommunicator, PaymentRequest, ReceiverConfig,
    Result,
};
use tokio_util::sync::CancellationToken;
use url::Url;

/// A communicator that hands requests straight to an in-process receiver,
/// going through the same query/body encoding as the HTTP transport.
pub struct LoopbackCommunicator {
    pub receiver: PayjoinReceiver<Arc<MockReceiverWallet>>,
}

#[async_trait]
impl PayjoinServerCommunicator for LoopbackCommunicator {
    fn supports(&self, endpoint: &Url) -> bool {
        endpoint.scheme() == "https"
    }

    async fn request_payjoin(
        &self,
        _endpoint: &Url,
        original_psbt: &Psbt,
        params: &ClientParameters,
        _cancel: &CancellationToken,
    ) -> Result<Psbt> {
        let (_, body) = handle_http_request(
            &self.receiver,
            &params.to_query_string(),
            &original_psbt.to_string(),
        )
        .await;
        parse_proposal_response(&body)
    }
}

/// A receiver wallet expecting the scenario's payment, wrapped in a loopback.
pub fn loopback(scenario: &PayjoinScenario) -> (Arc<MockReceiverWallet>, Arc<LoopbackCommunicator>) {
    let wallet = Arc::new(MockReceiverWallet::new(scenario.clone()));
    wallet.book.add(PaymentRequest::new(
        scenario.payment_script(),
        Some(scenario.payment_value),
    ));
    let communicator = Arc::new(LoopbackCommunicator {
        receiver: PayjoinReceiver::new(wallet.clone(), ReceiverConfig::default()),
    });
    (wallet, communicator)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("payjoin_lib=debug")
        .with_test_writer()
        .try_init();
}
