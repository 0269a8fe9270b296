//! Sender and receiver negotiating through a relay.
//!
//! ```bash
//! cargo test -p payjoin-relay --test relay_communicator
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, Harness};
use payjoin_lib::test_utils::ProposalMode;
use payjoin_lib::{
    CompositeCommunicator, ErrorCode, PayjoinClient, PayjoinError, PayjoinUri, PsbtExt,
    ReceiverError, SenderConfig,
};
use payjoin_relay::{Keys, MemoryRelay, RelayCommunicator, RelayConfig, RelayEndpoint};
use tokio_util::sync::CancellationToken;

fn client(relay: &MemoryRelay, config: RelayConfig) -> PayjoinClient {
    let relay_transport = Arc::new(RelayCommunicator::new(Arc::new(relay.clone()), config));
    let composite = CompositeCommunicator::new().with_transport("nostr", relay_transport);
    PayjoinClient::new(Arc::new(composite), SenderConfig::default())
}

fn uri(harness: &Harness, endpoint: &RelayEndpoint) -> PayjoinUri {
    harness
        .scenario
        .bip21(endpoint.to_url().unwrap().as_str())
        .parse()
        .unwrap()
}

#[tokio::test]
async fn test_negotiation_over_relay() {
    common::init_tracing();
    let harness = Harness::new();
    harness.expect_payment();
    let handle = harness.receiver.start(CancellationToken::new());
    assert!(eventually(|| harness.relay.subscription_count() == 1).await);

    let endpoint = harness.receiver.generate_endpoint();
    let psbt = client(&harness.relay, common::test_config())
        .request_payjoin(
            &uri(&harness, &endpoint),
            &harness.scenario.wallet(),
            &harness.scenario.signed_psbt(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(psbt.inputs.len(), 2);
    assert_eq!(
        psbt.fee_amount().unwrap(),
        harness.scenario.original_fee() + harness.scenario.one_input_fee()
    );
    assert_eq!(harness.wallet.broadcasts().len(), 1);

    // Request and reply are the only events, and the sender unsubscribed.
    assert_eq!(harness.relay.events().len(), 2);
    assert!(eventually(|| harness.relay.subscription_count() == 1).await);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unique_endpoint_negotiation() {
    let harness = Harness::new();
    let handle = harness.receiver.start(CancellationToken::new());
    let expiry = chrono::Utc::now().timestamp() + 600;
    let endpoint = harness.receiver.generate_unique_endpoint(Some(expiry));
    harness.wallet.book.add(
        payjoin_lib::PaymentRequest::new(harness.scenario.payment_script(), None)
            .with_relay_identifier(endpoint.identifier()),
    );
    // The resubscription covering the new key.
    assert!(
        eventually(|| {
            let filters = harness.relay.last_filters();
            filters.len() == 1 && filters[0].pubkeys.contains(&endpoint.identifier())
        })
        .await
    );

    let uri = uri(&harness, &endpoint);
    assert_eq!(uri.endpoint().unwrap().query(), Some(format!("expiry={}", expiry).as_str()));

    let psbt = client(&harness.relay, common::test_config())
        .request_payjoin(
            &uri,
            &harness.scenario.wallet(),
            &harness.scenario.signed_psbt(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(psbt.inputs.len(), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_receiver_error_surfaces() {
    let harness = Harness::new();
    harness.expect_payment();
    harness
        .wallet
        .set_mode(ProposalMode::Fail(ReceiverError::not_enough_money("dust only")));
    let handle = harness.receiver.start(CancellationToken::new());
    assert!(eventually(|| harness.relay.subscription_count() == 1).await);

    let endpoint = harness.receiver.generate_endpoint();
    let err = client(&harness.relay, common::test_config())
        .request_payjoin(
            &uri(&harness, &endpoint),
            &harness.scenario.wallet(),
            &harness.scenario.signed_psbt(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.receiver_error().unwrap().code, ErrorCode::NotEnoughMoney);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_reply_times_out() {
    let harness = Harness::new();
    let endpoint = RelayEndpoint::new(Keys::generate().public_key(), vec![], None);

    let err = client(&harness.relay, common::test_config().with_response_timeout(3))
        .request_payjoin(
            &uri(&harness, &endpoint),
            &harness.scenario.wallet(),
            &harness.scenario.signed_psbt(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PayjoinError::ConnectionTimeout { timeout_ms: 3000, .. }
    ));
    assert!(err.is_retryable());
    assert!(!harness.relay.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_waiting() {
    let harness = Harness::new();
    let endpoint = RelayEndpoint::new(Keys::generate().public_key(), vec![], None);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = client(&harness.relay, common::test_config())
        .request_payjoin(
            &uri(&harness, &endpoint),
            &harness.scenario.wallet(),
            &harness.scenario.signed_psbt(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PayjoinError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(1));
    // The request was published before the cancellation.
    assert_eq!(harness.relay.events().len(), 1);
}
