//! End-to-end sender/receiver negotiation over an in-process transport.
//!
//! ```bash
//! cargo test -p payjoin-lib --features test-utils --test payjoin_flow
//! ```

#![cfg(feature = "test-utils")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use bitcoin::Amount;
use payjoin_lib::test_utils::fixtures::PayjoinScenario;
use payjoin_lib::test_utils::{MockBroadcaster, MockReceiverWallet, ProposalMode};
use payjoin_lib::{
    CompositeCommunicator, ErrorCode, FallbackScheduler, PayjoinClient, PayjoinError,
    PayjoinReceiver, PayjoinUri, PaymentRequest, ProposalContext, PsbtExt, ReceiverConfig,
    SenderConfig,
};
use tokio_util::sync::CancellationToken;

fn uri(scenario: &PayjoinScenario) -> PayjoinUri {
    scenario.bip21("https://receiver.example/pj").parse().unwrap()
}

#[tokio::test]
async fn test_full_negotiation() {
    common::init_tracing();
    let scenario = PayjoinScenario::new();
    let (wallet, loopback) = common::loopback(&scenario);
    let client = PayjoinClient::new(loopback, SenderConfig::default());

    let psbt = client
        .request_payjoin(
            &uri(&scenario),
            &scenario.wallet(),
            &scenario.signed_psbt(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // Sender input restored for signing, receiver input finalized.
    assert_eq!(psbt.inputs.len(), 2);
    assert!(psbt.inputs[0].final_script_witness.is_none());
    assert!(psbt.inputs[0].witness_utxo.is_some());
    assert!(psbt.inputs[1].final_script_witness.is_some());

    let fee = psbt.fee_amount().unwrap();
    assert_eq!(fee, scenario.original_fee() + scenario.one_input_fee());
    assert_eq!(
        psbt.unsigned_tx.output[PayjoinScenario::PAYMENT_INDEX].value,
        scenario.payment_value + scenario.receiver_input_value
    );

    let broadcasts = wallet.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].1, Duration::from_secs(120));
}

#[tokio::test]
async fn test_replayed_original_is_refused() {
    let scenario = PayjoinScenario::new();
    let (wallet, loopback) = common::loopback(&scenario);
    let client = PayjoinClient::new(loopback, SenderConfig::default());
    let cancel = CancellationToken::new();

    client
        .request_payjoin(&uri(&scenario), &scenario.wallet(), &scenario.signed_psbt(), &cancel)
        .await
        .unwrap();

    // A fresh request for the same payment, but the inputs were already used.
    wallet
        .book
        .add(PaymentRequest::new(scenario.payment_script(), None));
    let err = client
        .request_payjoin(&uri(&scenario), &scenario.wallet(), &scenario.signed_psbt(), &cancel)
        .await
        .unwrap_err();
    let receiver_err = err.receiver_error().unwrap();
    assert_eq!(receiver_err.code, ErrorCode::OriginalPsbtRejected);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_no_proposal_falls_back() {
    let scenario = PayjoinScenario::new();
    let (wallet, loopback) = common::loopback(&scenario);
    wallet.set_mode(ProposalMode::NoProposal);
    let client = PayjoinClient::new(loopback, SenderConfig::default());

    let err = client
        .request_payjoin(
            &uri(&scenario),
            &scenario.wallet(),
            &scenario.signed_psbt(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.receiver_error().unwrap().code, ErrorCode::Unavailable);
    assert!(err.is_retryable());
    assert_eq!(wallet.broadcasts()[0].1, Duration::ZERO);
}

#[tokio::test]
async fn test_min_fee_rate_enforced_end_to_end() {
    let scenario = PayjoinScenario::new();
    let (_, loopback) = common::loopback(&scenario);
    let client = PayjoinClient::new(
        loopback,
        SenderConfig::default().with_min_fee_rate(50.0),
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
        PayjoinError::Validation(payjoin_lib::ValidationError::FeeRateTooLow)
    ));
}

#[tokio::test]
async fn test_composite_routes_to_loopback() {
    let scenario = PayjoinScenario::new();
    let (_, loopback) = common::loopback(&scenario);
    let composite = CompositeCommunicator::new().with_transport("https", loopback);
    let client = PayjoinClient::new(Arc::new(composite), SenderConfig::default());

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

    let other: PayjoinUri = scenario.bip21("nostr:npub1xyz").parse().unwrap();
    let err = client
        .request_payjoin(
            &other,
            &scenario.wallet(),
            &scenario.signed_psbt(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PayjoinError::UnsupportedEndpoint(_)));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_skipped_once_payjoin_propagates() {
    let scenario = PayjoinScenario::new();
    let broadcaster = Arc::new(MockBroadcaster::new());
    let scheduler = Arc::new(FallbackScheduler::new(broadcaster.clone()));
    let wallet = Arc::new(MockReceiverWallet::new(scenario.clone()).with_scheduler(scheduler.clone()));
    wallet
        .book
        .add(PaymentRequest::new(scenario.payment_script(), None));
    let receiver = PayjoinReceiver::new(wallet.clone(), ReceiverConfig::default());

    let mut ctx = ProposalContext::new(scenario.original_psbt(), None);
    receiver.initiate(&mut ctx).await.unwrap();
    assert_eq!(scheduler.pending(), 1);

    let payjoin_txid = ctx.proposal().unwrap().payjoin_txid;
    broadcaster.mark_known(payjoin_txid);

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(scheduler.pending(), 0);
    assert!(broadcaster.broadcasts().is_empty());
}

#[tokio::test]
async fn test_fee_output_untouched_without_parameters() {
    let scenario = PayjoinScenario::new();
    let wallet = Arc::new(MockReceiverWallet::new(scenario.clone()));
    wallet
        .book
        .add(PaymentRequest::new(scenario.payment_script(), None));
    let receiver = PayjoinReceiver::new(wallet, ReceiverConfig::default());

    let mut ctx = ProposalContext::new(scenario.original_psbt(), None);
    receiver.initiate(&mut ctx).await.unwrap();
    let proposal = ctx.proposal().unwrap();
    assert_eq!(proposal.extra_fee_from_additional_fee_output, Amount::ZERO);
    assert_eq!(
        proposal.payjoin_psbt.unsigned_tx.output[PayjoinScenario::CHANGE_INDEX].value,
        scenario.change_value()
    );
}
