//! Relay receiver: event handling, key lifecycle and the connection loop.
//!
//! ```bash
//! cargo test -p payjoin-relay --test receiver_loop
//! ```

mod common;

use std::str::FromStr;

use bitcoin::psbt::Psbt;
use common::{eventually, next_reply, open_reply, request_event, Harness};
use payjoin_lib::test_utils::ProposalMode;
use payjoin_lib::{ErrorCode, PaymentRequest, ReceiverError};
use payjoin_relay::{EventBuilder, Filter, Keys, RelayClient, KIND_ENCRYPTED_DM};
use tokio_util::sync::CancellationToken;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn replies_to(harness: &Harness, request_id: &str) -> usize {
    harness
        .relay
        .query(&Filter::new().kind(KIND_ENCRYPTED_DM).event(request_id))
        .len()
}

#[tokio::test]
async fn test_request_answered_over_running_loop() {
    common::init_tracing();
    let harness = Harness::new();
    harness.expect_payment();
    let handle = harness.receiver.start(CancellationToken::new());
    assert!(eventually(|| harness.relay.subscription_count() == 1).await);

    let sender = Keys::generate();
    let request = request_event(&sender, &harness.static_key(), &harness.original_request());
    harness.relay.publish(&request).await.unwrap();

    let reply = next_reply(&harness.relay, &request).await.expect("no reply");
    assert_eq!(reply.author().unwrap(), harness.static_key());
    assert_eq!(reply.first_tag("p"), Some(request.pubkey.as_str()));

    let proposal = Psbt::from_str(&open_reply(&sender, &reply)).unwrap();
    assert_eq!(proposal.inputs.len(), 2);
    assert_eq!(harness.wallet.broadcasts().len(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_event_answered_once() {
    let harness = Harness::new();
    harness.expect_payment();
    let sender = Keys::generate();
    let request = request_event(&sender, &harness.static_key(), &harness.original_request());

    harness.receiver.handle_event(request.clone()).await;
    harness.receiver.handle_event(request.clone()).await;

    assert_eq!(replies_to(&harness, &request.id), 1);
    assert_eq!(harness.wallet.modification_calls(), 1);
}

#[tokio::test]
async fn test_forged_and_foreign_events_ignored() {
    let harness = Harness::new();
    harness.expect_payment();
    let sender = Keys::generate();

    // Addressed to a key the receiver does not hold.
    let stranger = Keys::generate().public_key();
    let foreign = request_event(&sender, &stranger, &harness.original_request());
    harness.receiver.handle_event(foreign.clone()).await;
    assert_eq!(replies_to(&harness, &foreign.id), 0);

    let mut forged = request_event(&sender, &harness.static_key(), &harness.original_request());
    forged.created_at += 1;
    harness.receiver.handle_event(forged.clone()).await;
    assert_eq!(replies_to(&harness, &forged.id), 0);

    // Not decryptable with the receiver's key: no reply at all.
    let garbled = EventBuilder::new(
        KIND_ENCRYPTED_DM,
        "bm90IGNpcGhlcg==?iv=AAAAAAAAAAAAAAAAAAAAAA==",
    )
    .tag("p", harness.static_key().to_string())
    .sign(&sender);
    harness.receiver.handle_event(garbled.clone()).await;
    assert_eq!(replies_to(&harness, &garbled.id), 0);

    assert_eq!(harness.wallet.modification_calls(), 0);
}

#[tokio::test]
async fn test_expired_key_ignored() {
    let harness = Harness::new();
    harness.expect_payment();
    let endpoint = harness.receiver.generate_unique_endpoint(Some(now() - 10));

    let sender = Keys::generate();
    let request = request_event(&sender, &endpoint.public_key, &harness.original_request());
    harness.receiver.handle_event(request.clone()).await;

    assert_eq!(replies_to(&harness, &request.id), 0);
}

#[tokio::test]
async fn test_pipeline_error_replied_encrypted() {
    let harness = Harness::new();
    harness.expect_payment();
    harness
        .wallet
        .set_mode(ProposalMode::Fail(ReceiverError::not_enough_money("no utxos")));

    let sender = Keys::generate();
    let request = request_event(&sender, &harness.static_key(), &harness.original_request());
    harness.receiver.handle_event(request.clone()).await;

    let reply = next_reply(&harness.relay, &request).await.expect("no reply");
    let err = ReceiverError::from_json(&open_reply(&sender, &reply)).unwrap();
    assert_eq!(err.code, ErrorCode::NotEnoughMoney);
}

#[tokio::test]
async fn test_malformed_requests() {
    let harness = Harness::new();
    harness.expect_payment();
    let sender = Keys::generate();

    let request = request_event(&sender, &harness.static_key(), "not json");
    harness.receiver.handle_event(request.clone()).await;
    let reply = next_reply(&harness.relay, &request).await.expect("no reply");
    let err = ReceiverError::from_json(&open_reply(&sender, &reply)).unwrap();
    assert_eq!(err.code, ErrorCode::Other("unknown-error".to_string()));

    let request = request_event(&sender, &harness.static_key(), r#"{"psbt":"garbage"}"#);
    harness.receiver.handle_event(request.clone()).await;
    let reply = next_reply(&harness.relay, &request).await.expect("no reply");
    let err = ReceiverError::from_json(&open_reply(&sender, &reply)).unwrap();
    assert_eq!(err.code, ErrorCode::OriginalPsbtRejected);
}

#[tokio::test]
async fn test_unique_endpoint_only_matches_its_request() {
    let harness = Harness::new();
    let endpoint = harness.receiver.generate_unique_endpoint(Some(now() + 600));
    harness.wallet.book.add(
        PaymentRequest::new(harness.scenario.payment_script(), None)
            .with_relay_identifier(endpoint.identifier()),
    );
    let sender = Keys::generate();

    // Same payment through the static key finds no request.
    let request = request_event(&sender, &harness.static_key(), &harness.original_request());
    harness.receiver.handle_event(request.clone()).await;
    let reply = next_reply(&harness.relay, &request).await.expect("no reply");
    assert!(ReceiverError::from_json(&open_reply(&sender, &reply)).is_some());

    let request = request_event(&sender, &endpoint.public_key, &harness.original_request());
    harness.receiver.handle_event(request.clone()).await;
    let reply = next_reply(&harness.relay, &request).await.expect("no reply");
    assert_eq!(reply.author().unwrap(), endpoint.public_key);
    assert!(Psbt::from_str(&open_reply(&sender, &reply)).is_ok());
}

#[tokio::test]
async fn test_detection_retires_endpoint_key() {
    let harness = Harness::new();
    let endpoint = harness.receiver.generate_unique_endpoint(None);
    let id = harness.wallet.book.add(
        PaymentRequest::new(harness.scenario.payment_script(), None)
            .with_relay_identifier(endpoint.identifier()),
    );

    let sender = Keys::generate();
    let request = request_event(&sender, &endpoint.public_key, &harness.original_request());
    harness.receiver.handle_event(request).await;

    let proposed = harness.wallet.book.get(&id).unwrap().proposed_txid.unwrap();
    let detected = harness
        .receiver
        .on_transaction_detected(&harness.wallet.book, proposed);
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].id, id);
    assert!(harness.receiver.keys().is_empty());
    assert_eq!(harness.receiver.filter().pubkeys.len(), 1);
}

#[tokio::test]
async fn test_sweep_drops_expired_keys_and_resubscribes() {
    let harness = Harness::new();
    let handle = harness.receiver.start(CancellationToken::new());
    assert!(eventually(|| harness.relay.subscribe_calls() == 1).await);

    let live = harness.receiver.generate_unique_endpoint(Some(now() + 600));
    harness.receiver.generate_unique_endpoint(Some(now() - 1));

    assert!(eventually(|| harness.receiver.keys().len() == 1).await);
    assert!(
        eventually(|| {
            let filters = harness.relay.last_filters();
            filters.len() == 1 && filters[0].pubkeys.len() == 2
        })
        .await
    );
    let filters = harness.relay.last_filters();
    assert!(filters[0].pubkeys.contains(&live.identifier()));
    assert!(harness.relay.subscribe_calls() >= 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_drop_and_refused_connects() {
    let harness = Harness::new();
    harness.relay.fail_connects(2);
    let handle = harness.receiver.start(CancellationToken::new());
    assert!(eventually(|| harness.relay.subscription_count() == 1).await);
    assert_eq!(harness.relay.subscribe_calls(), 1);

    harness.relay.drop_subscriptions();
    assert!(eventually(|| harness.relay.subscribe_calls() == 2).await);
    assert!(eventually(|| harness.relay.subscription_count() == 1).await);

    // Still answering after the reconnect.
    harness.expect_payment();
    let sender = Keys::generate();
    let request = request_event(&sender, &harness.static_key(), &harness.original_request());
    harness.relay.publish(&request).await.unwrap();
    assert!(next_reply(&harness.relay, &request).await.is_some());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_loops_and_disconnects() {
    let harness = Harness::new();
    let shutdown = CancellationToken::new();
    let handle = harness.receiver.start(shutdown.clone());
    assert!(eventually(|| harness.relay.is_connected()).await);

    shutdown.cancel();
    assert!(eventually(|| handle.is_finished()).await);
    handle.shutdown().await;
    assert!(!harness.relay.is_connected());
    assert_eq!(harness.relay.subscription_count(), 0);
}
