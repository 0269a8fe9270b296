//! Shared helpers for payjoin-relay integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::XOnlyPublicKey;
use futures::StreamExt;
use payjoin_lib::test_utils::fixtures::PayjoinScenario;
use payjoin_lib::test_utils::MockReceiverWallet;
use payjoin_lib::{ClientParameters, PayjoinReceiver, PaymentRequest, ReceiverConfig};
use payjoin_relay::{
    nip04, Event, EventBuilder, Filter, Keys, MemoryRelay, RelayClient, RelayConfig,
    RelayPayjoinReceiver, RelayPayjoinRequest, KIND_ENCRYPTED_DM,
};

pub type TestReceiver = RelayPayjoinReceiver<Arc<MockReceiverWallet>>;

/// A receiver wired to an in-process relay.
pub struct Harness {
    pub scenario: PayjoinScenario,
    pub relay: MemoryRelay,
    pub wallet: Arc<MockReceiverWallet>,
    pub receiver: TestReceiver,
}

impl Harness {
    /// A receiver expecting the scenario's payment on its static key.
    pub fn new() -> Self {
        let scenario = PayjoinScenario::new();
        let relay = MemoryRelay::new();
        let wallet = Arc::new(MockReceiverWallet::new(scenario.clone()));
        let receiver = RelayPayjoinReceiver::new(
            Arc::new(relay.clone()),
            PayjoinReceiver::new(wallet.clone(), ReceiverConfig::default()),
            test_config(),
        );
        Self {
            scenario,
            relay,
            wallet,
            receiver,
        }
    }

    /// Add an open-amount request for the scenario's payment script.
    pub fn expect_payment(&self) -> String {
        self.wallet
            .book
            .add(PaymentRequest::new(self.scenario.payment_script(), None))
    }

    /// Static key of the receiver.
    pub fn static_key(&self) -> XOnlyPublicKey {
        self.receiver.keys().static_keys().public_key()
    }

    /// The scenario's original PSBT as a relay request plaintext.
    pub fn original_request(&self) -> String {
        serde_json::to_string(&RelayPayjoinRequest {
            psbt: self.scenario.original_psbt().to_string(),
            parameters: Some(ClientParameters::default()),
        })
        .unwrap()
    }
}

/// Fast reconnects and sweeps.
pub fn test_config() -> RelayConfig {
    RelayConfig::default()
        .with_sweep_interval(20)
        .with_reconnect_delay(10, 80)
        .with_response_timeout(5)
}

/// An encrypted request from `sender` to `recipient`.
pub fn request_event(sender: &Keys, recipient: &XOnlyPublicKey, plaintext: &str) -> Event {
    let content = nip04::encrypt(&sender.secret_key(), recipient, plaintext).unwrap();
    EventBuilder::new(KIND_ENCRYPTED_DM, content)
        .tag("p", recipient.to_string())
        .sign(sender)
}

/// Wait up to two seconds for a reply to `request`.
pub async fn next_reply(relay: &MemoryRelay, request: &Event) -> Option<Event> {
    let mut replies = relay
        .subscribe(vec![Filter::new().kind(KIND_ENCRYPTED_DM).event(request.id.clone())])
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), replies.next())
        .await
        .ok()
        .flatten()
}

/// Plaintext of a reply addressed to `sender`.
pub fn open_reply(sender: &Keys, reply: &Event) -> String {
    nip04::decrypt(&sender.secret_key(), &reply.author().unwrap(), &reply.content).unwrap()
}

/// Poll `condition` every 10ms for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("payjoin_relay=debug,payjoin_lib=debug")
        .with_test_writer()
        .try_init();
}
