//! Receiver side of the relay transport.
//!
//! [`RelayPayjoinReceiver`] owns the key table and two background tasks:
//!
//! - the connection loop: connect, subscribe to direct messages addressed to
//!   any known key, handle events one at a time, reconnect with backoff;
//! - the sweep loop: drop expired endpoint keys and force a resubscription.
//!
//! Every change to the key set cancels the current subscription so the loop
//! rebuilds its filter. A panic inside the pipeline is answered with
//! `unknown-error` and does not stop the loop.

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitcoin::psbt::Psbt;
use bitcoin::Txid;
use futures::{FutureExt, StreamExt};
use payjoin_lib::receiver::{
    PayjoinReceiver, PayjoinReceiverWallet, PaymentRequest, PaymentRequestBook, ProposalContext,
    SeenSet,
};
use payjoin_lib::ReceiverError;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::RelayClient;
use crate::communicator::RelayPayjoinRequest;
use crate::config::RelayConfig;
use crate::endpoint::RelayEndpoint;
use crate::event::{Event, EventBuilder, Filter, KIND_ENCRYPTED_DM};
use crate::keys::{ActiveKey, KeyTable, Keys};
use crate::{nip04, Result};

struct Shared<W> {
    client: Arc<dyn RelayClient>,
    pipeline: PayjoinReceiver<W>,
    config: RelayConfig,
    keys: KeyTable,
    /// `(created_at, id)` of handled events inside the since window.
    seen_events: SeenSet<(i64, String)>,
    subscription: Mutex<CancellationToken>,
}

/// Answers payjoin requests arriving as encrypted direct messages.
///
/// Cheap to clone; clones share keys and state.
pub struct RelayPayjoinReceiver<W> {
    shared: Arc<Shared<W>>,
}

impl<W> Clone for RelayPayjoinReceiver<W> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<W: PayjoinReceiverWallet + 'static> RelayPayjoinReceiver<W> {
    /// Receiver with a fresh static key.
    pub fn new(
        client: Arc<dyn RelayClient>,
        pipeline: PayjoinReceiver<W>,
        config: RelayConfig,
    ) -> Self {
        Self::with_static_keys(client, pipeline, config, Keys::generate())
    }

    pub fn with_static_keys(
        client: Arc<dyn RelayClient>,
        pipeline: PayjoinReceiver<W>,
        config: RelayConfig,
        static_keys: Keys,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                pipeline,
                config,
                keys: KeyTable::new(static_keys),
                seen_events: SeenSet::new(),
                subscription: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn pipeline(&self) -> &PayjoinReceiver<W> {
        &self.shared.pipeline
    }

    pub fn keys(&self) -> &KeyTable {
        &self.shared.keys
    }

    /// Endpoint for the static key. Used for open requests.
    pub fn generate_endpoint(&self) -> RelayEndpoint {
        RelayEndpoint::new(
            self.shared.keys.static_keys().public_key(),
            self.shared.config.relays.clone(),
            None,
        )
    }

    /// Register a new key and return its endpoint.
    ///
    /// Tag the matching [`PaymentRequest`] with the endpoint's identifier so
    /// it only matches requests sent there.
    pub fn generate_unique_endpoint(&self, expiry: Option<i64>) -> RelayEndpoint {
        let keys = Keys::generate();
        let relays = self.shared.config.relays.clone();
        let endpoint = RelayEndpoint::new(keys.public_key(), relays, expiry);
        let identifier = self.shared.keys.insert(ActiveKey::new(keys, expiry));
        debug!(key = %identifier, ?expiry, "endpoint key registered");
        self.shared.force_resubscribe();
        endpoint
    }

    /// Stop answering on `identifier`. Returns whether it was registered.
    pub fn retire_key(&self, identifier: &str) -> bool {
        let removed = self.shared.keys.remove(identifier).is_some();
        if removed {
            debug!(key = %identifier, "endpoint key retired");
            self.shared.force_resubscribe();
        }
        removed
    }

    /// Mark requests paid by `txid` as detected and retire their keys.
    pub fn on_transaction_detected(
        &self,
        book: &PaymentRequestBook,
        txid: Txid,
    ) -> Vec<PaymentRequest> {
        let detected = book.mark_detected(txid);
        for request in &detected {
            if let Some(identifier) = &request.relay_identifier {
                self.retire_key(identifier);
            }
        }
        detected
    }

    /// The filter a subscription made now would use.
    pub fn filter(&self) -> Filter {
        self.shared.filter()
    }

    /// Spawn the connection and sweep loops.
    pub fn start(&self, shutdown: CancellationToken) -> RelayReceiverHandle {
        let connection = tokio::spawn(self.shared.clone().run_connection(shutdown.clone()));
        let sweep = tokio::spawn(self.shared.clone().run_sweep(shutdown.clone()));
        info!(
            static_key = %self.shared.keys.static_keys().public_key_hex(),
            "relay payjoin receiver started"
        );
        RelayReceiverHandle {
            shutdown,
            tasks: vec![connection, sweep],
        }
    }

    /// Handle one inbound event. The connection loop calls this for every
    /// event it receives.
    pub async fn handle_event(&self, event: Event) {
        self.shared.handle_event(event).await
    }
}

/// Running receiver tasks.
pub struct RelayReceiverHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayReceiverHandle {
    /// Cancel both loops and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "relay receiver task failed");
            }
        }
    }

    /// Whether either loop has stopped. The receiver no longer answers
    /// every request once this is `true`.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().any(JoinHandle::is_finished)
    }
}

impl<W: PayjoinReceiverWallet + 'static> Shared<W> {
    fn since(&self) -> i64 {
        crate::unix_now() - self.config.since_window_secs as i64
    }

    fn filter(&self) -> Filter {
        Filter::new()
            .kind(KIND_ENCRYPTED_DM)
            .pubkeys(self.keys.identifiers())
            .since(self.since())
    }

    fn force_resubscribe(&self) {
        self.subscription.lock().expect("lock poisoned").cancel();
    }

    /// Install a fresh subscription token. Must run before the filter is built.
    fn next_subscription(&self, shutdown: &CancellationToken) -> CancellationToken {
        let token = shutdown.child_token();
        *self.subscription.lock().expect("lock poisoned") = token.clone();
        token
    }

    async fn run_connection(self: Arc<Self>, shutdown: CancellationToken) {
        let mut backoff = self.config.reconnect_delay();
        while !shutdown.is_cancelled() {
            let token = self.next_subscription(&shutdown);
            match self.subscribe_once(&token, &mut backoff).await {
                Ok(()) => continue,
                Err(e) => warn!(error = %e, retry_in = ?backoff, "relay subscription failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_reconnect_delay());
        }
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "relay disconnect failed");
        }
        info!("relay payjoin receiver stopped");
    }

    /// Connect, subscribe and handle events until `token` is cancelled.
    ///
    /// A stream that ends on its own is reported as an error. `backoff` is
    /// reset once the subscription is in place.
    async fn subscribe_once(
        &self,
        token: &CancellationToken,
        backoff: &mut Duration,
    ) -> Result<()> {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            result = self.client.connect() => result?,
        }
        let filter = self.filter();
        debug!(keys = filter.pubkeys.len(), since = ?filter.since, "subscribing");
        let mut events = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            result = self.client.subscribe(vec![filter]) => result?,
        };
        *backoff = self.config.reconnect_delay();
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                next = events.next() => match next {
                    Some(event) => self.handle_event(event).await,
                    None => return Err(crate::RelayError::Closed),
                },
            }
        }
    }

    async fn run_sweep(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let expired = self.keys.remove_expired(crate::unix_now());
            if !expired.is_empty() {
                info!(count = expired.len(), "expired endpoint keys removed");
                self.force_resubscribe();
            }
            self.prune_seen_events();
        }
    }

    /// Forget events older than the since window. Older events are dropped
    /// before the dedup check, so they cannot be answered twice.
    fn prune_seen_events(&self) {
        let since = self.since();
        self.seen_events.retain(|(created_at, _)| *created_at >= since);
    }

    #[instrument(skip_all, fields(event_id = %event.id))]
    async fn handle_event(&self, event: Event) {
        if event.kind != KIND_ENCRYPTED_DM {
            return;
        }
        if let Err(e) = event.verify() {
            debug!(error = %e, "dropping unverifiable event");
            return;
        }
        if event.created_at < self.since() {
            debug!(created_at = event.created_at, "event older than the since window");
            return;
        }
        if !self
            .seen_events
            .insert_if_absent((event.created_at, event.id.clone()))
        {
            debug!("event already handled");
            return;
        }
        let Some(recipient) = event.first_tag("p") else {
            return;
        };
        let Some(key) = self.keys.resolve(recipient) else {
            debug!(%recipient, "event for unknown key");
            return;
        };
        if key.is_expired_at(crate::unix_now()) {
            debug!(%recipient, "event for expired key");
            return;
        }
        let sender = match event.author() {
            Ok(sender) => sender,
            Err(e) => {
                debug!(error = %e, "bad sender key");
                return;
            }
        };
        let plaintext = match nip04::decrypt(&key.keys.secret_key(), &sender, &event.content) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(error = %e, "could not decrypt request");
                return;
            }
        };

        let outcome = AssertUnwindSafe(self.process(&plaintext, recipient))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(%recipient, %reason, "payjoin pipeline panicked");
                Err(ReceiverError::unknown("internal error"))
            });
        let reply = match outcome {
            Ok(proposal) => {
                info!(%recipient, "payjoin proposal sent");
                proposal.to_string()
            }
            Err(err) => {
                info!(%recipient, code = %err.code, "payjoin request refused");
                err.to_json()
            }
        };

        if let Err(e) = self.reply(&key.keys, &event, &reply).await {
            warn!(error = %e, "failed to publish reply");
        }
    }

    async fn process(
        &self,
        plaintext: &str,
        recipient: &str,
    ) -> std::result::Result<Psbt, ReceiverError> {
        let request: RelayPayjoinRequest = serde_json::from_str(plaintext)
            .map_err(|e| ReceiverError::unknown(format!("malformed request: {}", e)))?;
        let psbt = Psbt::from_str(&request.psbt)
            .map_err(|e| ReceiverError::original_psbt_rejected(format!("invalid PSBT: {}", e)))?;

        let mut ctx =
            ProposalContext::new(psbt, request.parameters).with_relay_identifier(recipient);
        self.pipeline.initiate(&mut ctx).await?;
        ctx.proposal()
            .map(|proposal| proposal.payjoin_psbt.clone())
            .ok_or_else(|| ReceiverError::unknown("no proposal"))
    }

    async fn reply(&self, keys: &Keys, request: &Event, content: &str) -> Result<()> {
        let sender = request.author()?;
        let encrypted = nip04::encrypt(&keys.secret_key(), &sender, content)?;
        let reply = EventBuilder::new(KIND_ENCRYPTED_DM, encrypted)
            .tag("e", request.id.clone())
            .tag("p", request.pubkey.clone())
            .sign(keys);
        self.client.publish(&reply).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRelay;
    use payjoin_lib::test_utils::fixtures::PayjoinScenario;
    use payjoin_lib::test_utils::{MockReceiverWallet, ProposalMode};
    use payjoin_lib::{ClientParameters, ErrorCode, ReceiverConfig};

    fn receiver() -> RelayPayjoinReceiver<Arc<MockReceiverWallet>> {
        let wallet = Arc::new(MockReceiverWallet::new(PayjoinScenario::new()));
        RelayPayjoinReceiver::new(
            Arc::new(MemoryRelay::new()),
            PayjoinReceiver::new(wallet, ReceiverConfig::default()),
            RelayConfig::default(),
        )
    }

    #[test]
    fn test_filter_tracks_keys() {
        let receiver = receiver();
        let filter = receiver.filter();
        assert_eq!(filter.kinds, vec![KIND_ENCRYPTED_DM]);
        assert_eq!(
            filter.pubkeys,
            vec![receiver.keys().static_keys().public_key_hex()]
        );
        let since = filter.since.unwrap();
        assert!((crate::unix_now() - 1800 - since).abs() <= 1);

        let endpoint = receiver.generate_unique_endpoint(None);
        assert_eq!(receiver.filter().pubkeys.len(), 2);
        assert!(receiver.retire_key(&endpoint.identifier()));
        assert!(!receiver.retire_key(&endpoint.identifier()));
        assert_eq!(receiver.filter().pubkeys.len(), 1);
    }

    #[test]
    fn test_key_changes_cancel_subscription() {
        let receiver = receiver();
        let shutdown = CancellationToken::new();
        let token = receiver.shared.next_subscription(&shutdown);
        assert!(!token.is_cancelled());

        receiver.generate_unique_endpoint(Some(crate::unix_now() + 60));
        assert!(token.is_cancelled());

        let token = receiver.shared.next_subscription(&shutdown);
        shutdown.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_endpoints_carry_relays() {
        let relay = url::Url::parse("wss://relay.example.com").unwrap();
        let wallet = Arc::new(MockReceiverWallet::new(PayjoinScenario::new()));
        let receiver = RelayPayjoinReceiver::new(
            Arc::new(MemoryRelay::new()),
            PayjoinReceiver::new(wallet, ReceiverConfig::default()),
            RelayConfig::default().with_relay(relay.clone()),
        );

        let open = receiver.generate_endpoint();
        assert_eq!(open.identifier(), receiver.keys().static_keys().public_key_hex());
        assert_eq!(open.relays, vec![relay.clone()]);
        assert_eq!(open.expiry, None);

        let unique = receiver.generate_unique_endpoint(Some(42));
        assert_ne!(unique.identifier(), open.identifier());
        assert_eq!(unique.expiry, Some(42));
        assert_eq!(receiver.keys().len(), 1);
    }

    struct Running {
        relay: MemoryRelay,
        wallet: Arc<MockReceiverWallet>,
        receiver: RelayPayjoinReceiver<Arc<MockReceiverWallet>>,
        request: String,
    }

    fn running() -> Running {
        let scenario = PayjoinScenario::new();
        let relay = MemoryRelay::new();
        let wallet = Arc::new(MockReceiverWallet::new(scenario.clone()));
        wallet
            .book
            .add(PaymentRequest::new(scenario.payment_script(), None));
        let receiver = RelayPayjoinReceiver::new(
            Arc::new(relay.clone()),
            PayjoinReceiver::new(wallet.clone(), ReceiverConfig::default()),
            RelayConfig::default().with_sweep_interval(20),
        );
        let request = serde_json::to_string(&RelayPayjoinRequest {
            psbt: scenario.original_psbt().to_string(),
            parameters: Some(ClientParameters::default()),
        })
        .unwrap();
        Running {
            relay,
            wallet,
            receiver,
            request,
        }
    }

    fn request_from(
        sender: &Keys,
        receiver: &RelayPayjoinReceiver<Arc<MockReceiverWallet>>,
        plaintext: &str,
    ) -> Event {
        let recipient = receiver.keys().static_keys().public_key();
        let content = nip04::encrypt(&sender.secret_key(), &recipient, plaintext).unwrap();
        EventBuilder::new(KIND_ENCRYPTED_DM, content)
            .tag("p", recipient.to_string())
            .sign(sender)
    }

    /// Decrypted reply to `request`, polling the relay for up to two seconds.
    async fn reply_to(relay: &MemoryRelay, sender: &Keys, request: &Event) -> Option<String> {
        let filter = Filter::new().kind(KIND_ENCRYPTED_DM).event(request.id.clone());
        for _ in 0..200 {
            if let Some(reply) = relay.query(&filter).first() {
                let author = reply.author().unwrap();
                return Some(nip04::decrypt(&sender.secret_key(), &author, &reply.content).unwrap());
            }
            sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_panicking_wallet_does_not_stop_loop() {
        let running = running();
        running.wallet.set_mode(ProposalMode::Panic);
        let handle = running.receiver.start(CancellationToken::new());
        for _ in 0..200 {
            if running.relay.subscription_count() == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let first = Keys::generate();
        let poison = request_from(&first, &running.receiver, &running.request);
        running.relay.publish(&poison).await.unwrap();
        let reply = reply_to(&running.relay, &first, &poison)
            .await
            .expect("no reply to panicking request");
        let err = ReceiverError::from_json(&reply).unwrap();
        assert_eq!(err.code, ErrorCode::Other("unknown-error".to_string()));

        running.wallet.set_mode(ProposalMode::Contribute);
        running.wallet.seen.retain(|_| false);
        let second = Keys::generate();
        let honest = request_from(&second, &running.receiver, &running.request);
        running.relay.publish(&honest).await.unwrap();
        let reply = reply_to(&running.relay, &second, &honest)
            .await
            .expect("no reply after a panicking request");
        let proposal = Psbt::from_str(&reply).unwrap();
        assert_eq!(proposal.inputs.len(), 2);

        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_events_dropped_and_pruned() {
        let running = running();
        let sender = Keys::generate();
        let recipient = running.receiver.keys().static_keys().public_key();
        let content = nip04::encrypt(&sender.secret_key(), &recipient, &running.request).unwrap();
        let stale = EventBuilder::new(KIND_ENCRYPTED_DM, content)
            .tag("p", recipient.to_string())
            .created_at(crate::unix_now() - 3600)
            .sign(&sender);
        running.receiver.handle_event(stale.clone()).await;
        assert!(running
            .relay
            .query(&Filter::new().kind(KIND_ENCRYPTED_DM).event(stale.id.clone()))
            .is_empty());
        assert!(running.receiver.shared.seen_events.is_empty());

        let fresh = request_from(&sender, &running.receiver, &running.request);
        running.receiver.handle_event(fresh).await;
        assert_eq!(running.receiver.shared.seen_events.len(), 1);

        running
            .receiver
            .shared
            .seen_events
            .insert_if_absent((crate::unix_now() - 3600, "old".to_string()));
        running.receiver.shared.prune_seen_events();
        assert_eq!(running.receiver.shared.seen_events.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_reports_either_loop_stopping() {
        let stopped = tokio::spawn(async {});
        let alive = tokio::spawn(futures::future::pending::<()>());
        while !stopped.is_finished() {
            tokio::task::yield_now().await;
        }
        let handle = RelayReceiverHandle {
            shutdown: CancellationToken::new(),
            tasks: vec![stopped, alive],
        };
        assert!(handle.is_finished());
        for task in &handle.tasks {
            task.abort();
        }
    }
}
