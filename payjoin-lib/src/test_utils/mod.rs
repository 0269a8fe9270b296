//! Test utilities for payjoin.
//!
//! This module provides testing infrastructure including:
//! - PSBT fixtures for a standard one-input payment and its payjoin
//! - A scripted communicator for sender tests
//! - A configurable receiver wallet backed by the fixtures
//! - A recording broadcaster
//!
//! ## Usage
//!
//! ```rust,ignore
//! use payjoin_lib::test_utils::{fixtures::PayjoinScenario, MockCommunicator};
//!
//! let scenario = PayjoinScenario::new();
//! let proposal = scenario.proposal(scenario.one_input_fee());
//! let communicator = Arc::new(MockCommunicator::replying(Ok(proposal)));
//! ```

pub mod fixtures;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
use bitcoin::{Amount, OutPoint, Transaction, Txid};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::broadcast::{Broadcaster, FallbackScheduler};
use crate::communicator::{with_cancellation, PayjoinServerCommunicator};
use crate::errors::{PayjoinError, ReceiverError};
use crate::params::ClientParameters;
use crate::psbt::ScriptType;
use crate::receiver::{
    PayjoinReceiverWallet, PaymentRequest, PaymentRequestBook, ProposalContext, ReceiverProposal,
    SeenInputs,
};
use crate::Result;
use fixtures::PayjoinScenario;

/// A communicator that answers every request with a fixed reply.
pub struct MockCommunicator {
    reply: std::result::Result<Psbt, ReceiverError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_request: Mutex<Option<(Psbt, ClientParameters)>>,
}

impl MockCommunicator {
    pub fn replying(reply: std::result::Result<Psbt, ReceiverError>) -> Self {
        Self {
            reply,
            delay: None,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Wait `delay` before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of requests received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Original PSBT of the last request.
    pub fn last_original(&self) -> Option<Psbt> {
        self.last_request
            .lock()
            .unwrap()
            .as_ref()
            .map(|(psbt, _)| psbt.clone())
    }

    /// Parameters of the last request.
    pub fn last_params(&self) -> Option<ClientParameters> {
        self.last_request
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, params)| params.clone())
    }
}

#[async_trait]
impl PayjoinServerCommunicator for MockCommunicator {
    fn supports(&self, _endpoint: &Url) -> bool {
        true
    }

    async fn request_payjoin(
        &self,
        _endpoint: &Url,
        original_psbt: &Psbt,
        params: &ClientParameters,
        cancel: &CancellationToken,
    ) -> Result<Psbt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some((original_psbt.clone(), params.clone()));

        with_cancellation(cancel, async {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reply.clone().map_err(PayjoinError::Receiver)
        })
        .await
    }
}

/// A broadcaster that records what it was asked to send.
#[derive(Default)]
pub struct MockBroadcaster {
    broadcasts: Mutex<Vec<Txid>>,
    known: Mutex<HashSet<Txid>>,
    failure: Mutex<Option<String>>,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Txids broadcast so far, in order.
    pub fn broadcasts(&self) -> Vec<Txid> {
        self.broadcasts.lock().unwrap().clone()
    }

    /// Pretend `txid` is already in the mempool.
    pub fn mark_known(&self, txid: Txid) {
        self.known.lock().unwrap().insert(txid);
    }

    /// Reject every following broadcast with `reason`.
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait]
impl Broadcaster for MockBroadcaster {
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        if let Some(reason) = self.failure.lock().unwrap().clone() {
            return Err(PayjoinError::Transport(reason));
        }
        let txid = tx.compute_txid();
        self.broadcasts.lock().unwrap().push(txid);
        self.known.lock().unwrap().insert(txid);
        Ok(txid)
    }

    async fn is_known(&self, txid: &Txid) -> Result<bool> {
        Ok(self.known.lock().unwrap().contains(txid))
    }
}

/// How [`MockReceiverWallet`] answers `compute_payjoin_modifications`.
#[derive(Clone, Debug)]
pub enum ProposalMode {
    /// Add the fixture receiver input and take up to one input's fee.
    Contribute,
    /// Offer no payjoin.
    NoProposal,
    /// Fail with the given error.
    Fail(ReceiverError),
    /// Panic inside the hook.
    Panic,
}

/// A receiver wallet built on [`PayjoinScenario`].
///
/// Supports P2WPKH inputs, matches requests through its [`PaymentRequestBook`]
/// and records inputs in its [`SeenInputs`].
pub struct MockReceiverWallet {
    /// Requests the wallet matches against.
    pub book: PaymentRequestBook,
    /// Inputs seen by earlier runs.
    pub seen: SeenInputs,
    scenario: PayjoinScenario,
    supported: ScriptType,
    mode: Mutex<ProposalMode>,
    forced_match: Mutex<Option<PaymentRequest>>,
    mempool_error: Mutex<Option<String>>,
    scheduler: Option<Arc<FallbackScheduler>>,
    broadcasts: Mutex<Vec<(Txid, Duration)>>,
    modification_calls: AtomicUsize,
}

impl MockReceiverWallet {
    pub fn new(scenario: PayjoinScenario) -> Self {
        Self {
            book: PaymentRequestBook::new(),
            seen: SeenInputs::new(),
            scenario,
            supported: ScriptType::P2wpkh,
            mode: Mutex::new(ProposalMode::Contribute),
            forced_match: Mutex::new(None),
            mempool_error: Mutex::new(None),
            scheduler: None,
            broadcasts: Mutex::new(Vec::new()),
            modification_calls: AtomicUsize::new(0),
        }
    }

    /// Hand fallback broadcasts to `scheduler` as well as recording them.
    pub fn with_scheduler(mut self, scheduler: Arc<FallbackScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn set_mode(&self, mode: ProposalMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Return `request` from every lookup, bypassing the book.
    pub fn match_any(&self, request: PaymentRequest) {
        *self.forced_match.lock().unwrap() = Some(request);
    }

    /// Fail the mempool check with `reason`.
    pub fn reject_mempool(&self, reason: &str) {
        *self.mempool_error.lock().unwrap() = Some(reason.to_string());
    }

    /// `(original txid, delay)` of every requested fallback broadcast.
    pub fn broadcasts(&self) -> Vec<(Txid, Duration)> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn modification_calls(&self) -> usize {
        self.modification_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayjoinReceiverWallet for MockReceiverWallet {
    async fn find_matching_payment_request(&self, ctx: &ProposalContext) -> Option<PaymentRequest> {
        if let Some(request) = self.forced_match.lock().unwrap().clone() {
            return Some(request);
        }
        self.book
            .find_match(&ctx.original_tx().output, ctx.relay_identifier())
    }

    async fn supports_type(&self, script_type: ScriptType) -> bool {
        script_type == self.supported
    }

    async fn inputs_seen_before(&self, inputs: &[OutPoint]) -> bool {
        !self.seen.check_and_mark(inputs)
    }

    async fn is_mempool_eligible(&self, _psbt: &Psbt) -> std::result::Result<(), String> {
        match self.mempool_error.lock().unwrap().clone() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    async fn compute_payjoin_modifications(
        &self,
        ctx: &ProposalContext,
    ) -> std::result::Result<Option<ReceiverProposal>, ReceiverError> {
        self.modification_calls.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().unwrap().clone();
        match mode {
            ProposalMode::Contribute => {
                let fee_output = ctx.params().additional_fee_output_index;
                let max = ctx
                    .params()
                    .max_additional_fee_contribution
                    .unwrap_or(Amount::ZERO);
                let decrease = match fee_output {
                    Some(_) => self.scenario.one_input_fee().min(max),
                    None => Amount::ZERO,
                };
                Ok(Some(self.scenario.receiver_proposal_for(
                    ctx.original_psbt(),
                    fee_output,
                    decrease,
                )))
            }
            ProposalMode::NoProposal => Ok(None),
            ProposalMode::Fail(err) => Err(err),
            ProposalMode::Panic => panic!("wallet hook panicked"),
        }
    }

    async fn broadcast_original_transaction(&self, ctx: &ProposalContext, delay: Duration) {
        let payjoin_txid = ctx.proposal().map(|p| p.payjoin_txid);
        self.broadcasts
            .lock()
            .unwrap()
            .push((ctx.original_txid(), delay));
        if let Some(request) = ctx.payment_request() {
            self.book
                .record_negotiation(&request.id, ctx.original_txid(), payjoin_txid);
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.schedule(ctx.original_tx().clone(), payjoin_txid, delay);
        }
    }
}
