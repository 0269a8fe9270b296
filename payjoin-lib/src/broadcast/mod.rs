//! Fallback broadcasting of original transactions.
//!
//! A receiver that accepted an original PSBT must make sure the payment
//! still lands if the payjoin transaction never shows up. The
//! [`FallbackScheduler`] owns those deferred broadcasts: each one sleeps for
//! its delay, checks whether the payjoin transaction is already known, and
//! broadcasts the original otherwise. Owners cancel them once superseded.

mod esplora;

pub use esplora::EsploraBroadcaster;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;

/// Submits transactions to the network.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Broadcast a signed transaction.
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid>;

    /// Whether the network already knows `txid` (mempool or chain).
    async fn is_known(&self, txid: &Txid) -> Result<bool>;
}

/// What happened to a scheduled fallback broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// The original transaction was broadcast.
    Broadcast(Txid),
    /// The payjoin transaction was already known; nothing was sent.
    PayjoinKnown(Txid),
    /// The broadcast was cancelled before it fired.
    Cancelled,
    /// The broadcaster rejected the original transaction.
    Failed(String),
}

struct Pending {
    generation: u64,
    token: CancellationToken,
}

/// Owns delayed, cancellable broadcasts keyed by original txid.
pub struct FallbackScheduler {
    broadcaster: Arc<dyn Broadcaster>,
    pending: Arc<Mutex<HashMap<Txid, Pending>>>,
    generation: AtomicU64,
    root: CancellationToken,
}

impl FallbackScheduler {
    /// Create a scheduler broadcasting through `broadcaster`.
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            broadcaster,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            root: CancellationToken::new(),
        }
    }

    /// Broadcast `original` after `delay` unless cancelled first.
    ///
    /// When `payjoin_txid` is given and the broadcaster already knows it once
    /// the delay elapses, the original is not sent. Scheduling the same
    /// original again replaces the earlier broadcast.
    pub fn schedule(
        &self,
        original: Transaction,
        payjoin_txid: Option<Txid>,
        delay: Duration,
    ) -> JoinHandle<FallbackOutcome> {
        let txid = original.compute_txid();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();

        let previous = self.pending.lock().expect("lock poisoned").insert(
            txid,
            Pending {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        debug!(%txid, delay_ms = delay.as_millis() as u64, "scheduled fallback broadcast");

        let broadcaster = self.broadcaster.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => FallbackOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {
                    fire(broadcaster.as_ref(), &original, payjoin_txid).await
                }
            };

            let mut pending = pending.lock().expect("lock poisoned");
            if pending.get(&txid).is_some_and(|p| p.generation == generation) {
                pending.remove(&txid);
            }
            outcome
        })
    }

    /// Cancel the broadcast scheduled for `txid`. Returns whether one was pending.
    pub fn cancel(&self, txid: &Txid) -> bool {
        match self.pending.lock().expect("lock poisoned").remove(txid) {
            Some(pending) => {
                pending.token.cancel();
                debug!(%txid, "cancelled fallback broadcast");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending broadcast.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().expect("lock poisoned");
        for (_, entry) in pending.drain() {
            entry.token.cancel();
        }
    }

    /// Number of broadcasts still waiting to fire.
    pub fn pending(&self) -> usize {
        self.pending.lock().expect("lock poisoned").len()
    }
}

impl Drop for FallbackScheduler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn fire(
    broadcaster: &dyn Broadcaster,
    original: &Transaction,
    payjoin_txid: Option<Txid>,
) -> FallbackOutcome {
    if let Some(payjoin_txid) = payjoin_txid {
        match broadcaster.is_known(&payjoin_txid).await {
            Ok(true) => {
                debug!(%payjoin_txid, "payjoin transaction known, skipping fallback");
                return FallbackOutcome::PayjoinKnown(payjoin_txid);
            }
            Ok(false) => {}
            Err(e) => warn!(%payjoin_txid, error = %e, "could not look up payjoin transaction"),
        }
    }

    match broadcaster.broadcast(original).await {
        Ok(txid) => {
            info!(%txid, "broadcast original transaction");
            FallbackOutcome::Broadcast(txid)
        }
        Err(e) => {
            warn!(txid = %original.compute_txid(), error = %e, "fallback broadcast failed");
            FallbackOutcome::Failed(e.to_string())
        }
    }
}
