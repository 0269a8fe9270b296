//! Payment requests a receiver has advertised.

use std::sync::RwLock;

use bitcoin::hex::DisplayHex;
use bitcoin::{Amount, ScriptBuf, TxOut, Txid};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Something the receiver expects to be paid.
///
/// A request without a destination is "open": it matches any transaction
/// sent to the endpoint it was advertised under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Unique identifier.
    pub id: String,
    /// Script the payment must go to.
    pub destination: Option<ScriptBuf>,
    /// Minimum amount paid to `destination`.
    pub amount: Option<Amount>,
    /// Unix time after which the request no longer matches.
    pub expiry: Option<i64>,
    /// Relay identifier (hex public key) the request was advertised under.
    pub relay_identifier: Option<String>,
    /// Original transaction received for this request.
    pub original_txid: Option<Txid>,
    /// Payjoin transaction proposed for this request.
    pub proposed_txid: Option<Txid>,
    /// Transaction seen paying this request.
    pub detected_txid: Option<Txid>,
}

fn new_request_id() -> String {
    bitcoin::secp256k1::rand::random::<[u8; 8]>().to_lower_hex_string()
}

impl PaymentRequest {
    /// A request paying `amount` (or anything, if `None`) to `destination`.
    pub fn new(destination: ScriptBuf, amount: Option<Amount>) -> Self {
        Self {
            destination: Some(destination),
            amount,
            ..Self::open()
        }
    }

    /// A request without a destination.
    pub fn open() -> Self {
        Self {
            id: new_request_id(),
            destination: None,
            amount: None,
            expiry: None,
            relay_identifier: None,
            original_txid: None,
            proposed_txid: None,
            detected_txid: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_expiry(mut self, expiry: i64) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_relay_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.relay_identifier = Some(identifier.into());
        self
    }

    /// Whether the request has no destination.
    pub fn is_open(&self) -> bool {
        self.destination.is_none()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    /// Whether a transaction paying this request has been detected.
    pub fn is_terminal(&self) -> bool {
        self.detected_txid.is_some()
    }

    /// Total value the outputs pay to the destination.
    pub fn amount_paid(&self, outputs: &[TxOut]) -> Amount {
        match &self.destination {
            Some(destination) => outputs
                .iter()
                .filter(|out| &out.script_pubkey == destination)
                .try_fold(Amount::ZERO, |total, out| total.checked_add(out.value))
                .unwrap_or(Amount::MAX),
            None => Amount::ZERO,
        }
    }

    /// Index of the output paying this request.
    ///
    /// Prefers the first output covering the amount on its own, then the
    /// first output paying the destination at all.
    pub fn payment_output_index(&self, outputs: &[TxOut]) -> Option<usize> {
        let destination = self.destination.as_ref()?;
        let amount = self.amount.unwrap_or(Amount::ZERO);
        outputs
            .iter()
            .position(|out| &out.script_pubkey == destination && out.value >= amount)
            .or_else(|| {
                outputs
                    .iter()
                    .position(|out| &out.script_pubkey == destination)
            })
    }

    /// Whether an inbound transaction with `outputs`, addressed to
    /// `relay_identifier`, can be paying this request at time `now`.
    pub fn matches(&self, outputs: &[TxOut], relay_identifier: Option<&str>, now: i64) -> bool {
        if self.is_expired_at(now) || self.is_terminal() || self.proposed_txid.is_some() {
            return false;
        }
        if let Some(expected) = &self.relay_identifier {
            if relay_identifier != Some(expected.as_str()) {
                return false;
            }
        }
        match &self.destination {
            None => true,
            Some(destination) => {
                let amount = self.amount.unwrap_or(Amount::ZERO);
                outputs
                    .iter()
                    .any(|out| &out.script_pubkey == destination && out.value >= amount)
            }
        }
    }
}

/// In-memory store of advertised payment requests.
#[derive(Debug, Default)]
pub struct PaymentRequestBook {
    requests: RwLock<Vec<PaymentRequest>>,
}

impl PaymentRequestBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a request and return its id.
    pub fn add(&self, request: PaymentRequest) -> String {
        let id = request.id.clone();
        self.requests.write().expect("lock poisoned").push(request);
        id
    }

    pub fn get(&self, id: &str) -> Option<PaymentRequest> {
        self.requests
            .read()
            .expect("lock poisoned")
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<PaymentRequest> {
        let mut requests = self.requests.write().expect("lock poisoned");
        let index = requests.iter().position(|r| r.id == id)?;
        Some(requests.remove(index))
    }

    /// Snapshot of every stored request.
    pub fn list(&self) -> Vec<PaymentRequest> {
        self.requests.read().expect("lock poisoned").clone()
    }

    /// First request the inbound transaction can be paying.
    pub fn find_match(
        &self,
        outputs: &[TxOut],
        relay_identifier: Option<&str>,
    ) -> Option<PaymentRequest> {
        let now = crate::unix_now();
        self.requests
            .read()
            .expect("lock poisoned")
            .iter()
            .find(|r| r.matches(outputs, relay_identifier, now))
            .cloned()
    }

    /// Remember which transactions a request was negotiated with.
    ///
    /// A request with a proposed txid no longer matches new originals.
    pub fn record_negotiation(&self, id: &str, original: Txid, proposed: Option<Txid>) -> bool {
        let mut requests = self.requests.write().expect("lock poisoned");
        match requests.iter_mut().find(|r| r.id == id) {
            Some(request) => {
                request.original_txid = Some(original);
                request.proposed_txid = proposed;
                true
            }
            None => false,
        }
    }

    /// Forget a negotiation so the request matches again.
    pub fn reset_negotiation(&self, id: &str) {
        let mut requests = self.requests.write().expect("lock poisoned");
        if let Some(request) = requests.iter_mut().find(|r| r.id == id) {
            request.original_txid = None;
            request.proposed_txid = None;
        }
    }

    /// Mark every request negotiated with `txid` as paid.
    ///
    /// Returns the requests that became terminal.
    pub fn mark_detected(&self, txid: Txid) -> Vec<PaymentRequest> {
        let mut requests = self.requests.write().expect("lock poisoned");
        let mut detected = Vec::new();
        for request in requests.iter_mut() {
            if request.is_terminal() {
                continue;
            }
            if request.original_txid == Some(txid) || request.proposed_txid == Some(txid) {
                request.detected_txid = Some(txid);
                debug!(request = %request.id, %txid, "payment request detected");
                detected.push(request.clone());
            }
        }
        detected
    }

    /// Drop expired requests that never got paid.
    pub fn remove_expired(&self) -> Vec<PaymentRequest> {
        let now = crate::unix_now();
        let mut requests = self.requests.write().expect("lock poisoned");
        let (expired, live): (Vec<_>, Vec<_>) = requests
            .drain(..)
            .partition(|r| r.is_expired_at(now) && !r.is_terminal());
        *requests = live;
        expired
    }
}
