use bitcoin::psbt::Psbt;
use bitcoin::{Transaction, Txid};

use super::{PaymentRequest, ReceiverProposal};
use crate::params::ClientParameters;
use crate::psbt::extract_with_final_scripts;

/// State threaded through one receiver pipeline run.
///
/// Created from the inbound original PSBT; the pipeline records the matched
/// payment request and the wallet's proposal on it. The proposal can only be
/// set once.
#[derive(Clone, Debug)]
pub struct ProposalContext {
    original_psbt: Psbt,
    original_tx: Transaction,
    params: ClientParameters,
    relay_identifier: Option<String>,
    payment_request: Option<PaymentRequest>,
    payment_output_index: Option<usize>,
    proposal: Option<ReceiverProposal>,
}

impl ProposalContext {
    /// Context for `original_psbt`, falling back to receiver defaults when the
    /// sender supplied no parameters.
    pub fn new(original_psbt: Psbt, params: Option<ClientParameters>) -> Self {
        let original_tx = extract_with_final_scripts(&original_psbt);
        Self {
            original_psbt,
            original_tx,
            params: params.unwrap_or_else(ClientParameters::receiver_defaults),
            relay_identifier: None,
            payment_request: None,
            payment_output_index: None,
            proposal: None,
        }
    }

    /// Record the relay identifier the request was addressed to.
    pub fn with_relay_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.relay_identifier = Some(identifier.into());
        self
    }

    pub fn original_psbt(&self) -> &Psbt {
        &self.original_psbt
    }

    /// The original transaction with its final scripts.
    pub fn original_tx(&self) -> &Transaction {
        &self.original_tx
    }

    pub fn original_txid(&self) -> Txid {
        self.original_tx.compute_txid()
    }

    pub fn params(&self) -> &ClientParameters {
        &self.params
    }

    pub fn relay_identifier(&self) -> Option<&str> {
        self.relay_identifier.as_deref()
    }

    /// The payment request matched in the first pipeline step.
    pub fn payment_request(&self) -> Option<&PaymentRequest> {
        self.payment_request.as_ref()
    }

    /// Index of the original output paying the matched request.
    ///
    /// `None` for open requests.
    pub fn payment_output_index(&self) -> Option<usize> {
        self.payment_output_index
    }

    pub fn proposal(&self) -> Option<&ReceiverProposal> {
        self.proposal.as_ref()
    }

    /// Store the wallet's proposal. Returns `false` if one was already set.
    pub fn set_proposal(&mut self, proposal: ReceiverProposal) -> bool {
        if self.proposal.is_some() {
            return false;
        }
        self.proposal = Some(proposal);
        true
    }

    pub(crate) fn set_payment_request(&mut self, request: PaymentRequest) {
        self.payment_output_index = request.payment_output_index(&self.original_tx.output);
        self.payment_request = Some(request);
    }
}
