//! Receiver side of the payjoin protocol.
//!
//! [`PayjoinReceiver::initiate`] runs an inbound original PSBT through an
//! ordered list of checks before the wallet gets to contribute anything.
//! The first failing check ends the run with a [`ReceiverError`]. Wallet
//! decisions (which request is being paid, mempool policy, coin selection,
//! broadcasting) are delegated to a [`PayjoinReceiverWallet`].
//!
//! ```rust,ignore
//! let receiver = PayjoinReceiver::new(wallet, ReceiverConfig::default());
//! let mut ctx = ProposalContext::new(original_psbt, Some(params));
//! receiver.initiate(&mut ctx).await?;
//! let proposal = ctx.proposal().expect("set on success");
//! ```

mod context;
mod http;
mod proposal;
mod request;
mod seen;

pub use context::ProposalContext;
pub use http::handle_http_request;
pub use proposal::{ContributedInput, ReceiverProposal};
pub use request::{PaymentRequest, PaymentRequestBook};
pub use seen::{SeenInputs, SeenSet};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
use bitcoin::{Amount, OutPoint};
use tracing::{debug, info, instrument, warn};

use crate::config::ReceiverConfig;
use crate::errors::{ErrorCode, ReceiverError};
use crate::params::PAYJOIN_VERSION;
use crate::psbt::{is_finalized, PsbtExt, ScriptType};

/// Wallet capabilities the receiver pipeline relies on.
#[async_trait]
pub trait PayjoinReceiverWallet: Send + Sync {
    /// The payment request the original transaction pays, if any.
    async fn find_matching_payment_request(&self, ctx: &ProposalContext) -> Option<PaymentRequest>;

    /// Whether the wallet can build a payjoin with inputs of `script_type`.
    async fn supports_type(&self, script_type: ScriptType) -> bool;

    /// Whether any of `inputs` was used by an earlier original transaction.
    ///
    /// Implementations record the inputs when they were not seen before.
    async fn inputs_seen_before(&self, inputs: &[OutPoint]) -> bool;

    /// Check the original transaction against local mempool policy.
    async fn is_mempool_eligible(&self, psbt: &Psbt) -> Result<(), String>;

    /// Build the receiver's proposal. `Ok(None)` means no payjoin is offered.
    async fn compute_payjoin_modifications(
        &self,
        ctx: &ProposalContext,
    ) -> Result<Option<ReceiverProposal>, ReceiverError>;

    /// Broadcast the original transaction after `delay`.
    ///
    /// Must not wait for the delay to elapse.
    async fn broadcast_original_transaction(&self, ctx: &ProposalContext, delay: Duration);
}

#[async_trait]
impl<W: PayjoinReceiverWallet + ?Sized> PayjoinReceiverWallet for Arc<W> {
    async fn find_matching_payment_request(&self, ctx: &ProposalContext) -> Option<PaymentRequest> {
        (**self).find_matching_payment_request(ctx).await
    }

    async fn supports_type(&self, script_type: ScriptType) -> bool {
        (**self).supports_type(script_type).await
    }

    async fn inputs_seen_before(&self, inputs: &[OutPoint]) -> bool {
        (**self).inputs_seen_before(inputs).await
    }

    async fn is_mempool_eligible(&self, psbt: &Psbt) -> Result<(), String> {
        (**self).is_mempool_eligible(psbt).await
    }

    async fn compute_payjoin_modifications(
        &self,
        ctx: &ProposalContext,
    ) -> Result<Option<ReceiverProposal>, ReceiverError> {
        (**self).compute_payjoin_modifications(ctx).await
    }

    async fn broadcast_original_transaction(&self, ctx: &ProposalContext, delay: Duration) {
        (**self).broadcast_original_transaction(ctx, delay).await
    }
}

fn rejected(message: &str) -> ReceiverError {
    ReceiverError::original_psbt_rejected(message)
}

/// Validates original PSBTs and asks the wallet for a proposal.
pub struct PayjoinReceiver<W> {
    wallet: W,
    config: ReceiverConfig,
}

impl<W: PayjoinReceiverWallet> PayjoinReceiver<W> {
    pub fn new(wallet: W, config: ReceiverConfig) -> Self {
        Self { wallet, config }
    }

    pub fn wallet(&self) -> &W {
        &self.wallet
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Run the validation pipeline on `ctx`.
    ///
    /// On success the context holds the wallet's proposal and a fallback
    /// broadcast of the original has been scheduled.
    #[instrument(skip_all, fields(txid = %ctx.original_txid()))]
    pub async fn initiate(&self, ctx: &mut ProposalContext) -> Result<(), ReceiverError> {
        let result = self.run(ctx).await;
        match &result {
            Ok(()) => info!("payjoin proposal ready"),
            Err(err) => debug!(code = %err.code, message = %err.message, "original PSBT refused"),
        }
        result
    }

    async fn run(&self, ctx: &mut ProposalContext) -> Result<(), ReceiverError> {
        let request = self
            .wallet
            .find_matching_payment_request(ctx)
            .await
            .ok_or_else(|| rejected("Could not match PSBT to a payment request"))?;
        ctx.set_payment_request(request.clone());

        if ctx.params().version != PAYJOIN_VERSION {
            return Err(ReceiverError::version_unsupported());
        }

        let psbt = ctx.original_psbt();
        if !psbt.is_all_finalized() {
            return Err(rejected("The PSBT should be finalized"));
        }

        let supported = match psbt.inputs_script_type() {
            Some(script_type) => self.wallet.supports_type(script_type).await,
            None => false,
        };
        if !supported {
            return Err(ReceiverError::unavailable(
                "Our wallet does not support this wallet format",
            ));
        }

        if let Some(err) = psbt.sanity_errors().first() {
            return Err(rejected(&format!("This PSBT is insane ({})", err)));
        }

        if psbt.estimated_fee_rate().is_none() {
            return Err(rejected(
                "You need to provide Witness UTXO information to the PSBT.",
            ));
        }

        if !psbt.xpub.is_empty() {
            return Err(rejected("GlobalXPubs should not be included in the PSBT"));
        }
        if psbt.has_key_paths() {
            return Err(rejected(
                "Keypath information should not be included in the PSBT",
            ));
        }

        if !psbt.inputs.iter().all(is_finalized) {
            return Err(rejected("The PSBT Should be finalized"));
        }

        if let Err(reason) = self.wallet.is_mempool_eligible(psbt).await {
            return Err(rejected(&format!(
                "Provided transaction isn't mempool eligible {}",
                reason
            )));
        }

        let outpoints: Vec<OutPoint> = psbt
            .unsigned_tx
            .input
            .iter()
            .map(|txin| txin.previous_output)
            .collect();
        if self.wallet.inputs_seen_before(&outpoints).await {
            return Err(rejected(
                "Some of those inputs have already been used to make another payjoin transaction",
            ));
        }

        if let Some(destination) = &request.destination {
            let outputs = &ctx.original_tx().output;
            if !outputs.iter().any(|out| &out.script_pubkey == destination) {
                return Err(rejected("PSBT does not pay to the BIP21 destination"));
            }
            if request.amount_paid(outputs) < request.amount.unwrap_or(Amount::ZERO) {
                return Err(ReceiverError::new(
                    ErrorCode::parse("invoice-not-fully-paid"),
                    "The transaction must pay the whole invoice",
                ));
            }
            if let Some(index) = ctx.params().additional_fee_output_index {
                if outputs
                    .get(index)
                    .is_some_and(|out| &out.script_pubkey == destination)
                {
                    return Err(rejected(
                        "AdditionalFeeOutputIndex specified index of payment output",
                    ));
                }
            }
        }

        match self.wallet.compute_payjoin_modifications(ctx).await? {
            Some(proposal) => {
                if !ctx.set_proposal(proposal) {
                    warn!("proposal already set, keeping the first one");
                }
            }
            None => {
                self.wallet
                    .broadcast_original_transaction(ctx, Duration::ZERO)
                    .await;
                return Err(ReceiverError::unavailable(
                    "We do not have any proposal for payjoin",
                ));
            }
        }

        self.wallet
            .broadcast_original_transaction(ctx, self.config.fallback_delay())
            .await;
        Ok(())
    }
}
