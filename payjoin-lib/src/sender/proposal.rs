use std::collections::{HashSet, VecDeque};

use bitcoin::psbt::Psbt;
use bitcoin::{Amount, FeeRate, ScriptBuf};
use tracing::debug;
use url::Url;

use super::original::create_original_psbt;
use super::{PayjoinWallet, ValidationError};
use crate::config::SenderConfig;
use crate::errors::PayjoinError;
use crate::params::ClientParameters;
use crate::psbt::{fee_for_vsize, is_finalized, PsbtExt, ScriptType};
use crate::uri::PayjoinUri;

/// Prepares payjoin requests from signed PSBTs.
#[derive(Clone, Debug, Default)]
pub struct SenderBuilder {
    config: SenderConfig,
}

impl SenderBuilder {
    /// Create a builder with the given configuration.
    pub fn new(config: SenderConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Derive the original PSBT and the request parameters.
    ///
    /// Fails with [`PayjoinError::Precondition`] before anything is sent if the
    /// URI has no endpoint, the PSBT is already finalized, or it lacks the
    /// UTXO data needed to compute its fee.
    pub fn build(
        &self,
        uri: &PayjoinUri,
        wallet: &dyn PayjoinWallet,
        signed_psbt: &Psbt,
    ) -> Result<RequestContext, PayjoinError> {
        let endpoint = uri
            .endpoint()
            .cloned()
            .ok_or_else(|| PayjoinError::precondition("This BIP21 does not support payjoin"))?;
        if signed_psbt.is_all_finalized() {
            return Err(PayjoinError::precondition(
                "The original PSBT should not be finalized.",
            ));
        }

        let script_type = wallet.script_type();
        let payment_script = uri.payment_script();
        let fee_output_index = signed_psbt
            .unsigned_tx
            .output
            .iter()
            .zip(&signed_psbt.outputs)
            .position(|(txout, output)| {
                wallet.is_own_output(output) && txout.script_pubkey != payment_script
            });

        let original_fee_rate = signed_psbt
            .estimated_fee_rate()
            .ok_or_else(|| PayjoinError::precondition("signedPSBT should have utxo information"))?;
        let original_fee = signed_psbt
            .fee_amount()
            .ok_or_else(|| PayjoinError::precondition("signedPSBT should have utxo information"))?;

        let allow_output_substitution =
            !self.config.disable_output_substitution && !uri.output_substitution_disabled();

        let mut params = ClientParameters {
            additional_fee_output_index: fee_output_index,
            min_fee_rate: self.config.min_fee_rate(),
            ..ClientParameters::default()
        };
        if fee_output_index.is_some() {
            params.max_additional_fee_contribution = Some(
                self.config
                    .max_fee_bump_amount()
                    .unwrap_or_else(|| fee_for_vsize(original_fee_rate, script_type.input_vsize())),
            );
        }
        if !allow_output_substitution {
            params.disable_output_substitution = Some(true);
        }

        let original_psbt = create_original_psbt(signed_psbt)
            .map_err(|e| PayjoinError::precondition(e.to_string()))?;

        debug!(
            endpoint = %endpoint,
            fee = original_fee.to_sat(),
            fee_output = ?fee_output_index,
            "prepared original PSBT"
        );

        Ok(RequestContext {
            endpoint,
            signed_psbt: signed_psbt.clone(),
            original_psbt,
            params,
            payment_script,
            script_type,
            original_fee,
            original_fee_rate,
            allow_output_substitution,
            enforce_uniform_input_type: self.config.enforce_uniform_input_type,
        })
    }
}

/// Everything needed to send one payjoin request and verify its answer.
#[derive(Clone, Debug)]
pub struct RequestContext {
    endpoint: Url,
    signed_psbt: Psbt,
    original_psbt: Psbt,
    params: ClientParameters,
    payment_script: ScriptBuf,
    script_type: ScriptType,
    original_fee: Amount,
    original_fee_rate: FeeRate,
    allow_output_substitution: bool,
    enforce_uniform_input_type: bool,
}

impl RequestContext {
    /// Receiver endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// The stripped, finalized PSBT to send.
    pub fn original_psbt(&self) -> &Psbt {
        &self.original_psbt
    }

    /// Parameters to send alongside the original PSBT.
    pub fn params(&self) -> &ClientParameters {
        &self.params
    }

    /// Fee of the original transaction.
    pub fn original_fee(&self) -> Amount {
        self.original_fee
    }

    /// Verify a receiver proposal and prepare it for signing.
    ///
    /// Inputs and outputs that belong to the sender get their UTXO, key
    /// origin and script data restored from the signed PSBT.
    pub fn process_proposal(&self, mut proposal: Psbt) -> Result<Psbt, ValidationError> {
        let original_tx = &self.signed_psbt.unsigned_tx;
        let mut own_inputs: VecDeque<_> = original_tx
            .input
            .iter()
            .zip(&self.signed_psbt.inputs)
            .collect();
        let mut own_outputs: VecDeque<_> = original_tx
            .output
            .iter()
            .zip(&self.signed_psbt.outputs)
            .enumerate()
            .collect();

        if !proposal.xpub.is_empty() {
            return Err(ValidationError::GlobalXpubs);
        }
        if let Some(err) = proposal.sanity_errors().first() {
            return Err(ValidationError::NotSane(err.to_string()));
        }
        if proposal.unsigned_tx.version != original_tx.version {
            return Err(ValidationError::VersionChanged);
        }
        if proposal.unsigned_tx.lock_time != original_tx.lock_time {
            return Err(ValidationError::LockTimeChanged);
        }

        let mut sequences = HashSet::new();
        for index in 0..proposal.inputs.len() {
            let txin = proposal.unsigned_tx.input[index].clone();
            let input_type = proposal.input_script_type(index);
            let input = &mut proposal.inputs[index];

            if !input.bip32_derivation.is_empty() || !input.tap_key_origins.is_empty() {
                return Err(ValidationError::InputKeyPaths);
            }
            if !input.partial_sigs.is_empty()
                || !input.tap_script_sigs.is_empty()
                || input.tap_key_sig.is_some()
            {
                return Err(ValidationError::InputPartialSigs);
            }

            let is_ours = own_inputs
                .front()
                .is_some_and(|(own, _)| own.previous_output == txin.previous_output);
            sequences.insert(txin.sequence);

            let own = if is_ours { own_inputs.pop_front() } else { None };
            if let Some((own_txin, signed_input)) = own {
                if own_txin.sequence != txin.sequence {
                    return Err(ValidationError::SequenceModified);
                }
                if is_finalized(input) {
                    return Err(ValidationError::OwnInputFinalized);
                }
                if input.witness_utxo.is_some() || input.non_witness_utxo.is_some() {
                    return Err(ValidationError::OwnInputUtxoAdded);
                }

                input.non_witness_utxo = signed_input.non_witness_utxo.clone();
                input.witness_utxo = signed_input.witness_utxo.clone();
                input
                    .bip32_derivation
                    .extend(signed_input.bip32_derivation.clone());
                input
                    .tap_key_origins
                    .extend(signed_input.tap_key_origins.clone());
                input.tap_internal_key = signed_input.tap_internal_key;
                input.redeem_script = signed_input.redeem_script.clone();
                input.witness_script = signed_input.witness_script.clone();
            } else {
                if !is_finalized(input) {
                    return Err(ValidationError::ForeignInputNotFinalized);
                }
                if input.witness_utxo.is_none() && input.non_witness_utxo.is_none() {
                    return Err(ValidationError::ForeignInputMissingUtxo);
                }
                if self.enforce_uniform_input_type && input_type != Some(self.script_type) {
                    return Err(ValidationError::MixedInputType);
                }
            }
        }

        if !own_inputs.is_empty() {
            return Err(ValidationError::MissingInputs);
        }
        if sequences.len() != 1 {
            return Err(ValidationError::MixedSequence);
        }

        let new_fee = proposal
            .fee_amount()
            .ok_or(ValidationError::MissingFeeData)?;
        let additional_fee = new_fee
            .checked_sub(self.original_fee)
            .ok_or(ValidationError::FeeDecreased)?;

        let added_inputs =
            proposal.inputs.len().saturating_sub(original_tx.input.len()) as u64;
        let added_inputs_fee = fee_for_vsize(self.original_fee_rate, self.script_type.input_vsize())
            .checked_mul(added_inputs)
            .unwrap_or(Amount::MAX);
        let max_contribution = self
            .params
            .max_additional_fee_contribution
            .unwrap_or(Amount::ZERO);

        let tx_outputs = &proposal.unsigned_tx.output;
        for (proposed, psbt_output) in tx_outputs.iter().zip(proposal.outputs.iter_mut()) {
            if !psbt_output.bip32_derivation.is_empty() || !psbt_output.tap_key_origins.is_empty() {
                return Err(ValidationError::OutputKeyPaths);
            }
            let Some(&(own_index, (own_txout, signed_output))) = own_outputs.front() else {
                continue;
            };

            let is_payment = own_txout.script_pubkey == self.payment_script;
            let is_original = own_txout.script_pubkey == proposed.script_pubkey;
            let substituted = !is_original && self.allow_output_substitution && is_payment;
            if !is_original && !substituted {
                continue;
            }
            own_outputs.pop_front();

            if Some(own_index) == self.params.additional_fee_output_index {
                let contribution = own_txout
                    .value
                    .checked_sub(proposed.value)
                    .unwrap_or(Amount::ZERO);
                if contribution > max_contribution {
                    return Err(ValidationError::ContributionExceedsMax);
                }
                if contribution > additional_fee {
                    return Err(ValidationError::ContributionNotOnlyFee);
                }
                if contribution > added_inputs_fee {
                    return Err(ValidationError::ContributionExceedsAddedInputs);
                }
            } else if self.allow_output_substitution && is_payment {
                // The receiver may change its own payment output.
            } else if own_txout.value > proposed.value {
                return Err(ValidationError::OutputDecreased);
            }

            psbt_output
                .bip32_derivation
                .extend(signed_output.bip32_derivation.clone());
            psbt_output
                .tap_key_origins
                .extend(signed_output.tap_key_origins.clone());
            psbt_output.redeem_script = signed_output.redeem_script.clone();
            psbt_output.witness_script = signed_output.witness_script.clone();
        }

        if !own_outputs.is_empty() {
            let lone_payment = own_outputs.len() == 1
                && own_outputs
                    .front()
                    .is_some_and(|(_, (txout, _))| txout.script_pubkey == self.payment_script);
            if !self.allow_output_substitution || !lone_payment {
                return Err(ValidationError::MissingOutputs);
            }
        }

        if let Some(min_fee_rate) = self.params.min_fee_rate {
            let fee_rate = proposal
                .estimated_fee_rate()
                .ok_or(ValidationError::MissingFeeData)?;
            if fee_rate < min_fee_rate {
                return Err(ValidationError::FeeRateTooLow);
            }
        }

        debug!(
            fee = new_fee.to_sat(),
            added_inputs, "payjoin proposal accepted"
        );
        Ok(proposal)
    }
}
