//! PSBT inspection helpers shared by the sender and the receiver.
//!
//! Covers script-type detection, finalization status, fee and fee-rate
//! estimation for partially finalized PSBTs, and structural sanity checks.

use std::collections::HashSet;

use bitcoin::psbt::{Input, Psbt};
use bitcoin::script::Instruction;
use bitcoin::{Amount, FeeRate, Script, Transaction, TxOut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Added-input cost used when the script type is unknown, in vbytes.
pub const DEFAULT_INPUT_VSIZE: u64 = 110;

/// Size of an input with empty script_sig and witness, in vbytes.
const EMPTY_TXIN_VSIZE: u64 = 41;

/// Spending condition family of a single-key input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    /// Legacy pay-to-pubkey-hash.
    P2pkh,
    /// Native segwit v0 pay-to-witness-pubkey-hash.
    P2wpkh,
    /// P2WPKH wrapped in P2SH.
    P2shP2wpkh,
    /// Taproot key path.
    P2tr,
}

impl ScriptType {
    /// Virtual size of one spent input of this type.
    pub fn input_vsize(self) -> u64 {
        match self {
            Self::P2pkh => 148,
            Self::P2wpkh => 68,
            Self::P2shP2wpkh => 91,
            Self::P2tr => 58,
        }
    }

    /// Short name used in logs and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::P2pkh => "p2pkh",
            Self::P2wpkh => "p2wpkh",
            Self::P2shP2wpkh => "p2sh-p2wpkh",
            Self::P2tr => "p2tr",
        }
    }
}

impl std::str::FromStr for ScriptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p2pkh" | "legacy" => Ok(Self::P2pkh),
            "p2wpkh" | "segwit" => Ok(Self::P2wpkh),
            "p2sh-p2wpkh" | "segwit-p2sh" => Ok(Self::P2shP2wpkh),
            "p2tr" | "taproot" => Ok(Self::P2tr),
            other => Err(format!("unknown script type: {}", other)),
        }
    }
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Virtual size of an added input, falling back to [`DEFAULT_INPUT_VSIZE`].
pub fn input_vsize(script_type: Option<ScriptType>) -> u64 {
    script_type.map_or(DEFAULT_INPUT_VSIZE, ScriptType::input_vsize)
}

/// Fee for `vbytes` at `rate`, rounded down.
pub fn fee_for_vsize(rate: FeeRate, vbytes: u64) -> Amount {
    Amount::from_sat(
        rate.to_sat_per_kwu()
            .saturating_mul(vbytes)
            .saturating_mul(4)
            / 1000,
    )
}

/// Whether the input carries a final script_sig or witness.
pub fn is_finalized(input: &Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

/// Classify a spent output together with the PSBT input spending it.
pub fn classify_input(spent: &Script, input: &Input) -> Option<ScriptType> {
    if spent.is_p2pkh() {
        Some(ScriptType::P2pkh)
    } else if spent.is_p2wpkh() {
        Some(ScriptType::P2wpkh)
    } else if spent.is_p2tr() {
        Some(ScriptType::P2tr)
    } else if spent.is_p2sh() && wraps_p2wpkh(input) {
        Some(ScriptType::P2shP2wpkh)
    } else {
        None
    }
}

fn wraps_p2wpkh(input: &Input) -> bool {
    if let Some(redeem) = &input.redeem_script {
        return redeem.is_p2wpkh();
    }
    input
        .final_script_sig
        .as_deref()
        .and_then(last_push)
        .map(|bytes| Script::from_bytes(bytes).is_p2wpkh())
        .unwrap_or(false)
}

fn last_push(script: &Script) -> Option<&[u8]> {
    match script.instructions().filter_map(Result::ok).last()? {
        Instruction::PushBytes(bytes) => Some(bytes.as_bytes()),
        Instruction::Op(_) => None,
    }
}

/// Copy the unsigned transaction and fill in any final scripts.
pub fn extract_with_final_scripts(psbt: &Psbt) -> Transaction {
    let mut tx = psbt.unsigned_tx.clone();
    for (txin, input) in tx.input.iter_mut().zip(&psbt.inputs) {
        if let Some(script_sig) = &input.final_script_sig {
            txin.script_sig = script_sig.clone();
        }
        if let Some(witness) = &input.final_script_witness {
            txin.witness = witness.clone();
        }
    }
    tx
}

/// A structural defect in a PSBT.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanityError {
    /// PSBT input maps do not line up with transaction inputs.
    #[error("{psbt} PSBT inputs for {tx} transaction inputs")]
    InputCountMismatch {
        /// PSBT input maps
        psbt: usize,
        /// Transaction inputs
        tx: usize,
    },
    /// PSBT output maps do not line up with transaction outputs.
    #[error("{psbt} PSBT outputs for {tx} transaction outputs")]
    OutputCountMismatch {
        /// PSBT output maps
        psbt: usize,
        /// Transaction outputs
        tx: usize,
    },
    /// The same outpoint is spent twice.
    #[error("input {index} spends an outpoint already spent by another input")]
    DuplicateInput {
        /// Input index
        index: usize,
    },
    /// non_witness_utxo is not the transaction the input spends from.
    #[error("input {index} has a non_witness_utxo that does not match its previous output")]
    NonWitnessUtxoMismatch {
        /// Input index
        index: usize,
    },
    /// witness_utxo and non_witness_utxo disagree.
    #[error("input {index} has a witness_utxo inconsistent with its non_witness_utxo")]
    WitnessUtxoMismatch {
        /// Input index
        index: usize,
    },
    /// The unsigned transaction carries signature data.
    #[error("input {index} of the unsigned transaction is not empty")]
    UnsignedInputNotEmpty {
        /// Input index
        index: usize,
    },
}

/// Inspection helpers on [`Psbt`].
pub trait PsbtExt {
    /// The output spent by input `index`, from witness or non-witness UTXO data.
    fn spent_output(&self, index: usize) -> Option<&TxOut>;

    /// Script type of input `index`, if recognised.
    fn input_script_type(&self, index: usize) -> Option<ScriptType>;

    /// The script type shared by every input, if there is exactly one.
    fn inputs_script_type(&self) -> Option<ScriptType>;

    /// Whether every input carries final scripts.
    fn is_all_finalized(&self) -> bool;

    /// Whether any input or output carries BIP32 or taproot key origins.
    fn has_key_paths(&self) -> bool;

    /// Absolute fee, if every input carries UTXO data.
    fn fee_amount(&self) -> Option<Amount>;

    /// Estimated virtual size once every input is finalized.
    fn estimated_vsize(&self) -> Option<u64>;

    /// Estimated fee rate once every input is finalized. `None` when the
    /// fee is too large to express as a rate.
    fn estimated_fee_rate(&self) -> Option<FeeRate>;

    /// Structural defects, in input order.
    fn sanity_errors(&self) -> Vec<SanityError>;
}

impl PsbtExt for Psbt {
    fn spent_output(&self, index: usize) -> Option<&TxOut> {
        let input = self.inputs.get(index)?;
        if let Some(utxo) = &input.witness_utxo {
            return Some(utxo);
        }
        let prevout = self.unsigned_tx.input.get(index)?.previous_output;
        input
            .non_witness_utxo
            .as_ref()?
            .output
            .get(prevout.vout as usize)
    }

    fn input_script_type(&self, index: usize) -> Option<ScriptType> {
        let spent = self.spent_output(index)?;
        classify_input(&spent.script_pubkey, &self.inputs[index])
    }

    fn inputs_script_type(&self) -> Option<ScriptType> {
        let mut types = (0..self.inputs.len()).map(|i| self.input_script_type(i));
        let first = types.next()??;
        types.all(|t| t == Some(first)).then_some(first)
    }

    fn is_all_finalized(&self) -> bool {
        self.inputs.iter().all(is_finalized)
    }

    fn has_key_paths(&self) -> bool {
        self.inputs
            .iter()
            .any(|i| !i.bip32_derivation.is_empty() || !i.tap_key_origins.is_empty())
            || self
                .outputs
                .iter()
                .any(|o| !o.bip32_derivation.is_empty() || !o.tap_key_origins.is_empty())
    }

    fn fee_amount(&self) -> Option<Amount> {
        let mut input_total = 0u64;
        for index in 0..self.inputs.len() {
            input_total = input_total.checked_add(self.spent_output(index)?.value.to_sat())?;
        }
        let output_total = self
            .unsigned_tx
            .output
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value.to_sat()))?;
        input_total.checked_sub(output_total).map(Amount::from_sat)
    }

    fn estimated_vsize(&self) -> Option<u64> {
        let tx = extract_with_final_scripts(self);
        let mut pending = 0u64;
        for (index, input) in self.inputs.iter().enumerate() {
            if is_finalized(input) {
                continue;
            }
            self.spent_output(index)?;
            pending += input_vsize(self.input_script_type(index)) - EMPTY_TXIN_VSIZE;
        }
        Some(tx.vsize() as u64 + pending)
    }

    fn estimated_fee_rate(&self) -> Option<FeeRate> {
        let fee = self.fee_amount()?;
        let vsize = self.estimated_vsize()?;
        if vsize == 0 {
            return None;
        }
        let sat_per_kwu = fee.to_sat().checked_mul(250)? / vsize;
        Some(FeeRate::from_sat_per_kwu(sat_per_kwu))
    }

    fn sanity_errors(&self) -> Vec<SanityError> {
        let mut errors = Vec::new();
        let tx = &self.unsigned_tx;

        if self.inputs.len() != tx.input.len() {
            errors.push(SanityError::InputCountMismatch {
                psbt: self.inputs.len(),
                tx: tx.input.len(),
            });
        }
        if self.outputs.len() != tx.output.len() {
            errors.push(SanityError::OutputCountMismatch {
                psbt: self.outputs.len(),
                tx: tx.output.len(),
            });
        }

        let mut outpoints = HashSet::new();
        for (index, (txin, input)) in tx.input.iter().zip(&self.inputs).enumerate() {
            if !outpoints.insert(txin.previous_output) {
                errors.push(SanityError::DuplicateInput { index });
            }
            if !txin.script_sig.is_empty() || !txin.witness.is_empty() {
                errors.push(SanityError::UnsignedInputNotEmpty { index });
            }
            if let Some(prev_tx) = &input.non_witness_utxo {
                let prevout = txin.previous_output;
                let spent = prev_tx.output.get(prevout.vout as usize);
                if prev_tx.compute_txid() != prevout.txid || spent.is_none() {
                    errors.push(SanityError::NonWitnessUtxoMismatch { index });
                } else if let (Some(witness_utxo), Some(spent)) = (&input.witness_utxo, spent) {
                    if witness_utxo != spent {
                        errors.push(SanityError::WitnessUtxoMismatch { index });
                    }
                }
            }
        }

        errors
    }
}
