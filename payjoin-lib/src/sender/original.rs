//! Building the original PSBT from the sender's signed PSBT.
//!
//! Each input is finalized from its partial signatures and then reduced to
//! UTXO data plus final scripts. Key origins, unknown and proprietary fields
//! and global xpubs are removed everywhere.

use bitcoin::psbt::{Input, Psbt};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::Witness;
use thiserror::Error;

use crate::psbt::{classify_input, is_finalized, PsbtExt, ScriptType};

/// Reason an input of the signed PSBT could not be finalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FinalizeError {
    #[error("input {index} has no witness_utxo or non_witness_utxo")]
    MissingUtxo { index: usize },

    #[error("input {index} spends an unsupported script type")]
    UnsupportedScript { index: usize },

    #[error("input {index} has no signature to finalize with")]
    MissingSignature { index: usize },

    #[error("input {index} has no redeem script")]
    MissingRedeemScript { index: usize },

    #[error("input {index}: {reason}")]
    Script { index: usize, reason: String },
}

/// Finalize and strip a signed PSBT into the PSBT sent to the receiver.
pub fn create_original_psbt(signed: &Psbt) -> Result<Psbt, FinalizeError> {
    let mut original = signed.clone();

    for index in 0..original.inputs.len() {
        if !is_finalized(&original.inputs[index]) {
            let script_type = script_type_of(&original, index)?;
            finalize_input(&mut original.inputs[index], script_type, index)?;
        }
        let input = &original.inputs[index];
        original.inputs[index] = Input {
            non_witness_utxo: input.non_witness_utxo.clone(),
            witness_utxo: input.witness_utxo.clone(),
            final_script_sig: input.final_script_sig.clone(),
            final_script_witness: input.final_script_witness.clone(),
            ..Default::default()
        };
    }

    for output in original.outputs.iter_mut() {
        output.bip32_derivation.clear();
        output.tap_key_origins.clear();
        output.unknown.clear();
        output.proprietary.clear();
    }

    original.xpub.clear();
    original.unknown.clear();
    original.proprietary.clear();
    Ok(original)
}

fn script_type_of(psbt: &Psbt, index: usize) -> Result<ScriptType, FinalizeError> {
    let spent = psbt
        .spent_output(index)
        .ok_or(FinalizeError::MissingUtxo { index })?;
    classify_input(&spent.script_pubkey, &psbt.inputs[index])
        .ok_or(FinalizeError::UnsupportedScript { index })
}

fn finalize_input(
    input: &mut Input,
    script_type: ScriptType,
    index: usize,
) -> Result<(), FinalizeError> {
    let ecdsa_sig = input
        .partial_sigs
        .iter()
        .next()
        .map(|(pk, sig)| (*pk, *sig));

    match (script_type, ecdsa_sig) {
        (ScriptType::P2tr, _) => {
            let sig = input
                .tap_key_sig
                .ok_or(FinalizeError::MissingSignature { index })?;
            input.final_script_witness = Some(Witness::from_slice(&[sig.to_vec()]));
        }
        (_, None) => return Err(FinalizeError::MissingSignature { index }),
        (ScriptType::P2wpkh, Some((pubkey, sig))) => {
            input.final_script_witness =
                Some(Witness::from_slice(&[sig.to_vec(), pubkey.to_bytes()]));
        }
        (ScriptType::P2pkh, Some((pubkey, sig))) => {
            let sig_push = push_bytes(sig.to_vec(), index)?;
            input.final_script_sig = Some(
                Builder::new()
                    .push_slice(sig_push)
                    .push_key(&pubkey)
                    .into_script(),
            );
        }
        (ScriptType::P2shP2wpkh, Some((pubkey, sig))) => {
            let redeem = input
                .redeem_script
                .as_ref()
                .ok_or(FinalizeError::MissingRedeemScript { index })?;
            let redeem_push = push_bytes(redeem.to_bytes(), index)?;
            input.final_script_sig = Some(Builder::new().push_slice(redeem_push).into_script());
            input.final_script_witness =
                Some(Witness::from_slice(&[sig.to_vec(), pubkey.to_bytes()]));
        }
    }
    Ok(())
}

fn push_bytes(bytes: Vec<u8>, index: usize) -> Result<PushBytesBuf, FinalizeError> {
    PushBytesBuf::try_from(bytes).map_err(|e| FinalizeError::Script {
        index,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::{p2pkh_script, p2sh_script, p2wpkh_script, PayjoinScenario};
    use bitcoin::psbt::Psbt;
    use bitcoin::TxOut;

    #[test]
    fn test_signed_scenario_strips_to_original() {
        let scenario = PayjoinScenario::new();
        let original = create_original_psbt(&scenario.signed_psbt()).unwrap();
        assert_eq!(original, scenario.original_psbt());
        assert!(original.is_all_finalized());
        assert!(!original.has_key_paths());
    }

    #[test]
    fn test_finalized_inputs_kept() {
        let scenario = PayjoinScenario::new();
        let original = scenario.original_psbt();
        assert_eq!(create_original_psbt(&original).unwrap(), original);
    }

    #[test]
    fn test_p2pkh_finalizes_into_script_sig() {
        let scenario = PayjoinScenario::new();
        let mut psbt = scenario.signed_psbt();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: scenario.funding_value,
            script_pubkey: p2pkh_script(0xaa),
        });

        let original = create_original_psbt(&psbt).unwrap();
        let input = &original.inputs[0];
        assert!(input.final_script_witness.is_none());
        let script_sig = input.final_script_sig.as_ref().unwrap();
        assert_eq!(script_sig.instructions().count(), 2);
    }

    #[test]
    fn test_wrapped_segwit_needs_redeem_script() {
        let scenario = PayjoinScenario::new();
        let mut psbt = scenario.signed_psbt();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: scenario.funding_value,
            script_pubkey: p2sh_script(0xaa),
        });

        // Without a redeem script the input cannot even be classified.
        assert_eq!(
            create_original_psbt(&psbt).unwrap_err(),
            FinalizeError::UnsupportedScript { index: 0 }
        );

        psbt.inputs[0].redeem_script = Some(p2wpkh_script(0xaa));
        let original = create_original_psbt(&psbt).unwrap();
        let input = &original.inputs[0];
        assert!(input.final_script_sig.is_some());
        assert_eq!(input.final_script_witness.as_ref().unwrap().len(), 2);
        assert_eq!(original.input_script_type(0), Some(ScriptType::P2shP2wpkh));
    }

    #[test]
    fn test_missing_signature_and_utxo() {
        let scenario = PayjoinScenario::new();
        let mut psbt: Psbt = scenario.signed_psbt();
        psbt.inputs[0].partial_sigs.clear();
        assert_eq!(
            create_original_psbt(&psbt).unwrap_err(),
            FinalizeError::MissingSignature { index: 0 }
        );

        psbt.inputs[0].witness_utxo = None;
        assert_eq!(
            create_original_psbt(&psbt).unwrap_err(),
            FinalizeError::MissingUtxo { index: 0 }
        );
    }
}
