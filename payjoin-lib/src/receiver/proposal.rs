use bitcoin::psbt::Psbt;
use bitcoin::{Amount, OutPoint, TxOut, Txid};

/// A UTXO the receiver adds to the payjoin transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContributedInput {
    /// Outpoint being spent.
    pub outpoint: OutPoint,
    /// The output being spent.
    pub txout: TxOut,
}

/// The receiver's modifications to an original PSBT.
///
/// Produced by [`PayjoinReceiverWallet::compute_payjoin_modifications`]
/// and stored once on the [`ProposalContext`].
///
/// [`PayjoinReceiverWallet::compute_payjoin_modifications`]: super::PayjoinReceiverWallet::compute_payjoin_modifications
/// [`ProposalContext`]: super::ProposalContext
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiverProposal {
    /// The proposal sent back to the sender.
    pub payjoin_psbt: Psbt,
    /// Inputs added by the receiver.
    pub contributed_inputs: Vec<ContributedInput>,
    /// Outputs added by the receiver.
    pub contributed_outputs: Vec<TxOut>,
    /// The payment output after modification, if it changed.
    pub modified_payment_output: Option<TxOut>,
    /// Fee taken from the sender's additional-fee output.
    pub extra_fee_from_additional_fee_output: Amount,
    /// Fee paid by the receiver's contributed inputs.
    pub extra_fee_from_receiver_inputs: Amount,
    /// Txid of the payjoin transaction.
    pub payjoin_txid: Txid,
}

impl ReceiverProposal {
    /// A proposal with no recorded contributions.
    pub fn new(payjoin_psbt: Psbt) -> Self {
        let payjoin_txid = payjoin_psbt.unsigned_tx.compute_txid();
        Self {
            payjoin_psbt,
            contributed_inputs: Vec::new(),
            contributed_outputs: Vec::new(),
            modified_payment_output: None,
            extra_fee_from_additional_fee_output: Amount::ZERO,
            extra_fee_from_receiver_inputs: Amount::ZERO,
            payjoin_txid,
        }
    }

    /// Total value of the contributed inputs.
    pub fn contributed_value(&self) -> Amount {
        self.contributed_inputs
            .iter()
            .try_fold(Amount::ZERO, |total, input| total.checked_add(input.txout.value))
            .unwrap_or(Amount::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::PayjoinScenario;

    #[test]
    fn test_fixture_proposal_accounting() {
        let scenario = PayjoinScenario::new();
        let proposal = scenario.receiver_proposal_for(
            &scenario.original_psbt(),
            Some(PayjoinScenario::CHANGE_INDEX),
            Amount::from_sat(500),
        );

        assert_eq!(proposal.contributed_value(), scenario.receiver_input_value);
        assert_eq!(
            proposal.extra_fee_from_additional_fee_output,
            Amount::from_sat(500)
        );
        assert_eq!(
            proposal.payjoin_txid,
            proposal.payjoin_psbt.unsigned_tx.compute_txid()
        );
        assert_eq!(
            proposal.modified_payment_output.unwrap().value,
            scenario.payment_value + scenario.receiver_input_value
        );
    }
}
