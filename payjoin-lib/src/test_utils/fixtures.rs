//! PSBT fixtures for payjoin scenarios.
//!
//! Scripts are built from raw template bytes so tests can tell outputs apart
//! by a single tag byte. Signatures are real ECDSA signatures over a fixed
//! digest; nothing in the payjoin checks verifies them against a sighash.

use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::psbt::{Input, Psbt};
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, ecdsa, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use crate::psbt::{fee_for_vsize, PsbtExt, ScriptType};
use crate::receiver::{ContributedInput, ReceiverProposal};
use crate::sender::WalletDescriptor;

/// Master fingerprint of the fixture sender wallet.
pub const SENDER_FINGERPRINT: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// Native segwit script with a 20-byte program of `tag`.
pub fn p2wpkh_script(tag: u8) -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend([tag; 20]);
    ScriptBuf::from_bytes(bytes)
}

/// Legacy P2PKH script with a hash of `tag`.
pub fn p2pkh_script(tag: u8) -> ScriptBuf {
    let mut bytes = vec![0x76, 0xa9, 0x14];
    bytes.extend([tag; 20]);
    bytes.extend([0x88, 0xac]);
    ScriptBuf::from_bytes(bytes)
}

/// P2SH script with a hash of `tag`.
pub fn p2sh_script(tag: u8) -> ScriptBuf {
    let mut bytes = vec![0xa9, 0x14];
    bytes.extend([tag; 20]);
    bytes.push(0x87);
    ScriptBuf::from_bytes(bytes)
}

/// Taproot script with an output key of `tag`.
pub fn p2tr_script(tag: u8) -> ScriptBuf {
    let mut bytes = vec![0x51, 0x20];
    bytes.extend([tag; 32]);
    ScriptBuf::from_bytes(bytes)
}

/// Witness shaped like a P2WPKH spend.
pub fn dummy_p2wpkh_witness() -> Witness {
    Witness::from_slice(&[vec![0x30; 72], vec![0x02; 33]])
}

fn funding_tx(value: Amount, script: ScriptBuf) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey: script,
        }],
    }
}

/// A one-input, two-output payment (payment + change) and a receiver
/// contribution of one P2WPKH input.
#[derive(Clone)]
pub struct PayjoinScenario {
    secp: Secp256k1<All>,
    sender_key: SecretKey,
    change_key: SecretKey,
    /// Value of the sender's funding UTXO.
    pub funding_value: Amount,
    /// Value paid to the receiver.
    pub payment_value: Amount,
    /// Fee of the original transaction.
    pub fee: Amount,
    /// Value of the UTXO the receiver contributes.
    pub receiver_input_value: Amount,
    /// Sequence used by every input.
    pub sequence: Sequence,
}

impl Default for PayjoinScenario {
    fn default() -> Self {
        Self::new()
    }
}

impl PayjoinScenario {
    /// Output index of the payment in the original transaction.
    pub const PAYMENT_INDEX: usize = 0;
    /// Output index of the sender's change in the original transaction.
    pub const CHANGE_INDEX: usize = 1;

    /// Standard scenario: 100k sat funding, 60k sat payment, ~10 sat/vB fee.
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            sender_key: SecretKey::from_slice(&[0x01; 32]).expect("valid key"),
            change_key: SecretKey::from_slice(&[0x02; 32]).expect("valid key"),
            funding_value: Amount::from_sat(100_000),
            payment_value: Amount::from_sat(60_000),
            fee: Amount::from_sat(1_410),
            receiver_input_value: Amount::from_sat(50_000),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        }
    }

    /// Sender's funding script.
    pub fn sender_script(&self) -> ScriptBuf {
        p2wpkh_script(0xaa)
    }

    /// Receiver's payment script.
    pub fn payment_script(&self) -> ScriptBuf {
        p2wpkh_script(0xbb)
    }

    /// Sender's change script.
    pub fn change_script(&self) -> ScriptBuf {
        p2wpkh_script(0xcc)
    }

    /// Script of the UTXO the receiver contributes.
    pub fn receiver_script(&self) -> ScriptBuf {
        p2wpkh_script(0xdd)
    }

    /// Transaction creating the sender's UTXO.
    pub fn sender_funding_tx(&self) -> Transaction {
        funding_tx(self.funding_value, self.sender_script())
    }

    /// Transaction creating the receiver's UTXO.
    pub fn receiver_funding_tx(&self) -> Transaction {
        funding_tx(self.receiver_input_value, self.receiver_script())
    }

    /// Outpoint spent by the sender.
    pub fn sender_outpoint(&self) -> OutPoint {
        OutPoint::new(self.sender_funding_tx().compute_txid(), 0)
    }

    /// Outpoint contributed by the receiver.
    pub fn receiver_outpoint(&self) -> OutPoint {
        OutPoint::new(self.receiver_funding_tx().compute_txid(), 0)
    }

    /// Value of the change output in the original transaction.
    pub fn change_value(&self) -> Amount {
        self.funding_value - self.payment_value - self.fee
    }

    /// Fee of the original transaction.
    pub fn original_fee(&self) -> Amount {
        self.fee
    }

    /// Sender wallet descriptor matching the fixture key origins.
    pub fn wallet(&self) -> WalletDescriptor {
        WalletDescriptor::new(ScriptType::P2wpkh, Fingerprint::from(SENDER_FINGERPRINT))
    }

    /// BIP21 URI paying the receiver, with `pj` set to `endpoint`.
    pub fn bip21(&self, endpoint: &str) -> String {
        let address = bitcoin::Address::from_script(&self.payment_script(), bitcoin::Network::Regtest)
            .expect("standard script");
        format!(
            "bitcoin:{}?amount={}&pj={}",
            address,
            self.payment_value.to_btc(),
            endpoint
        )
    }

    fn sender_public_key(&self) -> PublicKey {
        self.sender_key.public_key(&self.secp)
    }

    fn signature(&self) -> ecdsa::Signature {
        let msg = Message::from_digest([0x07; 32]);
        ecdsa::Signature::sighash_all(self.secp.sign_ecdsa(&msg, &self.sender_key))
    }

    /// The payment transaction without signatures.
    pub fn unsigned_tx(&self) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: self.sender_outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: self.sequence,
                witness: Witness::new(),
            }],
            output: vec![
                TxOut {
                    value: self.payment_value,
                    script_pubkey: self.payment_script(),
                },
                TxOut {
                    value: self.change_value(),
                    script_pubkey: self.change_script(),
                },
            ],
        }
    }

    /// The sender's signed, not finalized PSBT with wallet metadata.
    pub fn signed_psbt(&self) -> Psbt {
        let mut psbt = Psbt::from_unsigned_tx(self.unsigned_tx()).expect("unsigned tx");
        let fingerprint = Fingerprint::from(SENDER_FINGERPRINT);

        let input = &mut psbt.inputs[0];
        input.witness_utxo = Some(self.sender_funding_tx().output[0].clone());
        input.partial_sigs.insert(
            bitcoin::PublicKey::new(self.sender_public_key()),
            self.signature(),
        );
        input.bip32_derivation = BTreeMap::from([(
            self.sender_public_key(),
            (
                fingerprint,
                DerivationPath::from_str("m/84'/1'/0'/0/0").expect("path"),
            ),
        )]);

        psbt.outputs[Self::CHANGE_INDEX].bip32_derivation = BTreeMap::from([(
            self.change_key.public_key(&self.secp),
            (
                fingerprint,
                DerivationPath::from_str("m/84'/1'/0'/1/0").expect("path"),
            ),
        )]);
        psbt
    }

    /// The stripped, finalized PSBT the sender transmits.
    pub fn original_psbt(&self) -> Psbt {
        let mut psbt = Psbt::from_unsigned_tx(self.unsigned_tx()).expect("unsigned tx");
        let input = &mut psbt.inputs[0];
        input.witness_utxo = Some(self.sender_funding_tx().output[0].clone());
        input.final_script_witness = Some(Witness::from_slice(&[
            self.signature().to_vec(),
            bitcoin::PublicKey::new(self.sender_public_key()).to_bytes(),
        ]));
        psbt
    }

    /// The receiver's finalized contribution.
    pub fn receiver_input(&self) -> (TxIn, Input) {
        let txin = TxIn {
            previous_output: self.receiver_outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: self.sequence,
            witness: Witness::new(),
        };
        let input = Input {
            witness_utxo: Some(self.receiver_funding_tx().output[0].clone()),
            final_script_witness: Some(dummy_p2wpkh_witness()),
            ..Default::default()
        };
        (txin, input)
    }

    /// Fee of one added P2WPKH input at the original fee rate.
    pub fn one_input_fee(&self) -> Amount {
        let rate = self
            .original_psbt()
            .estimated_fee_rate()
            .expect("fixture has utxo data");
        fee_for_vsize(rate, ScriptType::P2wpkh.input_vsize())
    }

    /// A receiver proposal built from the fixture original PSBT.
    ///
    /// The receiver adds one input, moves its value into the payment output,
    /// and takes `change_decrease` from the change output as extra fee.
    pub fn proposal(&self, change_decrease: Amount) -> Psbt {
        self.receiver_proposal_for(
            &self.original_psbt(),
            Some(Self::CHANGE_INDEX),
            change_decrease,
        )
        .payjoin_psbt
    }

    /// Build a receiver proposal for any original PSBT paying the fixture receiver.
    pub fn receiver_proposal_for(
        &self,
        original: &Psbt,
        fee_output: Option<usize>,
        change_decrease: Amount,
    ) -> ReceiverProposal {
        let mut psbt = original.clone();
        for input in psbt.inputs.iter_mut() {
            input.final_script_sig = None;
            input.final_script_witness = None;
            input.witness_utxo = None;
            input.non_witness_utxo = None;
        }

        let (txin, input) = self.receiver_input();
        psbt.unsigned_tx.input.push(txin);
        psbt.inputs.push(input);

        let payment_script = self.payment_script();
        let mut modified_payment = None;
        if let Some(out) = psbt
            .unsigned_tx
            .output
            .iter_mut()
            .find(|o| o.script_pubkey == payment_script)
        {
            out.value += self.receiver_input_value;
            modified_payment = Some(out.clone());
        }

        let mut absorbed = Amount::ZERO;
        if let Some(index) = fee_output {
            if let Some(out) = psbt.unsigned_tx.output.get_mut(index) {
                out.value -= change_decrease;
                absorbed = change_decrease;
            }
        }

        let mut proposal = ReceiverProposal::new(psbt);
        proposal.contributed_inputs = vec![ContributedInput {
            outpoint: self.receiver_outpoint(),
            txout: self.receiver_funding_tx().output[0].clone(),
        }];
        proposal.modified_payment_output = modified_payment;
        proposal.extra_fee_from_additional_fee_output = absorbed;
        proposal
    }
}
