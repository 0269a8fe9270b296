use thiserror::Error;

/// A receiver proposal that breaks one of the sender's invariants.
///
/// Every variant is fatal to the current negotiation. The sender should fall
/// back to broadcasting its original transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("GlobalXPubs should not be included in the receiver's PSBT")]
    GlobalXpubs,

    #[error("The proposal PSBT is not sane ({0})")]
    NotSane(String),

    #[error("The proposal PSBT changed the transaction version")]
    VersionChanged,

    #[error("The proposal PSBT changed the nLocktime")]
    LockTimeChanged,

    #[error("The receiver added keypaths to an input")]
    InputKeyPaths,

    #[error("The receiver added partial signatures to an input")]
    InputPartialSigs,

    #[error("The proposedTxIn modified the sequence of one of our inputs")]
    SequenceModified,

    #[error("The receiver finalized one of our inputs")]
    OwnInputFinalized,

    #[error("The receiver added non_witness_utxo or witness_utxo to one of our inputs")]
    OwnInputUtxoAdded,

    #[error("The receiver did not finalized one of their input")]
    ForeignInputNotFinalized,

    #[error("The receiver did not specify non_witness_utxo or witness_utxo for one of their inputs")]
    ForeignInputMissingUtxo,

    #[error("Mixed input type detected in the proposal")]
    MixedInputType,

    #[error("Some of our inputs are not included in the proposal")]
    MissingInputs,

    #[error("Mixed sequence detected in the proposal")]
    MixedSequence,

    #[error("The payjoin receiver did not included UTXO information to calculate fee correctly")]
    MissingFeeData,

    #[error("The receiver decreased absolute fee")]
    FeeDecreased,

    #[error("The receiver added keypaths to an output")]
    OutputKeyPaths,

    #[error("The actual contribution is more than maxadditionalfeecontribution")]
    ContributionExceedsMax,

    #[error("The actual contribution is not only paying fee")]
    ContributionNotOnlyFee,

    #[error("The actual contribution is not only paying for additional inputs")]
    ContributionExceedsAddedInputs,

    #[error("The receiver decreased the value of one of the outputs")]
    OutputDecreased,

    #[error("Some of our outputs are not included in the proposal")]
    MissingOutputs,

    #[error("The payjoin receiver created a payjoin with a too low fee rate")]
    FeeRateTooLow,
}
