//! Sender side of the payjoin protocol.
//!
//! The flow is split in two phases so transports stay pluggable:
//!
//! 1. [`SenderBuilder::build`] strips the signed PSBT into the original PSBT
//!    and derives the [`ClientParameters`](crate::ClientParameters).
//! 2. [`RequestContext::process_proposal`] verifies the receiver's answer and
//!    returns a PSBT the wallet can sign.
//!
//! [`PayjoinClient`] ties both phases to a communicator.

mod client;
mod error;
mod original;
mod proposal;

pub use client::PayjoinClient;
pub use error::ValidationError;
pub use original::{create_original_psbt, FinalizeError};
pub use proposal::{RequestContext, SenderBuilder};

use bitcoin::bip32::Fingerprint;
use bitcoin::psbt::Output;

use crate::psbt::ScriptType;

/// What the sender verifier needs to know about the paying wallet.
pub trait PayjoinWallet: Send + Sync {
    /// Script type of the wallet's inputs.
    fn script_type(&self) -> ScriptType;

    /// Master key fingerprint of the wallet.
    fn master_fingerprint(&self) -> Fingerprint;

    /// Whether a PSBT output belongs to this wallet.
    ///
    /// The default looks for BIP32 or taproot key origins under the wallet's
    /// master fingerprint.
    fn is_own_output(&self, output: &Output) -> bool {
        let fingerprint = self.master_fingerprint();
        output
            .bip32_derivation
            .values()
            .any(|(fp, _)| *fp == fingerprint)
            || output
                .tap_key_origins
                .values()
                .any(|(_, (fp, _))| *fp == fingerprint)
    }
}

/// A plain [`PayjoinWallet`] built from a script type and fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalletDescriptor {
    /// Script type of the wallet's inputs.
    pub script_type: ScriptType,
    /// Master key fingerprint.
    pub fingerprint: Fingerprint,
}

impl WalletDescriptor {
    /// Create a descriptor.
    pub fn new(script_type: ScriptType, fingerprint: Fingerprint) -> Self {
        Self {
            script_type,
            fingerprint,
        }
    }
}

impl PayjoinWallet for WalletDescriptor {
    fn script_type(&self) -> ScriptType {
        self.script_type
    }

    fn master_fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::PayjoinScenario;

    #[test]
    fn test_change_detection_by_fingerprint() {
        let scenario = PayjoinScenario::new();
        let signed = scenario.signed_psbt();
        let wallet = scenario.wallet();

        assert!(!wallet.is_own_output(&signed.outputs[PayjoinScenario::PAYMENT_INDEX]));
        assert!(wallet.is_own_output(&signed.outputs[PayjoinScenario::CHANGE_INDEX]));

        let stranger = WalletDescriptor::new(ScriptType::P2wpkh, Fingerprint::from([1, 2, 3, 4]));
        assert!(!stranger.is_own_output(&signed.outputs[PayjoinScenario::CHANGE_INDEX]));
    }
}
