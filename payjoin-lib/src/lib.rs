//! Payjoin (BIP78) library.
//!
//! Implements both halves of the payjoin negotiation:
//!
//! - **Sender**: strips a signed PSBT into the "original PSBT", sends it to the
//!   receiver through a [`PayjoinServerCommunicator`], and verifies the returned
//!   proposal before handing it back for re-signing.
//! - **Receiver**: gates an inbound original PSBT through an ordered validation
//!   pipeline, delegating wallet decisions to an injected
//!   [`PayjoinReceiverWallet`], and schedules a fallback broadcast of the
//!   original transaction.
//!
//! Transports plug in behind the communicator trait. HTTP lives here (behind
//! the `http-client` feature); the relay transport lives in `payjoin-relay`.
//!
//! # Example
//!
//! ```ignore
//! use payjoin_lib::{PayjoinClient, PayjoinUri, SenderConfig};
//! use payjoin_lib::communicator::CompositeCommunicator;
//!
//! let uri: PayjoinUri = "bitcoin:bc1q...?amount=0.001&pj=https://example.com/pj".parse()?;
//! let client = PayjoinClient::new(Arc::new(CompositeCommunicator::with_http()?), SenderConfig::default());
//! let proposal = client.request_payjoin(&uri, &wallet, &signed_psbt, &cancel).await?;
//! // sign `proposal` with the wallet and broadcast it
//! ```

pub mod broadcast;
pub mod communicator;
pub mod config;
pub mod errors;
pub mod params;
pub mod psbt;
pub mod receiver;
pub mod sender;
pub mod uri;

/// Test utilities for payjoin testing.
///
/// This module is only available with the `test-utils` feature or in test builds.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use broadcast::{Broadcaster, FallbackOutcome, FallbackScheduler};
pub use communicator::{CompositeCommunicator, PayjoinServerCommunicator};
pub use config::{ReceiverConfig, SenderConfig};
pub use errors::{ErrorCode, PayjoinError, PayjoinErrorCode, ReceiverError};
pub use params::ClientParameters;
pub use psbt::{PsbtExt, ScriptType};
pub use receiver::{
    ContributedInput, PaymentRequest, PaymentRequestBook, PayjoinReceiver, PayjoinReceiverWallet,
    ProposalContext, ReceiverProposal, SeenInputs, SeenSet,
};
pub use sender::{PayjoinClient, PayjoinWallet, RequestContext, ValidationError, WalletDescriptor};
pub use uri::PayjoinUri;

/// Common result alias for payjoin operations.
pub type Result<T> = std::result::Result<T, PayjoinError>;

/// Current unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
