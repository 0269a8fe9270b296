//! Relay transport for payjoin.
//!
//! Senders and receivers exchange the original PSBT and the proposal as
//! encrypted direct messages (kind 4) on one or more relays, so the receiver
//! needs no publicly reachable HTTP endpoint.
//!
//! - [`RelayCommunicator`] plugs into the sender's
//!   [`CompositeCommunicator`](payjoin_lib::CompositeCommunicator) under the
//!   `nostr` scheme.
//! - [`RelayPayjoinReceiver`] runs the receiver side: it keeps a table of
//!   per-payment keys, subscribes to messages addressed to any of them and
//!   feeds each request through the payjoin-lib receiver pipeline.
//!
//! Relays are reached through the [`RelayClient`] trait. [`MemoryRelay`]
//! is an in-process relay for tests and embedding; `WebSocketRelayClient`
//! (behind the `websocket` feature) talks to real relays.

pub mod client;
pub mod communicator;
pub mod config;
pub mod endpoint;
pub mod event;
pub mod keys;
pub mod memory;
pub mod nip04;
pub mod nip19;
pub mod receiver;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use client::{EventStream, RelayClient, RelayConnector};
pub use communicator::{RelayCommunicator, RelayPayjoinRequest};
pub use config::RelayConfig;
pub use endpoint::RelayEndpoint;
pub use event::{Event, EventBuilder, Filter, KIND_ENCRYPTED_DM};
pub use keys::{ActiveKey, KeyTable, Keys};
pub use memory::MemoryRelay;
pub use receiver::{RelayPayjoinReceiver, RelayReceiverHandle};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnector, WebSocketRelayClient};

use payjoin_lib::PayjoinError;

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("relay connection error: {0}")]
    Connection(String),
    #[error("relay protocol error: {0}")]
    Protocol(String),
    #[error("invalid relay endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("encryption error: {0}")]
    Crypto(String),
    #[error("relay subscription closed")]
    Closed,
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Encoding(e.to_string())
    }
}

impl From<nip04::Nip04Error> for RelayError {
    fn from(e: nip04::Nip04Error) -> Self {
        RelayError::Crypto(e.to_string())
    }
}

impl From<nip19::Nip19Error> for RelayError {
    fn from(e: nip19::Nip19Error) -> Self {
        RelayError::InvalidEndpoint(e.to_string())
    }
}

impl From<RelayError> for PayjoinError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Connection(reason) => PayjoinError::ConnectionFailed {
                target: "relay".to_string(),
                reason,
            },
            RelayError::InvalidEndpoint(msg) => PayjoinError::Precondition(msg),
            RelayError::Encoding(msg) => PayjoinError::Serialization(msg),
            other => PayjoinError::Transport(other.to_string()),
        }
    }
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let err: PayjoinError = RelayError::Connection("refused".into()).into();
        assert!(err.is_retryable());

        let err: PayjoinError = RelayError::InvalidEndpoint("bad npub".into()).into();
        assert!(matches!(err, PayjoinError::Precondition(_)));

        let err: PayjoinError = RelayError::Closed.into();
        assert!(matches!(err, PayjoinError::Transport(_)));
    }
}
