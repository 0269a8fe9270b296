//! Error types for payjoin operations.
//!
//! Two families live here:
//!
//! - [`PayjoinError`]: everything a caller of this crate can observe, with a
//!   stable [`PayjoinErrorCode`] for FFI and a retry classification.
//! - [`ReceiverError`]: the `(errorCode, message)` pair a receiver puts on the
//!   wire, shared by the receiver pipeline and every communicator that decodes
//!   receiver replies.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sender::ValidationError;

/// Message used for any error code outside the well-known set.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error from the receiver";

/// Machine-readable receiver error code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The endpoint cannot produce a payjoin right now.
    Unavailable,
    /// The receiver added inputs but could not bump the fee.
    NotEnoughMoney,
    /// The requested protocol version is not supported.
    VersionUnsupported,
    /// The original PSBT failed validation.
    OriginalPsbtRejected,
    /// Any other code, kept verbatim (e.g. `invoice-not-fully-paid`, `unknown-error`).
    Other(String),
}

impl ErrorCode {
    /// Parse a wire code. Unknown codes are preserved in [`ErrorCode::Other`].
    pub fn parse(code: &str) -> Self {
        match code {
            "unavailable" => Self::Unavailable,
            "not-enough-money" => Self::NotEnoughMoney,
            "version-unsupported" => Self::VersionUnsupported,
            "original-psbt-rejected" => Self::OriginalPsbtRejected,
            other => Self::Other(other.to_string()),
        }
    }

    /// The wire form of this code.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unavailable => "unavailable",
            Self::NotEnoughMoney => "not-enough-money",
            Self::VersionUnsupported => "version-unsupported",
            Self::OriginalPsbtRejected => "original-psbt-rejected",
            Self::Other(code) => code,
        }
    }

    /// Whether the code is one of the four well-known BIP78 codes.
    pub fn is_well_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Human-readable message for the code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Unavailable => "The payjoin endpoint is not available for now.",
            Self::NotEnoughMoney => {
                "The receiver added some inputs but could not bump the fee of the payjoin proposal."
            }
            Self::VersionUnsupported => "This version of payjoin is not supported.",
            Self::OriginalPsbtRejected => "The receiver rejected the original PSBT.",
            Self::Other(_) => UNKNOWN_ERROR_MESSAGE,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire representation of a receiver error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable code.
    #[serde(rename = "errorCode")]
    pub error_code: String,
    /// Message accompanying the code.
    pub message: String,
}

/// A structured error produced by (or received from) a payjoin receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// The receiver's own free-text message.
    pub message: String,
}

impl ReceiverError {
    /// Create a receiver error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `unavailable` with a receiver message.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    /// `original-psbt-rejected` with a receiver message.
    pub fn original_psbt_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OriginalPsbtRejected, message)
    }

    /// `not-enough-money` with a receiver message.
    pub fn not_enough_money(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotEnoughMoney, message)
    }

    /// `version-unsupported` with the well-known message.
    pub fn version_unsupported() -> Self {
        let code = ErrorCode::VersionUnsupported;
        let message = code.message();
        Self::new(code, message)
    }

    /// Generic `unknown-error` used by outermost handlers.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Other("unknown-error".to_string()), message)
    }

    /// Well-known message for this error's code.
    pub fn well_known_message(&self) -> &'static str {
        self.code.message()
    }

    /// Serialize for the wire.
    ///
    /// The `message` field carries the well-known message for the code, not the
    /// receiver's internal message, so nothing beyond the code leaks.
    pub fn to_json(&self) -> String {
        let response = ErrorResponse {
            error_code: self.code.as_str().to_string(),
            message: self.well_known_message().to_string(),
        };
        serde_json::to_string(&response).unwrap_or_else(|_| {
            format!(
                r#"{{"errorCode":"{}","message":"{}"}}"#,
                self.code.as_str(),
                UNKNOWN_ERROR_MESSAGE
            )
        })
    }

    /// Parse a `{errorCode, message}` object. Returns `None` if the body is not one.
    pub fn from_json(body: &str) -> Option<Self> {
        let response: ErrorResponse = serde_json::from_str(body.trim()).ok()?;
        Some(Self::new(
            ErrorCode::parse(&response.error_code),
            response.message,
        ))
    }

    /// Whether the sender may reasonably retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, ErrorCode::Unavailable)
    }
}

impl fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}. (Receiver message: {})",
            self.code,
            self.well_known_message(),
            self.message
        )
    }
}

impl std::error::Error for ReceiverError {}

/// Error codes for FFI and mobile integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PayjoinErrorCode {
    /// Feature not compiled in
    Unimplemented = 1000,
    /// Transport/network layer error
    Transport = 2000,
    /// Connection failed
    ConnectionFailed = 2001,
    /// Connection timeout
    ConnectionTimeout = 2002,
    /// No communicator handles the endpoint
    UnsupportedEndpoint = 2003,
    /// Caller supplied unusable input
    Precondition = 5000,
    /// Receiver proposal violated an invariant
    Validation = 5001,
    /// Serialization error
    Serialization = 5002,
    /// Receiver returned a structured error
    Receiver = 6000,
    /// Operation cancelled by the caller
    Cancelled = 7000,
    /// Internal/unexpected error
    Internal = 9999,
}

/// Comprehensive error type for payjoin operations.
#[derive(Debug)]
pub enum PayjoinError {
    /// Feature not compiled in.
    Unimplemented(&'static str),

    /// Local precondition violated (bad URI, finalized PSBT, missing UTXO data).
    Precondition(String),

    /// The receiver's proposal broke a sender-side invariant.
    Validation(ValidationError),

    /// The receiver answered with a structured error.
    Receiver(ReceiverError),

    /// Transport/network layer error.
    Transport(String),

    /// Connection failed.
    ConnectionFailed {
        /// Target endpoint or service
        target: String,
        /// Underlying error message
        reason: String,
    },

    /// Connection timeout.
    ConnectionTimeout {
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// No registered communicator supports the endpoint.
    UnsupportedEndpoint(String),

    /// Serialization/deserialization error.
    Serialization(String),

    /// The caller cancelled the operation.
    Cancelled,

    /// Internal/unexpected error.
    Internal(String),
}

impl PayjoinError {
    /// Get the error code for FFI/mobile integration.
    pub fn code(&self) -> PayjoinErrorCode {
        match self {
            Self::Unimplemented(_) => PayjoinErrorCode::Unimplemented,
            Self::Precondition(_) => PayjoinErrorCode::Precondition,
            Self::Validation(_) => PayjoinErrorCode::Validation,
            Self::Receiver(_) => PayjoinErrorCode::Receiver,
            Self::Transport(_) => PayjoinErrorCode::Transport,
            Self::ConnectionFailed { .. } => PayjoinErrorCode::ConnectionFailed,
            Self::ConnectionTimeout { .. } => PayjoinErrorCode::ConnectionTimeout,
            Self::UnsupportedEndpoint(_) => PayjoinErrorCode::UnsupportedEndpoint,
            Self::Serialization(_) => PayjoinErrorCode::Serialization,
            Self::Cancelled => PayjoinErrorCode::Cancelled,
            Self::Internal(_) => PayjoinErrorCode::Internal,
        }
    }

    /// Get the error message as an owned String (useful for FFI).
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Returns true if this error is potentially recoverable by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::ConnectionFailed { .. } | Self::ConnectionTimeout { .. } => {
                true
            }
            Self::Receiver(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// The receiver error, if the receiver answered with one.
    pub fn receiver_error(&self) -> Option<&ReceiverError> {
        match self {
            Self::Receiver(err) => Some(err),
            _ => None,
        }
    }

    /// Create a transport error from any error type.
    pub fn transport<E: std::error::Error>(err: E) -> Self {
        Self::Transport(err.to_string())
    }

    /// Create a precondition error.
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition(reason.into())
    }
}

impl fmt::Display for PayjoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unimplemented(label) => write!(f, "{} is not implemented", label),
            Self::Precondition(msg) => write!(f, "invalid payjoin request: {}", msg),
            Self::Validation(err) => write!(f, "payjoin proposal rejected: {}", err),
            Self::Receiver(err) => write!(f, "{}", err),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::ConnectionFailed { target, reason } => {
                write!(f, "connection to {} failed: {}", target, reason)
            }
            Self::ConnectionTimeout {
                operation,
                timeout_ms,
            } => {
                write!(f, "{} timed out after {}ms", operation, timeout_ms)
            }
            Self::UnsupportedEndpoint(endpoint) => write!(
                f,
                "A payjoin endpoint was provided but no communicator was found that supports it ({})",
                endpoint
            ),
            Self::Serialization(msg) => write!(f, "serialization error: {}", msg),
            Self::Cancelled => write!(f, "payjoin request cancelled"),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for PayjoinError {}

impl From<ValidationError> for PayjoinError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<ReceiverError> for PayjoinError {
    fn from(err: ReceiverError) -> Self {
        Self::Receiver(err)
    }
}

impl From<serde_json::Error> for PayjoinError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
