//! Error types for the IKEv1 protocol engine
//!
//! This is the parse/validation-level error type. State transition
//! handlers do not use it; they return a [`HandlerResult`] and the
//! dispatcher owns all failure side effects.
//!
//! [`HandlerResult`]: crate::ikev1::dispatch::HandlerResult

use std::fmt;

/// Result type for IKEv1 operations
pub type Result<T> = std::result::Result<T, Error>;

/// IKEv1 protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid ISAKMP message format
    InvalidMessage(String),

    /// Invalid ISAKMP payload
    InvalidPayload(String),

    /// Unsupported protocol version
    UnsupportedVersion(u8),

    /// No acceptable proposal found
    NoProposalChosen,

    /// Authentication failed
    AuthenticationFailed(String),

    /// Security Association not found
    SaNotFound(String),

    /// Cryptographic operation failed
    CryptoError(String),

    /// Invalid length field
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Message too large
    MessageTooLarge(u32),

    /// State machine error
    InvalidState(String),

    /// Invalid configuration parameter
    InvalidParameter(String),

    /// I/O error
    Io(String),

    /// Internal error (should not happen)
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidMessage(msg) => write!(f, "Invalid ISAKMP message: {}", msg),
            Error::InvalidPayload(msg) => write!(f, "Invalid ISAKMP payload: {}", msg),
            Error::UnsupportedVersion(v) => {
                write!(f, "Unsupported ISAKMP version: 0x{:02x}", v)
            }
            Error::NoProposalChosen => {
                write!(f, "No acceptable proposal found in negotiation")
            }
            Error::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            Error::SaNotFound(id) => write!(f, "Security Association not found: {}", id),
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::InvalidLength { expected, actual } => {
                write!(f, "Invalid length: expected {}, got {}", expected, actual)
            }
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::MessageTooLarge(size) => {
                write!(f, "ISAKMP message too large: {} bytes", size)
            }
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
