//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid frame format
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual unit size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// A type signature could not be parsed
    #[error("Invalid signature {signature:?}: {reason}")]
    InvalidSignature {
        /// The offending signature text
        signature: String,
        /// What went wrong
        reason: String,
    },

    /// A value does not conform to the declared signature
    #[error("Value does not match signature {expected:?}")]
    SignatureMismatch {
        /// The signature the value was checked against
        expected: String,
    },

    /// A message body had an unexpected shape
    #[error("Malformed message body: {0}")]
    MalformedBody(String),
}
