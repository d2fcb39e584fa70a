//! Error types for the Hookwire library

use thiserror::Error;
use std::time::Duration;

/// Main error type for Hookwire operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The transport failed to open, or was lost
    #[error("Transport error: {0}")]
    Transport(String),

    /// A message could not be encoded, decoded or interpreted
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote side answered a call with an error
    #[error("Remote error {name}: {message}")]
    Remote {
        /// Error name reported by the remote
        name: String,
        /// Error message reported by the remote
        message: String,
    },

    /// No reply arrived within the call deadline
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// The operation is not valid in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Authentication with the server failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A script export call was rejected by the script
    #[error("{name}: {message}")]
    Rpc {
        /// Error message thrown by the script
        message: String,
        /// Error name, e.g. `TypeError`
        name: String,
        /// Stack trace, if the script provided one
        stack: Option<String>,
    },
}

impl From<hookwire_proto::ProtocolError> for Error {
    fn from(err: hookwire_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<hookwire_transport::TransportError> for Error {
    fn from(err: hookwire_transport::TransportError) -> Self {
        use hookwire_transport::TransportError;

        match err {
            TransportError::Connection(msg) => Self::Transport(msg),
            TransportError::Io(e) => Self::Transport(format!("I/O error: {}", e)),
            TransportError::Timeout => Self::Transport("Connection timed out".to_string()),
            TransportError::Closed => Self::Transport("Connection closed".to_string()),
            TransportError::Configuration(msg) => Self::InvalidOperation(msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}
