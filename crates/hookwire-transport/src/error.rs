//! Transport error types

use thiserror::Error;
use std::io;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connect attempt timed out
    #[error("Operation timed out")]
    Timeout,

    /// The channel is closed
    #[error("Channel closed")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}
