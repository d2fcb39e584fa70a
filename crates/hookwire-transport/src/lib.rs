//! # Hookwire Transport
//!
//! Bidirectional byte-frame channels used to reach an instrumentation server.

#![warn(missing_docs)]

/// Transport abstraction and implementations
pub mod transport;

/// Open channel handles and events
pub mod channel;

/// In-process transport
pub mod memory;

/// Transport error types
pub mod error;

pub use transport::{Transport, TcpConfig};
#[cfg(feature = "tcp")]
pub use transport::TcpTransport;
pub use channel::{Channel, ChannelSender, TransportEvent};
pub use memory::{MemoryTransport, MemoryListener, MemoryPeer};
pub use error::TransportError;
