//! # Hookwire Protocol
//!
//! Bus message model, dynamic values, type signatures and the codec used by
//! the Hookwire client.

#![warn(missing_docs)]

/// Message types
pub mod message;

/// Dynamic values and variants
pub mod value;

/// Type signature parsing and checking
pub mod signature;

/// Message codec
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use message::{ErrorReply, Message, MethodCall, MethodReturn, Signal, SignalKey};
pub use value::{Value, Variant, VariantDict};
pub use signature::{Signature, Type};
pub use codec::Codec;
#[cfg(feature = "rmp-serde")]
pub use codec::MsgPackCodec;
pub use error::ProtocolError;
