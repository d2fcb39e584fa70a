//! Message types for the bus protocol

use crate::{ProtocolError, Signature, Value};
use serde::{Deserialize, Serialize};

/// Top-level message wrapper covering the four logical message kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Method call
    MethodCall(MethodCall),
    /// Successful method return
    MethodReturn(MethodReturn),
    /// Error reply
    Error(ErrorReply),
    /// Broadcast signal
    Signal(Signal),
}

impl Message {
    /// Serial of this message
    pub fn serial(&self) -> u32 {
        match self {
            Self::MethodCall(m) => m.serial,
            Self::MethodReturn(m) => m.serial,
            Self::Error(m) => m.serial,
            Self::Signal(m) => m.serial,
        }
    }

    /// Serial of the call this message replies to, if it is a reply
    pub fn reply_serial(&self) -> Option<u32> {
        match self {
            Self::MethodReturn(m) => Some(m.reply_serial),
            Self::Error(m) => Some(m.reply_serial),
            _ => None,
        }
    }
}

/// Method call message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Serial for reply correlation, assigned by the sender
    pub serial: u32,
    /// Destination peer, if any
    pub destination: Option<String>,
    /// Object path
    pub path: String,
    /// Interface name
    pub interface: String,
    /// Member name
    pub member: String,
    /// Body signature
    pub signature: String,
    /// Positional arguments
    pub body: Vec<Value>,
}

impl MethodCall {
    /// Create a method call with an empty body
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            serial: 0,
            destination: None,
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            signature: String::new(),
            body: Vec::new(),
        }
    }

    /// Set the destination
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the body and its signature
    pub fn with_args(mut self, signature: impl Into<String>, body: Vec<Value>) -> Self {
        self.signature = signature.into();
        self.body = body;
        self
    }

    /// Check the body against the declared signature
    pub fn check_body(&self) -> Result<(), ProtocolError> {
        Signature::parse(&self.signature)?.check(&self.body)
    }
}

/// Method return message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodReturn {
    /// Serial of this message
    pub serial: u32,
    /// Serial of the call being answered
    pub reply_serial: u32,
    /// Positional results
    pub body: Vec<Value>,
}

/// Error reply message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Serial of this message
    pub serial: u32,
    /// Serial of the call being answered
    pub reply_serial: u32,
    /// Error name, e.g. `org.freedesktop.DBus.Error.Failed`
    pub name: String,
    /// Human-readable error message
    pub message: String,
}

/// Signal message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Serial of this message
    pub serial: u32,
    /// Emitting object path
    pub path: String,
    /// Interface name
    pub interface: String,
    /// Member name
    pub member: String,
    /// Body signature
    pub signature: String,
    /// Signal arguments
    pub body: Vec<Value>,
}

impl Signal {
    /// Create a signal with an empty body
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            serial: 0,
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            signature: String::new(),
            body: Vec::new(),
        }
    }

    /// Set the body and its signature
    pub fn with_args(mut self, signature: impl Into<String>, body: Vec<Value>) -> Self {
        self.signature = signature.into();
        self.body = body;
        self
    }

    /// Dispatch key of this signal
    pub fn key(&self) -> SignalKey {
        SignalKey::new(&self.path, &self.interface, &self.member)
    }
}

/// Dispatch key for signal handlers: (object path, interface, member)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalKey {
    /// Object path
    pub path: String,
    /// Interface name
    pub interface: String,
    /// Member name
    pub member: String,
}

impl SignalKey {
    /// Create a signal key
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
        }
    }
}
