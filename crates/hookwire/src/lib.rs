//! # Hookwire
//!
//! Client library for a remote dynamic-instrumentation server.
//!
//! A [`Client`] talks to the server over a message bus: it enumerates
//! processes, attaches to them as [`Session`]s, and injects [`Script`]s that
//! exchange JSON messages with the client and expose functions callable
//! through [`Exports`].
//!
//! ```no_run
//! use hookwire::{AttachOptions, ClientBuilder, ScriptOptions};
//!
//! # async fn run() -> hookwire::Result<()> {
//! let client = ClientBuilder::new("127.0.0.1").connect_tcp().await?;
//! let session = client.attach(1234, AttachOptions::new()).await?;
//! let script = session
//!     .create_script("send({hello: 1})", &ScriptOptions::new())
//!     .await?;
//! let _sub = script.on_message(|m| println!("{}", m.message));
//! script.load().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use hookwire_proto as proto;
pub use hookwire_transport as transport;

/// Error types for the Hookwire library
pub mod error;

/// Ordered notification fan-out
pub mod notify;

/// Call/reply correlation and signal routing
pub mod bus;

/// Host session facade
pub mod host;

/// Agent session facade
pub mod agent;

/// Client configuration and connection management
pub mod client;

/// Attached sessions
pub mod session;

/// Injected scripts
pub mod script;

#[cfg(test)]
mod testing;

pub use error::Error;
pub use notify::{Notifier, Subscription};
pub use bus::Bus;
pub use host::{AttachOptions, HostFacade, ProcessInfo, Realm, SessionId};
pub use agent::{AgentFacade, AgentMessage, AgentMessageKind, AgentSessionApi, ScriptId, ScriptOptions, ScriptRuntime};
pub use client::{Client, ClientBuilder, ClientConfig, Connection};
pub use session::{DetachEvent, DetachReason, Session, SessionStatus};
pub use script::{Exports, LogLevel, Script, ScriptMessage};

/// Result type alias for Hookwire operations
pub type Result<T> = std::result::Result<T, Error>;
