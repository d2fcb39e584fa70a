//! Typed calls against the server's host session object

use crate::bus::{single_result, Bus};
use crate::{Error, Result};
use hookwire_proto::{MethodCall, Value, VariantDict};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Object path of the host session
pub const HOST_SESSION_PATH: &str = "/io/hookwire/HostSession";

/// Interface of the host session
pub const HOST_SESSION_INTERFACE: &str = "io.hookwire.HostSession";

/// Object path of the authentication service
pub const AUTH_SERVICE_PATH: &str = "/io/hookwire/AuthenticationService";

/// Interface of the authentication service
pub const AUTH_SERVICE_INTERFACE: &str = "io.hookwire.AuthenticationService";

/// Signal emitted by the host when an agent session goes away
pub const AGENT_SESSION_DETACHED: &str = "AgentSessionDetached";

/// Identifier of an agent session, assigned by the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a raw identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode as the `(s)` wire struct
    pub fn to_value(&self) -> Value {
        Value::Struct(vec![Value::Str(self.0.clone())])
    }

    /// Decode from the `(s)` wire struct
    pub fn from_value(value: &Value) -> Result<Self> {
        value
            .as_struct()
            .and_then(|fields| fields.first())
            .and_then(Value::as_str)
            .map(Self::new)
            .ok_or_else(|| Error::Protocol(format!("Expected (s) session id, got {:?}", value)))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A process running on the target system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: u32,
    /// Process name
    pub name: String,
    /// Extra properties reported by the server
    pub parameters: serde_json::Value,
}

impl ProcessInfo {
    fn from_value(value: &Value) -> Result<Self> {
        let invalid = || Error::Protocol(format!("Expected (usa{{sv}}) process entry, got {:?}", value));

        match value.as_struct() {
            Some([pid, name, parameters]) => Ok(Self {
                pid: pid.as_u32().ok_or_else(invalid)?,
                name: name.as_str().ok_or_else(invalid)?.to_string(),
                parameters: VariantDict::from_value(parameters)?.to_json(),
            }),
            _ => Err(invalid()),
        }
    }
}

/// Which runtime realm to attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Realm {
    /// The process's own code
    #[default]
    Native,
    /// Code running under an emulator inside the process
    Emulated,
}

impl Realm {
    fn as_str(self) -> &'static str {
        match self {
            Realm::Native => "native",
            Realm::Emulated => "emulated",
        }
    }
}

/// Options for attaching to a process
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Realm to attach to
    pub realm: Realm,
    /// Seconds the server keeps the session alive after the connection drops;
    /// zero disables persistence
    pub persist_timeout: u32,
}

impl AttachOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the realm
    pub fn with_realm(mut self, realm: Realm) -> Self {
        self.realm = realm;
        self
    }

    /// Set the persist timeout in seconds
    pub fn with_persist_timeout(mut self, seconds: u32) -> Self {
        self.persist_timeout = seconds;
        self
    }

    /// Encode as an `a{sv}` option map
    pub fn to_dict(&self) -> VariantDict {
        let mut dict = VariantDict::new();
        if self.realm != Realm::Native {
            dict.insert("realm", self.realm.as_str());
        }
        if self.persist_timeout != 0 {
            dict.insert("persist-timeout", self.persist_timeout);
        }
        dict
    }
}

/// Typed proxy for the host session object
#[derive(Debug, Clone)]
pub struct HostFacade {
    bus: Bus,
}

impl HostFacade {
    /// Create a facade over `bus`
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }

    fn method(&self, member: &str) -> MethodCall {
        MethodCall::new(HOST_SESSION_PATH, HOST_SESSION_INTERFACE, member)
    }

    /// List the processes running on the target
    pub async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
        let call = self
            .method("EnumerateProcesses")
            .with_args("a{sv}", vec![VariantDict::new().into_value()]);
        let result = single_result(self.bus.call(call).await?, "EnumerateProcesses")?;

        let entries = result
            .as_array()
            .ok_or_else(|| Error::Protocol("EnumerateProcesses did not return an array".to_string()))?;
        let processes = entries
            .iter()
            .map(ProcessInfo::from_value)
            .collect::<Result<Vec<_>>>()?;

        debug!("Enumerated {} processes", processes.len());
        Ok(processes)
    }

    /// Attach to `pid`, returning the new session id
    pub async fn attach(&self, pid: u32, options: &AttachOptions) -> Result<SessionId> {
        let call = self
            .method("Attach")
            .with_args("ua{sv}", vec![Value::U32(pid), options.to_dict().into_value()]);
        let result = single_result(self.bus.call(call).await?, "Attach")?;
        SessionId::from_value(&result)
    }

    /// Re-establish a persisted session after reconnecting
    pub async fn reattach(&self, id: &SessionId) -> Result<()> {
        let call = self.method("Reattach").with_args("(s)", vec![id.to_value()]);
        self.bus.call(call).await?;
        Ok(())
    }

    /// Describe the target system
    pub async fn query_system_parameters(&self) -> Result<serde_json::Value> {
        let result = single_result(
            self.bus.call(self.method("QuerySystemParameters")).await?,
            "QuerySystemParameters",
        )?;
        Ok(VariantDict::from_value(&result)?.to_json())
    }

    /// Present `token` to the authentication service
    pub async fn authenticate(&self, token: &str) -> Result<()> {
        let call = MethodCall::new(AUTH_SERVICE_PATH, AUTH_SERVICE_INTERFACE, "Authenticate")
            .with_args("s", vec![Value::Str(token.to_string())]);
        self.bus.call(call).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_wire_form() {
        let id = SessionId::new("a1b2");
        assert_eq!(id.to_value(), Value::Struct(vec![Value::Str("a1b2".to_string())]));
        assert_eq!(SessionId::from_value(&id.to_value()).unwrap(), id);
        assert!(SessionId::from_value(&Value::Str("a1b2".to_string())).is_err());
    }

    #[test]
    fn test_process_info_from_value() {
        let params = VariantDict::new().with("user", "root").into_value();
        let entry = Value::Struct(vec![
            Value::U32(42),
            Value::Str("init".to_string()),
            params,
        ]);

        let info = ProcessInfo::from_value(&entry).unwrap();
        assert_eq!(info.pid, 42);
        assert_eq!(info.name, "init");
        assert_eq!(info.parameters, serde_json::json!({"user": "root"}));

        let short = Value::Struct(vec![Value::U32(42)]);
        assert!(matches!(ProcessInfo::from_value(&short), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_attach_options_dict() {
        assert!(AttachOptions::new().to_dict().is_empty());

        let dict = AttachOptions::new()
            .with_realm(Realm::Emulated)
            .with_persist_timeout(30)
            .to_dict();
        assert_eq!(dict.get("realm").unwrap().value(), &Value::Str("emulated".to_string()));
        assert_eq!(dict.get("persist-timeout").unwrap().value(), &Value::U32(30));
    }
}
