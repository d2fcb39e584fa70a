//! Typed calls against one attached agent session

use crate::bus::{single_result, Bus};
use crate::host::SessionId;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hookwire_proto::{MethodCall, Value, VariantDict};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Interface of an agent session object
pub const AGENT_SESSION_INTERFACE: &str = "io.hookwire.AgentSession";

/// Interface of the message sink the server posts agent messages to
pub const AGENT_MESSAGE_SINK_INTERFACE: &str = "io.hookwire.AgentMessageSink";

/// Signal carrying a batch of agent messages
pub const POST_MESSAGES: &str = "PostMessages";

/// Object path of the agent session `id`
pub fn agent_session_path(id: &SessionId) -> String {
    format!("/io/hookwire/AgentSession/{}", id)
}

/// Object path of the message sink for session `id`
pub fn agent_message_sink_path(id: &SessionId) -> String {
    format!("/io/hookwire/AgentMessageSink/{}", id)
}

/// Identifier of a script within its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScriptId(pub u32);

impl ScriptId {
    /// Encode as the `(u)` wire struct
    pub fn to_value(self) -> Value {
        Value::Struct(vec![Value::U32(self.0)])
    }

    /// Decode from the `(u)` wire struct
    pub fn from_value(value: &Value) -> Result<Self> {
        value
            .as_struct()
            .and_then(|fields| fields.first())
            .and_then(Value::as_u32)
            .map(ScriptId)
            .ok_or_else(|| Error::Protocol(format!("Expected (u) script id, got {:?}", value)))
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Script engine to run a script on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRuntime {
    /// The lightweight interpreter
    QuickJs,
    /// The JIT engine
    V8,
}

/// Options for creating a script
#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    /// Name shown in the script's stack traces
    pub name: Option<String>,
    /// Engine to use; the server picks when unset
    pub runtime: Option<ScriptRuntime>,
}

impl ScriptOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the script name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the runtime
    pub fn with_runtime(mut self, runtime: ScriptRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Encode as an `a{sv}` option map
    pub fn to_dict(&self) -> VariantDict {
        let mut dict = VariantDict::new();
        if let Some(name) = &self.name {
            dict.insert("name", name.as_str());
        }
        if let Some(runtime) = self.runtime {
            let runtime = match runtime {
                ScriptRuntime::QuickJs => "qjs",
                ScriptRuntime::V8 => "v8",
            };
            dict.insert("runtime", runtime);
        }
        dict
    }
}

/// Kind of an agent message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMessageKind {
    /// Message to or from a script
    Script = 1,
    /// Message to or from the debugger
    Debugger = 2,
}

impl AgentMessageKind {
    /// Map a wire code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Script),
            2 => Some(Self::Debugger),
            _ => None,
        }
    }
}

/// One record of a `PostMessages` batch
#[derive(Debug, Clone, PartialEq)]
pub struct AgentMessage {
    /// Kind of message
    pub kind: AgentMessageKind,
    /// Script the message belongs to
    pub script_id: ScriptId,
    /// JSON text
    pub text: String,
    /// Optional binary attachment
    pub data: Option<Bytes>,
}

impl AgentMessage {
    /// A script message
    pub fn script(script_id: ScriptId, text: impl Into<String>, data: Option<Bytes>) -> Self {
        Self {
            kind: AgentMessageKind::Script,
            script_id,
            text: text.into(),
            data,
        }
    }

    /// Encode as the `(i(u)sbay)` wire struct
    pub fn to_value(&self) -> Value {
        Value::Struct(vec![
            Value::I32(self.kind as i32),
            self.script_id.to_value(),
            Value::Str(self.text.clone()),
            Value::Bool(self.data.is_some()),
            Value::Bytes(self.data.clone().unwrap_or_default()),
        ])
    }

    /// Decode from the `(i(u)sbay)` wire struct
    pub fn from_value(value: &Value) -> Result<Self> {
        let invalid = || Error::Protocol(format!("Expected (i(u)sbay) agent message, got {:?}", value));

        match value.as_struct() {
            Some([kind, script_id, text, has_data, data]) => {
                let kind = kind
                    .as_i32()
                    .ok_or_else(invalid)
                    .and_then(|code| {
                        AgentMessageKind::from_code(code)
                            .ok_or_else(|| Error::Protocol(format!("Unknown agent message kind {}", code)))
                    })?;
                let data = if has_data.as_bool().ok_or_else(invalid)? {
                    Some(data.to_bytes().ok_or_else(invalid)?)
                } else {
                    None
                };
                Ok(Self {
                    kind,
                    script_id: ScriptId::from_value(script_id)?,
                    text: text.as_str().ok_or_else(invalid)?.to_string(),
                    data,
                })
            }
            _ => Err(invalid()),
        }
    }
}

/// Operations of an attached agent session.
///
/// [`AgentFacade`] implements this over the bus; sessions only talk to the
/// agent through this trait.
#[async_trait]
pub trait AgentSessionApi: Send + Sync {
    /// Close the agent session
    async fn close(&self) -> Result<()>;

    /// Resume after an interruption; takes and returns a receive batch id
    async fn resume(&self, rx_batch_id: u32) -> Result<u32>;

    /// Create a script from source
    async fn create_script(&self, source: &str, options: &ScriptOptions) -> Result<ScriptId>;

    /// Destroy a script
    async fn destroy_script(&self, id: ScriptId) -> Result<()>;

    /// Load a created script
    async fn load_script(&self, id: ScriptId) -> Result<()>;

    /// Deliver a batch of messages to the agent
    async fn post_messages(&self, messages: Vec<AgentMessage>, batch_id: u32) -> Result<()>;

    /// Offer a peer connection; returns the answer SDP
    async fn offer_peer_connection(&self, offer_sdp: &str, options: VariantDict) -> Result<String>;

    /// Add ICE candidates
    async fn add_candidates(&self, candidates: Vec<String>) -> Result<()>;

    /// Signal the end of candidate gathering
    async fn notify_candidate_gathering_done(&self) -> Result<()>;

    /// Start migrating to a new transport
    async fn begin_migration(&self) -> Result<()>;

    /// Finish migrating to a new transport
    async fn commit_migration(&self) -> Result<()>;
}

/// Bus-backed proxy for an agent session object
#[derive(Debug, Clone)]
pub struct AgentFacade {
    bus: Bus,
    path: String,
}

impl AgentFacade {
    /// Create a facade for session `id`
    pub fn new(bus: Bus, id: &SessionId) -> Self {
        Self {
            bus,
            path: agent_session_path(id),
        }
    }

    fn method(&self, member: &str) -> MethodCall {
        MethodCall::new(&self.path, AGENT_SESSION_INTERFACE, member)
    }

    async fn call_unit(&self, call: MethodCall) -> Result<()> {
        self.bus.call(call).await?;
        Ok(())
    }
}

#[async_trait]
impl AgentSessionApi for AgentFacade {
    async fn close(&self) -> Result<()> {
        self.call_unit(self.method("Close")).await
    }

    async fn resume(&self, rx_batch_id: u32) -> Result<u32> {
        let call = self.method("Resume").with_args("u", vec![Value::U32(rx_batch_id)]);
        let result = single_result(self.bus.call(call).await?, "Resume")?;
        result
            .as_u32()
            .ok_or_else(|| Error::Protocol(format!("Resume returned {:?}", result)))
    }

    async fn create_script(&self, source: &str, options: &ScriptOptions) -> Result<ScriptId> {
        let call = self.method("CreateScript").with_args(
            "sa{sv}",
            vec![Value::Str(source.to_string()), options.to_dict().into_value()],
        );
        let result = single_result(self.bus.call(call).await?, "CreateScript")?;
        ScriptId::from_value(&result)
    }

    async fn destroy_script(&self, id: ScriptId) -> Result<()> {
        self.call_unit(self.method("DestroyScript").with_args("(u)", vec![id.to_value()]))
            .await
    }

    async fn load_script(&self, id: ScriptId) -> Result<()> {
        self.call_unit(self.method("LoadScript").with_args("(u)", vec![id.to_value()]))
            .await
    }

    async fn post_messages(&self, messages: Vec<AgentMessage>, batch_id: u32) -> Result<()> {
        let records = messages.iter().map(AgentMessage::to_value).collect();
        let call = self
            .method(POST_MESSAGES)
            .with_args("a(i(u)sbay)u", vec![Value::Array(records), Value::U32(batch_id)]);
        self.call_unit(call).await
    }

    async fn offer_peer_connection(&self, offer_sdp: &str, options: VariantDict) -> Result<String> {
        let call = self.method("OfferPeerConnection").with_args(
            "sa{sv}",
            vec![Value::Str(offer_sdp.to_string()), options.into_value()],
        );
        let result = single_result(self.bus.call(call).await?, "OfferPeerConnection")?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol(format!("OfferPeerConnection returned {:?}", result)))
    }

    async fn add_candidates(&self, candidates: Vec<String>) -> Result<()> {
        let candidates = candidates.into_iter().map(Value::Str).collect();
        self.call_unit(self.method("AddCandidates").with_args("as", vec![Value::Array(candidates)]))
            .await
    }

    async fn notify_candidate_gathering_done(&self) -> Result<()> {
        self.call_unit(self.method("NotifyCandidateGatheringDone")).await
    }

    async fn begin_migration(&self) -> Result<()> {
        self.call_unit(self.method("BeginMigration")).await
    }

    async fn commit_migration(&self) -> Result<()> {
        self.call_unit(self.method("CommitMigration")).await
    }
}

/// Decode the `(a(i(u)sbay)u)` body of a `PostMessages` signal.
///
/// Only a malformed envelope or batch id fails the whole batch; records that
/// don't decode are skipped.
pub(crate) fn decode_post_messages(body: &[Value]) -> Result<(Vec<AgentMessage>, u32)> {
    match body {
        [Value::Array(records), batch_id] => {
            let batch_id = batch_id
                .as_u32()
                .ok_or_else(|| Error::Protocol(format!("Expected batch id, got {:?}", batch_id)))?;
            let messages = records
                .iter()
                .filter_map(|record| match AgentMessage::from_value(record) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("Dropping malformed record in batch {}: {}", batch_id, e);
                        None
                    }
                })
                .collect();
            Ok((messages, batch_id))
        }
        _ => Err(Error::Protocol("Malformed PostMessages body".to_string())),
    }
}
