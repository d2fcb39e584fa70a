//! Scripts injected into an attached session
//!
//! Messages from a script are sorted three ways: replies to export calls
//! resolve the waiting call, log records go to the log handler, and
//! everything else reaches the `on_message` handlers.

use crate::agent::{AgentMessage, AgentSessionApi, ScriptId};
use crate::notify::{isolate, Notifier, Subscription};
use crate::session::{Session, SessionInner};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// First element of every RPC request and reply array
pub const RPC_MARKER: &str = "hookwire:rpc";

/// Severity of a script log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Informational
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
}

impl LogLevel {
    fn parse(level: Option<&str>) -> Self {
        match level {
            Some("warning") | Some("warn") => LogLevel::Warning,
            Some("error") => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Receives log records emitted by a script
pub type LogHandler = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// A message sent by a script
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMessage {
    /// Decoded JSON message
    pub message: Json,
    /// Binary attachment, if any
    pub data: Option<Bytes>,
}

/// Handle to a script; clones refer to the same script
#[derive(Clone)]
pub struct Script {
    inner: Arc<ScriptInner>,
}

struct ScriptInner {
    id: ScriptId,
    session: Weak<SessionInner>,
    agent: Arc<dyn AgentSessionApi>,
    state: Mutex<ScriptState>,
    messages: Notifier<ScriptMessage>,
    destroyed: Notifier<()>,
}

struct ScriptState {
    destroyed: bool,
    /// Export calls waiting for a reply, by request id
    pending: HashMap<u32, oneshot::Sender<Result<Json>>>,
    next_request_id: u32,
    log_handler: LogHandler,
}

fn default_log_handler(level: LogLevel, text: &str) {
    match level {
        LogLevel::Info => info!(target: "hookwire::script", "{}", text),
        LogLevel::Warning => warn!(target: "hookwire::script", "{}", text),
        LogLevel::Error => error!(target: "hookwire::script", "{}", text),
    }
}

impl Script {
    pub(crate) fn new(id: ScriptId, session: Weak<SessionInner>, agent: Arc<dyn AgentSessionApi>) -> Self {
        Self {
            inner: Arc::new(ScriptInner {
                id,
                session,
                agent,
                state: Mutex::new(ScriptState {
                    destroyed: false,
                    pending: HashMap::new(),
                    next_request_id: 1,
                    log_handler: Arc::new(default_log_handler),
                }),
                messages: Notifier::new(),
                destroyed: Notifier::new(),
            }),
        }
    }

    /// Script id
    pub fn id(&self) -> ScriptId {
        self.inner.id
    }

    /// Whether the script has been destroyed
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Register a handler for messages from the script
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ScriptMessage) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(handler)
    }

    /// Register a handler called once when the script is destroyed
    pub fn on_destroyed<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.destroyed.subscribe(move |_| handler())
    }

    /// Replace the log handler; the default forwards to `tracing`
    pub fn set_log_handler<F>(&self, handler: F)
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        self.inner.state.lock().log_handler = Arc::new(handler);
    }

    /// Load the script into the target
    pub async fn load(&self) -> Result<()> {
        self.ensure_alive()?;
        debug!("Loading script {}", self.inner.id);
        self.inner.agent.load_script(self.inner.id).await
    }

    /// Destroy the script
    pub async fn unload(&self) -> Result<()> {
        self.ensure_alive()?;
        debug!("Unloading script {}", self.inner.id);
        self.inner.agent.destroy_script(self.inner.id).await?;
        self.mark_destroyed();
        Ok(())
    }

    /// Post a JSON message, with an optional binary attachment, to the script
    pub fn post<T: Serialize + ?Sized>(&self, message: &T, data: Option<Bytes>) -> Result<()> {
        self.ensure_alive()?;
        let text = serde_json::to_string(message)?;
        self.session()?
            .post(AgentMessage::script(self.inner.id, text, data))
    }

    /// Proxy for the script's exported functions
    pub fn exports(&self) -> Exports {
        Exports {
            script: self.clone(),
        }
    }

    fn session(&self) -> Result<Session> {
        self.inner
            .session
            .upgrade()
            .map(Session::from_inner)
            .ok_or_else(|| Error::InvalidOperation("Session is gone".to_string()))
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::InvalidOperation("Script is destroyed".to_string()));
        }
        Ok(())
    }

    /// Route a decoded message from the script
    pub(crate) fn dispatch_message(&self, message: Json, data: Option<Bytes>) {
        match message.get("type").and_then(Json::as_str) {
            Some("send") => {
                if let Some(items) = message.get("payload").and_then(Json::as_array) {
                    if items.first().and_then(Json::as_str) == Some(RPC_MARKER) {
                        self.handle_rpc_reply(items);
                        return;
                    }
                }
                if let Some(payload) = message.get("payload") {
                    if payload.get("type").and_then(Json::as_str) == Some("log") {
                        self.log(payload);
                        return;
                    }
                }
            }
            Some("log") => {
                self.log(&message);
                return;
            }
            _ => {}
        }

        self.inner.messages.emit(&ScriptMessage { message, data });
    }

    fn log(&self, record: &Json) {
        let level = LogLevel::parse(record.get("level").and_then(Json::as_str));
        let text = match record.get("payload") {
            Some(Json::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let handler = self.inner.state.lock().log_handler.clone();
        isolate("Log", || handler(level, &text));
    }

    fn handle_rpc_reply(&self, items: &[Json]) {
        let Some(request_id) = items.get(1).and_then(Json::as_u64).and_then(|id| u32::try_from(id).ok()) else {
            warn!("Script {} sent an RPC reply without a request id", self.inner.id);
            return;
        };

        let result = match items.get(2).and_then(Json::as_str) {
            Some("ok") => Ok(items.get(3).cloned().unwrap_or(Json::Null)),
            Some("error") => {
                let field = |index: usize| items.get(index).and_then(Json::as_str).map(str::to_string);
                Err(Error::Rpc {
                    message: field(3).unwrap_or_default(),
                    name: field(4).unwrap_or_else(|| "Error".to_string()),
                    stack: field(5),
                })
            }
            other => {
                warn!("Script {} sent an RPC reply with unknown status {:?}", self.inner.id, other);
                return;
            }
        };

        let sender = self.inner.state.lock().pending.remove(&request_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => debug!("Dropping RPC reply for unknown request {}", request_id),
        }
    }

    async fn rpc_request(&self, operation: &str, params: Vec<Json>) -> Result<Json> {
        let (request_id, reply_rx) = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(Error::InvalidOperation("Script is destroyed".to_string()));
            }
            let request_id = state.next_request_id;
            state.next_request_id = state.next_request_id.checked_add(1).unwrap_or(1);
            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending.insert(request_id, reply_tx);
            (request_id, reply_rx)
        };

        let mut request = vec![json!(RPC_MARKER), json!(request_id), json!(operation)];
        request.extend(params);

        if let Err(e) = self.post(&request, None) {
            self.inner.state.lock().pending.remove(&request_id);
            return Err(e);
        }

        reply_rx
            .await
            .map_err(|_| Error::InvalidOperation("Script is destroyed".to_string()))?
    }

    /// Mark the script destroyed and abandon its pending export calls
    pub(crate) fn mark_destroyed(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.pending.clear();
        }

        if let Some(session) = self.inner.session.upgrade() {
            Session::from_inner(session).forget_script(self.inner.id);
        }
        debug!("Script {} destroyed", self.inner.id);
        self.inner.destroyed.emit(&());
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("id", &self.inner.id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Calls functions a script exports over its RPC channel
#[derive(Debug, Clone)]
pub struct Exports {
    script: Script,
}

impl Exports {
    /// Call the export `name` with JSON arguments.
    ///
    /// Calls still pending when the script is unloaded or its session
    /// detaches fail with [`Error::InvalidOperation`].
    pub async fn call(&self, name: &str, args: Vec<Json>) -> Result<Json> {
        debug!("Calling export {} on script {}", name, self.script.id());
        self.script
            .rpc_request("call", vec![json!(name), Json::Array(args)])
            .await
    }

    /// Call the export `name` and deserialize its result
    pub async fn call_as<R: DeserializeOwned>(&self, name: &str, args: Vec<Json>) -> Result<R> {
        let value = self.call(name, args).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Serialization(format!("Failed to decode result of {}: {}", name, e)))
    }

    /// Names of the exported functions
    pub async fn list(&self) -> Result<Vec<String>> {
        let value = self.script.rpc_request("list", Vec::new()).await?;
        serde_json::from_value(value).map_err(Error::from)
    }
}
