//! Attached sessions
//!
//! A [`Session`] owns the scripts created in one attached process. Outbound
//! script messages are queued and delivered in batches, with at most one
//! batch in flight; the batch id is the serial of the batch's last message.
//! Inbound batches arrive as `PostMessages` signals on the session's message
//! sink and are routed to scripts by id.

use crate::agent::{
    agent_message_sink_path, decode_post_messages, AgentMessage, AgentMessageKind, AgentSessionApi,
    ScriptId, ScriptOptions, AGENT_MESSAGE_SINK_INTERFACE, POST_MESSAGES,
};
use crate::bus::Bus;
use crate::host::SessionId;
use crate::notify::{Notifier, Subscription};
use crate::script::Script;
use crate::{Error, Result};
use hookwire_proto::{SignalKey, Value, VariantDict};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Messages flow in both directions
    Attached,
    /// Outbound delivery is paused until [`Session::resume`]
    Interrupted,
    /// Terminal; no further operations are accepted
    Detached,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// [`Session::detach`] was called
    ApplicationRequested = 1,
    /// The process was replaced, e.g. by `exec`
    ProcessReplaced = 2,
    /// The process exited
    ProcessTerminated = 3,
    /// The connection to the server was lost
    ConnectionTerminated = 4,
    /// The device went away
    DeviceLost = 5,
}

impl DetachReason {
    /// Map a wire code
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::ApplicationRequested),
            2 => Some(Self::ProcessReplaced),
            3 => Some(Self::ProcessTerminated),
            4 => Some(Self::ConnectionTerminated),
            5 => Some(Self::DeviceLost),
            _ => None,
        }
    }
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ApplicationRequested => "application-requested",
            Self::ProcessReplaced => "process-replaced",
            Self::ProcessTerminated => "process-terminated",
            Self::ConnectionTerminated => "connection-terminated",
            Self::DeviceLost => "device-lost",
        };
        f.write_str(text)
    }
}

/// Payload of the detached notification
#[derive(Debug, Clone, PartialEq)]
pub struct DetachEvent {
    /// Why the session ended
    pub reason: DetachReason,
    /// Crash report, when the process died
    pub crash: Option<serde_json::Value>,
}

/// Handle to an attached session; clones refer to the same session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pid: u32,
    id: SessionId,
    persist_timeout: u32,
    agent: Arc<dyn AgentSessionApi>,
    state: Mutex<SessionState>,
    detached: Notifier<DetachEvent>,
    sink: Mutex<Option<Subscription>>,
}

struct SessionState {
    status: SessionStatus,
    /// Batch id of the last inbound batch
    last_rx_batch_id: u32,
    /// Queued outbound messages with their serials
    outbound: Vec<(u32, AgentMessage)>,
    next_serial: u32,
    delivery_in_flight: bool,
    scripts: HashMap<ScriptId, Script>,
}

impl Session {
    /// Create a session driven through `agent`
    pub fn new(pid: u32, id: SessionId, persist_timeout: u32, agent: Arc<dyn AgentSessionApi>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                pid,
                id,
                persist_timeout,
                agent,
                state: Mutex::new(SessionState {
                    status: SessionStatus::Attached,
                    last_rx_batch_id: 0,
                    outbound: Vec::new(),
                    next_serial: 1,
                    delivery_in_flight: false,
                    scripts: HashMap::new(),
                }),
                detached: Notifier::new(),
                sink: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Route `PostMessages` signals for this session from `bus`
    pub(crate) fn listen(&self, bus: &Bus) {
        let key = SignalKey::new(
            agent_message_sink_path(&self.inner.id),
            AGENT_MESSAGE_SINK_INTERFACE,
            POST_MESSAGES,
        );
        let weak = Arc::downgrade(&self.inner);
        let subscription = bus.add_signal_listener(key, move |body| {
            let Some(inner) = weak.upgrade() else { return };
            match decode_post_messages(body) {
                Ok((messages, batch_id)) => Session::from_inner(inner).handle_messages(messages, batch_id),
                Err(e) => warn!("Dropping malformed message batch: {}", e),
            }
        });

        if let Some(previous) = self.inner.sink.lock().replace(subscription) {
            previous.dispose();
        }
    }

    /// Target process ID
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Session id
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Persist timeout requested at attach time, in seconds
    pub fn persist_timeout(&self) -> u32 {
        self.inner.persist_timeout
    }

    /// Current state
    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status
    }

    /// Whether the session has detached
    pub fn is_detached(&self) -> bool {
        self.status() == SessionStatus::Detached
    }

    /// Batch id of the last inbound batch
    pub fn last_rx_batch_id(&self) -> u32 {
        self.inner.state.lock().last_rx_batch_id
    }

    /// Live scripts, in no particular order
    pub fn scripts(&self) -> Vec<Script> {
        self.inner.state.lock().scripts.values().cloned().collect()
    }

    /// Register a handler called once when the session detaches
    pub fn on_detached<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DetachEvent) + Send + Sync + 'static,
    {
        self.inner.detached.subscribe(handler)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_detached() {
            return Err(Error::InvalidOperation("Session is detached".to_string()));
        }
        Ok(())
    }

    /// Create a script from `source`; it runs once loaded
    pub async fn create_script(&self, source: &str, options: &ScriptOptions) -> Result<Script> {
        self.ensure_usable()?;

        let id = self.inner.agent.create_script(source, options).await?;
        let script = Script::new(id, Arc::downgrade(&self.inner), self.inner.agent.clone());

        {
            let mut state = self.inner.state.lock();
            if state.status == SessionStatus::Detached {
                drop(state);
                script.mark_destroyed();
                return Err(Error::InvalidOperation("Session is detached".to_string()));
            }
            state.scripts.insert(id, script.clone());
        }

        debug!("Created script {} in session {}", id, self.inner.id);
        Ok(script)
    }

    /// Queue a message for the agent and kick delivery
    pub(crate) fn post(&self, message: AgentMessage) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.status == SessionStatus::Detached {
                return Err(Error::InvalidOperation("Session is detached".to_string()));
            }
            let serial = state.next_serial;
            state.next_serial = state.next_serial.wrapping_add(1);
            state.outbound.push((serial, message));
        }
        self.deliver();
        Ok(())
    }

    /// Send the queued messages as one batch unless a batch is already in
    /// flight, the queue is empty, or the session is not attached
    fn deliver(&self) {
        let (messages, batch_id) = {
            let mut state = self.inner.state.lock();
            if state.status != SessionStatus::Attached || state.delivery_in_flight {
                return;
            }
            let Some(&(batch_id, _)) = state.outbound.last() else {
                return;
            };
            state.delivery_in_flight = true;
            let messages: Vec<AgentMessage> = state.outbound.drain(..).map(|(_, m)| m).collect();
            (messages, batch_id)
        };

        let session = self.clone();
        tokio::spawn(async move {
            let count = messages.len();
            debug!("Posting {} messages as batch {}", count, batch_id);
            let result = session.inner.agent.post_messages(messages, batch_id).await;
            session.inner.state.lock().delivery_in_flight = false;

            match result {
                Ok(()) => session.deliver(),
                Err(e) => warn!("Dropping batch {} of {} messages: {}", batch_id, count, e),
            }
        });
    }

    /// Route an inbound batch to its scripts
    pub(crate) fn handle_messages(&self, messages: Vec<AgentMessage>, batch_id: u32) {
        self.inner.state.lock().last_rx_batch_id = batch_id;

        for message in messages {
            if message.kind != AgentMessageKind::Script {
                debug!("Ignoring {:?} message for script {}", message.kind, message.script_id);
                continue;
            }

            let script = self.inner.state.lock().scripts.get(&message.script_id).cloned();
            let Some(script) = script else {
                debug!("Dropping message for unknown script {}", message.script_id);
                continue;
            };

            match serde_json::from_str(&message.text) {
                Ok(json) => script.dispatch_message(json, message.data),
                Err(e) => warn!("Dropping undecodable message from script {}: {}", message.script_id, e),
            }
        }
    }

    /// Resume after an interruption, telling the agent what was last received
    pub async fn resume(&self) -> Result<()> {
        let last_rx = {
            let state = self.inner.state.lock();
            match state.status {
                SessionStatus::Interrupted => state.last_rx_batch_id,
                SessionStatus::Attached => return Ok(()),
                SessionStatus::Detached => {
                    return Err(Error::InvalidOperation("Session is detached".to_string()))
                }
            }
        };

        let rx_batch_id = self.inner.agent.resume(last_rx).await?;

        {
            let mut state = self.inner.state.lock();
            if state.status != SessionStatus::Interrupted {
                return Ok(());
            }
            state.last_rx_batch_id = rx_batch_id;
            state.status = SessionStatus::Attached;
        }
        info!("Session {} resumed", self.inner.id);
        self.deliver();
        Ok(())
    }

    /// Detach from the process.
    ///
    /// Scripts are marked destroyed and the agent is asked to close; a close
    /// failure is ignored. Detaching twice does nothing.
    pub async fn detach(&self) {
        if !self.begin_detach() {
            return;
        }

        if let Err(e) = self.inner.agent.close().await {
            debug!("Ignoring close failure for session {}: {}", self.inner.id, e);
        }

        self.finish_detach(DetachReason::ApplicationRequested, None);
    }

    /// The session ended on the remote side; does nothing once detached
    pub(crate) fn on_remote_detach(&self, reason: DetachReason, crash: Option<serde_json::Value>) {
        if self.begin_detach() {
            self.finish_detach(reason, crash);
        }
    }

    fn begin_detach(&self) -> bool {
        let scripts: Vec<Script> = {
            let mut state = self.inner.state.lock();
            if state.status == SessionStatus::Detached {
                return false;
            }
            state.status = SessionStatus::Detached;
            state.outbound.clear();
            state.scripts.drain().map(|(_, script)| script).collect()
        };

        if let Some(sink) = self.inner.sink.lock().take() {
            sink.dispose();
        }
        for script in scripts {
            script.mark_destroyed();
        }
        true
    }

    fn finish_detach(&self, reason: DetachReason, crash: Option<serde_json::Value>) {
        info!("Session {} detached: {}", self.inner.id, reason);
        self.inner.detached.emit(&DetachEvent { reason, crash });
    }

    pub(crate) fn forget_script(&self, id: ScriptId) {
        self.inner.state.lock().scripts.remove(&id);
    }

    /// Offer a peer-to-peer connection; returns the answer SDP
    pub async fn offer_peer_connection(&self, offer_sdp: &str, options: VariantDict) -> Result<String> {
        self.ensure_usable()?;
        self.inner.agent.offer_peer_connection(offer_sdp, options).await
    }

    /// Add ICE candidates for the peer connection
    pub async fn add_candidates(&self, candidates: Vec<String>) -> Result<()> {
        self.ensure_usable()?;
        self.inner.agent.add_candidates(candidates).await
    }

    /// Signal that candidate gathering has finished
    pub async fn notify_candidate_gathering_done(&self) -> Result<()> {
        self.ensure_usable()?;
        self.inner.agent.notify_candidate_gathering_done().await
    }

    /// Start moving the session to another transport; pauses outbound delivery
    pub async fn begin_migration(&self) -> Result<()> {
        self.ensure_usable()?;
        self.inner.agent.begin_migration().await?;

        let mut state = self.inner.state.lock();
        if state.status == SessionStatus::Attached {
            state.status = SessionStatus::Interrupted;
        }
        Ok(())
    }

    /// Complete a migration started with [`Session::begin_migration`]
    pub async fn commit_migration(&self) -> Result<()> {
        self.ensure_usable()?;
        self.inner.agent.commit_migration().await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.inner.pid)
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Decode the `((s)uv)`-shaped body of `AgentSessionDetached`
pub(crate) fn decode_detached(body: &[Value]) -> Result<(SessionId, DetachReason, Option<serde_json::Value>)> {
    match body {
        [id, reason, rest @ ..] => {
            let id = SessionId::from_value(id)?;
            let code = reason
                .as_u32()
                .ok_or_else(|| Error::Protocol(format!("Expected detach reason, got {:?}", reason)))?;
            let reason = DetachReason::from_code(code)
                .ok_or_else(|| Error::Protocol(format!("Unknown detach reason {}", code)))?;
            let crash = rest.first().map(Value::to_json).filter(|crash| !crash.is_null());
            Ok((id, reason, crash))
        }
        _ => Err(Error::Protocol("Malformed AgentSessionDetached body".to_string())),
    }
}

#[cfg(test)]
mod tests;
