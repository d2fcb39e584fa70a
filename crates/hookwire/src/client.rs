//! Client configuration and connection management
//!
//! A [`Client`] connects lazily: the first operation opens the transport,
//! wires a [`Bus`] onto it and authenticates. Concurrent operations share
//! that single attempt. When the connection is lost every session attached
//! through it is detached and the next operation connects again.

use crate::agent::AgentFacade;
use crate::bus::{Bus, DEFAULT_CALL_TIMEOUT};
use crate::host::{
    AttachOptions, HostFacade, ProcessInfo, SessionId, AGENT_SESSION_DETACHED, HOST_SESSION_INTERFACE,
    HOST_SESSION_PATH,
};
use crate::session::{decode_detached, DetachReason, Session};
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use hookwire_proto::{Codec, MsgPackCodec, SignalKey};
use hookwire_transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default server port
pub const DEFAULT_PORT: u16 = 27042;

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server hostname or IP
    pub host: String,
    /// Server port
    pub port: u16,
    /// Authentication token, presented right after connecting
    pub token: Option<String>,
    /// Reply deadline for every bus call
    pub call_timeout: Duration,
    /// Deadline for opening the transport
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            token: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Builder for [`Client`]
pub struct ClientBuilder {
    /// Client configuration
    config: ClientConfig,
    /// Message codec
    codec: Arc<dyn Codec>,
}

impl ClientBuilder {
    /// Create a builder for `target`, written as `host[:port]`
    pub fn new(target: &str) -> Self {
        let (host, port) = Self::parse_target(target);

        Self {
            config: ClientConfig {
                host,
                port,
                ..Default::default()
            },
            codec: Arc::new(MsgPackCodec::new()),
        }
    }

    /// Parse target string into host and port
    fn parse_target(target: &str) -> (String, u16) {
        let mut host = target.trim().to_string();
        let mut port = DEFAULT_PORT;

        if let Some(colon_pos) = host.rfind(':') {
            if let Ok(parsed_port) = host[colon_pos + 1..].parse::<u16>() {
                port = parsed_port;
                host = host[..colon_pos].to_string();
            }
        }
        if host.is_empty() {
            host = DEFAULT_HOST.to_string();
        }

        (host, port)
    }

    /// Set the authentication token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Set the call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Use a different message codec
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Build the client configuration
    pub fn build_config(self) -> ClientConfig {
        self.config
    }

    /// Build a client that connects through `transport`
    pub fn build(self, transport: Arc<dyn Transport>) -> Client {
        Client::new(self.config, transport, self.codec)
    }

    /// Build a TCP client and connect it
    #[cfg(feature = "tcp")]
    pub async fn connect_tcp(self) -> Result<Client> {
        use hookwire_transport::{TcpConfig, TcpTransport};

        let transport = TcpTransport::new(TcpConfig {
            host: self.config.host.clone(),
            port: self.config.port,
            connect_timeout: self.config.connect_timeout,
            ..Default::default()
        });
        let client = self.build(Arc::new(transport));
        client.connection().await?;
        Ok(client)
    }
}

/// An established connection: the bus and the host facade on top of it
#[derive(Debug, Clone)]
pub struct Connection {
    bus: Bus,
    host: HostFacade,
    generation: u64,
}

impl Connection {
    /// The message bus
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// The host session facade
    pub fn host(&self) -> &HostFacade {
        &self.host
    }
}

type ConnectFuture = Shared<BoxFuture<'static, Result<Connection>>>;

/// Entry point for talking to an instrumentation server
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    /// Current or in-progress connection, tagged with its generation
    connection: Mutex<Option<(u64, ConnectFuture)>>,
    next_generation: AtomicU64,
    /// Live sessions with the generation they were attached on
    sessions: Mutex<HashMap<SessionId, (u64, Session)>>,
}

impl Client {
    /// Create a client; nothing is opened until the first operation
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, codec: Arc<dyn Codec>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                codec,
                connection: Mutex::new(None),
                next_generation: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Get the established connection, connecting if needed.
    ///
    /// Concurrent callers share one attempt and see the same outcome. A
    /// failed attempt is forgotten so the next call tries again.
    pub async fn connection(&self) -> Result<Connection> {
        let pending = {
            let mut slot = self.inner.connection.lock();
            let current = slot.as_ref().map(|(_, pending)| pending.clone());
            match current {
                Some(pending) => pending,
                None => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let pending = ClientInner::establish(self.inner.clone(), generation)
                        .boxed()
                        .shared();
                    *slot = Some((generation, pending.clone()));
                    pending
                }
            }
        };
        pending.await
    }

    /// List the processes on the target
    pub async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
        self.connection().await?.host.enumerate_processes().await
    }

    /// Find a process by exact name
    pub async fn find_process(&self, name: &str) -> Result<Option<ProcessInfo>> {
        let processes = self.enumerate_processes().await?;
        Ok(processes.into_iter().find(|process| process.name == name))
    }

    /// Describe the target system
    pub async fn query_system_parameters(&self) -> Result<serde_json::Value> {
        self.connection().await?.host.query_system_parameters().await
    }

    /// Attach to `pid`
    pub async fn attach(&self, pid: u32, options: AttachOptions) -> Result<Session> {
        let connection = self.connection().await?;
        let id = connection.host.attach(pid, &options).await?;

        let agent = Arc::new(AgentFacade::new(connection.bus.clone(), &id));
        let session = Session::new(pid, id.clone(), options.persist_timeout, agent);
        session.listen(&connection.bus);

        self.inner
            .sessions
            .lock()
            .insert(id.clone(), (connection.generation, session.clone()));

        let weak = Arc::downgrade(&self.inner);
        let session_id = id.clone();
        let _unregister = session.on_detached(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.sessions.lock().remove(&session_id);
            }
        });

        // The connection may have dropped while the session was being set up
        if connection.bus.is_closed() {
            session.on_remote_detach(DetachReason::ConnectionTerminated, None);
        }

        info!("Attached to pid {} as session {}", pid, id);
        Ok(session)
    }

    /// Sessions that have not detached
    pub fn sessions(&self) -> Vec<Session> {
        self.inner
            .sessions
            .lock()
            .values()
            .map(|(_, session)| session.clone())
            .collect()
    }

    /// Drop the current connection.
    ///
    /// Sessions attached through it detach with
    /// [`DetachReason::ConnectionTerminated`] once the bus has stopped.
    pub fn close(&self) {
        let current = self.inner.connection.lock().clone();
        if let Some((_, pending)) = current {
            if let Some(Ok(connection)) = pending.peek() {
                connection.bus.shutdown();
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.inner.transport.describe())
            .field("sessions", &self.inner.sessions.lock().len())
            .finish()
    }
}

impl ClientInner {
    async fn establish(inner: Arc<ClientInner>, generation: u64) -> Result<Connection> {
        let target = inner.transport.describe();
        info!("Connecting to {}", target);

        let channel = match inner.transport.open().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to connect to {}: {}", target, e);
                inner.forget_connection(generation);
                return Err(e.into());
            }
        };

        let bus = Bus::new(channel.sender(), inner.codec.clone(), inner.config.call_timeout);
        let host = HostFacade::new(bus.clone());

        let weak = Arc::downgrade(&inner);
        let _detached = bus.add_signal_listener(
            SignalKey::new(HOST_SESSION_PATH, HOST_SESSION_INTERFACE, AGENT_SESSION_DETACHED),
            move |body| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_agent_session_detached(body);
                }
            },
        );

        let pump = bus.clone();
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            pump.pump(channel).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_lost(generation);
            }
        });

        if let Some(token) = &inner.config.token {
            debug!("Authenticating with {}", target);
            if let Err(e) = host.authenticate(token).await {
                warn!("Authentication with {} failed: {}", target, e);
                inner.forget_connection(generation);
                bus.shutdown();
                return Err(Error::Auth(e.to_string()));
            }
        }

        info!("Connected to {}", target);
        Ok(Connection { bus, host, generation })
    }

    /// Clear the connection slot if it still holds `generation`
    fn forget_connection(&self, generation: u64) {
        let mut slot = self.connection.lock();
        if matches!(&*slot, Some((current, _)) if *current == generation) {
            *slot = None;
        }
    }

    fn on_connection_lost(&self, generation: u64) {
        self.forget_connection(generation);

        let sessions: Vec<Session> = self
            .sessions
            .lock()
            .values()
            .filter(|(session_generation, _)| *session_generation == generation)
            .map(|(_, session)| session.clone())
            .collect();

        info!("Connection lost; detaching {} sessions", sessions.len());
        for session in sessions {
            session.on_remote_detach(DetachReason::ConnectionTerminated, None);
        }
    }

    fn on_agent_session_detached(&self, body: &[hookwire_proto::Value]) {
        let (id, reason, crash) = match decode_detached(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping malformed detach notification: {}", e);
                return;
            }
        };

        let session = self.sessions.lock().get(&id).map(|(_, session)| session.clone());
        match session {
            Some(session) => session.on_remote_detach(reason, crash),
            None => debug!("Detach notification for unknown session {}", id),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some((_, pending)) = self.connection.get_mut().take() {
            if let Some(Ok(connection)) = pending.peek() {
                connection.bus.shutdown();
            }
        }
    }
}
