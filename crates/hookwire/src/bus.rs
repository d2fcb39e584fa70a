//! Message bus: call/reply correlation and signal routing
//!
//! A [`Bus`] sits on top of one open transport channel. Outgoing method calls
//! get a fresh serial and wait for the reply carrying that serial; incoming
//! signals are fanned out to the listeners registered for their
//! `(path, interface, member)` key.

use crate::notify::{isolate, Subscription};
use crate::{Error, Result};
use hookwire_proto::{Codec, Message, MethodCall, SignalKey, Value};
use hookwire_transport::{Channel, ChannelSender, TransportEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default time to wait for a method reply
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type SignalHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;
type ReplySender = oneshot::Sender<Result<Vec<Value>>>;

/// Handle to a message bus; clones share the same connection
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    /// Message codec
    codec: Arc<dyn Codec>,
    /// Outbound frames; taken on shutdown
    sender: Mutex<Option<ChannelSender>>,
    /// Next call serial
    next_serial: AtomicU32,
    /// Calls waiting for a reply, by serial
    pending: Mutex<HashMap<u32, ReplySender>>,
    /// Signal listeners, in registration order per key
    signals: Mutex<HashMap<SignalKey, Vec<(u64, SignalHandler)>>>,
    /// Next listener id
    next_listener_id: AtomicU64,
    /// Reply deadline
    call_timeout: Duration,
    /// Set once the bus has shut down
    closed: AtomicBool,
    /// Wakes the pump on shutdown
    shutdown: Notify,
}

/// Removes a pending call when its caller stops waiting
struct PendingGuard<'a> {
    inner: &'a BusInner,
    serial: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.serial);
    }
}

impl Bus {
    /// Create a bus writing through `sender`.
    ///
    /// Inbound frames must be fed to [`Bus::handle_frame`], usually by
    /// running [`Bus::pump`] on the matching channel.
    pub fn new(sender: ChannelSender, codec: Arc<dyn Codec>, call_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                codec,
                sender: Mutex::new(Some(sender)),
                next_serial: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
                signals: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                call_timeout,
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Call a remote method and wait for its reply body.
    ///
    /// The body is checked against the call's signature before anything is
    /// written. A reply arriving after the deadline is dropped.
    pub async fn call(&self, mut call: MethodCall) -> Result<Vec<Value>> {
        if self.is_closed() {
            return Err(Error::Transport("Connection closed".to_string()));
        }

        call.check_body()?;

        let serial = self.next_serial();
        call.serial = serial;
        debug!("Calling {}.{} on {} (serial {})", call.interface, call.member, call.path, serial);

        let frame = self.inner.codec.encode(&Message::MethodCall(call))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().insert(serial, reply_tx);
        let _guard = PendingGuard {
            inner: &self.inner,
            serial,
        };

        let sender = self.inner.sender.lock().clone();
        match sender {
            Some(sender) => sender.send(frame)?,
            None => return Err(Error::Transport("Connection closed".to_string())),
        }

        match timeout(self.inner.call_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport("Connection closed".to_string())),
            Err(_) => {
                warn!("Call with serial {} timed out", serial);
                Err(Error::Timeout {
                    duration: self.inner.call_timeout,
                })
            }
        }
    }

    /// Register a handler for signals matching `key`.
    ///
    /// Handlers for the same key run in registration order.
    pub fn add_signal_listener<F>(&self, key: SignalKey, handler: F) -> Subscription
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        debug!("Adding signal listener {} for {}.{} on {}", id, key.interface, key.member, key.path);
        self.inner
            .signals
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut signals = inner.signals.lock();
                if let Some(handlers) = signals.get_mut(&key) {
                    handlers.retain(|(handler_id, _)| *handler_id != id);
                    if handlers.is_empty() {
                        signals.remove(&key);
                    }
                }
            }
        })
    }

    /// Remove a signal handler; same as [`Subscription::dispose`]
    pub fn remove_signal_listener(&self, subscription: Subscription) {
        subscription.dispose();
    }

    /// Decode and dispatch every message carried by an inbound frame
    pub fn handle_frame(&self, frame: &[u8]) {
        for decoded in self.inner.codec.decode(frame) {
            match decoded {
                Ok(message) => self.dispatch(message),
                Err(e) => warn!("Dropping undecodable message: {}", e),
            }
        }
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::MethodReturn(reply) => {
                self.resolve(reply.reply_serial, Ok(reply.body));
            }
            Message::Error(reply) => {
                self.resolve(
                    reply.reply_serial,
                    Err(Error::Remote {
                        name: reply.name,
                        message: reply.message,
                    }),
                );
            }
            Message::Signal(signal) => {
                let handlers: Vec<SignalHandler> = self
                    .inner
                    .signals
                    .lock()
                    .get(&signal.key())
                    .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default();

                if handlers.is_empty() {
                    debug!("No listener for signal {}.{} on {}", signal.interface, signal.member, signal.path);
                }
                for handler in handlers {
                    isolate("Signal", || handler(&signal.body));
                }
            }
            Message::MethodCall(call) => {
                warn!("Ignoring unexpected method call {}.{} from remote", call.interface, call.member);
            }
        }
    }

    fn resolve(&self, reply_serial: u32, result: Result<Vec<Value>>) {
        let sender = self.inner.pending.lock().remove(&reply_serial);
        match sender {
            Some(sender) => {
                if sender.send(result).is_err() {
                    debug!("Caller for serial {} stopped waiting", reply_serial);
                }
            }
            None => warn!("Dropping reply for unknown serial {}", reply_serial),
        }
    }

    /// Feed inbound events from `channel` into the bus until the channel
    /// closes or [`Bus::shutdown`] is called, then shut the bus down.
    pub async fn pump(&self, mut channel: Channel) {
        info!("Starting bus pump");

        loop {
            tokio::select! {
                event = channel.next_event() => {
                    match event {
                        TransportEvent::Message(frame) => self.handle_frame(&frame),
                        TransportEvent::Error(e) => warn!("Transport error: {}", e),
                        TransportEvent::Closed => {
                            debug!("Channel closed");
                            break;
                        }
                    }
                }

                _ = self.inner.shutdown.notified() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown();
        info!("Bus pump stopped");
    }

    /// Close the bus.
    ///
    /// Drops the outbound sender, stops the pump and fails every pending
    /// call with a transport error. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down bus");

        self.inner.sender.lock().take();
        self.inner.shutdown.notify_one();

        let pending: Vec<ReplySender> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, sender)| sender)
            .collect();
        for sender in pending {
            let _ = sender.send(Err(Error::Transport("Connection closed".to_string())));
        }
    }

    /// Whether the bus has shut down
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Call timeout in use
    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("closed", &self.is_closed())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

/// First value of a reply body
pub(crate) fn single_result(mut body: Vec<Value>, member: &str) -> Result<Value> {
    if body.is_empty() {
        return Err(Error::Protocol(format!("{} returned an empty reply", member)));
    }
    Ok(body.swap_remove(0))
}
