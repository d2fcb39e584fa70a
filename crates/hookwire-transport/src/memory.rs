//! In-process transport
//!
//! Every [`Transport::open`] on a [`MemoryTransport`] hands a [`MemoryPeer`]
//! to the paired [`MemoryListener`]. The peer plays the remote end: it reads
//! the frames the client sends and injects frames, errors and closure.

use async_trait::async_trait;
use crate::{Channel, ChannelSender, Transport, TransportError, TransportEvent};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// Client side of the in-process transport
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    /// Queue of peers waiting to be accepted
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Accepts the peers created by [`MemoryTransport::open`]
#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Remote end of one in-process channel
#[derive(Debug)]
pub struct MemoryPeer {
    /// Frames sent by the client
    incoming: mpsc::UnboundedReceiver<Bytes>,
    /// Events delivered to the client
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    /// Create a transport and its listener.
    ///
    /// Opening fails with a connection error once the listener is dropped.
    pub fn new() -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (Self { accept_tx }, MemoryListener { accept_rx })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<Channel, TransportError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            incoming: out_rx,
            events: ev_tx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::Connection("Connection refused".to_string()))?;

        debug!("Opened in-memory channel");
        Ok(Channel::new(ChannelSender::new(out_tx), ev_rx))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryListener {
    /// Wait for the next opened channel
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Take an already opened channel without waiting
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }
}

impl MemoryPeer {
    /// Wait for the next frame from the client; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }

    /// Deliver a frame to the client
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.events
            .send(TransportEvent::Message(frame))
            .map_err(|_| TransportError::Closed)
    }

    /// Report a channel failure to the client
    pub fn fail(&self, error: TransportError) {
        let _ = self.events.send(TransportEvent::Error(error));
    }

    /// Close the channel
    pub fn close(self) {
        let _ = self.events.send(TransportEvent::Closed);
    }
}
