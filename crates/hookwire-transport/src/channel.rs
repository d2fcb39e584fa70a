//! Open bidirectional channels

use crate::TransportError;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// Events emitted by an open channel
#[derive(Debug)]
pub enum TransportEvent {
    /// A frame arrived from the remote end
    Message(Bytes),
    /// The channel failed; a `Closed` event follows
    Error(TransportError),
    /// The channel is closed and will emit nothing more
    Closed,
}

/// Cloneable handle for writing frames to a channel
#[derive(Debug, Clone)]
pub struct ChannelSender {
    /// Outbound frame queue drained by the transport
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelSender {
    /// Wrap an outbound frame queue
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queue a frame for sending
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    /// Whether the transport side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open channel: a frame sender plus the stream of inbound events
#[derive(Debug)]
pub struct Channel {
    /// Outbound side
    sender: ChannelSender,
    /// Inbound events
    events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Set once `Closed` has been observed
    closed: bool,
}

impl Channel {
    /// Create a channel from its two halves
    pub fn new(sender: ChannelSender, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self {
            sender,
            events,
            closed: false,
        }
    }

    /// Get a sender for this channel
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Wait for the next event.
    ///
    /// Once the event source is gone this keeps returning `Closed`.
    pub async fn next_event(&mut self) -> TransportEvent {
        if self.closed {
            return TransportEvent::Closed;
        }
        match self.events.recv().await {
            Some(TransportEvent::Closed) | None => {
                debug!("Channel closed");
                self.closed = true;
                TransportEvent::Closed
            }
            Some(event) => event,
        }
    }

    /// Split into sender and event receiver
    pub fn into_parts(self) -> (ChannelSender, mpsc::UnboundedReceiver<TransportEvent>) {
        (self.sender, self.events)
    }
}
