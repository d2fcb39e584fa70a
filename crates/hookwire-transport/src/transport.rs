//! Transport abstraction and the TCP implementation

use async_trait::async_trait;
use crate::{Channel, TransportError};
#[cfg(feature = "tcp")]
use crate::{ChannelSender, TransportEvent};
use std::time::Duration;
#[cfg(feature = "tcp")]
use tracing::{debug, info, warn};

/// Transport abstraction for different connection types
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new channel to the remote end.
    ///
    /// An error here means the channel never opened; failures after this
    /// returns are reported as channel events.
    async fn open(&self) -> Result<Channel, TransportError>;

    /// Describe the remote end for logging
    fn describe(&self) -> String;
}

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Largest frame accepted from the peer
    pub max_frame_length: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 27042,
            connect_timeout: Duration::from_secs(10),
            max_frame_length: 64 * 1024 * 1024,
        }
    }
}

/// TCP transport with length-delimited framing
#[cfg(feature = "tcp")]
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// TCP configuration
    config: TcpConfig,
}

#[cfg(feature = "tcp")]
impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Pump frames between the socket and the channel until either side ends
    async fn run(
        framed: tokio_util::codec::Framed<tokio::net::TcpStream, tokio_util::codec::LengthDelimitedCodec>,
        mut outbound: tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>,
        events: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
    ) {
        use futures::{SinkExt, StreamExt};

        let (mut sink, mut stream) = framed.split();

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                warn!("Failed to write frame: {}", e);
                                let _ = events.send(TransportEvent::Error(e.into()));
                                break;
                            }
                        }
                        None => {
                            debug!("All channel senders dropped");
                            let _ = sink.close().await;
                            break;
                        }
                    }
                }

                item = stream.next() => {
                    match item {
                        Some(Ok(frame)) => {
                            if events.send(TransportEvent::Message(frame.freeze())).is_err() {
                                debug!("Event receiver dropped");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Failed to read frame: {}", e);
                            let _ = events.send(TransportEvent::Error(e.into()));
                            break;
                        }
                        None => {
                            debug!("Peer closed the connection");
                            break;
                        }
                    }
                }
            }
        }

        let _ = events.send(TransportEvent::Closed);
    }
}

#[cfg(feature = "tcp")]
#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self) -> Result<Channel, TransportError> {
        use tokio_util::codec::{Framed, LengthDelimitedCodec};

        info!("Connecting to {}:{}", self.config.host, self.config.port);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            tokio::net::TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Connection(format!("Failed to connect: {}", e)))?;

        stream.set_nodelay(true)?;

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.config.max_frame_length)
            .new_codec();
        let framed = Framed::new(stream, codec);

        let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(Self::run(framed, out_rx, ev_tx));

        info!("Connected to {}:{}", self.config.host, self.config.port);
        Ok(Channel::new(ChannelSender::new(out_tx), ev_rx))
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.config.host, self.config.port)
    }
}
