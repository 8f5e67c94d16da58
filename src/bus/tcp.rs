//! Framed TCP bus.
//!
//! A subscriber connects to a publisher, sends one `Subscribe` frame with its
//! topic prefixes, then receives `Message` frames. The publisher filters by
//! topic before writing.

use crate::bus::wire::{read_frame, read_json, write_json, FrameType};
use crate::bus::{matches_any, Connector, Publisher, Subscriber};
use crate::error::{FerryError, Result};
use crate::message::Message;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered messages per subscription before the reader task waits
pub const SUBSCRIBER_CHANNEL_SIZE: usize = 1024;

/// Messages a slow subscriber may lag behind before it starts losing them
pub const PUBLISHER_CHANNEL_SIZE: usize = 4096;

/// Default bound on establishing a subscription
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Subscriber side
// =============================================================================

#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn subscribe(&self, address: &str, topics: &[String]) -> Result<Arc<dyn Subscriber>> {
        let subscriber = TcpSubscriber::connect(address, topics, self.connect_timeout).await?;
        Ok(Arc::new(subscriber))
    }
}

type Received = Result<Option<Message>>;

pub struct TcpSubscriber {
    address: String,
    // Frames are decoded by a background task; receiving from the channel
    // is cancel-safe where reading a frame off the socket is not.
    messages: Mutex<mpsc::Receiver<Received>>,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl TcpSubscriber {
    pub async fn connect(address: &str, topics: &[String], connect_timeout: Duration) -> Result<Self> {
        let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| FerryError::RequestTimeout {
                address: address.to_string(),
                timeout: connect_timeout,
            })??;
        stream.set_nodelay(true)?;

        write_json(&mut stream, FrameType::Subscribe, topics).await?;
        debug!(%address, ?topics, "Subscribed");

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_SIZE);
        let reader = tokio::spawn(read_messages(stream, address.to_string(), tx));

        Ok(Self {
            address: address.to_string(),
            messages: Mutex::new(rx),
            closed: CancellationToken::new(),
            reader,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn closed_error(&self) -> FerryError {
        FerryError::SubscriptionClosed {
            address: self.address.clone(),
        }
    }
}

async fn read_messages(mut stream: TcpStream, address: String, tx: mpsc::Sender<Received>) {
    loop {
        let item = match read_frame(&mut stream).await {
            Ok((FrameType::Message, payload)) => match Message::decode(&payload) {
                Ok(message) => Ok(Some(message)),
                Err(e) => {
                    warn!(%address, error = %e, "Dropping malformed message");
                    Ok(None)
                }
            },
            Ok((frame_type, _)) => {
                debug!(%address, ?frame_type, "Ignoring unexpected frame");
                Ok(None)
            }
            Err(FerryError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(FerryError::SubscriptionClosed {
                    address: address.clone(),
                })
            }
            Err(e) => Err(e),
        };

        let fatal = item.is_err();
        if tx.send(item).await.is_err() || fatal {
            return;
        }
    }
}

#[async_trait]
impl Subscriber for TcpSubscriber {
    async fn recv(&self) -> Result<Option<Message>> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        let mut messages = self.messages.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(self.closed_error()),
            item = messages.recv() => item.unwrap_or_else(|| Err(self.closed_error())),
        }
    }

    fn close(&self) {
        self.closed.cancel();
        self.reader.abort();
    }
}

impl Drop for TcpSubscriber {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// =============================================================================
// Publisher side
// =============================================================================

pub struct TcpPublisher {
    local_addr: SocketAddr,
    sender: broadcast::Sender<Arc<Message>>,
    acceptor: JoinHandle<()>,
}

impl TcpPublisher {
    /// Bind and start accepting subscribers. Port 0 picks an ephemeral port.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (sender, _) = broadcast::channel(PUBLISHER_CHANNEL_SIZE);
        let acceptor = tokio::spawn(accept_subscribers(listener, sender.clone()));

        debug!(%local_addr, "Publisher listening");
        Ok(Self {
            local_addr,
            sender,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_subscribers(listener: TcpListener, sender: broadcast::Sender<Arc<Message>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let rx = sender.subscribe();
                tokio::spawn(serve_subscriber(stream, peer, rx));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept subscriber");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_subscriber(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Arc<Message>>,
) {
    let topics: Vec<String> = match read_json(&mut stream, FrameType::Subscribe).await {
        Ok(topics) => topics,
        Err(e) => {
            debug!(%peer, error = %e, "Subscriber handshake failed");
            return;
        }
    };
    debug!(%peer, ?topics, "Subscriber connected");

    loop {
        match rx.recv().await {
            Ok(message) => {
                if !matches_any(&topics, &message.topic) {
                    continue;
                }
                if let Err(e) = write_json(&mut stream, FrameType::Message, message.as_ref()).await {
                    debug!(%peer, error = %e, "Subscriber disconnected");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%peer, skipped, "Subscriber lagging, messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[async_trait]
impl Publisher for TcpPublisher {
    async fn publish(&self, message: Message) -> Result<()> {
        // No connected subscribers is not an error for a bus.
        let _ = self.sender.send(Arc::new(message));
        Ok(())
    }
}

impl Drop for TcpPublisher {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}
