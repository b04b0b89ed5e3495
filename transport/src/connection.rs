use crate::capabilities::Capabilities;
use crate::config::TransportConfig;
use crate::envelope::{CloseConnectionMessage, CloseConnectionReason, HelloMessage, NetworkEnvelope};
use crate::error::SendError;
use crate::frame::{decode_frame, encode_frame, read_frame, write_frame};
use crate::node_address::NodeAddress;
use async_trait::async_trait;
use bytes::BytesMut;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::{select, time};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

/// The connection's link back to its owner (typically the transport node)
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// An inbound connection was accepted and started
    async fn on_inbound_connection(&self, _connection: &Arc<Connection>) {}
    /// An inbound connection learned its peer's address
    async fn on_peer_address_resolved(&self, connection: &Arc<Connection>);
    /// An application envelope was received
    fn on_envelope(&self, envelope: NetworkEnvelope, connection: &Arc<Connection>);
    /// Called exactly once per connection, after its socket is closed
    async fn on_closed(&self, reason: CloseConnectionReason, connection: &Arc<Connection>);
}

enum WriteCommand {
    Frame(BytesMut, oneshot::Sender<std::io::Result<()>>),
    Close(oneshot::Sender<()>),
}

/// One bidirectional session with a peer, owning one socket.
///
/// Writes are queued and performed by a dedicated task, so envelopes are written in the order of
///  the [`Connection::send`] calls. Another task reads and decodes frames.
pub struct Connection {
    uid: String,
    direction: ConnectionDirection,
    remote_socket_addr: Option<SocketAddr>,
    peer_address: watch::Sender<Option<NodeAddress>>,
    peer_capabilities: watch::Sender<Capabilities>,
    stopped: AtomicBool,
    closing: watch::Sender<bool>,
    outbox: mpsc::UnboundedSender<WriteCommand>,
    handler: Arc<dyn ConnectionHandler>,
    config: Arc<TransportConfig>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{} {:?} peer={:?} stopped={}}}",
            self.uid,
            self.direction,
            self.peer_address.borrow().as_ref().map(|a| a.to_string()),
            self.is_stopped(),
        )
    }
}

impl Connection {
    /// Takes ownership of an established socket, sends our `Hello` and starts the read and write
    ///  tasks. `peer_address` is known for outbound connections; inbound connections learn it
    ///  from the first envelope that reveals it.
    pub fn start(
        stream: TcpStream,
        direction: ConnectionDirection,
        peer_address: Option<NodeAddress>,
        own_hello: HelloMessage,
        handler: Arc<dyn ConnectionHandler>,
        config: Arc<TransportConfig>,
    ) -> Arc<Connection> {
        let remote_socket_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (outbox, commands) = mpsc::unbounded_channel();
        let (closing, _) = watch::channel(false);

        let connection = Arc::new(Connection {
            uid: Uuid::new_v4().to_string(),
            direction,
            remote_socket_addr,
            peer_address: watch::Sender::new(peer_address),
            peer_capabilities: watch::Sender::new(Capabilities::empty()),
            stopped: AtomicBool::new(false),
            closing,
            outbox,
            handler,
            config,
        });
        debug!("starting {:?} to {:?}", connection, remote_socket_addr);

        tokio::spawn(run_writer(write_half, commands, connection.closing.subscribe()));
        connection.enqueue(NetworkEnvelope::Hello(own_hello));
        tokio::spawn(run_reader(connection.clone(), read_half));

        connection
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn remote_socket_addr(&self) -> Option<SocketAddr> {
        self.remote_socket_addr
    }

    pub fn peer_address(&self) -> Option<NodeAddress> {
        self.peer_address.borrow().clone()
    }

    pub fn has_peer_address(&self, address: &NodeAddress) -> bool {
        self.peer_address.borrow().as_ref() == Some(address)
    }

    pub fn peer_capabilities(&self) -> Capabilities {
        *self.peer_capabilities.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Queues the envelope and waits until it is written to the socket
    pub async fn send(self: &Arc<Self>, envelope: NetworkEnvelope) -> Result<(), SendError> {
        if self.is_stopped() {
            return Err(SendError::ConnectionClosed(self.uid.clone()));
        }

        let frame = encode_frame(&envelope, self.config.max_frame_size)
            .map_err(|e| SendError::Encoding(e.to_string()))?;

        let (reply_sender, reply_receiver) = oneshot::channel();
        self.outbox.send(WriteCommand::Frame(frame, reply_sender))
            .map_err(|_| SendError::ConnectionClosed(self.uid.clone()))?;

        match reply_receiver.await {
            Ok(Ok(())) => {
                trace!("sent {:?} envelope on {:?}", envelope.kind(), self);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("writing to {:?} failed: {} - closing", self, e);
                let connection = self.clone();
                tokio::spawn(async move { connection.shut_down(CloseConnectionReason::Reset).await });
                Err(SendError::Io(e))
            }
            Err(_) => Err(SendError::ConnectionClosed(self.uid.clone())),
        }
    }

    /// Queues an envelope without waiting for it to be written
    fn enqueue(&self, envelope: NetworkEnvelope) {
        match encode_frame(&envelope, self.config.max_frame_size) {
            Ok(frame) => {
                let (reply_sender, _) = oneshot::channel();
                let _ = self.outbox.send(WriteCommand::Frame(frame, reply_sender));
            }
            Err(e) => warn!("failed to encode {:?} envelope: {}", envelope.kind(), e),
        }
    }

    /// Closes the connection, notifying the peer if the reason calls for it. Only the first call
    ///  has an effect and returns `true`; it completes when the socket is closed, or after the
    ///  configured timeout.
    pub async fn shut_down(self: &Arc<Self>, reason: CloseConnectionReason) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            trace!("{:?} is already shutting down", self);
            return false;
        }
        debug!("shutting down {:?}: {:?}", self, reason);

        if reason.notifies_peer() {
            self.enqueue(NetworkEnvelope::CloseConnection(CloseConnectionMessage { reason }));
        }

        let (reply_sender, reply_receiver) = oneshot::channel();
        if self.outbox.send(WriteCommand::Close(reply_sender)).is_ok() {
            if time::timeout(self.config.connection_shutdown_timeout, reply_receiver).await.is_err() {
                warn!("{:?} did not close its socket within {:?} - abandoning it", self, self.config.connection_shutdown_timeout);
            }
        }

        self.closing.send_replace(true);
        self.handler.on_closed(reason, self).await;
        true
    }

    async fn on_received(self: &Arc<Self>, envelope: NetworkEnvelope) -> Option<CloseConnectionReason> {
        match &envelope {
            NetworkEnvelope::Hello(hello) => {
                trace!("received hello on {:?}: {:?}", self, hello);
                self.peer_capabilities.send_replace(hello.capabilities);
                if let Some(addr) = &hello.sender_address {
                    self.resolve_peer_address(addr).await;
                }
                None
            }
            NetworkEnvelope::CloseConnection(close) => {
                info!("peer closed {:?}: {:?}", self, close.reason);
                Some(CloseConnectionReason::ClosedByPeer)
            }
            NetworkEnvelope::Sealed(sealed) => {
                let sender_address = sealed.sender_address.clone();
                self.resolve_peer_address(&sender_address).await;
                self.handler.on_envelope(envelope, self);
                None
            }
        }
    }

    async fn resolve_peer_address(self: &Arc<Self>, address: &NodeAddress) {
        let newly_resolved = self.peer_address.send_if_modified(|current| {
            match current {
                None => {
                    *current = Some(address.clone());
                    true
                }
                Some(known) => {
                    if known != address {
                        debug!("{:?}: peer announces {} - keeping the known address", self.uid, address);
                    }
                    false
                }
            }
        });

        if newly_resolved {
            debug!("resolved peer address of {:?}", self);
            self.handler.on_peer_address_resolved(self).await;
        }
    }
}

async fn run_writer(mut write_half: OwnedWriteHalf, mut commands: mpsc::UnboundedReceiver<WriteCommand>, mut closing: watch::Receiver<bool>) {
    loop {
        let command = select! {
            _ = closing.wait_for(|c| *c) => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            WriteCommand::Frame(frame, reply) => {
                let result = select! {
                    _ = closing.wait_for(|c| *c) => break,
                    result = write_frame(&mut write_half, &frame) => result,
                };
                let failed = result.is_err();
                let _ = reply.send(result);
                if failed {
                    break;
                }
            }
            WriteCommand::Close(reply) => {
                let _ = write_half.shutdown().await;
                let _ = reply.send(());
                break;
            }
        }
    }
    trace!("writer terminated");
}

async fn run_reader(connection: Arc<Connection>, mut read_half: OwnedReadHalf) {
    let mut closing = connection.closing.subscribe();
    let max_frame_size = connection.config.max_frame_size;

    let reason = loop {
        let frame = select! {
            _ = closing.wait_for(|c| *c) => {
                trace!("reader of {:?} terminated", connection);
                return;
            }
            frame = read_frame(&mut read_half, max_frame_size) => frame,
        };

        match frame {
            Ok(Some(frame)) => match decode_frame(&frame) {
                Ok(envelope) => {
                    if let Some(reason) = connection.on_received(envelope).await {
                        break reason;
                    }
                }
                Err(e) => {
                    warn!("received an invalid frame on {:?}: {}", connection, e);
                    break CloseConnectionReason::InvalidFrame;
                }
            },
            Ok(None) => {
                debug!("{:?} was closed by the peer without notice", connection);
                break CloseConnectionReason::Reset;
            }
            Err(e) => {
                if e.downcast_ref::<std::io::Error>().is_some() {
                    debug!("reading from {:?} failed: {}", connection, e);
                    break CloseConnectionReason::Reset;
                }
                warn!("{:?}: {}", connection, e);
                break CloseConnectionReason::InvalidFrame;
            }
        }
    };

    connection.shut_down(reason).await;
}
