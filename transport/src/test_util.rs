use crate::capabilities::Capabilities;
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionDirection, ConnectionHandler};
use crate::envelope::{CloseConnectionReason, HelloMessage, NetworkEnvelope};
use crate::node_address::NodeAddress;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

pub fn test_config() -> Arc<TransportConfig> {
    Arc::new(TransportConfig::new_localhost(0))
}

pub fn hello(port: u16) -> HelloMessage {
    HelloMessage {
        sender_address: Some(NodeAddress::localhost(port)),
        capabilities: Capabilities::default_for_peer(),
    }
}

/// Records everything a connection reports to its owner
pub struct RecordingConnectionHandler {
    envelopes: Mutex<Vec<NetworkEnvelope>>,
    closed: Mutex<Vec<CloseConnectionReason>>,
    resolved: AtomicUsize,
    inbound: Mutex<Vec<Arc<Connection>>>,
    notify: Notify,
}

impl RecordingConnectionHandler {
    pub fn new() -> Arc<RecordingConnectionHandler> {
        Arc::new(RecordingConnectionHandler {
            envelopes: Default::default(),
            closed: Default::default(),
            resolved: AtomicUsize::new(0),
            inbound: Default::default(),
            notify: Notify::new(),
        })
    }

    pub fn closed(&self) -> Vec<CloseConnectionReason> {
        self.closed.lock().unwrap().clone()
    }

    async fn wait_until<T>(&self, f: impl Fn(&Self) -> Option<T>) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(result) = f(self) {
                return result;
            }
            tokio::time::timeout(Duration::from_secs(5), notified).await
                .expect("timed out waiting for connection events");
        }
    }

    pub async fn wait_for_envelopes(&self, n: usize) -> Vec<NetworkEnvelope> {
        self.wait_until(|s| {
            let envelopes = s.envelopes.lock().unwrap();
            (envelopes.len() >= n).then(|| envelopes.clone())
        }).await
    }

    pub async fn wait_for_closed(&self, n: usize) -> Vec<CloseConnectionReason> {
        self.wait_until(|s| {
            let closed = s.closed.lock().unwrap();
            (closed.len() >= n).then(|| closed.clone())
        }).await
    }

    pub async fn wait_for_inbound(&self, n: usize) -> Vec<Arc<Connection>> {
        self.wait_until(|s| {
            let inbound = s.inbound.lock().unwrap();
            (inbound.len() >= n).then(|| inbound.clone())
        }).await
    }

    pub async fn wait_for_resolved(&self, n: usize) {
        self.wait_until(|s| (s.resolved.load(Ordering::SeqCst) >= n).then_some(())).await
    }
}

#[async_trait]
impl ConnectionHandler for RecordingConnectionHandler {
    async fn on_inbound_connection(&self, connection: &Arc<Connection>) {
        self.inbound.lock().unwrap().push(connection.clone());
        self.notify.notify_waiters();
    }

    async fn on_peer_address_resolved(&self, _connection: &Arc<Connection>) {
        self.resolved.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn on_envelope(&self, envelope: NetworkEnvelope, _connection: &Arc<Connection>) {
        self.envelopes.lock().unwrap().push(envelope);
        self.notify.notify_waiters();
    }

    async fn on_closed(&self, reason: CloseConnectionReason, _connection: &Arc<Connection>) {
        self.closed.lock().unwrap().push(reason);
        self.notify.notify_waiters();
    }
}

/// An outbound connection from 'localhost:1111' and the corresponding inbound connection at
///  'localhost:2222', connected over a real localhost socket
pub async fn connected_pair(
    client_handler: Arc<RecordingConnectionHandler>,
    server_handler: Arc<RecordingConnectionHandler>,
) -> (Arc<Connection>, Arc<Connection>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client_stream = TcpStream::connect(addr).await.unwrap();
    let (server_stream, _) = listener.accept().await.unwrap();

    let client = Connection::start(client_stream, ConnectionDirection::Outbound, Some(NodeAddress::localhost(2222)), hello(1111), client_handler, test_config());
    let server = Connection::start(server_stream, ConnectionDirection::Inbound, None, hello(2222), server_handler, test_config());
    (client, server)
}
