use crate::capabilities::Capabilities;
use crate::config::{NetworkMode, TransportConfig};
use crate::connection::{Connection, ConnectionDirection, ConnectionHandler};
use crate::envelope::{CloseConnectionMessage, CloseConnectionReason, HelloMessage, NetworkEnvelope};
use crate::error::{BootstrapError, DialError, SendError};
use crate::executor::SerialExecutor;
use crate::frame::{encode_frame, write_frame};
use crate::listener::{ConnectionListener, ListenerRegistry, MessageListener, SetupListener};
use crate::node_address::NodeAddress;
use crate::proxy::{ProxyProvider, SocksProxy, SocksProxySource};
use crate::server::Server;
use crate::shutdown::await_all_or_timeout;
use crate::substrate::localhost::LocalhostLauncher;
use crate::substrate::{Substrate, SubstrateLauncher};
use crate::tor::bootstrap::TorBootstrap;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    New,
    Bootstrapping,
    /// The substrate is running and the provisional address is known
    SubstrateReady,
    /// The final address is published and the node accepts connections
    Published,
    Failed,
    ShutDown,
}

/// The launcher for the configured network mode
pub fn launcher_for(config: &TransportConfig) -> Arc<dyn SubstrateLauncher> {
    match &config.network_mode {
        NetworkMode::Localhost(localhost) => Arc::new(LocalhostLauncher::new(localhost)),
        NetworkMode::Tor(tor) => Arc::new(TorBootstrap::native(tor)),
    }
}

/// Inbound and outbound connections, disjoint. A peer may be connected in both directions at the
///  same time, but there is at most one live outbound connection per peer address.
#[derive(Default)]
struct ConnectionRegistry {
    inbound: FxHashMap<String, Arc<Connection>>,
    outbound: FxHashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// A live connection to the peer, preferring outbound connections
    fn find(&self, peer: &NodeAddress) -> Option<Arc<Connection>> {
        let matching = |connections: &FxHashMap<String, Arc<Connection>>| connections.values()
            .find(|c| !c.is_stopped() && c.has_peer_address(peer))
            .cloned();
        matching(&self.outbound)
            .or_else(|| matching(&self.inbound))
    }

    fn all(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.outbound.values()
            .chain(self.inbound.values())
            .filter(|c| !c.is_stopped())
    }

    fn insert(&mut self, connection: Arc<Connection>) {
        let map = match connection.direction() {
            ConnectionDirection::Inbound => &mut self.inbound,
            ConnectionDirection::Outbound => &mut self.outbound,
        };
        map.insert(connection.uid().to_string(), connection);
    }

    fn remove(&mut self, connection: &Connection) -> bool {
        let map = match connection.direction() {
            ConnectionDirection::Inbound => &mut self.inbound,
            ConnectionDirection::Outbound => &mut self.outbound,
        };
        map.remove(connection.uid()).is_some()
    }
}

/// A peer in the overlay network: it owns the node's published endpoint, the accept loop and all
///  connections to other peers.
///
/// Sending to a peer address reuses a live connection to that peer (outbound first, then
///  inbound) or dials a new one. Dials to the same peer are serialized, and a dial that completes
///  while a connection to the peer appeared in the meantime is discarded in favor of the existing
///  connection.
pub struct TransportNode {
    config: Arc<TransportConfig>,
    launcher: Arc<dyn SubstrateLauncher>,
    listeners: Arc<ListenerRegistry>,
    handler: Arc<dyn ConnectionHandler>,

    state: watch::Sender<NodeState>,
    substrate: watch::Sender<Option<Arc<dyn Substrate>>>,
    node_address: watch::Sender<Option<NodeAddress>>,

    connections: RwLock<ConnectionRegistry>,
    server: Mutex<Option<Arc<Server>>>,
    dial_locks: Mutex<FxHashMap<NodeAddress, Arc<Mutex<()>>>>,
    setup_task: Mutex<Option<JoinHandle<()>>>,
    shut_down_in_progress: AtomicBool,
}

impl TransportNode {
    pub fn new(config: TransportConfig, launcher: Arc<dyn SubstrateLauncher>) -> Arc<TransportNode> {
        Arc::new_cyclic(|myself: &Weak<TransportNode>| TransportNode {
            config: Arc::new(config),
            launcher,
            listeners: Arc::new(ListenerRegistry::new(SerialExecutor::start())),
            handler: Arc::new(NodeConnectionHandler { node: myself.clone() }),
            state: watch::Sender::new(NodeState::New),
            substrate: watch::Sender::new(None),
            node_address: watch::Sender::new(None),
            connections: Default::default(),
            server: Default::default(),
            dial_locks: Default::default(),
            setup_task: Default::default(),
            shut_down_in_progress: AtomicBool::new(false),
        })
    }

    /// A node with the launcher for its configured network mode
    pub fn from_config(config: TransportConfig) -> Arc<TransportNode> {
        let launcher = launcher_for(&config);
        TransportNode::new(config, launcher)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Completes when the node reaches a state matching the predicate
    pub async fn wait_for_state(&self, f: impl Fn(NodeState) -> bool) -> NodeState {
        let mut receiver = self.state.subscribe();
        let state = match receiver.wait_for(|s| f(*s)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// The node's own address: provisional once the substrate is ready, final once published
    pub fn node_address(&self) -> Option<NodeAddress> {
        self.node_address.borrow().clone()
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// The serialized context all listener callbacks run on
    pub fn executor(&self) -> &SerialExecutor {
        self.listeners.executor()
    }

    pub async fn add_setup_listener(&self, listener: Arc<dyn SetupListener>) {
        self.listeners.add_setup_listener(listener).await
    }

    pub async fn remove_setup_listener(&self, listener: &Arc<dyn SetupListener>) {
        self.listeners.remove_setup_listener(listener).await
    }

    pub async fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add_connection_listener(listener).await
    }

    pub async fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.remove_connection_listener(listener).await
    }

    pub async fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.add_message_listener(listener).await
    }

    pub async fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.listeners.remove_message_listener(listener).await
    }

    /// Outbound proxies as configured, with the node's own substrate as the fallback for peer
    ///  traffic
    pub fn proxy_provider(self: &Arc<Self>) -> ProxyProvider {
        let mut provider = ProxyProvider::new(&self.config);
        provider.set_internal_proxy_source(self.clone());
        provider
    }

    fn own_hello(&self) -> HelloMessage {
        HelloMessage {
            sender_address: self.node_address(),
            capabilities: self.config.capabilities,
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shut_down_in_progress.load(Ordering::Acquire)
    }

    /// Acquires the substrate and publishes the node's endpoint, notifying setup listeners along
    ///  the way. Completes with the published address once the node accepts connections.
    pub async fn start(self: &Arc<Self>) -> Result<NodeAddress, BootstrapError> {
        let is_new = self.state.send_if_modified(|state| {
            if *state == NodeState::New {
                *state = NodeState::Bootstrapping;
                true
            }
            else {
                false
            }
        });
        if !is_new {
            warn!("node was already started ({:?})", self.state());
            return Err(BootstrapError::Config("node was already started".to_string()));
        }

        let result = self.run_setup().await;
        if let Err(e) = &result {
            error!("node setup failed: {}", e);
            self.state.send_if_modified(|state| {
                if *state == NodeState::ShutDown {
                    return false;
                }
                *state = NodeState::Failed;
                true
            });
            self.listeners.fire_setup_failed(e.to_string());
        }
        result
    }

    /// Runs [`TransportNode::start`] on a separate task, reporting its outcome to setup
    ///  listeners only. Shutting the node down cancels a setup that is still in progress.
    pub async fn start_in_background(self: &Arc<Self>) {
        let node = self.clone();
        let task = tokio::spawn(async move {
            let _ = node.start().await;
        });
        *self.setup_task.lock().await = Some(task);
    }

    #[instrument(name = "node_setup", skip_all, fields(port = self.config.service_port))]
    async fn run_setup(self: &Arc<Self>) -> Result<NodeAddress, BootstrapError> {
        self.config.validate()
            .map_err(|e| BootstrapError::Config(e.to_string()))?;

        let substrate = self.launcher.acquire(&self.listeners).await?;
        self.substrate.send_replace(Some(substrate.clone()));

        let endpoint = substrate.listen(self.config.service_port).await?;
        debug!("substrate is ready, provisional address is {}", endpoint.provisional_address);
        self.node_address.send_replace(Some(endpoint.provisional_address.clone()));
        self.state.send_replace(NodeState::SubstrateReady);
        self.listeners.fire_tor_node_ready();

        let address = endpoint.published.await?;
        self.node_address.send_replace(Some(address.clone()));

        let server = Server::start(endpoint.listener, self.own_hello(), self.handler.clone(), self.config.clone())
            .map_err(|e| BootstrapError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        let server = Arc::new(server);
        {
            let mut slot = self.server.lock().await;
            if self.is_shutting_down() {
                drop(slot);
                server.shut_down().await;
                return Err(BootstrapError::Config("node was shut down during setup".to_string()));
            }
            *slot = Some(server);
        }

        self.state.send_replace(NodeState::Published);
        info!("node is published as {}", address);
        self.listeners.fire_hidden_service_published();
        Ok(address)
    }

    /// Sends the envelope to the peer on a live connection, dialing one if there is none
    pub async fn send_message_to(&self, peer: &NodeAddress, envelope: NetworkEnvelope) -> Result<Arc<Connection>, SendError> {
        let connection = self.connection_to(peer).await?;
        connection.send(envelope).await?;
        Ok(connection)
    }

    pub async fn send_message_on(&self, connection: &Arc<Connection>, envelope: NetworkEnvelope) -> Result<Arc<Connection>, SendError> {
        if self.is_shutting_down() {
            return Err(SendError::ShutDown);
        }
        connection.send(envelope).await?;
        Ok(connection.clone())
    }

    async fn connection_to(&self, peer: &NodeAddress) -> Result<Arc<Connection>, SendError> {
        if self.is_shutting_down() {
            return Err(SendError::ShutDown);
        }
        if self.node_address.borrow().as_ref() == Some(peer) {
            return Err(SendError::OwnAddress(peer.clone()));
        }

        if let Some(connection) = self.connections.read().await.find(peer) {
            trace!("reusing {:?}", connection);
            return Ok(connection);
        }

        let dial_lock = self.dial_lock(peer).await;
        let result = {
            let _guard = dial_lock.lock().await;
            self.dial_if_unconnected(peer).await
        };
        self.release_dial_lock(peer, dial_lock).await;
        result
    }

    async fn dial_lock(&self, peer: &NodeAddress) -> Arc<Mutex<()>> {
        self.dial_locks.lock().await
            .entry(peer.clone())
            .or_default()
            .clone()
    }

    async fn release_dial_lock(&self, peer: &NodeAddress, dial_lock: Arc<Mutex<()>>) {
        let mut dial_locks = self.dial_locks.lock().await;
        // one reference in the map and ours: nobody else is waiting
        if Arc::strong_count(&dial_lock) <= 2 {
            dial_locks.remove(peer);
        }
    }

    #[instrument(name = "dial", skip_all, fields(peer = %peer))]
    async fn dial_if_unconnected(&self, peer: &NodeAddress) -> Result<Arc<Connection>, SendError> {
        // a concurrent send may have dialed the peer while we waited for the lock
        if let Some(connection) = self.connections.read().await.find(peer) {
            return Ok(connection);
        }

        let substrate = self.substrate.borrow().clone()
            .ok_or(SendError::NotReady)?;

        debug!("dialing");
        let stream = match time::timeout(self.config.dial_timeout, substrate.connect(peer)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(DialError::Timeout {
                peer: peer.clone(),
                after: self.config.dial_timeout,
            }.into()),
        };

        let connection = {
            let mut connections = self.connections.write().await;
            if self.is_shutting_down() {
                debug!("node is shutting down - discarding the newly dialed socket");
                return Err(SendError::ShutDown);
            }
            // the peer may have dialed us in the meantime: the existing connection wins
            if let Some(existing) = connections.find(peer) {
                debug!("{:?} was established while dialing - discarding the newly dialed socket", existing);
                tokio::spawn(close_surplus_stream(stream, self.config.max_frame_size));
                return Ok(existing);
            }

            let connection = Connection::start(
                stream,
                ConnectionDirection::Outbound,
                Some(peer.clone()),
                self.own_hello(),
                self.handler.clone(),
                self.config.clone(),
            );
            connections.insert(connection.clone());
            connection
        };

        info!("connected to {}", peer);
        self.listeners.fire_connection(connection.clone());
        Ok(connection)
    }

    /// All live connections, inbound and outbound
    pub async fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await
            .all()
            .cloned()
            .collect()
    }

    /// All live connections whose peer address is known
    pub async fn confirmed_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await
            .all()
            .filter(|c| c.peer_address().is_some())
            .cloned()
            .collect()
    }

    pub async fn node_addresses_of_confirmed_connections(&self) -> Vec<NodeAddress> {
        let mut addresses = self.connections.read().await
            .all()
            .filter_map(|c| c.peer_address())
            .collect::<Vec<_>>();
        addresses.sort();
        addresses.dedup();
        addresses
    }

    /// The capabilities the peer advertised on any live connection
    pub async fn find_peers_capabilities(&self, peer: &NodeAddress) -> Option<Capabilities> {
        self.connections.read().await
            .find(peer)
            .map(|c| c.peer_capabilities())
    }

    /// Stops accepting connections and closes all of them. Completes when all connections
    ///  confirmed their close or after the configured shutdown timeout, whichever comes first.
    ///  Subsequent calls have no effect.
    pub async fn shut_down(&self) {
        if self.shut_down_in_progress.swap(true, Ordering::AcqRel) {
            debug!("node is already shutting down");
            return;
        }
        info!("shutting down node {:?}", self.node_address());

        if let Some(setup_task) = self.setup_task.lock().await.take() {
            setup_task.abort();
        }

        let outbound = self.connections.read().await
            .outbound
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut shutdowns: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = Vec::new();
        if let Some(server) = self.server.lock().await.take() {
            shutdowns.push(Box::pin(async move { server.shut_down().await }));
        }
        for connection in outbound {
            shutdowns.push(Box::pin(async move {
                connection.shut_down(CloseConnectionReason::AppShutDown).await;
            }));
        }
        let num_tasks = shutdowns.len();
        let num_completed = await_all_or_timeout(shutdowns, self.config.shutdown_timeout).await;
        debug!("{} of {} shutdown tasks completed in time", num_completed, num_tasks);

        let substrate = self.substrate.send_replace(None);
        if let Some(substrate) = substrate {
            substrate.shut_down().await;
        }

        self.state.send_replace(NodeState::ShutDown);
        info!("node shut down");
    }
}

impl SocksProxySource for TransportNode {
    fn socks_proxy(&self) -> Option<SocksProxy> {
        self.substrate.borrow().as_ref()
            .and_then(|s| s.socks_proxy())
    }
}

/// Keeps the node's registry in sync with its connections and forwards their events to the
///  listeners
struct NodeConnectionHandler {
    node: Weak<TransportNode>,
}

#[async_trait]
impl ConnectionHandler for NodeConnectionHandler {
    async fn on_inbound_connection(&self, connection: &Arc<Connection>) {
        let Some(node) = self.node.upgrade() else { return; };
        {
            let mut connections = node.connections.write().await;
            if connection.is_stopped() {
                // closed before it was registered, nothing to clean up later
                return;
            }
            connections.insert(connection.clone());
        }
        node.listeners.fire_connection(connection.clone());
    }

    async fn on_peer_address_resolved(&self, connection: &Arc<Connection>) {
        trace!("peer address of {:?} resolved", connection);
    }

    fn on_envelope(&self, envelope: NetworkEnvelope, connection: &Arc<Connection>) {
        if let Some(node) = self.node.upgrade() {
            node.listeners.fire_message(envelope, connection.clone());
        }
    }

    async fn on_closed(&self, reason: CloseConnectionReason, connection: &Arc<Connection>) {
        let Some(node) = self.node.upgrade() else { return; };
        if node.connections.write().await.remove(connection) {
            debug!("removed {:?} ({:?})", connection, reason);
        }
        node.listeners.fire_disconnect(reason, connection.clone());
    }
}

/// Lets the peer of a socket that lost the dial race know why it is closed before it ever said hello
async fn close_surplus_stream(mut stream: TcpStream, max_frame_size: usize) {
    let envelope = NetworkEnvelope::CloseConnection(CloseConnectionMessage { reason: CloseConnectionReason::DuplicatePeer });
    match encode_frame(&envelope, max_frame_size) {
        Ok(frame) => {
            if let Err(e) = write_frame(&mut stream, &frame).await {
                debug!("could not send {:?} on a surplus socket: {}", envelope, e);
            }
        }
        Err(e) => warn!("could not encode {:?}: {}", envelope, e),
    }
    let _ = stream.shutdown().await;
}
