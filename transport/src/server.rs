use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionDirection, ConnectionHandler};
use crate::envelope::{CloseConnectionReason, HelloMessage};
use crate::shutdown::await_all_or_timeout;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tracing::{debug, info, warn};

/// The accept loop on the node's listening socket. Every accepted socket becomes an inbound
///  [`Connection`] that is handed to the [`ConnectionHandler`].
pub struct Server {
    local_addr: SocketAddr,
    terminated: AtomicBool,
    cancel_sender: broadcast::Sender<()>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<RwLock<Vec<Arc<Connection>>>>,
    config: Arc<TransportConfig>,
}

impl Server {
    pub fn start(
        listener: TcpListener,
        own_hello: HelloMessage,
        handler: Arc<dyn ConnectionHandler>,
        config: Arc<TransportConfig>,
    ) -> anyhow::Result<Server> {
        let local_addr = listener.local_addr()?;
        let (cancel_sender, cancel_receiver) = broadcast::channel(1);
        let connections: Arc<RwLock<Vec<Arc<Connection>>>> = Default::default();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            cancel_receiver,
            connections.clone(),
            own_hello,
            handler,
            config.clone(),
        ));
        info!("server listening on {:?}", local_addr);

        Ok(Server {
            local_addr,
            terminated: AtomicBool::new(false),
            cancel_sender,
            accept_task: Mutex::new(Some(accept_task)),
            connections,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Stops accepting and closes the listening socket
    pub async fn stop_accepting(&self) {
        let _ = self.cancel_sender.send(());
        if let Some(accept_task) = self.accept_task.lock().await.take() {
            if let Err(e) = accept_task.await {
                debug!("accept loop on {:?} was already closed: {}", self.local_addr, e);
            }
        }
    }

    /// Stops accepting, then shuts down all connections accepted by this server. Completes when
    ///  all of them confirmed their close, or after the configured shutdown timeout. Subsequent
    ///  calls have no effect.
    pub async fn shut_down(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            debug!("server on {:?} is already terminated", self.local_addr);
            return;
        }

        self.stop_accepting().await;

        let connections = std::mem::take(&mut *self.connections.write().await);
        let shutdowns = connections.into_iter()
            .map(|c| async move {
                c.shut_down(CloseConnectionReason::ServerTerminated).await;
            })
            .collect::<Vec<_>>();
        let num_connections = shutdowns.len();

        let num_closed = await_all_or_timeout(shutdowns, self.config.shutdown_timeout).await;
        info!("server on {:?} terminated, {} of {} connections confirmed their close", self.local_addr, num_closed, num_connections);
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut cancel_receiver: broadcast::Receiver<()>,
    connections: Arc<RwLock<Vec<Arc<Connection>>>>,
    own_hello: HelloMessage,
    handler: Arc<dyn ConnectionHandler>,
    config: Arc<TransportConfig>,
) {
    loop {
        select! {
            _ = cancel_receiver.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    debug!("accepted connection from {:?}", remote_addr);
                    let connection = Connection::start(stream, ConnectionDirection::Inbound, None, own_hello.clone(), handler.clone(), config.clone());
                    {
                        let mut connections = connections.write().await;
                        connections.retain(|c| !c.is_stopped());
                        connections.push(connection.clone());
                    }
                    handler.on_inbound_connection(&connection).await;
                }
                Err(e) => {
                    // e.g. out of file descriptors - keep the loop alive without spinning
                    warn!("error accepting connection: {}", e);
                    time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("accept loop terminated, closing the listening socket");
}
