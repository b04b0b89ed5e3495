use crate::connection::Connection;
use crate::envelope::{CloseConnectionReason, NetworkEnvelope};
use crate::executor::SerialExecutor;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Lifecycle of the node's substrate and hidden endpoint
#[cfg_attr(test, automock)]
pub trait SetupListener: Send + Sync + 'static {
    /// The substrate is reachable and a provisional address is known
    fn on_tor_node_ready(&self) {}
    /// The final address is published and the node accepts connections
    fn on_hidden_service_published(&self) {}
    fn on_setup_failed(&self, _error: &str) {}
    /// The substrate failed with a retryable error, the operator may provide different bridges
    ///  before the next attempt
    fn on_request_custom_bridges(&self) {}
}

#[cfg_attr(test, automock)]
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_connection(&self, connection: &Arc<Connection>);
    fn on_disconnect(&self, reason: CloseConnectionReason, connection: &Arc<Connection>);
}

#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, envelope: &NetworkEnvelope, connection: &Arc<Connection>);
}

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

async fn add_listener<T: ?Sized>(listeners: &RwLock<Vec<Arc<T>>>, listener: Arc<T>, kind: &str) {
    let mut listeners = listeners.write().await;
    if listeners.iter().any(|l| same_listener(l, &listener)) {
        warn!("{} listener was already registered - ignoring", kind);
        return;
    }
    listeners.push(listener);
}

async fn remove_listener<T: ?Sized>(listeners: &RwLock<Vec<Arc<T>>>, listener: &Arc<T>, kind: &str) {
    let mut listeners = listeners.write().await;
    let len_before = listeners.len();
    listeners.retain(|l| !same_listener(l, listener));
    if listeners.len() == len_before {
        debug!("{} listener to be removed was not registered", kind);
    }
}

/// Fan-out of setup, connection and message events. All listeners are invoked on the node's
///  [`SerialExecutor`], in the order in which events are fired.
pub struct ListenerRegistry {
    executor: SerialExecutor,
    setup_listeners: RwLock<Vec<Arc<dyn SetupListener>>>,
    connection_listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    message_listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
}

impl ListenerRegistry {
    pub fn new(executor: SerialExecutor) -> ListenerRegistry {
        ListenerRegistry {
            executor,
            setup_listeners: Default::default(),
            connection_listeners: Default::default(),
            message_listeners: Default::default(),
        }
    }

    pub fn executor(&self) -> &SerialExecutor {
        &self.executor
    }

    pub async fn add_setup_listener(&self, listener: Arc<dyn SetupListener>) {
        add_listener(&self.setup_listeners, listener, "setup").await
    }

    pub async fn remove_setup_listener(&self, listener: &Arc<dyn SetupListener>) {
        remove_listener(&self.setup_listeners, listener, "setup").await
    }

    pub async fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        add_listener(&self.connection_listeners, listener, "connection").await
    }

    pub async fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        remove_listener(&self.connection_listeners, listener, "connection").await
    }

    pub async fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        add_listener(&self.message_listeners, listener, "message").await
    }

    pub async fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        remove_listener(&self.message_listeners, listener, "message").await
    }

    fn fire_setup(self: &Arc<Self>, f: impl Fn(&dyn SetupListener) + Send + 'static) {
        let registry = self.clone();
        self.executor.execute(async move {
            let listeners = registry.setup_listeners.read().await.clone();
            for l in listeners {
                f(l.as_ref());
            }
        });
    }

    pub fn fire_tor_node_ready(self: &Arc<Self>) {
        self.fire_setup(|l| l.on_tor_node_ready());
    }

    pub fn fire_hidden_service_published(self: &Arc<Self>) {
        self.fire_setup(|l| l.on_hidden_service_published());
    }

    pub fn fire_setup_failed(self: &Arc<Self>, error: String) {
        self.fire_setup(move |l| l.on_setup_failed(&error));
    }

    pub fn fire_request_custom_bridges(self: &Arc<Self>) {
        self.fire_setup(|l| l.on_request_custom_bridges());
    }

    pub fn fire_connection(self: &Arc<Self>, connection: Arc<Connection>) {
        let registry = self.clone();
        self.executor.execute(async move {
            let listeners = registry.connection_listeners.read().await.clone();
            for l in listeners {
                l.on_connection(&connection);
            }
        });
    }

    pub fn fire_disconnect(self: &Arc<Self>, reason: CloseConnectionReason, connection: Arc<Connection>) {
        let registry = self.clone();
        self.executor.execute(async move {
            let listeners = registry.connection_listeners.read().await.clone();
            for l in listeners {
                l.on_disconnect(reason, &connection);
            }
        });
    }

    pub fn fire_message(self: &Arc<Self>, envelope: NetworkEnvelope, connection: Arc<Connection>) {
        let registry = self.clone();
        self.executor.execute(async move {
            let listeners = registry.message_listeners.read().await.clone();
            for l in listeners {
                l.on_message(&envelope, &connection).await;
            }
        });
    }
}
