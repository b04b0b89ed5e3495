use crate::config::LocalhostConfig;
use crate::error::{BootstrapError, DialError};
use crate::listener::ListenerRegistry;
use crate::node_address::NodeAddress;
use crate::proxy::SocksProxy;
use crate::substrate::{HiddenEndpoint, Substrate, SubstrateLauncher};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, info};

/// Plain TCP on the loopback interface, simulating the delays of an anonymity substrate
pub struct LocalhostSubstrate {
    hidden_service_delay: Duration,
}

impl LocalhostSubstrate {
    pub fn new(hidden_service_delay: Duration) -> LocalhostSubstrate {
        LocalhostSubstrate { hidden_service_delay }
    }
}

#[async_trait]
impl Substrate for LocalhostSubstrate {
    async fn connect(&self, peer: &NodeAddress) -> Result<TcpStream, DialError> {
        TcpStream::connect((peer.host_name(), peer.port())).await
            .map_err(|e| DialError::Unreachable {
                peer: peer.clone(),
                reason: e.to_string(),
            })
    }

    async fn listen(&self, service_port: u16) -> Result<HiddenEndpoint, BootstrapError> {
        let listener = TcpListener::bind(("127.0.0.1", service_port)).await?;
        let address = NodeAddress::localhost(listener.local_addr()?.port());
        debug!("listening on {}", address);

        let delay = self.hidden_service_delay;
        let published_address = address.clone();
        Ok(HiddenEndpoint {
            provisional_address: address,
            listener,
            published: Box::pin(async move {
                time::sleep(delay).await;
                Ok(published_address)
            }),
        })
    }

    fn socks_proxy(&self) -> Option<SocksProxy> {
        None
    }

    async fn shut_down(&self) {}
}

pub struct LocalhostLauncher {
    tor_node_ready_delay: Duration,
    hidden_service_delay: Duration,
}

impl LocalhostLauncher {
    pub fn new(config: &LocalhostConfig) -> LocalhostLauncher {
        LocalhostLauncher {
            tor_node_ready_delay: config.simulated_tor_node_ready_delay,
            hidden_service_delay: config.simulated_hidden_service_ready_delay,
        }
    }
}

#[async_trait]
impl SubstrateLauncher for LocalhostLauncher {
    async fn acquire(&self, _listeners: &Arc<ListenerRegistry>) -> Result<Arc<dyn Substrate>, BootstrapError> {
        time::sleep(self.tor_node_ready_delay).await;
        info!("simulated localhost substrate is ready");
        Ok(Arc::new(LocalhostSubstrate::new(self.hidden_service_delay)))
    }
}
