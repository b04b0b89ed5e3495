//! The pluggable network layer beneath the transport node: either a plain localhost TCP
//!  substrate or an onion routing instance.

pub mod localhost;
pub mod onion;

use crate::error::{BootstrapError, DialError};
use crate::listener::ListenerRegistry;
use crate::node_address::NodeAddress;
use crate::proxy::SocksProxy;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

pub type PublishFuture = Pin<Box<dyn Future<Output = Result<NodeAddress, BootstrapError>> + Send>>;

/// A listening endpoint whose publication is still in progress.
pub struct HiddenEndpoint {
    /// The address under which the endpoint will be reachable once it is published
    pub provisional_address: NodeAddress,
    /// The local socket that published connections are forwarded to
    pub listener: TcpListener,
    /// Resolves to the final address once the endpoint is reachable. This can take tens of
    ///  seconds.
    pub published: PublishFuture,
}

#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    async fn connect(&self, peer: &NodeAddress) -> Result<TcpStream, DialError>;

    async fn listen(&self, service_port: u16) -> Result<HiddenEndpoint, BootstrapError>;

    /// A proxy for outbound traffic through the substrate, if it has one
    fn socks_proxy(&self) -> Option<SocksProxy>;

    async fn shut_down(&self);
}

/// Acquires a running substrate, reporting progress to setup listeners
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SubstrateLauncher: Send + Sync + 'static {
    async fn acquire(&self, listeners: &Arc<ListenerRegistry>) -> Result<Arc<dyn Substrate>, BootstrapError>;
}
