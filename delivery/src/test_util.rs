use crate::config::DeliveryConfig;
use crate::crypto::{EnvelopeCrypto, PubKeyRing};
use crate::delivery_service::{DeliveryService, EnvelopeTransport};
use crate::mailbox::MailboxStore;
use crate::message::{AckSourceType, DirectMessage};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, Weak};
use transport::envelope::{MessageUid, NetworkEnvelope};
use transport::error::SendError;
use transport::executor::SerialExecutor;
use transport::node_address::NodeAddress;

pub fn direct_message(sender: NodeAddress, correlation_id: &str) -> DirectMessage {
    DirectMessage {
        uid: MessageUid::new_random(),
        sender_address: sender,
        source_type: AckSourceType::TradeMessage,
        message_type: "DepositTxMessage".to_string(),
        correlation_id: correlation_id.to_string(),
        mailbox_eligible: true,
        payload: Bytes::from_static(b"deposit tx"),
    }
}

pub fn key_ring(name: &str) -> PubKeyRing {
    PubKeyRing::new(format!("{}-sig", name).into_bytes(), format!("{}-enc", name).into_bytes())
}

/// In-process network of delivery services, each with its own executor. Sending to an address
///  without a registered service never completes, like dialing a peer that is offline.
pub struct LoopbackNetwork {
    services: Mutex<FxHashMap<NodeAddress, Weak<DeliveryService>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<LoopbackNetwork> {
        Arc::new(LoopbackNetwork {
            services: Default::default(),
        })
    }

    pub fn service(self: &Arc<Self>, port: u16, crypto: Arc<dyn EnvelopeCrypto>, mailbox: Arc<dyn MailboxStore>) -> Arc<DeliveryService> {
        self.service_with_config(port, crypto, mailbox, DeliveryConfig::default())
    }

    pub fn service_with_config(self: &Arc<Self>, port: u16, crypto: Arc<dyn EnvelopeCrypto>, mailbox: Arc<dyn MailboxStore>, config: DeliveryConfig) -> Arc<DeliveryService> {
        let address = NodeAddress::localhost(port);
        let transport = Arc::new(LoopbackTransport {
            address: Some(address.clone()),
            network: self.clone(),
        });
        let service = DeliveryService::new(transport, crypto, mailbox, config, SerialExecutor::start());
        self.services.lock().unwrap().insert(address, Arc::downgrade(&service));
        service
    }

    pub fn service_without_address(self: &Arc<Self>, crypto: Arc<dyn EnvelopeCrypto>, mailbox: Arc<dyn MailboxStore>) -> Arc<DeliveryService> {
        let transport = Arc::new(LoopbackTransport {
            address: None,
            network: self.clone(),
        });
        DeliveryService::new(transport, crypto, mailbox, DeliveryConfig::default(), SerialExecutor::start())
    }

    pub fn go_offline(&self, address: &NodeAddress) {
        self.services.lock().unwrap().remove(address);
    }

    fn lookup(&self, address: &NodeAddress) -> Option<Arc<DeliveryService>> {
        self.services.lock().unwrap()
            .get(address)
            .and_then(Weak::upgrade)
    }
}

struct LoopbackTransport {
    address: Option<NodeAddress>,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl EnvelopeTransport for LoopbackTransport {
    fn node_address(&self) -> Option<NodeAddress> {
        self.address.clone()
    }

    async fn send_envelope(&self, peer: &NodeAddress, envelope: NetworkEnvelope) -> Result<(), SendError> {
        let Some(target) = self.network.lookup(peer) else {
            return std::future::pending().await;
        };
        if let NetworkEnvelope::Sealed(sealed) = envelope {
            let executor = target.executor().clone();
            executor.execute(async move {
                target.handle_sealed(&sealed).await;
            });
        }
        Ok(())
    }
}
