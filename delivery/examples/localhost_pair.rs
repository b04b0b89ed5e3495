use clap::Parser;
use clap_derive::Parser;
use delivery::config::DeliveryConfig;
use delivery::crypto::{PlaintextCrypto, PubKeyRing};
use delivery::delivery_service::DeliveryService;
use delivery::mailbox::InMemoryMailboxStore;
use delivery::message::{AckMessage, AckSourceType, DeliveryMessage, DirectMessage};
use delivery::protocol_inbox::{ProtocolHandler, ProtocolInbox};
use delivery::send_state::SendState;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::time;
use tracing::{info, Level};
use transport::config::TransportConfig;
use transport::envelope::MessageUid;
use transport::node::TransportNode;
use transport::node_address::NodeAddress;

#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 9998)]
    alice_port: u16,
    #[clap(long, default_value_t = 9999)]
    bob_port: u16,

    #[clap(long, default_value = "trade-1")]
    trade_id: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct PrintingHandler {
    name: &'static str,
    trade_id: String,
    peer: PubKeyRing,
}

impl ProtocolHandler for PrintingHandler {
    fn source_type(&self) -> AckSourceType {
        AckSourceType::TradeMessage
    }

    fn correlation_id(&self) -> String {
        self.trade_id.clone()
    }

    fn peer_pub_key_ring(&self) -> Option<PubKeyRing> {
        Some(self.peer.clone())
    }

    fn on_message(&self, message: &DirectMessage, peer: &NodeAddress) -> Result<(), String> {
        info!("{} received {} from {}: {:?}", self.name, message.message_type, peer, message.payload);
        Ok(())
    }

    fn on_ack(&self, ack: &AckMessage, peer: &NodeAddress) {
        info!("{} received ACK for {} from {} (success={})", self.name, ack.source_message_type, peer, ack.success);
    }
}

fn key_ring(name: &str) -> PubKeyRing {
    PubKeyRing::new(format!("{}-sig", name).into_bytes(), format!("{}-enc", name).into_bytes())
}

async fn start_node(name: &'static str, port: u16, peer: &str, trade_id: &str) -> anyhow::Result<(Arc<TransportNode>, Arc<DeliveryService>, NodeAddress)> {
    let node = TransportNode::from_config(TransportConfig::new_localhost(port));
    let service = DeliveryService::attach(
        &node,
        Arc::new(PlaintextCrypto::new(key_ring(name))),
        Arc::new(InMemoryMailboxStore::new()),
        DeliveryConfig::default(),
    ).await?;

    let inbox = ProtocolInbox::register(&service, Arc::new(PrintingHandler {
        name,
        trade_id: trade_id.to_string(),
        peer: key_ring(peer),
    })).await;
    inbox.initialize();

    let address = node.start().await?;
    info!("{} is listening on {}", name, address);
    Ok((node, service, address))
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let (alice_node, alice, alice_address) = start_node("alice", args.alice_port, "bob", &args.trade_id).await?;
    let (bob_node, _bob, bob_address) = start_node("bob", args.bob_port, "alice", &args.trade_id).await?;

    let message = DirectMessage {
        uid: MessageUid::new_random(),
        sender_address: alice_address,
        source_type: AckSourceType::TradeMessage,
        message_type: "DepositTxMessage".to_string(),
        correlation_id: args.trade_id.clone(),
        mailbox_eligible: true,
        payload: Bytes::from_static(b"deposit tx"),
    };
    let mut handle = alice.send_encrypted_message(&bob_address, &key_ring("bob"), DeliveryMessage::Direct(message), None);

    let state = time::timeout(Duration::from_secs(30), handle.wait_for(|s| s.is_terminal())).await
        .map_err(|_| anyhow!("no ACK within 30 seconds"))?;
    info!("send {} finished as {:?}", handle.uid(), state);

    alice_node.shut_down().await;
    bob_node.shut_down().await;

    match state {
        SendState::Acked { success: true } => Ok(()),
        other => Err(anyhow!("message was not acknowledged: {:?}", other)),
    }
}
