use crate::crypto::{DecryptedMessageWithPubKey, PubKeyRing};
use crate::delivery_service::{DecryptedMessageListener, DeliveryService};
use crate::message::{AckMessage, AckSourceType, DeliveryMessage, DirectMessage};
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};
use transport::envelope::MessageUid;
use transport::node_address::NodeAddress;

/// The consumer side of a protocol session (e.g. a trade), identified by its source type and
///  correlation id.
pub trait ProtocolHandler: Send + Sync + 'static {
    fn source_type(&self) -> AckSourceType;
    fn correlation_id(&self) -> String;

    /// The peer's keys, once they are known. Messages signed with a different key are dropped.
    fn peer_pub_key_ring(&self) -> Option<PubKeyRing>;

    /// Processes a message; the result is sent back to the peer as an ACK
    fn on_message(&self, message: &DirectMessage, peer: &NodeAddress) -> Result<(), String>;

    fn on_ack(&self, ack: &AckMessage, peer: &NodeAddress);
}

struct EarlyMessage {
    message: DecryptedMessageWithPubKey,
    peer: NodeAddress,
    from_mailbox: bool,
}

struct InboxState {
    initialized: bool,
    early_messages: VecDeque<EarlyMessage>,
    seen_uids: FxHashSet<MessageUid>,
    /// oldest first, to forget uids beyond `max_seen`
    seen_order: VecDeque<MessageUid>,
    max_seen: usize,
}

impl InboxState {
    fn new(max_seen: usize) -> InboxState {
        InboxState {
            initialized: false,
            early_messages: Default::default(),
            seen_uids: Default::default(),
            seen_order: Default::default(),
            max_seen,
        }
    }

    /// `false` if the uid was seen before
    fn remember(&mut self, uid: MessageUid) -> bool {
        if !self.seen_uids.insert(uid) {
            return false;
        }
        self.seen_order.push_back(uid);
        while self.seen_order.len() > self.max_seen {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen_uids.remove(&oldest);
            }
        }
        true
    }
}

/// Routes decrypted messages and ACKs of one protocol session to its [`ProtocolHandler`].
///
/// Messages arriving before the session is initialized (typically while it is restored on
///  startup) are buffered and replayed in arrival order by [`ProtocolInbox::initialize`]. Every
///  processed message is acknowledged to its sender. A message that arrives more than once, e.g.
///  directly and from the mailbox, is processed only the first time.
pub struct ProtocolInbox {
    handler: Arc<dyn ProtocolHandler>,
    service: Weak<DeliveryService>,
    state: Mutex<InboxState>,
}

impl ProtocolInbox {
    /// Creates the inbox and registers it with the service. Mailbox entries the service picked up
    ///  earlier are handed to the new inbox as well.
    pub async fn register(service: &Arc<DeliveryService>, handler: Arc<dyn ProtocolHandler>) -> Arc<ProtocolInbox> {
        let inbox = Arc::new(ProtocolInbox {
            handler,
            service: Arc::downgrade(service),
            state: Mutex::new(InboxState::new(service.config().remembered_uids_per_session)),
        });
        service.add_decrypted_message_listener(inbox.clone()).await;

        if let Err(e) = service.replay_mailbox_to(inbox.clone()).await {
            warn!("could not replay the mailbox for {}: {}", inbox.handler.correlation_id(), e);
        }
        inbox
    }

    pub async fn unregister(self: &Arc<Self>) {
        if let Some(service) = self.service.upgrade() {
            let listener: Arc<dyn DecryptedMessageListener> = self.clone();
            service.remove_decrypted_message_listener(&listener).await;
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.initialized
    }

    /// Marks the session as ready and replays buffered messages, on the service's executor
    pub fn initialize(self: &Arc<Self>) {
        let Some(service) = self.service.upgrade() else {
            warn!("initializing inbox for {} after the delivery service was dropped", self.handler.correlation_id());
            return;
        };
        let inbox = self.clone();
        service.executor().execute(async move {
            inbox.replay_early_messages().await;
        });
    }

    async fn replay_early_messages(&self) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                let next = state.early_messages.pop_front();
                if next.is_none() {
                    state.initialized = true;
                }
                next
            };
            let Some(early) = next else {
                break;
            };
            debug!("replaying {} {}", early.message.message.type_name(), early.message.message.uid());
            self.apply(&early.message, &early.peer, early.from_mailbox).await;
        }
    }

    fn is_my_message(&self, message: &DeliveryMessage) -> bool {
        let (source_type, correlation_id) = match message {
            DeliveryMessage::Direct(m) => (m.source_type, &m.correlation_id),
            DeliveryMessage::Ack(m) => (m.source_type, &m.source_id),
        };
        source_type == self.handler.source_type() && *correlation_id == self.handler.correlation_id()
    }

    async fn on_decrypted(&self, message: &DecryptedMessageWithPubKey, peer: &NodeAddress, from_mailbox: bool) {
        if !self.is_my_message(&message.message) {
            return;
        }
        if let Some(key_ring) = self.handler.peer_pub_key_ring() {
            if key_ring.signature_pub_key != message.signature_pub_key {
                error!("{} {} for {} is signed with a key that is not the peer's - dropping", message.message.type_name(), message.message.uid(), self.handler.correlation_id());
                return;
            }
        }

        {
            let mut state = self.state.lock().await;
            let uid = message.message.uid();
            if !state.remember(uid) {
                debug!("{} {} was received before - ignoring", message.message.type_name(), uid);
                return;
            }
            if !state.initialized {
                trace!("buffering {} {} until {} is initialized", message.message.type_name(), uid, self.handler.correlation_id());
                state.early_messages.push_back(EarlyMessage {
                    message: message.clone(),
                    peer: peer.clone(),
                    from_mailbox,
                });
                return;
            }
        }
        self.apply(message, peer, from_mailbox).await;
    }

    async fn apply(&self, message: &DecryptedMessageWithPubKey, peer: &NodeAddress, from_mailbox: bool) {
        match &message.message {
            DeliveryMessage::Direct(m) => {
                let result = self.handler.on_message(m, peer);
                match &result {
                    Ok(()) => info!("processed {} {} for {}", m.message_type, m.uid, m.correlation_id),
                    Err(e) => warn!("rejected {} {} for {}: {}", m.message_type, m.uid, m.correlation_id, e),
                }
                let success = result.is_ok();
                self.acknowledge(m, result);
                if from_mailbox && success {
                    self.remove_from_mailbox(m.uid);
                }
            }
            DeliveryMessage::Ack(ack) => self.handler.on_ack(ack, peer),
        }
    }

    fn acknowledge(&self, message: &DirectMessage, result: Result<(), String>) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let Some(key_ring) = self.handler.peer_pub_key_ring() else {
            error!("cannot acknowledge {} {}: the peer's keys are not known", message.message_type, message.uid);
            return;
        };
        service.send_ack(message, &key_ring, result);
    }

    fn remove_from_mailbox(&self, uid: MessageUid) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = service.remove_mailbox_message(uid).await {
                warn!("failed to remove processed message {} from the mailbox: {}", uid, e);
            }
        });
    }
}

#[async_trait]
impl DecryptedMessageListener for ProtocolInbox {
    async fn on_direct_message(&self, message: &DecryptedMessageWithPubKey, peer: &NodeAddress) {
        self.on_decrypted(message, peer, false).await;
    }

    async fn on_mailbox_message(&self, message: &DecryptedMessageWithPubKey, peer: &NodeAddress) {
        self.on_decrypted(message, peer, true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::crypto::{EnvelopeCrypto, PlaintextCrypto};
    use crate::mailbox::{InMemoryMailboxStore, MailboxEntry, MailboxStore};
    use crate::send_state::SendState;
    use crate::test_util::{direct_message, key_ring, LoopbackNetwork};
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, SystemTime};
    use transport::envelope::SealedMessage;

    struct RecordingHandler {
        correlation_id: String,
        peer_key_ring: Option<PubKeyRing>,
        reject: bool,
        messages: StdMutex<Vec<MessageUid>>,
        acks: StdMutex<Vec<AckMessage>>,
    }

    impl RecordingHandler {
        fn new(correlation_id: &str, peer: &str) -> RecordingHandler {
            RecordingHandler {
                correlation_id: correlation_id.to_string(),
                peer_key_ring: Some(key_ring(peer)),
                reject: false,
                messages: Default::default(),
                acks: Default::default(),
            }
        }

        fn messages(&self) -> Vec<MessageUid> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl ProtocolHandler for RecordingHandler {
        fn source_type(&self) -> AckSourceType {
            AckSourceType::TradeMessage
        }
        fn correlation_id(&self) -> String {
            self.correlation_id.clone()
        }
        fn peer_pub_key_ring(&self) -> Option<PubKeyRing> {
            self.peer_key_ring.clone()
        }
        fn on_message(&self, message: &DirectMessage, _peer: &NodeAddress) -> Result<(), String> {
            self.messages.lock().unwrap().push(message.uid);
            if self.reject {
                Err("invalid deposit tx".to_string())
            }
            else {
                Ok(())
            }
        }
        fn on_ack(&self, ack: &AckMessage, _peer: &NodeAddress) {
            self.acks.lock().unwrap().push(ack.clone());
        }
    }

    fn decrypted(message: DirectMessage, signed_by: &str) -> DecryptedMessageWithPubKey {
        DecryptedMessageWithPubKey {
            message: DeliveryMessage::Direct(message),
            signature_pub_key: key_ring(signed_by).signature_pub_key,
        }
    }

    fn bob(network: &Arc<LoopbackNetwork>) -> Arc<DeliveryService> {
        network.service(2, Arc::new(PlaintextCrypto::new(key_ring("bob"))), Arc::new(InMemoryMailboxStore::new()))
    }

    #[tokio::test]
    async fn test_early_messages_are_replayed_in_order() {
        let network = LoopbackNetwork::new();
        let bob = bob(&network);
        let handler = Arc::new(RecordingHandler::new("trade-1", "alice"));
        let inbox = ProtocolInbox::register(&bob, handler.clone()).await;

        let first = direct_message(NodeAddress::localhost(1), "trade-1");
        let second = direct_message(NodeAddress::localhost(1), "trade-1");
        inbox.on_direct_message(&decrypted(first.clone(), "alice"), &NodeAddress::localhost(1)).await;
        inbox.on_mailbox_message(&decrypted(second.clone(), "alice"), &NodeAddress::localhost(1)).await;
        // the same message again, e.g. directly and from the mailbox
        inbox.on_mailbox_message(&decrypted(first.clone(), "alice"), &NodeAddress::localhost(1)).await;
        assert!(handler.messages().is_empty());

        inbox.initialize();
        bob.executor().flush().await;
        assert!(inbox.is_initialized().await);
        assert_eq!(handler.messages(), vec![first.uid, second.uid]);

        let third = direct_message(NodeAddress::localhost(1), "trade-1");
        inbox.on_direct_message(&decrypted(third.clone(), "alice"), &NodeAddress::localhost(1)).await;
        assert_eq!(handler.messages(), vec![first.uid, second.uid, third.uid]);

        // replaying again is a no-op
        inbox.initialize();
        bob.executor().flush().await;
        assert_eq!(handler.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_other_sessions_are_ignored() {
        let network = LoopbackNetwork::new();
        let bob = bob(&network);
        let handler = Arc::new(RecordingHandler::new("trade-1", "alice"));
        let inbox = ProtocolInbox::register(&bob, handler.clone()).await;
        inbox.initialize();
        bob.executor().flush().await;

        inbox.on_direct_message(&decrypted(direct_message(NodeAddress::localhost(1), "trade-2"), "alice"), &NodeAddress::localhost(1)).await;
        let mut offer = direct_message(NodeAddress::localhost(1), "trade-1");
        offer.source_type = AckSourceType::OfferMessage;
        inbox.on_direct_message(&decrypted(offer, "alice"), &NodeAddress::localhost(1)).await;

        assert!(handler.messages().is_empty());
    }

    #[tokio::test]
    async fn test_message_signed_by_other_key_is_dropped() {
        let network = LoopbackNetwork::new();
        let bob = bob(&network);
        let handler = Arc::new(RecordingHandler::new("trade-1", "alice"));
        let inbox = ProtocolInbox::register(&bob, handler.clone()).await;
        inbox.initialize();
        bob.executor().flush().await;

        inbox.on_direct_message(&decrypted(direct_message(NodeAddress::localhost(1), "trade-1"), "mallory"), &NodeAddress::localhost(1)).await;
        assert!(handler.messages().is_empty());
    }

    #[tokio::test]
    async fn test_acks_reach_the_handler() {
        let network = LoopbackNetwork::new();
        let bob = bob(&network);
        let handler = Arc::new(RecordingHandler::new("trade-1", "alice"));
        let inbox = ProtocolInbox::register(&bob, handler.clone()).await;

        let ack = AckMessage::for_message(&direct_message(NodeAddress::localhost(2), "trade-1"), NodeAddress::localhost(1), Ok(()));
        let decrypted_ack = DecryptedMessageWithPubKey {
            message: DeliveryMessage::Ack(ack.clone()),
            signature_pub_key: key_ring("alice").signature_pub_key,
        };
        inbox.on_direct_message(&decrypted_ack, &NodeAddress::localhost(1)).await;
        assert!(handler.acks.lock().unwrap().is_empty());

        inbox.initialize();
        bob.executor().flush().await;
        assert_eq!(*handler.acks.lock().unwrap(), vec![ack]);
    }

    #[tokio::test]
    async fn test_rejection_is_acknowledged() {
        let network = LoopbackNetwork::new();
        let alice = network.service(1, Arc::new(PlaintextCrypto::new(key_ring("alice"))), Arc::new(InMemoryMailboxStore::new()));
        let bob = bob(&network);

        let mut handler = RecordingHandler::new("trade-1", "alice");
        handler.reject = true;
        let inbox = ProtocolInbox::register(&bob, Arc::new(handler)).await;
        inbox.initialize();

        let message = direct_message(NodeAddress::localhost(1), "trade-1");
        let mut handle = alice.send_encrypted_message(&NodeAddress::localhost(2), &key_ring("bob"), DeliveryMessage::Direct(message), None);

        assert_eq!(handle.wait_for(|s| s.is_terminal()).await, SendState::Acked { success: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_peer_processes_mailbox_and_acks() {
        let network = LoopbackNetwork::new();
        let mailbox = Arc::new(InMemoryMailboxStore::new());
        let alice = network.service(1, Arc::new(PlaintextCrypto::new(key_ring("alice"))), mailbox.clone());

        // bob is offline, so the message ends up in the mailbox
        let mut message = direct_message(NodeAddress::localhost(1), "trade-1");
        message.payload = Bytes::from_static(b"payout tx");
        let mut handle = alice.send_encrypted_message(&NodeAddress::localhost(2), &key_ring("bob"), DeliveryMessage::Direct(message.clone()), None);
        assert_eq!(handle.wait_for(|s| s != SendState::Pending).await, SendState::Mailboxed);
        assert!(mailbox.contains(message.uid).await);

        // bob comes online, restores the trade and picks up his mailbox
        let bob = network.service(2, Arc::new(PlaintextCrypto::new(key_ring("bob"))), mailbox.clone());
        let handler = Arc::new(RecordingHandler::new("trade-1", "alice"));
        let inbox = ProtocolInbox::register(&bob, handler.clone()).await;
        assert_eq!(bob.process_mailbox().await.unwrap(), 1);
        inbox.initialize();

        assert_eq!(handle.wait_for(|s| s.is_terminal()).await, SendState::Acked { success: true });
        alice.executor().flush().await;
        assert_eq!(handler.messages(), vec![message.uid]);
        assert!(mailbox.entries_for(&NodeAddress::localhost(2)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_to_offline_sender_goes_through_mailbox() {
        let network = LoopbackNetwork::new();
        let mailbox = Arc::new(InMemoryMailboxStore::new());
        let alice = network.service(1, Arc::new(PlaintextCrypto::new(key_ring("alice"))), mailbox.clone());
        let bob = network.service(2, Arc::new(PlaintextCrypto::new(key_ring("bob"))), mailbox.clone());
        let inbox = ProtocolInbox::register(&bob, Arc::new(RecordingHandler::new("trade-1", "alice"))).await;

        // alice goes offline right after sending, before bob processes the message
        let message = direct_message(NodeAddress::localhost(1), "trade-1");
        let mut handle = alice.send_encrypted_message(&NodeAddress::localhost(2), &key_ring("bob"), DeliveryMessage::Direct(message.clone()), None);
        handle.wait_for(|s| s == SendState::Delivered).await;
        network.go_offline(&NodeAddress::localhost(1));
        inbox.initialize();
        bob.executor().flush().await;

        let ack_stored = async {
            while mailbox.entries_for(&NodeAddress::localhost(1)).await.unwrap().is_empty() {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(300), ack_stored).await.unwrap();

        // alice is back and finds the ACK in her mailbox
        assert_eq!(alice.process_mailbox().await.unwrap(), 1);
        assert_eq!(handle.wait_for(|s| s.is_terminal()).await, SendState::Acked { success: true });
        alice.executor().flush().await;
        assert_eq!(mailbox.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mailbox_picked_up_before_registration_is_replayed() {
        let network = LoopbackNetwork::new();
        let mailbox = Arc::new(InMemoryMailboxStore::new());
        let alice = network.service(1, Arc::new(PlaintextCrypto::new(key_ring("alice"))), mailbox.clone());

        let message = direct_message(NodeAddress::localhost(1), "trade-1");
        let mut handle = alice.send_encrypted_message(&NodeAddress::localhost(2), &key_ring("bob"), DeliveryMessage::Direct(message.clone()), None);
        assert_eq!(handle.wait_for(|s| s != SendState::Pending).await, SendState::Mailboxed);

        // bob's endpoint is published before the trade is restored
        let bob = network.service(2, Arc::new(PlaintextCrypto::new(key_ring("bob"))), mailbox.clone());
        assert_eq!(bob.process_mailbox().await.unwrap(), 1);
        bob.executor().flush().await;

        let handler = Arc::new(RecordingHandler::new("trade-1", "alice"));
        let inbox = ProtocolInbox::register(&bob, handler.clone()).await;
        inbox.initialize();

        assert_eq!(handle.wait_for(|s| s.is_terminal()).await, SendState::Acked { success: true });
        assert_eq!(handler.messages(), vec![message.uid]);
    }

    #[tokio::test]
    async fn test_message_received_directly_and_from_mailbox_is_processed_once() {
        let network = LoopbackNetwork::new();
        let mailbox = Arc::new(InMemoryMailboxStore::new());
        let _alice = network.service(1, Arc::new(PlaintextCrypto::new(key_ring("alice"))), mailbox.clone());
        let bob = network.service(2, Arc::new(PlaintextCrypto::new(key_ring("bob"))), mailbox.clone());
        let handler = Arc::new(RecordingHandler::new("trade-1", "alice"));
        let inbox = ProtocolInbox::register(&bob, handler.clone()).await;
        inbox.initialize();
        bob.executor().flush().await;

        let message = direct_message(NodeAddress::localhost(1), "trade-1");
        let sealed_payload = PlaintextCrypto::new(key_ring("alice"))
            .encrypt_and_sign(&DeliveryMessage::Direct(message.clone()), &key_ring("bob"))
            .unwrap();

        // the direct send timed out while the envelope was already on its way, so there is a
        //  mailbox copy as well
        mailbox.put(&NodeAddress::localhost(2), MailboxEntry {
            uid: message.uid,
            sender_address: NodeAddress::localhost(1),
            recipient_address: NodeAddress::localhost(2),
            recipient_pub_key_ring: key_ring("bob"),
            sealed_payload: sealed_payload.clone(),
            created_at: SystemTime::now(),
            ttl: Duration::from_secs(60),
        }).await.unwrap();

        bob.handle_sealed(&SealedMessage { sender_address: NodeAddress::localhost(1), uid: message.uid, payload: sealed_payload }).await;
        assert_eq!(bob.process_mailbox().await.unwrap(), 1);
        bob.executor().flush().await;

        assert_eq!(handler.messages(), vec![message.uid]);
    }

    #[tokio::test]
    async fn test_only_recent_uids_are_remembered() {
        let network = LoopbackNetwork::new();
        let mut config = DeliveryConfig::default();
        config.remembered_uids_per_session = 2;
        let bob = network.service_with_config(2, Arc::new(PlaintextCrypto::new(key_ring("bob"))), Arc::new(InMemoryMailboxStore::new()), config);
        let handler = Arc::new(RecordingHandler::new("trade-1", "alice"));
        let inbox = ProtocolInbox::register(&bob, handler.clone()).await;
        inbox.initialize();
        bob.executor().flush().await;

        let messages = (0..3)
            .map(|_| direct_message(NodeAddress::localhost(1), "trade-1"))
            .collect::<Vec<_>>();
        for m in &messages {
            inbox.on_direct_message(&decrypted(m.clone(), "alice"), &NodeAddress::localhost(1)).await;
        }
        inbox.on_direct_message(&decrypted(messages[2].clone(), "alice"), &NodeAddress::localhost(1)).await;
        inbox.on_direct_message(&decrypted(messages[0].clone(), "alice"), &NodeAddress::localhost(1)).await;

        assert_eq!(handler.messages(), vec![messages[0].uid, messages[1].uid, messages[2].uid, messages[0].uid]);
    }
}
