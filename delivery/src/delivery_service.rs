use crate::config::DeliveryConfig;
use crate::crypto::{DecryptedMessageWithPubKey, EnvelopeCrypto, PubKeyRing};
use crate::error::DeliveryFault;
use crate::mailbox::{MailboxEntry, MailboxStore};
use crate::message::{AckMessage, DeliveryMessage, DirectMessage};
use crate::send_state::{PendingSend, SendHandle, SendState};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tokio::sync::{Mutex, RwLock};
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};
use transport::connection::Connection;
use transport::envelope::{MessageUid, NetworkEnvelope, SealedMessage};
use transport::error::SendError;
use transport::executor::SerialExecutor;
use transport::listener::{MessageListener, SetupListener};
use transport::node::TransportNode;
use transport::node_address::NodeAddress;

/// The part of a transport node the delivery service needs
#[async_trait]
pub trait EnvelopeTransport: Send + Sync + 'static {
    /// `None` until the node's address is known
    fn node_address(&self) -> Option<NodeAddress>;

    async fn send_envelope(&self, peer: &NodeAddress, envelope: NetworkEnvelope) -> Result<(), SendError>;
}

#[async_trait]
impl EnvelopeTransport for TransportNode {
    fn node_address(&self) -> Option<NodeAddress> {
        TransportNode::node_address(self)
    }

    async fn send_envelope(&self, peer: &NodeAddress, envelope: NetworkEnvelope) -> Result<(), SendError> {
        self.send_message_to(peer, envelope).await
            .map(|_| ())
    }
}

/// Outcome of a single send, reported on the service's executor. At most one of `on_arrived`,
///  `on_stored_in_mailbox` and `on_fault` is called per send, `on_acked` may follow the first two.
#[cfg_attr(test, automock)]
pub trait SendResultListener: Send + Sync + 'static {
    fn on_arrived(&self);
    fn on_stored_in_mailbox(&self);
    fn on_fault(&self, error: &str);
    fn on_acked(&self, _ack: &AckMessage) {}
}

/// Receives every message that was unsealed successfully, ACKs included
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DecryptedMessageListener: Send + Sync + 'static {
    async fn on_direct_message(&self, message: &DecryptedMessageWithPubKey, peer: &NodeAddress);
    async fn on_mailbox_message(&self, message: &DecryptedMessageWithPubKey, peer: &NodeAddress);
}

struct OutstandingSend {
    pending: Arc<PendingSend>,
    listener: Option<Arc<dyn SendResultListener>>,
}

/// Sends sealed messages directly or, if the peer is unreachable, through the mailbox, and
///  correlates incoming ACKs with outstanding sends.
///
/// Incoming messages are unsealed and dispatched to [`DecryptedMessageListener`]s. All listener
///  callbacks run on the node's serial executor.
pub struct DeliveryService {
    myself: Weak<DeliveryService>,
    transport: Arc<dyn EnvelopeTransport>,
    crypto: Arc<dyn EnvelopeCrypto>,
    mailbox: Arc<dyn MailboxStore>,
    config: DeliveryConfig,
    executor: SerialExecutor,
    outstanding: RwLock<FxHashMap<MessageUid, OutstandingSend>>,
    listeners: RwLock<Vec<Arc<dyn DecryptedMessageListener>>>,
    processed_mailbox_uids: Mutex<FxHashSet<MessageUid>>,
}

impl DeliveryService {
    pub fn new(
        transport: Arc<dyn EnvelopeTransport>,
        crypto: Arc<dyn EnvelopeCrypto>,
        mailbox: Arc<dyn MailboxStore>,
        config: DeliveryConfig,
        executor: SerialExecutor,
    ) -> Arc<DeliveryService> {
        Arc::new_cyclic(|myself| DeliveryService {
            myself: myself.clone(),
            transport,
            crypto,
            mailbox,
            config,
            executor,
            outstanding: Default::default(),
            listeners: Default::default(),
            processed_mailbox_uids: Default::default(),
        })
    }

    /// Creates a service on top of a transport node and registers it for the node's sealed
    ///  messages. The mailbox is processed once the node's endpoint is published.
    pub async fn attach(
        node: &Arc<TransportNode>,
        crypto: Arc<dyn EnvelopeCrypto>,
        mailbox: Arc<dyn MailboxStore>,
        config: DeliveryConfig,
    ) -> anyhow::Result<Arc<DeliveryService>> {
        config.validate()?;

        let service = DeliveryService::new(node.clone(), crypto, mailbox, config, node.executor().clone());
        node.add_message_listener(service.clone()).await;
        node.add_setup_listener(service.clone()).await;
        Ok(service)
    }

    pub fn executor(&self) -> &SerialExecutor {
        &self.executor
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub async fn add_decrypted_message_listener(&self, listener: Arc<dyn DecryptedMessageListener>) {
        let mut listeners = self.listeners.write().await;
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            warn!("decrypted message listener was already registered - ignoring");
            return;
        }
        listeners.push(listener);
    }

    pub async fn remove_decrypted_message_listener(&self, listener: &Arc<dyn DecryptedMessageListener>) {
        self.listeners.write().await
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// The state of a send that was not acknowledged yet
    pub async fn send_state(&self, uid: MessageUid) -> Option<SendState> {
        self.outstanding.read().await
            .get(&uid)
            .map(|o| o.pending.state())
    }

    /// Seals `message` for the peer and sends it, falling back to the mailbox if the peer can not
    ///  be reached within the configured timeout and the message is mailbox eligible.
    ///
    /// Returns immediately, the outcome is reported to `listener` and through the returned
    ///  handle.
    pub fn send_encrypted_message(
        self: &Arc<Self>,
        peer: &NodeAddress,
        peer_pub_key_ring: &PubKeyRing,
        message: DeliveryMessage,
        listener: Option<Arc<dyn SendResultListener>>,
    ) -> SendHandle {
        let (source_type, correlation_id) = match &message {
            DeliveryMessage::Direct(m) => (m.source_type, m.correlation_id.clone()),
            DeliveryMessage::Ack(m) => (m.source_type, m.source_id.clone()),
        };
        let pending = Arc::new(PendingSend::new(message.uid(), peer.clone(), peer_pub_key_ring.clone(), source_type, correlation_id));
        let handle = pending.handle();

        let sealed_payload = match self.crypto.encrypt_and_sign(&message, peer_pub_key_ring) {
            Ok(p) => p,
            Err(e) => {
                self.fail(&pending, &listener, DeliveryFault::Encryption(e.to_string()));
                return handle;
            }
        };

        let service = self.clone();
        tokio::spawn(async move {
            service.deliver(pending, message, sealed_payload, listener).await;
        });
        handle
    }

    /// Sends the ACK for a processed message back to its sender
    pub fn send_ack(self: &Arc<Self>, message: &DirectMessage, peer_pub_key_ring: &PubKeyRing, result: Result<(), String>) -> Option<SendHandle> {
        let Some(own_address) = self.transport.node_address() else {
            error!("cannot acknowledge message {} before the own address is known", message.uid);
            return None;
        };
        let ack = AckMessage::for_message(message, own_address, result);
        debug!("sending ACK {} for {} {} (success={})", ack.uid, message.message_type, message.uid, ack.success);
        Some(self.send_encrypted_message(&message.sender_address, peer_pub_key_ring, DeliveryMessage::Ack(ack), None))
    }

    #[instrument(name = "deliver", skip_all, fields(uid = %pending.uid(), peer = %pending.peer()))]
    async fn deliver(self: Arc<Self>, pending: Arc<PendingSend>, message: DeliveryMessage, sealed_payload: Bytes, listener: Option<Arc<dyn SendResultListener>>) {
        // only direct messages are acknowledged
        let awaits_ack = matches!(message, DeliveryMessage::Direct(_));
        if awaits_ack {
            self.register_outstanding(pending.clone(), listener.clone()).await;
        }

        let peer = pending.peer().clone();
        let envelope = NetworkEnvelope::Sealed(SealedMessage {
            sender_address: message.sender_address().clone(),
            uid: message.uid(),
            payload: sealed_payload.clone(),
        });

        let timeout = self.config.direct_send_timeout;
        let cause = match time::timeout(timeout, self.transport.send_envelope(&peer, envelope)).await {
            Ok(Ok(())) => {
                debug!("sent {}", message.type_name());
                if pending.transition(SendState::Delivered) {
                    self.notify(&listener, |l| l.on_arrived());
                }
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no delivery within {:?}", timeout),
        };

        if !message.is_mailbox_eligible() {
            self.fail(&pending, &listener, DeliveryFault::NotMailboxEligible { peer, cause });
            self.outstanding.write().await.remove(&pending.uid());
            return;
        }

        debug!("direct send failed ({}) - storing {} in the mailbox", cause, message.type_name());
        let entry = MailboxEntry {
            uid: message.uid(),
            sender_address: message.sender_address().clone(),
            recipient_address: peer.clone(),
            recipient_pub_key_ring: pending.peer_pub_key_ring().clone(),
            sealed_payload,
            created_at: SystemTime::now(),
            ttl: self.config.mailbox_ttl,
        };
        match self.mailbox.put(&peer, entry).await {
            Ok(()) => {
                info!("stored {} in the mailbox", message.type_name());
                if pending.transition(SendState::Mailboxed) {
                    self.notify(&listener, |l| l.on_stored_in_mailbox());
                }
            }
            Err(e) => {
                self.fail(&pending, &listener, DeliveryFault::MailboxUnavailable { peer, cause, mailbox_error: e.to_string() });
                self.outstanding.write().await.remove(&pending.uid());
            }
        }
    }

    async fn register_outstanding(&self, pending: Arc<PendingSend>, listener: Option<Arc<dyn SendResultListener>>) {
        let retention = self.config.pending_send_retention;
        let mut outstanding = self.outstanding.write().await;

        let len_before = outstanding.len();
        outstanding.retain(|_, o| o.pending.created_at().elapsed() < retention);
        if outstanding.len() != len_before {
            debug!("dropped {} sends that were never acknowledged", len_before - outstanding.len());
        }

        outstanding.insert(pending.uid(), OutstandingSend { pending, listener });
    }

    fn fail(&self, pending: &PendingSend, listener: &Option<Arc<dyn SendResultListener>>, fault: DeliveryFault) {
        error!("sending {} to {} failed: {}", pending.uid(), pending.peer(), fault);
        if pending.transition(SendState::Failed) {
            let error = fault.to_string();
            self.notify(listener, move |l| l.on_fault(&error));
        }
    }

    fn notify(&self, listener: &Option<Arc<dyn SendResultListener>>, f: impl FnOnce(&dyn SendResultListener) + Send + 'static) {
        if let Some(listener) = listener.clone() {
            self.executor.execute(async move {
                f(listener.as_ref());
            });
        }
    }

    /// Unseals a message that arrived over a connection and dispatches it. Must run on the
    ///  service's executor.
    pub async fn handle_sealed(&self, sealed: &SealedMessage) {
        let decrypted = match self.crypto.decrypt_and_verify(&sealed.payload) {
            Ok(d) => d,
            Err(e) => {
                warn!("dropping message {} from {}: {}", sealed.uid, sealed.sender_address, e);
                return;
            }
        };
        if decrypted.message.uid() != sealed.uid || decrypted.message.sender_address() != &sealed.sender_address {
            warn!("dropping message {} from {}: envelope does not match the sealed content", sealed.uid, sealed.sender_address);
            return;
        }
        self.dispatch(decrypted, false).await;
    }

    async fn dispatch(&self, decrypted: DecryptedMessageWithPubKey, from_mailbox: bool) {
        trace!("dispatching {} {}", decrypted.message.type_name(), decrypted.message.uid());
        if let DeliveryMessage::Ack(ack) = &decrypted.message {
            self.on_ack(ack, &decrypted.signature_pub_key).await;
        }

        let peer = decrypted.message.sender_address().clone();
        let listeners = self.listeners.read().await.clone();
        for l in listeners {
            if from_mailbox {
                l.on_mailbox_message(&decrypted, &peer).await;
            }
            else {
                l.on_direct_message(&decrypted, &peer).await;
            }
        }
    }

    async fn on_ack(&self, ack: &AckMessage, signature_pub_key: &Bytes) {
        let outstanding = self.outstanding.read().await
            .get(&ack.source_uid)
            .map(|o| (o.pending.clone(), o.listener.clone()));
        let Some((pending, listener)) = outstanding else {
            debug!("ACK {} refers to {}, which is unknown or already acknowledged", ack.uid, ack.source_uid);
            return;
        };

        if !pending.matches(ack.source_type, &ack.source_id, ack.source_uid) {
            warn!("ACK {} does not match the send {} it refers to - ignoring", ack.uid, ack.source_uid);
            return;
        }
        if &pending.peer_pub_key_ring().signature_pub_key != signature_pub_key {
            warn!("ACK {} for {} is not signed by the recipient - ignoring", ack.uid, ack.source_uid);
            return;
        }
        if !pending.transition(SendState::Acked { success: ack.success }) {
            return;
        }

        if ack.success {
            info!("{} {} was processed by {}", ack.source_message_type, ack.source_uid, ack.sender_address);
        }
        else {
            warn!("{} {} was rejected by {}: {}", ack.source_message_type, ack.source_uid, ack.sender_address, ack.error_message.as_deref().unwrap_or("no reason given"));
        }

        self.outstanding.write().await.remove(&ack.source_uid);
        if let Some(listener) = listener {
            listener.on_acked(ack);
        }

        match self.mailbox.remove_by_uid(ack.source_uid).await {
            Ok(true) => debug!("removed acknowledged message {} from the mailbox", ack.source_uid),
            Ok(false) => {}
            Err(e) => warn!("failed to remove acknowledged message {} from the mailbox: {}", ack.source_uid, e),
        }
    }

    /// Picks up the mailbox entries addressed to this node and dispatches them on the executor.
    ///  Every entry is dispatched at most once while it stays in the mailbox. Returns the number of
    ///  new entries.
    ///
    /// Listeners that register later get the entries picked up so far through
    ///  [`DeliveryService::replay_mailbox_to`].
    pub async fn process_mailbox(self: &Arc<Self>) -> anyhow::Result<usize> {
        let own_address = self.transport.node_address()
            .ok_or_else(|| anyhow!("cannot process the mailbox before the own address is known"))?;
        let entries = self.live_mailbox_entries(&own_address).await?;

        let mut new_entries = Vec::new();
        {
            let mut processed = self.processed_mailbox_uids.lock().await;
            // entries that were removed or expired can not show up again under the same uid
            let live = entries.iter().map(|e| e.uid).collect::<FxHashSet<_>>();
            processed.retain(|uid| live.contains(uid));

            for entry in entries {
                if processed.insert(entry.uid) {
                    new_entries.push(entry);
                }
            }
        }

        let num_new = new_entries.len();
        debug!("{} new mailbox entries for {}", num_new, own_address);

        let service = self.clone();
        self.executor.execute(async move {
            for entry in new_entries {
                service.on_mailbox_entry(entry).await;
            }
        });
        Ok(num_new)
    }

    /// Dispatches the mailbox entries that were picked up before `listener` registered to
    ///  `listener` alone, on the executor. ACKs are not replayed. Returns the number of entries.
    pub async fn replay_mailbox_to(self: &Arc<Self>, listener: Arc<dyn DecryptedMessageListener>) -> anyhow::Result<usize> {
        let Some(own_address) = self.transport.node_address() else {
            debug!("own address is not known yet - nothing was picked up from the mailbox");
            return Ok(0);
        };
        let entries = self.live_mailbox_entries(&own_address).await?;

        let picked_up = {
            let processed = self.processed_mailbox_uids.lock().await;
            entries.into_iter()
                .filter(|e| processed.contains(&e.uid))
                .collect::<Vec<_>>()
        };

        let num_replayed = picked_up.len();
        if num_replayed > 0 {
            debug!("replaying {} mailbox entries to a new listener", num_replayed);
        }

        let service = self.clone();
        self.executor.execute(async move {
            for entry in picked_up {
                let Some(decrypted) = service.unseal_mailbox_entry(&entry) else {
                    continue;
                };
                if matches!(decrypted.message, DeliveryMessage::Ack(_)) {
                    continue;
                }
                let peer = decrypted.message.sender_address().clone();
                listener.on_mailbox_message(&decrypted, &peer).await;
            }
        });
        Ok(num_replayed)
    }

    async fn live_mailbox_entries(&self, own_address: &NodeAddress) -> anyhow::Result<Vec<MailboxEntry>> {
        let now = SystemTime::now();
        let mut entries = self.mailbox.entries_for(own_address).await?;
        entries.retain(|entry| {
            let expired = entry.is_expired(now);
            if expired {
                trace!("skipping expired mailbox entry {}", entry.uid);
            }
            !expired
        });
        Ok(entries)
    }

    fn unseal_mailbox_entry(&self, entry: &MailboxEntry) -> Option<DecryptedMessageWithPubKey> {
        let decrypted = match self.crypto.decrypt_and_verify(&entry.sealed_payload) {
            Ok(d) => d,
            Err(e) => {
                warn!("dropping mailbox entry {} from {}: {}", entry.uid, entry.sender_address, e);
                return None;
            }
        };
        if decrypted.message.uid() != entry.uid {
            warn!("dropping mailbox entry {}: uid does not match the sealed content", entry.uid);
            return None;
        }
        Some(decrypted)
    }

    async fn on_mailbox_entry(&self, entry: MailboxEntry) {
        let Some(decrypted) = self.unseal_mailbox_entry(&entry) else {
            return;
        };

        let is_ack = matches!(decrypted.message, DeliveryMessage::Ack(_));
        self.dispatch(decrypted, true).await;

        // nobody acknowledges an ACK, so it is removed as soon as it was handled
        if is_ack {
            if let Err(e) = self.mailbox.remove_by_uid(entry.uid).await {
                warn!("failed to remove ACK {} from the mailbox: {}", entry.uid, e);
            }
        }
    }

    /// Removes a processed message from the mailbox
    pub async fn remove_mailbox_message(&self, uid: MessageUid) -> anyhow::Result<bool> {
        self.mailbox.remove_by_uid(uid).await
    }
}

#[async_trait]
impl MessageListener for DeliveryService {
    async fn on_message(&self, envelope: &NetworkEnvelope, _connection: &Arc<Connection>) {
        if let NetworkEnvelope::Sealed(sealed) = envelope {
            self.handle_sealed(sealed).await;
        }
    }
}

impl SetupListener for DeliveryService {
    fn on_hidden_service_published(&self) {
        let Some(service) = self.myself.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = service.process_mailbox().await {
                error!("processing the mailbox failed: {}", e);
            }
        });
    }
}
