use crate::crypto::PubKeyRing;
use crate::message::AckSourceType;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};
use transport::envelope::MessageUid;
use transport::node_address::NodeAddress;

/// Lifecycle of an outstanding send. Transitions are one way:
///
/// ```ascii
/// Pending -> Delivered | Mailboxed | Failed | Acked
/// Delivered | Mailboxed -> Acked
/// ```
///
/// An ACK implies delivery, so it may overtake the transport's confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Pending,
    /// The message was written to a connection to the peer
    Delivered,
    /// The peer was unreachable and the message was stored in the mailbox
    Mailboxed,
    Failed,
    /// The peer acknowledged processing the message, successfully or not
    Acked { success: bool },
}

impl SendState {
    pub fn can_transition_to(self, next: SendState) -> bool {
        use SendState::*;

        matches!((self, next),
            (Pending, Delivered | Mailboxed | Failed | Acked { .. })
            | (Delivered | Mailboxed, Acked { .. })
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SendState::Failed | SendState::Acked { .. })
    }
}

/// An outstanding send, correlating incoming ACKs by (source type, correlation id, uid)
pub struct PendingSend {
    uid: MessageUid,
    peer: NodeAddress,
    peer_pub_key_ring: PubKeyRing,
    source_type: AckSourceType,
    correlation_id: String,
    created_at: Instant,
    state: watch::Sender<SendState>,
}

impl PendingSend {
    pub fn new(uid: MessageUid, peer: NodeAddress, peer_pub_key_ring: PubKeyRing, source_type: AckSourceType, correlation_id: String) -> PendingSend {
        PendingSend {
            uid,
            peer,
            peer_pub_key_ring,
            source_type,
            correlation_id,
            created_at: Instant::now(),
            state: watch::Sender::new(SendState::Pending),
        }
    }

    pub fn uid(&self) -> MessageUid {
        self.uid
    }

    pub fn peer(&self) -> &NodeAddress {
        &self.peer
    }

    pub fn peer_pub_key_ring(&self) -> &PubKeyRing {
        &self.peer_pub_key_ring
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> SendState {
        *self.state.borrow()
    }

    pub fn handle(&self) -> SendHandle {
        SendHandle {
            uid: self.uid,
            state: self.state.subscribe(),
        }
    }

    pub fn matches(&self, source_type: AckSourceType, correlation_id: &str, source_uid: MessageUid) -> bool {
        self.uid == source_uid
            && self.source_type == source_type
            && self.correlation_id == correlation_id
    }

    /// Returns `true` if the transition took place, `false` if it is not allowed from the current
    ///  state
    pub fn transition(&self, next: SendState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                trace!("send {}: {:?} -> {:?}", self.uid, state, next);
                *state = next;
                true
            }
            else {
                debug!("send {}: ignoring transition {:?} -> {:?}", self.uid, state, next);
                false
            }
        })
    }
}

/// The caller's view of a send: its uid and a watchable state
#[derive(Clone)]
pub struct SendHandle {
    uid: MessageUid,
    state: watch::Receiver<SendState>,
}

impl SendHandle {
    pub fn uid(&self) -> MessageUid {
        self.uid
    }

    pub fn state(&self) -> SendState {
        *self.state.borrow()
    }

    /// Completes when the state satisfies the predicate, returning that state
    pub async fn wait_for(&mut self, f: impl Fn(SendState) -> bool) -> SendState {
        let result = self.state.wait_for(|s| f(*s)).await.map(|state| *state);
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }
}
