use crate::buf::{put_bytes, try_get_bytes};
use crate::capabilities::Capabilities;
use crate::node_address::NodeAddress;
use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;

/// Unique per sender and never reused: a random (v4) UUID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageUid(Uuid);

impl MessageUid {
    pub fn new_random() -> MessageUid {
        MessageUid(Uuid::new_v4())
    }

    pub fn from_u128(value: u128) -> MessageUid {
        MessageUid(Uuid::from_u128(value))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u128(self.0.as_u128());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageUid> {
        Ok(MessageUid(Uuid::from_u128(buf.try_get_u128()?)))
    }
}

impl Debug for MessageUid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for MessageUid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EnvelopeKind {
    Hello = 1,
    CloseConnection = 2,
    Sealed = 3,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CloseConnectionReason {
    /// The local application is shutting down
    AppShutDown = 1,
    /// A connection to the same peer already exists
    DuplicatePeer = 2,
    /// The peer sent a `CloseConnection` envelope
    ClosedByPeer = 3,
    /// The socket was closed or reset without a `CloseConnection` envelope
    Reset = 4,
    /// The peer sent something that could not be decoded
    InvalidFrame = 5,
    /// The node's server stopped accepting connections
    ServerTerminated = 6,
    Other = 255,
}

impl CloseConnectionReason {
    /// Whether the peer should be sent a `CloseConnection` envelope before the socket is closed
    pub fn notifies_peer(&self) -> bool {
        match self {
            CloseConnectionReason::AppShutDown
            | CloseConnectionReason::DuplicatePeer
            | CloseConnectionReason::ServerTerminated
            | CloseConnectionReason::Other => true,
            CloseConnectionReason::ClosedByPeer
            | CloseConnectionReason::Reset
            | CloseConnectionReason::InvalidFrame => false,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HelloMessage {
    /// The published address of the sender, if it has one (yet)
    pub sender_address: Option<NodeAddress>,
    pub capabilities: Capabilities,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseConnectionMessage {
    pub reason: CloseConnectionReason,
}

/// An application message. The payload is encrypted and signed by the sender and opaque at this
///  level.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SealedMessage {
    pub sender_address: NodeAddress,
    pub uid: MessageUid,
    pub payload: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetworkEnvelope {
    Hello(HelloMessage),
    CloseConnection(CloseConnectionMessage),
    Sealed(SealedMessage),
}

impl NetworkEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            NetworkEnvelope::Hello(_) => EnvelopeKind::Hello,
            NetworkEnvelope::CloseConnection(_) => EnvelopeKind::CloseConnection,
            NetworkEnvelope::Sealed(_) => EnvelopeKind::Sealed,
        }
    }

    /// The address a message reveals about its sender, if any
    pub fn sender_address(&self) -> Option<&NodeAddress> {
        match self {
            NetworkEnvelope::Hello(m) => m.sender_address.as_ref(),
            NetworkEnvelope::CloseConnection(_) => None,
            NetworkEnvelope::Sealed(m) => Some(&m.sender_address),
        }
    }

    pub fn ser_body(&self, buf: &mut impl BufMut) {
        match self {
            NetworkEnvelope::Hello(m) => {
                match &m.sender_address {
                    None => buf.put_u8(0),
                    Some(addr) => {
                        buf.put_u8(1);
                        addr.ser(buf);
                    }
                }
                m.capabilities.ser(buf);
            }
            NetworkEnvelope::CloseConnection(m) => {
                buf.put_u8(m.reason.into());
            }
            NetworkEnvelope::Sealed(m) => {
                m.sender_address.ser(buf);
                m.uid.ser(buf);
                put_bytes(buf, &m.payload);
            }
        }
    }

    pub fn try_deser_body(kind: EnvelopeKind, buf: &mut impl Buf) -> anyhow::Result<NetworkEnvelope> {
        let result = match kind {
            EnvelopeKind::Hello => {
                let sender_address = match buf.try_get_u8()? {
                    0 => None,
                    1 => Some(NodeAddress::try_deser(buf)?),
                    n => return Err(anyhow!("invalid sender address marker {}", n)),
                };
                let capabilities = Capabilities::try_deser(buf)?;
                NetworkEnvelope::Hello(HelloMessage { sender_address, capabilities })
            }
            EnvelopeKind::CloseConnection => {
                let raw = buf.try_get_u8()?;
                let reason = CloseConnectionReason::try_from(raw)
                    .map_err(|_| anyhow!("invalid close connection reason {}", raw))?;
                NetworkEnvelope::CloseConnection(CloseConnectionMessage { reason })
            }
            EnvelopeKind::Sealed => {
                let sender_address = NodeAddress::try_deser(buf)?;
                let uid = MessageUid::try_deser(buf)?;
                let payload = try_get_bytes(buf)?;
                NetworkEnvelope::Sealed(SealedMessage { sender_address, uid, payload })
            }
        };

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after {:?} envelope", buf.remaining(), kind));
        }
        Ok(result)
    }
}
