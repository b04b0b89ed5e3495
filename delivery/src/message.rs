use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use transport::buf::{put_bool, put_bytes, put_optional_string, put_string, try_get_bool, try_get_bytes, try_get_optional_string, try_get_string};
use transport::envelope::MessageUid;
use transport::node_address::NodeAddress;

/// The protocol a message belongs to. ACKs carry the tag of the message they acknowledge, so
///  consumers can tell whether an ACK is meant for them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AckSourceType {
    Undefined = 0,
    OfferMessage = 1,
    TradeMessage = 2,
    ArbitrationMessage = 3,
    MediationMessage = 4,
    RefundMessage = 5,
    TradeChatMessage = 6,
    ArbitrationChatMessage = 7,
    MediationChatMessage = 8,
    RefundChatMessage = 9,
}

impl AckSourceType {
    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<AckSourceType> {
        let raw = buf.try_get_u8()?;
        AckSourceType::try_from(raw)
            .map_err(|_| anyhow!("invalid ack source type {}", raw))
    }
}

/// An application message for a consumer protocol
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectMessage {
    pub uid: MessageUid,
    pub sender_address: NodeAddress,
    pub source_type: AckSourceType,
    /// Name of the message type, echoed back in the ACK
    pub message_type: String,
    /// The session the message belongs to, e.g. a trade id
    pub correlation_id: String,
    /// Whether the message may be stored in the mailbox if the peer is offline
    pub mailbox_eligible: bool,
    pub payload: Bytes,
}

/// Application level receipt for a [`DirectMessage`]: the receiver processed it (`success`) or
///  rejected it (with an error message)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckMessage {
    pub uid: MessageUid,
    pub sender_address: NodeAddress,
    pub source_type: AckSourceType,
    pub source_message_type: String,
    pub source_uid: MessageUid,
    /// The acknowledged message's correlation id
    pub source_id: String,
    pub success: bool,
    pub error_message: Option<String>,
}

impl AckMessage {
    /// The ACK for a processed (or rejected) message
    pub fn for_message(message: &DirectMessage, sender_address: NodeAddress, result: Result<(), String>) -> AckMessage {
        let (success, error_message) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e)),
        };
        AckMessage {
            uid: MessageUid::new_random(),
            sender_address,
            source_type: message.source_type,
            source_message_type: message.message_type.clone(),
            source_uid: message.uid,
            source_id: message.correlation_id.clone(),
            success,
            error_message,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum DeliveryMessageKind {
    Direct = 1,
    Ack = 2,
}

/// The plaintext inside a sealed envelope
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeliveryMessage {
    Direct(DirectMessage),
    Ack(AckMessage),
}

impl DeliveryMessage {
    pub fn uid(&self) -> MessageUid {
        match self {
            DeliveryMessage::Direct(m) => m.uid,
            DeliveryMessage::Ack(m) => m.uid,
        }
    }

    pub fn sender_address(&self) -> &NodeAddress {
        match self {
            DeliveryMessage::Direct(m) => &m.sender_address,
            DeliveryMessage::Ack(m) => &m.sender_address,
        }
    }

    /// ACKs are always eligible, the peer may well have gone offline after sending the message
    pub fn is_mailbox_eligible(&self) -> bool {
        match self {
            DeliveryMessage::Direct(m) => m.mailbox_eligible,
            DeliveryMessage::Ack(_) => true,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            DeliveryMessage::Direct(m) => &m.message_type,
            DeliveryMessage::Ack(_) => "AckMessage",
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            DeliveryMessage::Direct(m) => {
                buf.put_u8(DeliveryMessageKind::Direct.into());
                m.uid.ser(buf);
                m.sender_address.ser(buf);
                buf.put_u8(m.source_type.into());
                put_string(buf, &m.message_type);
                put_string(buf, &m.correlation_id);
                put_bool(buf, m.mailbox_eligible);
                put_bytes(buf, &m.payload);
            }
            DeliveryMessage::Ack(m) => {
                buf.put_u8(DeliveryMessageKind::Ack.into());
                m.uid.ser(buf);
                m.sender_address.ser(buf);
                buf.put_u8(m.source_type.into());
                put_string(buf, &m.source_message_type);
                m.source_uid.ser(buf);
                put_string(buf, &m.source_id);
                put_bool(buf, m.success);
                put_optional_string(buf, m.error_message.as_deref());
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<DeliveryMessage> {
        let raw_kind = buf.try_get_u8()?;
        let kind = DeliveryMessageKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid delivery message kind {}", raw_kind))?;

        let result = match kind {
            DeliveryMessageKind::Direct => DeliveryMessage::Direct(DirectMessage {
                uid: MessageUid::try_deser(buf)?,
                sender_address: NodeAddress::try_deser(buf)?,
                source_type: AckSourceType::try_deser(buf)?,
                message_type: try_get_string(buf)?,
                correlation_id: try_get_string(buf)?,
                mailbox_eligible: try_get_bool(buf)?,
                payload: try_get_bytes(buf)?,
            }),
            DeliveryMessageKind::Ack => DeliveryMessage::Ack(AckMessage {
                uid: MessageUid::try_deser(buf)?,
                sender_address: NodeAddress::try_deser(buf)?,
                source_type: AckSourceType::try_deser(buf)?,
                source_message_type: try_get_string(buf)?,
                source_uid: MessageUid::try_deser(buf)?,
                source_id: try_get_string(buf)?,
                success: try_get_bool(buf)?,
                error_message: try_get_optional_string(buf)?,
            }),
        };

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after {:?} message", buf.remaining(), kind));
        }
        Ok(result)
    }
}
