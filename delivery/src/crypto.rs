use crate::error::DecryptionError;
use crate::message::DeliveryMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use sha2::{Digest, Sha256};
use std::fmt::{Debug, Formatter};
use tracing::warn;
use transport::buf::{put_bytes, try_get_bytes};

/// A peer's public keys: one for verifying its signatures, one for sealing messages to it
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PubKeyRing {
    pub signature_pub_key: Bytes,
    pub encryption_pub_key: Bytes,
}

impl Debug for PubKeyRing {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PubKeyRing{{sig={} enc={}}}", short_hex(&self.signature_pub_key), short_hex(&self.encryption_pub_key))
    }
}

fn short_hex(data: &[u8]) -> String {
    hex::encode(&data[..4.min(data.len())])
}

impl PubKeyRing {
    pub fn new(signature_pub_key: impl Into<Bytes>, encryption_pub_key: impl Into<Bytes>) -> PubKeyRing {
        PubKeyRing {
            signature_pub_key: signature_pub_key.into(),
            encryption_pub_key: encryption_pub_key.into(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_bytes(buf, &self.signature_pub_key);
        put_bytes(buf, &self.encryption_pub_key);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PubKeyRing> {
        Ok(PubKeyRing {
            signature_pub_key: try_get_bytes(buf)?,
            encryption_pub_key: try_get_bytes(buf)?,
        })
    }
}

/// A message that was successfully unsealed, together with the key that signed it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedMessageWithPubKey {
    pub message: DeliveryMessage,
    pub signature_pub_key: Bytes,
}

/// Seals messages for a recipient and unseals messages addressed to this node. Implementations
///  encrypt with the recipient's encryption key and sign with the node's own signature key.
#[cfg_attr(test, automock)]
pub trait EnvelopeCrypto: Send + Sync + 'static {
    fn encrypt_and_sign(&self, message: &DeliveryMessage, recipient: &PubKeyRing) -> anyhow::Result<Bytes>;

    fn decrypt_and_verify(&self, sealed: &[u8]) -> Result<DecryptedMessageWithPubKey, DecryptionError>;
}

/// A non-confidential codec for localhost networks and tests: the message travels in plain text,
///  protected only by a SHA-256 digest against corruption. It does check that a payload was
///  sealed for this node's key ring.
pub struct PlaintextCrypto {
    own_key_ring: PubKeyRing,
}

impl PlaintextCrypto {
    pub fn new(own_key_ring: PubKeyRing) -> PlaintextCrypto {
        warn!("using plaintext envelope crypto - messages are neither encrypted nor signed");
        PlaintextCrypto { own_key_ring }
    }

    fn digest(data: &[u8]) -> [u8; 32] {
        let mut sha256 = Sha256::default();
        sha256.update(data);
        sha256.finalize().into()
    }
}

impl EnvelopeCrypto for PlaintextCrypto {
    fn encrypt_and_sign(&self, message: &DeliveryMessage, recipient: &PubKeyRing) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, &recipient.encryption_pub_key);
        put_bytes(&mut buf, &self.own_key_ring.signature_pub_key);
        put_bytes(&mut buf, &message.to_bytes());
        let digest = Self::digest(&buf);
        buf.put_slice(&digest);
        Ok(buf.freeze())
    }

    fn decrypt_and_verify(&self, sealed: &[u8]) -> Result<DecryptedMessageWithPubKey, DecryptionError> {
        if sealed.len() < 32 {
            return Err(DecryptionError::Malformed(format!("sealed payload too short: {} bytes", sealed.len())));
        }
        let (content, digest) = sealed.split_at(sealed.len() - 32);
        if Self::digest(content) != digest {
            return Err(DecryptionError::IntegrityCheckFailed);
        }

        let mut buf = content;
        let malformed = |e: anyhow::Error| DecryptionError::Malformed(e.to_string());
        let recipient_key = try_get_bytes(&mut buf).map_err(malformed)?;
        if recipient_key != self.own_key_ring.encryption_pub_key {
            return Err(DecryptionError::WrongRecipient);
        }
        let signature_pub_key = try_get_bytes(&mut buf).map_err(malformed)?;
        let mut message_buf = try_get_bytes(&mut buf).map_err(malformed)?;
        if buf.has_remaining() {
            return Err(DecryptionError::Malformed(format!("{} trailing bytes", buf.remaining())));
        }
        let message = DeliveryMessage::try_deser(&mut message_buf).map_err(malformed)?;

        Ok(DecryptedMessageWithPubKey { message, signature_pub_key })
    }
}
