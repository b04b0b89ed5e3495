use bitflags::bitflags;
use bytes::{Buf, BufMut};
use tracing::debug;

bitflags! {
    /// Feature flags a node advertises in its `Hello` envelope. Unknown bits from newer peers are
    ///  dropped on receipt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const SEED_NODE = 1 << 0;
        /// The node stores and picks up mailbox messages
        const MAILBOX = 1 << 1;
        /// The node confirms processed application messages with an ACK
        const ACK_MESSAGE = 1 << 2;
        const BUNDLE_OF_ENVELOPES = 1 << 3;
        const TRADE_STATISTICS = 1 << 4;
    }
}

impl Capabilities {
    pub fn default_for_peer() -> Capabilities {
        Capabilities::MAILBOX | Capabilities::ACK_MESSAGE
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.bits());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Capabilities> {
        let raw = buf.try_get_u32()?;
        let result = Capabilities::from_bits_truncate(raw);
        if result.bits() != raw {
            debug!("peer advertised unknown capabilities {:#x}", raw & !result.bits());
        }
        Ok(result)
    }
}
