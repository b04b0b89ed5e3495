use anyhow::bail;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// A direct send that does not complete within this time falls back to the mailbox. Dialing
    ///  a peer over the anonymity network alone can take tens of seconds.
    pub direct_send_timeout: Duration,
    /// Mailbox entries expire after this time if the recipient never picks them up
    pub mailbox_ttl: Duration,
    /// Outstanding sends that were never acknowledged are forgotten after this time
    pub pending_send_retention: Duration,
    /// How many message uids each protocol session remembers to drop messages that arrive twice,
    ///  e.g. directly and from the mailbox
    pub remembered_uids_per_session: usize,
}

impl DeliveryConfig {
    pub fn new() -> DeliveryConfig {
        let mailbox_ttl = Duration::from_secs(15 * 24 * 60 * 60);
        DeliveryConfig {
            direct_send_timeout: Duration::from_secs(90),
            mailbox_ttl,
            pending_send_retention: mailbox_ttl,
            remembered_uids_per_session: 1000,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.direct_send_timeout.is_zero() {
            bail!("direct send timeout must be positive");
        }
        if self.mailbox_ttl.is_zero() {
            bail!("mailbox TTL must be positive");
        }
        if self.remembered_uids_per_session == 0 {
            bail!("protocol sessions must remember at least one message uid");
        }
        Ok(())
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig::new()
    }
}
