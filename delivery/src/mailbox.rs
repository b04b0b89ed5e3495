use crate::crypto::PubKeyRing;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use transport::envelope::MessageUid;
use transport::node_address::NodeAddress;

/// A sealed message waiting for its (offline) recipient
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxEntry {
    pub uid: MessageUid,
    pub sender_address: NodeAddress,
    pub recipient_address: NodeAddress,
    pub recipient_pub_key_ring: PubKeyRing,
    pub sealed_payload: Bytes,
    pub created_at: SystemTime,
    pub ttl: Duration,
}

impl MailboxEntry {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match now.duration_since(self.created_at) {
            Ok(age) => age >= self.ttl,
            // created in the future, i.e. clocks differ
            Err(_) => false,
        }
    }
}

/// Persistence for mailbox entries. Implementations must support concurrent access, and removal
///  must be idempotent.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MailboxStore: Send + Sync + 'static {
    async fn put(&self, recipient: &NodeAddress, entry: MailboxEntry) -> anyhow::Result<()>;

    /// Returns `true` if an entry was removed
    async fn remove_by_uid(&self, uid: MessageUid) -> anyhow::Result<bool>;

    async fn entries_for(&self, recipient: &NodeAddress) -> anyhow::Result<Vec<MailboxEntry>>;
}

/// Keeps entries in memory, purging expired entries whenever they are read
#[derive(Default)]
pub struct InMemoryMailboxStore {
    entries: RwLock<FxHashMap<NodeAddress, Vec<MailboxEntry>>>,
}

impl InMemoryMailboxStore {
    pub fn new() -> InMemoryMailboxStore {
        Default::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await
            .values()
            .map(|e| e.len())
            .sum()
    }

    pub async fn contains(&self, uid: MessageUid) -> bool {
        self.entries.read().await
            .values()
            .flatten()
            .any(|e| e.uid == uid)
    }
}

#[async_trait]
impl MailboxStore for InMemoryMailboxStore {
    async fn put(&self, recipient: &NodeAddress, entry: MailboxEntry) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        let for_recipient = entries.entry(recipient.clone()).or_default();
        if for_recipient.iter().any(|e| e.uid == entry.uid) {
            debug!("mailbox entry {} for {} is already stored", entry.uid, recipient);
            return Ok(());
        }
        trace!("storing mailbox entry {} for {}", entry.uid, recipient);
        for_recipient.push(entry);
        Ok(())
    }

    async fn remove_by_uid(&self, uid: MessageUid) -> anyhow::Result<bool> {
        let mut entries = self.entries.write().await;
        let mut removed = false;
        for for_recipient in entries.values_mut() {
            let len_before = for_recipient.len();
            for_recipient.retain(|e| e.uid != uid);
            removed |= for_recipient.len() != len_before;
        }
        entries.retain(|_, e| !e.is_empty());
        Ok(removed)
    }

    async fn entries_for(&self, recipient: &NodeAddress) -> anyhow::Result<Vec<MailboxEntry>> {
        let now = SystemTime::now();
        let mut entries = self.entries.write().await;
        let Some(for_recipient) = entries.get_mut(recipient) else {
            return Ok(Vec::new());
        };

        let len_before = for_recipient.len();
        for_recipient.retain(|e| !e.is_expired(now));
        if for_recipient.len() != len_before {
            debug!("purged {} expired mailbox entries for {}", len_before - for_recipient.len(), recipient);
        }
        Ok(for_recipient.clone())
    }
}
