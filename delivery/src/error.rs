use transport::node_address::NodeAddress;
use thiserror::Error;

/// A sealed payload that could not be authenticated. Such messages are dropped and never retried.
#[derive(Debug, Error)]
pub enum DecryptionError {
    #[error("sealed payload is malformed: {0}")]
    Malformed(String),
    #[error("integrity check failed")]
    IntegrityCheckFailed,
    #[error("payload is sealed for a different recipient")]
    WrongRecipient,
    #[error("payload carries an invalid signature")]
    InvalidSignature,
}

/// Neither the direct send nor the mailbox fallback succeeded
#[derive(Debug, Error)]
pub enum DeliveryFault {
    #[error("could not seal message: {0}")]
    Encryption(String),
    #[error("sending to {peer} failed and the message is not mailbox eligible: {cause}")]
    NotMailboxEligible { peer: NodeAddress, cause: String },
    #[error("sending to {peer} failed ({cause}), and the mailbox is unavailable: {mailbox_error}")]
    MailboxUnavailable { peer: NodeAddress, cause: String, mailbox_error: String },
}
