//! Reliable delivery of sealed application messages on top of [`transport`].
//!
//! A message is sealed for the recipient's key ring ([`crypto::EnvelopeCrypto`]) and sent over a
//!  direct connection. If the peer can not be reached within
//!  [`config::DeliveryConfig::direct_send_timeout`], mailbox eligible messages are stored in a
//!  [`mailbox::MailboxStore`] instead, where the recipient picks them up after coming online.
//!
//! Recipients acknowledge every processed message with an [`message::AckMessage`], which moves
//!  the sender's [`send_state::SendState`] to `Acked` and removes a mailbox copy that may still
//!  exist. ACKs are never acknowledged themselves.
//!
//! ```ascii
//! sender                                        recipient
//!   | ---- Sealed(DirectMessage) ----------------> |   (or via mailbox)
//!   |                                              |   ProtocolInbox -> ProtocolHandler
//!   | <--- Sealed(AckMessage) -------------------- |   (or via mailbox)
//! ```
//!
//! [`protocol_inbox::ProtocolInbox`] routes messages of a single protocol session to its
//!  handler, buffering those that arrive before the session is initialized.

pub mod config;
pub mod crypto;
pub mod delivery_service;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod protocol_inbox;
pub mod send_state;

#[cfg(test)]
mod test_util;
