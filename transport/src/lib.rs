//! Peer-to-peer transport over an anonymizing overlay (or plain localhost TCP for testing).
//!
//! A [`node::TransportNode`] owns the local endpoint identity, the accept loop and the registry of
//!  inbound / outbound [`connection::Connection`]s. It acquires its [`substrate::Substrate`] through
//!  a [`substrate::SubstrateLauncher`]: either a simulated localhost substrate or an onion routing
//!  instance that is spawned or attached to (see [`tor`]).
//!
//! ## Wire format
//!
//! Every frame on a connection is length prefixed, all numbers in network byte order (BE):
//!
//! ```ascii
//!  0: frame length (u32), starting *after* the encoded length
//!  4: protocol version (u8)
//!  5: envelope kind (u8)
//!  6: checksum of the body (u64, CRC-64)
//! 14: body
//! ```
//!
//! Both sides send a `Hello` envelope first, carrying their published address (if already known)
//!  and their capabilities. A graceful close is preceded by a `CloseConnection` envelope with a
//!  reason. Application payloads travel in `Sealed` envelopes which carry a unique message id and
//!  an opaque (encrypted and signed) payload.
//!
//! ## Concurrency
//!
//! All listener callbacks are run in submission order on a single [`executor::SerialExecutor`] per
//!  node, so consumer state is never mutated by two callbacks concurrently. Socket work (accept,
//!  read, write, dial) happens on separate tasks and only hands results to the executor.

pub mod buf;
pub mod capabilities;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod frame;
pub mod listener;
pub mod node;
pub mod node_address;
pub mod proxy;
pub mod server;
pub mod shutdown;
pub mod substrate;
pub mod tor;

#[cfg(test)]
mod test_util;
