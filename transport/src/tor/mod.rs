//! Acquiring an onion routing instance: spawning one or attaching to a running one, talking to it
//!  through its control port, and restarting it with different bridges when bootstrapping fails.

pub mod backup;
pub mod bootstrap;
pub mod control;
pub mod launcher;
pub mod mode;
