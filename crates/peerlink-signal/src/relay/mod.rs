//! Relay side of the signaling protocol
//!
//! [`RelayHub`] holds the rooms and routing rules. [`RelayServer`] exposes it
//! over WebSocket; [`MemoryConnector`] attaches sessions to it in-process.

pub mod hub;
pub mod memory;
pub mod server;

pub use hub::{RelayHub, Room};
pub use memory::{MemoryConnector, MemorySession};
pub use server::RelayServer;
