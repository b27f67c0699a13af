//! dscussd - Dscuss peer-to-peer discussion node daemon
//!
//! This daemon provides:
//! - Identity registration gated by proof-of-work
//! - A TCP peer network with handshake and relevance-filtered relay
//! - A local relational store of users and messages
//! - The node facade tying the above together for one logged-in session

pub mod config;
pub mod network;
pub mod node;
pub mod store;

pub use config::{Cli, Command, NodeSettings};
pub use network::NetworkManager;
pub use node::{Node, NodeError, NodeEvent, PeerSummary, ThreadNode};
pub use store::Store;
