//! Packet codec, connection, handshake and per-peer state machine for the
//! Dscuss node engine.
//!
//! # Modules
//!
//! - [`packet`]: the closed packet-type wire format and its `tokio_util` codec.
//! - [`connection`]: a cancellable, ordered read/write wrapper over one TCP stream.
//! - [`handshake`]: the 4-message authenticated identity/subscription exchange.
//! - [`peer`]: the per-peer phase state machine and typed dispatch.

pub mod connection;
pub mod handshake;
pub mod packet;
pub mod peer;

pub use connection::{Connection, ConnectionError, Direction};
pub use handshake::{run_handshake, HandshakeError};
pub use packet::{Packet, PacketCodec, PacketError, PacketType};
pub use peer::{DisconnectReason, Peer, PeerError, PeerHandle, Phase};
