//! Per-peer state machine layered over [`Connection`], with phase-gated
//! packet dispatch and duplicate detection.

use crate::connection::{Connection, ConnectionError, Direction};
use crate::handshake::{run_handshake, HandshakeError};
use crate::packet::{Packet, PacketError, PacketType};
use dscuss_core::crypto::Keypair;
use dscuss_core::entity::{Entity, Message, Operation, User};
use dscuss_core::topic::Subscriptions;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

/// Lifecycle phase of a peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Handshaking,
    Handshaked,
    Closed,
}

/// Why a peer was torn down.
#[derive(Clone, Debug)]
pub enum DisconnectReason {
    Broken,
    Closed,
    Duplicate(PeerHandle),
    NoCommonInterests,
    Banned,
    Violation(String),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("packet type {0:?} is not expected in phase {1:?}")]
    UnexpectedPhaseDispatch(PacketType, Phase),

    #[error("entity error: {0}")]
    Entity(String),
}

/// A cheap, copyable reference to a peer used in disconnect bookkeeping
/// (e.g. the surviving side of a [`DisconnectReason::Duplicate`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub id: u64,
}

/// `ANNOUNCE`/`ACK`/`REQ` are part of the closed wire vocabulary (§4.5) but
/// their pipelines are never wired up — relay/gossip routing beyond
/// one-hop push is a Non-goal (§1) — so they stay outside every phase's
/// expected set and a peer sending one is a protocol violation, the same
/// treatment an unknown packet type would get.
fn expected_types_for(phase: Phase) -> &'static [PacketType] {
    match phase {
        Phase::Connecting | Phase::Closed => &[],
        Phase::Handshaking => &[PacketType::User, PacketType::Hello],
        Phase::Handshaked => &[PacketType::Msg, PacketType::User, PacketType::Oper],
    }
}

/// One connected remote node.
pub struct Peer {
    pub handle: PeerHandle,
    pub addr: Option<SocketAddr>,
    connection: Connection,
    phase: Phase,
    pub user: Option<User>,
    pub subscriptions: Option<Subscriptions>,
}

impl Peer {
    pub fn new(id: u64, connection: Connection, addr: Option<SocketAddr>) -> Self {
        Self {
            handle: PeerHandle { id },
            addr,
            connection,
            phase: Phase::Connecting,
            user: None,
            subscriptions: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the handshake and, on success, transition to `Handshaked` with
    /// the expected-packet-type set widened accordingly.
    pub async fn handshake(
        &mut self,
        self_user: &User,
        keypair: &Keypair,
        subscriptions: &Subscriptions,
        required_zero_bits: u32,
    ) -> Result<(), PeerError> {
        self.phase = Phase::Handshaking;
        match run_handshake(&mut self.connection, self_user, keypair, subscriptions, required_zero_bits).await {
            Ok((peer_user, peer_subs)) => {
                self.user = Some(peer_user);
                self.subscriptions = Some(peer_subs);
                self.phase = Phase::Handshaked;
                Ok(())
            }
            Err(e) => {
                self.phase = Phase::Closed;
                Err(PeerError::Handshake(e))
            }
        }
    }

    /// Serialize, sign, and enqueue an entity of the appropriate packet type
    ///. Returns `false` (rather than erroring) on serialization
    /// failure, matching the synchronous-call contract; Connection-layer
    /// send failures surface through the returned future's `Err`.
    pub async fn send_entity(&self, entity: &Entity, keypair: &Keypair) -> Result<bool, PeerError> {
        let packet = match entity {
            Entity::User(user) => Packet::new_user(user.serialize()),
            Entity::Message(msg) => Packet::signed(PacketType::Msg, msg.serialize(), keypair)?,
            Entity::Operation(_) => return Ok(false),
        };
        self.connection.send(packet).await?;
        Ok(true)
    }

    /// Receive and dispatch one packet. Any type outside the phase's
    /// expected set is a protocol violation and the caller should tear the
    /// peer down with [`DisconnectReason::Violation`].
    pub async fn recv_entity(&mut self) -> Result<Entity, PeerError> {
        let packet = self.connection.recv().await?;
        if !expected_types_for(self.phase).contains(&packet.packet_type) {
            return Err(PeerError::UnexpectedPhaseDispatch(packet.packet_type, self.phase));
        }
        match packet.packet_type {
            PacketType::User => {
                let user = User::deserialize(&packet.payload).map_err(|e| PeerError::Entity(e.to_string()))?;
                Ok(Entity::User(user))
            }
            PacketType::Msg => {
                let msg = Message::deserialize(&packet.payload).map_err(|e| PeerError::Entity(e.to_string()))?;
                Ok(Entity::Message(msg))
            }
            PacketType::Oper => {
                Operation::deserialize(&packet.payload).map_err(|e| PeerError::Entity(e.to_string()))?;
                unreachable!("Operation::deserialize always errors")
            }
            other => Err(PeerError::UnexpectedPhaseDispatch(other, self.phase)),
        }
    }

    /// Destroy the peer: cancel in-flight I/O and close the connection.
    /// Synchronous and consuming, so it is only ever reachable once — callers
    /// invoke it inline at the end of the peer's own per-connection task
    /// (see `dscussd::network::run_peer`), never from a nested callback.
    pub fn free_with_reason(mut self, reason: DisconnectReason) -> DisconnectReason {
        debug!(peer_id = self.handle.id, ?reason, "freeing peer");
        self.phase = Phase::Closed;
        self.connection.cancel_io(Direction::Both);
        self.connection.close();
        reason
    }
}
