//! The 4-message authenticated handshake binding identity, subscriptions
//! and freshness.
//!
//! Both sides run the identical sequence: send own `USER`, await the
//! peer's `USER`, send a signed `HELLO`, await the peer's `HELLO`. The
//! whole exchange is bounded by a single 15-second deadline.

use crate::connection::{Connection, ConnectionError};
use crate::packet::{Packet, PacketError, PacketType};
use dscuss_core::crypto::{Hash, Keypair};
use dscuss_core::entity::User;
use dscuss_core::topic::Subscriptions;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// HELLO timestamps must be within this many seconds of the receiver's own
/// clock.
pub const HELLO_FRESHNESS_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("unexpected packet type in handshake: {0:?}")]
    UnexpectedType(PacketType),

    #[error("malformed hello payload: {0}")]
    MalformedHello(String),

    #[error("peer's user failed proof-of-work or self-signature validation")]
    InvalidPeerUser,

    #[error("hello signature did not verify under peer's public key")]
    BadHelloSignature,

    #[error("hello receiver_id did not match our own id")]
    WrongReceiver,

    #[error("hello timestamp is stale or in the future")]
    StaleTimestamp,

    #[error("handshake did not complete within {0:?}")]
    Timeout(Duration),

    #[error("entity error: {0}")]
    Entity(String),
}

fn build_hello_payload(receiver_id: Hash, timestamp: i64, subs: &Subscriptions) -> Vec<u8> {
    let subs_str = subs.to_hello_string();
    let mut subs_bytes = subs_str.into_bytes();
    subs_bytes.push(0); // null-terminated.
    let mut out = Vec::with_capacity(64 + 8 + 2 + subs_bytes.len());
    out.extend_from_slice(receiver_id.as_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&(subs_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(&subs_bytes);
    out
}

struct HelloPayload {
    receiver_id: Hash,
    timestamp: i64,
    subscriptions: Subscriptions,
}

fn parse_hello_payload(buf: &[u8]) -> Result<HelloPayload, HandshakeError> {
    if buf.len() < 64 + 8 + 2 {
        return Err(HandshakeError::MalformedHello("too short".into()));
    }
    let mut receiver_id_bytes = [0u8; 64];
    receiver_id_bytes.copy_from_slice(&buf[0..64]);
    let timestamp = i64::from_be_bytes(buf[64..72].try_into().unwrap());
    let subs_len = u16::from_be_bytes(buf[72..74].try_into().unwrap()) as usize;
    let rest = &buf[74..];
    if rest.len() < subs_len {
        return Err(HandshakeError::MalformedHello("subscriptions length overruns payload".into()));
    }
    let subs_bytes = &rest[..subs_len];
    let subs_str = std::str::from_utf8(subs_bytes)
        .map_err(|e| HandshakeError::MalformedHello(e.to_string()))?
        .trim_end_matches('\0');
    let subscriptions = Subscriptions::parse_hello_string(subs_str)
        .map_err(|e| HandshakeError::MalformedHello(e.to_string()))?;
    if subscriptions.is_empty() {
        return Err(HandshakeError::MalformedHello("empty subscriptions".into()));
    }
    Ok(HelloPayload {
        receiver_id: Hash(receiver_id_bytes),
        timestamp,
        subscriptions,
    })
}

fn now_utc_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Run the 4-packet exchange. Returns the peer's authenticated `User` and
/// declared subscriptions on success. `required_zero_bits` is the
/// operator-configured proof-of-work difficulty (`NodeSettings::required_zero_bits`)
/// the peer's self-asserted `User` must clear — the same bar this node
/// holds its own registration to, not a fixed runtime-check constant.
pub async fn run_handshake(
    conn: &mut Connection,
    self_user: &User,
    keypair: &Keypair,
    subscriptions: &Subscriptions,
    required_zero_bits: u32,
) -> Result<(User, Subscriptions), HandshakeError> {
    tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        run_handshake_inner(conn, self_user, keypair, subscriptions, required_zero_bits),
    )
    .await
    .map_err(|_| HandshakeError::Timeout(HANDSHAKE_TIMEOUT))?
}

async fn run_handshake_inner(
    conn: &mut Connection,
    self_user: &User,
    keypair: &Keypair,
    subscriptions: &Subscriptions,
    required_zero_bits: u32,
) -> Result<(User, Subscriptions), HandshakeError> {
    // 1. Send own USER packet (self-signed payload, unsigned at packet level).
    conn.send(Packet::new_user(self_user.serialize())).await?;

    // 2. Await peer's USER packet.
    let user_packet = conn.recv().await?;
    if user_packet.packet_type != PacketType::User {
        return Err(HandshakeError::UnexpectedType(user_packet.packet_type));
    }
    let peer_user =
        User::deserialize(&user_packet.payload).map_err(|e| HandshakeError::Entity(e.to_string()))?;
    if !peer_user.is_valid(required_zero_bits) {
        return Err(HandshakeError::InvalidPeerUser);
    }
    debug!(peer_id = %peer_user.id(), nickname = %peer_user.nickname, "peer user accepted");

    // 3. Send a signed HELLO.
    let hello_payload = build_hello_payload(peer_user.id(), now_utc_secs(), subscriptions);
    let hello_packet = Packet::signed(PacketType::Hello, hello_payload, keypair)?;
    conn.send(hello_packet).await?;

    // 4. Await peer's HELLO.
    let peer_hello_packet = conn.recv().await?;
    if peer_hello_packet.packet_type != PacketType::Hello {
        return Err(HandshakeError::UnexpectedType(peer_hello_packet.packet_type));
    }
    if !peer_hello_packet.verify(&peer_user.public_key) {
        return Err(HandshakeError::BadHelloSignature);
    }
    let hello = parse_hello_payload(&peer_hello_packet.payload)?;
    if hello.receiver_id != self_user.id() {
        return Err(HandshakeError::WrongReceiver);
    }
    if (now_utc_secs() - hello.timestamp).abs() > HELLO_FRESHNESS_SECS {
        return Err(HandshakeError::StaleTimestamp);
    }

    debug!(peer_id = %peer_user.id(), "handshake complete");
    Ok((peer_user, hello.subscriptions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dscuss_core::topic::Topic;
    use tokio::net::{TcpListener, TcpStream};

    fn make_user(keypair: &Keypair, nickname: &str) -> User {
        let der = keypair.public().to_der();
        let mut nonce = 0u64;
        while !dscuss_core::pow::validate(&der, nonce, 1) {
            nonce += 1;
        }
        User::emerge(keypair, nonce, nickname.into(), "".into(), now_utc_secs()).unwrap()
    }

    async fn connected_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, _) = listener.accept().await.unwrap();
        let client_stream = connect.await.unwrap();
        (Connection::new(server_stream), Connection::new(client_stream))
    }

    #[tokio::test]
    async fn successful_handshake_both_sides() {
        let (mut conn_a, mut conn_b) = connected_pair().await;
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let user_a = make_user(&kp_a, "alice");
        let user_b = make_user(&kp_b, "bob");
        let subs_a = Subscriptions::new(vec![Topic::parse("x").unwrap()]).unwrap();
        let subs_b = Subscriptions::new(vec![Topic::parse("x").unwrap()]).unwrap();

        let side_a = tokio::spawn(async move {
            run_handshake(&mut conn_a, &user_a, &kp_a, &subs_a, 1).await
        });
        let side_b = tokio::spawn(async move {
            run_handshake(&mut conn_b, &user_b, &kp_b, &subs_b, 1).await
        });

        let (peer_user_b, peer_subs_b) = side_a.await.unwrap().unwrap();
        let (peer_user_a, peer_subs_a) = side_b.await.unwrap().unwrap();

        assert_eq!(peer_user_b.nickname, "bob");
        assert_eq!(peer_user_a.nickname, "alice");
        assert!(!peer_subs_a.is_empty());
        assert!(!peer_subs_b.is_empty());
    }

    #[tokio::test]
    async fn stale_timestamp_fails_handshake() {
        let (mut conn_a, mut conn_b) = connected_pair().await;
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let user_a = make_user(&kp_a, "alice");
        let user_a_id = user_a.id();
        let user_b = make_user(&kp_b, "bob");
        let subs = Subscriptions::new(vec![Topic::parse("x").unwrap()]).unwrap();
        let subs_b = subs.clone();

        // Side B manually crafts a HELLO with the correct receiver_id but a
        // stale timestamp, instead of using run_handshake (S4).
        let side_a = tokio::spawn(async move { run_handshake(&mut conn_a, &user_a, &kp_a, &subs, 1).await });
        let side_b = tokio::spawn(async move {
            conn_b.send(Packet::new_user(user_b.serialize())).await.unwrap();
            let _their_user = conn_b.recv().await.unwrap();
            let stale_payload = build_hello_payload(user_a_id, now_utc_secs() - 1000, &subs_b);
            conn_b.send(Packet::signed(PacketType::Hello, stale_payload, &kp_b).unwrap()).await.unwrap();
        });

        let _ = side_b.await;
        let result = side_a.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::StaleTimestamp)));
    }
}
