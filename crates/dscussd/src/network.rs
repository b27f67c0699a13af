//! Network manager: listener, dial loop and peer registry.
//!
//! Each live connection is driven by its own task (one task per connection,
//! multiplexed by the runtime instead of hand-rolled socket-readiness
//! polling). A task runs the handshake, resolves duplicates against the
//! process-wide `peers_by_id` map, then loops forwarding inbound entities to
//! the [`Node`][crate::node] event channel and draining its own outbound
//! queue — an actor per connection, each with its own `mpsc` send queue.

use dscuss_core::crypto::{Hash, Keypair};
use dscuss_core::entity::{Entity, User};
use dscuss_core::topic::Subscriptions;
use dscuss_net::connection::Connection;
use dscuss_net::peer::{DisconnectReason, Peer, PeerError, PeerHandle};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `host:port`, IPv4 dotted quad or RFC-952/1123 hostname.
static HOST_PORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^
        (
            (?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)
            (?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*
            |
            (?:\d{1,3}\.){3}\d{1,3}
        )
        :(\d{1,5})$",
    )
    .unwrap()
});

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid peer address: {0:?}")]
    InvalidAddress(String),
}

/// Validate and dedupe one `host:port` per line.
pub fn parse_address_file(contents: &str) -> Result<Vec<String>, NetworkError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !HOST_PORT_RE.is_match(line) {
            return Err(NetworkError::InvalidAddress(line.to_string()));
        }
        if seen.insert(line.to_string()) {
            out.push(line.to_string());
        }
    }
    Ok(out)
}

/// `Peer -> Option<associated dial address>` registry.
#[derive(Default)]
struct PeerTable {
    addrs: RwLock<HashMap<u64, Option<String>>>,
}

impl PeerTable {
    fn insert(&self, handle: PeerHandle, addr: Option<String>) {
        self.addrs.write().insert(handle.id, addr);
    }

    fn remove(&self, handle: PeerHandle) -> Option<String> {
        self.addrs.write().remove(&handle.id).flatten()
    }

    fn set_address(&self, handle: PeerHandle, addr: Option<String>) {
        self.addrs.write().insert(handle.id, addr);
    }

    /// Addresses currently associated with a handshaked peer.
    fn dialed_addresses(&self) -> HashSet<String> {
        self.addrs
            .read()
            .values()
            .filter_map(|a| a.clone())
            .collect()
    }
}

/// A cancellation token paired with the reason the facade killed the peer
/// for, so the peer's own task can report why it tore down rather than a
/// single generic cause. Cloning shares both the token and the reason slot.
#[derive(Clone)]
pub struct KillSwitch {
    token: CancellationToken,
    reason: Arc<parking_lot::Mutex<Option<DisconnectReason>>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Record the reason and request cancellation. Only the first call's
    /// reason sticks; later calls still cancel but cannot overwrite it.
    pub fn kill(&self, reason: DisconnectReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn take_reason(&self) -> Option<DisconnectReason> {
        self.reason.lock().take()
    }

    /// Peek the recorded reason without consuming it.
    pub fn reason(&self) -> Option<DisconnectReason> {
        self.reason.lock().clone()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// An event surfaced from the network layer up to [`crate::node::Node`].
pub enum NetworkEvent {
    /// A peer completed the handshake. `outbox` is this peer's private
    /// send queue; `kill` lets the facade force a teardown with a reason.
    Connected {
        handle: PeerHandle,
        addr: Option<SocketAddr>,
        user: User,
        subscriptions: Subscriptions,
        outbox: mpsc::UnboundedSender<Entity>,
        kill: KillSwitch,
    },
    /// An already-connected peer sent an entity.
    Entity { handle: PeerHandle, entity: Entity },
    /// A peer was torn down.
    Disconnected {
        handle: PeerHandle,
        reason: DisconnectReason,
    },
}

struct SharedState {
    next_id: AtomicU64,
    table: PeerTable,
    peers_by_user_id: RwLock<HashMap<Hash, PeerHandle>>,
    self_user: User,
    keypair: Arc<Keypair>,
    subscriptions: Subscriptions,
    required_zero_bits: u32,
    events_tx: mpsc::UnboundedSender<NetworkEvent>,
}

/// Listener, dial loop and peer registry. Dropping (via [`Self::uninit`])
/// stops both background tasks and releases the listener.
pub struct NetworkManager {
    shared: Arc<SharedState>,
    listen_cancel: CancellationToken,
    dial_cancel: CancellationToken,
    listener_task: tokio::task::JoinHandle<()>,
    dial_task: tokio::task::JoinHandle<()>,
}

impl NetworkManager {
    /// Bind the listener, load the dial list, and start the accept and
    /// dial-tick loops.
    pub async fn init(
        port: u16,
        dial_tick: Duration,
        connect_timeout: Duration,
        addr_file: &Path,
        self_user: User,
        keypair: Arc<Keypair>,
        subscriptions: Subscriptions,
        required_zero_bits: u32,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NetworkEvent>), NetworkError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bound_port = listener.local_addr()?.port();
        info!(port = bound_port, "dscussd listening");

        let dial_addresses = match std::fs::read_to_string(addr_file) {
            Ok(contents) => parse_address_file(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(NetworkError::Io(e)),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState {
            next_id: AtomicU64::new(1),
            table: PeerTable::default(),
            peers_by_user_id: RwLock::new(HashMap::new()),
            self_user,
            keypair,
            subscriptions,
            required_zero_bits,
            events_tx,
        });

        let listen_cancel = CancellationToken::new();
        let dial_cancel = CancellationToken::new();

        let listener_task = tokio::spawn(accept_loop(listener, shared.clone(), listen_cancel.clone()));
        let dial_task = tokio::spawn(dial_loop(
            dial_addresses,
            dial_tick,
            connect_timeout,
            shared.clone(),
            dial_cancel.clone(),
        ));

        Ok((
            Self {
                shared,
                listen_cancel,
                dial_cancel,
                listener_task,
                dial_task,
            },
            events_rx,
        ))
    }

    /// Stop both background tasks and release the listener.
    pub async fn uninit(self) {
        self.listen_cancel.cancel();
        self.dial_cancel.cancel();
        let _ = self.listener_task.await;
        let _ = self.dial_task.await;
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<SharedState>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("accept loop stopping");
                return;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted inbound connection");
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            run_peer(stream, None, shared).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn dial_loop(
    addresses: Vec<String>,
    tick: Duration,
    connect_timeout: Duration,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(tick);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("dial loop stopping");
                return;
            }
            _ = ticker.tick() => {
                let dialed = shared.table.dialed_addresses();
                for addr in &addresses {
                    if dialed.contains(addr) {
                        continue;
                    }
                    let shared = shared.clone();
                    let addr = addr.clone();
                    tokio::spawn(async move {
                        // `TcpStream::connect` resolves RFC-952/1123 hostnames as well
                        // as dotted-quad addresses, so the `host:port` string validated
                        // out of the address file is passed through unparsed.
                        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr.as_str())).await {
                            Ok(Ok(stream)) => run_peer(stream, Some(addr), shared).await,
                            Ok(Err(e)) => debug!(%addr, error = %e, "dial failed"),
                            Err(_) => debug!(%addr, "dial timed out"),
                        }
                    });
                }
            }
        }
    }
}

/// Drive one connection end to end: construct the [`Peer`], run the
/// handshake, resolve duplicates, then relay entities until it closes.
async fn run_peer(stream: TcpStream, dial_addr: Option<String>, shared: Arc<SharedState>) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let handle = PeerHandle { id };
    let peer_socket_addr = stream.peer_addr().ok();
    let connection = Connection::new(stream);
    let mut peer = Peer::new(id, connection, peer_socket_addr);

    if let Err(e) = peer
        .handshake(
            &shared.self_user,
            &shared.keypair,
            &shared.subscriptions,
            shared.required_zero_bits,
        )
        .await
    {
        debug!(peer_id = id, error = %e, "handshake failed");
        let _ = shared.events_tx.send(NetworkEvent::Disconnected {
            handle,
            reason: DisconnectReason::Broken,
        });
        return;
    }

    let peer_user = peer.user.clone().expect("handshake populates user on success");
    let peer_subs = peer.subscriptions.clone().expect("handshake populates subscriptions on success");
    let peer_user_id = peer_user.id();

    let duplicate_of = {
        let mut map = shared.peers_by_user_id.write();
        match map.get(&peer_user_id).cloned() {
            Some(existing) => Some(existing),
            None => {
                map.insert(peer_user_id, handle);
                None
            }
        }
    };

    shared.table.insert(handle, dial_addr.clone());

    if let Some(existing) = duplicate_of {
        if dial_addr.is_some() {
            shared.table.set_address(existing, dial_addr);
        }
        shared.table.remove(handle);
        let _ = peer.free_with_reason(DisconnectReason::Duplicate(existing));
        let _ = shared.events_tx.send(NetworkEvent::Disconnected {
            handle,
            reason: DisconnectReason::Duplicate(existing),
        });
        return;
    }

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Entity>();
    let kill = KillSwitch::new();

    if shared
        .events_tx
        .send(NetworkEvent::Connected {
            handle,
            addr: peer_socket_addr,
            user: peer_user,
            subscriptions: peer_subs,
            outbox: outbox_tx,
            kill: kill.clone(),
        })
        .is_err()
    {
        // Facade already shut down.
        let _ = peer.free_with_reason(DisconnectReason::Closed);
        return;
    }

    let reason = loop {
        tokio::select! {
            biased;
            _ = kill.cancelled() => {
                break kill.take_reason().unwrap_or(DisconnectReason::Violation("disconnected by local facade".into()));
            }
            outgoing = outbox_rx.recv() => {
                match outgoing {
                    Some(entity) => {
                        if let Err(e) = peer.send_entity(&entity, &shared.keypair).await {
                            break peer_error_reason(e);
                        }
                    }
                    None => break DisconnectReason::Closed,
                }
            }
            incoming = peer.recv_entity() => {
                match incoming {
                    Ok(entity) => {
                        if shared.events_tx.send(NetworkEvent::Entity { handle, entity }).is_err() {
                            break DisconnectReason::Closed;
                        }
                    }
                    Err(e) => break peer_error_reason(e),
                }
            }
        }
    };

    shared.peers_by_user_id.write().remove(&peer_user_id);
    shared.table.remove(handle);
    let _ = peer.free_with_reason(reason.clone());
    let _ = shared.events_tx.send(NetworkEvent::Disconnected { handle, reason });
}

fn peer_error_reason(e: PeerError) -> DisconnectReason {
    match e {
        PeerError::UnexpectedPhaseDispatch(ty, phase) => {
            DisconnectReason::Violation(format!("unexpected packet {ty:?} in phase {phase:?}"))
        }
        PeerError::Packet(_) => DisconnectReason::Violation(e.to_string()),
        _ => DisconnectReason::Broken,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_dedupes_address_file() {
        let contents = "127.0.0.1:8004\nexample.com:9000\n127.0.0.1:8004\n";
        let addrs = parse_address_file(contents).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8004", "example.com:9000"]);
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(parse_address_file("not-an-address\n").is_err());
    }

    #[test]
    fn ignores_blank_lines() {
        let addrs = parse_address_file("\n127.0.0.1:1\n\n").unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:1"]);
    }
}
