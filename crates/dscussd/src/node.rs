//! The node facade: registration/login lifecycle, the relevance
//! filter, fan-out on send, and persist-then-publish local posting.
//!
//! Replaces the reference implementation's process-wide `LoggedUser`/
//! `peers`/`key_file` singletons with a `Node` value
//! constructed at [`Node::init`] and an `Option<LoggedInState>` guarding
//! the single-writer, non-reentrant login discipline.

use crate::config::NodeSettings;
use crate::network::{KillSwitch, NetworkError, NetworkEvent, NetworkManager};
use crate::store::{Store, StoreError};
use dscuss_core::crypto::{Hash, Keypair};
use dscuss_core::entity::{Entity, Message, User};
use dscuss_core::error::{CryptoError, EntityError, PowError, TopicError};
use dscuss_core::pow::PowSearch;
use dscuss_core::topic::{Subscriptions, Topic};
use dscuss_net::peer::{DisconnectReason, PeerHandle};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("already logged in")]
    AlreadyLoggedIn,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("a store already exists at {0}")]
    AlreadyRegistered(PathBuf),

    #[error("logged-in user has no stored User entity")]
    SelfUserMissing,

    #[error("subscriptions file is empty; at least one topic is required to log in")]
    EmptySubscriptions,

    #[error("message {0} not found")]
    MessageNotFound(Hash),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Pow(#[from] PowError),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Replaces a `msg_cb`/`user_cb`/`oper_cb` callback triple with a single
/// ordered event stream the out-of-scope UI consumes.
#[derive(Clone)]
pub enum NodeEvent {
    Message(Message),
    User(User),
    OperationIgnored,
}

/// A live peer as seen by the facade.
struct PeerRecord {
    user: User,
    subscriptions: Subscriptions,
    addr: Option<SocketAddr>,
    outbox: mpsc::UnboundedSender<Entity>,
    kill: KillSwitch,
}

/// A summary row for `lspeer`.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub nickname: String,
    pub user_id: Hash,
    pub addr: Option<SocketAddr>,
}

/// One DFS-ordered reply tree.
pub struct ThreadNode {
    pub message: Message,
    pub replies: Vec<ThreadNode>,
}

impl ThreadNode {
    /// Children-first, then next-sibling, then ancestor-next, expressed for
    /// free by recursive DFS over `replies`.
    pub fn flatten_depth_first(&self) -> Vec<&Message> {
        let mut out = vec![&self.message];
        for child in &self.replies {
            out.extend(child.flatten_depth_first());
        }
        out
    }
}

fn build_thread(
    store: Arc<Store>,
    message: Message,
) -> Pin<Box<dyn std::future::Future<Output = Result<ThreadNode, StoreError>> + Send>> {
    Box::pin(async move {
        let reply_rows = store.replies(&message.id()).await?;
        let mut replies = Vec::with_capacity(reply_rows.len());
        for reply in reply_rows {
            replies.push(build_thread(store.clone(), reply).await?);
        }
        Ok(ThreadNode { message, replies })
    })
}

struct LoggedInState {
    user_dir: PathBuf,
    keypair: Arc<Keypair>,
    self_user: User,
    subscriptions: Subscriptions,
    store: Arc<Store>,
    peers: Arc<AsyncMutex<HashMap<PeerHandle, PeerRecord>>>,
    network: NetworkManager,
    bridge_task: tokio::task::JoinHandle<()>,
}

/// The node facade: registration/login lifecycle and the single logged-in
/// session. Login/logout take `&mut self`, which makes a second
/// concurrent login a borrow-checker violation at the call site, backed at
/// runtime by [`NodeError::AlreadyLoggedIn`] for the async case.
pub struct Node {
    data_dir: PathBuf,
    settings: NodeSettings,
    logged: Option<LoggedInState>,
}

fn now_utc_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Node {
    /// The topic regex cache (`dscuss_core::topic`'s
    /// process-wide `Lazy<Regex>`) is already immutable-after-first-use by
    /// construction; this just records the data directory and settings
    /// snapshot handed in by the out-of-scope config loader.
    pub fn init(data_dir: impl Into<PathBuf>, settings: NodeSettings) -> Self {
        Self {
            data_dir: data_dir.into(),
            settings,
            logged: None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged.is_some()
    }

    fn user_dir(&self, nickname: &str) -> PathBuf {
        self.data_dir.join(nickname)
    }

    /// Create the directory, generate a keypair, run a
    /// PoW search, assemble and persist a self-signed `User`. Rejects if
    /// the DB file already exists.
    pub async fn register(&self, nickname: &str, info: String) -> Result<(), NodeError> {
        let user_dir = self.user_dir(nickname);
        std::fs::create_dir_all(&user_dir)?;
        let db_path = user_dir.join("db");
        if db_path.exists() {
            return Err(NodeError::AlreadyRegistered(db_path));
        }

        let keypair = Keypair::generate();
        keypair.to_pem_file(user_dir.join("privkey.pem"))?;

        let der = keypair.public().to_der();
        let progress_path = user_dir.join("proof_of_work.tmp");
        let search = PowSearch::resume(&progress_path, der, self.settings.required_zero_bits)?;
        info!(nickname, "starting proof-of-work search for registration");
        let nonce = search.run().await?;

        let user = User::emerge(&keypair, nonce, nickname.to_string(), info, now_utc_secs())?;
        let store = Store::create_new(&db_path)?;
        store.put_user(&user).await?;
        info!(nickname, user_id = %user.id(), "registration complete");
        Ok(())
    }

    /// Load the keypair, derive the id, open the store,
    /// fetch the self `User` (fail if absent), load subscriptions (fail if
    /// empty), and start the network manager. Returns the event stream the
    /// out-of-scope UI reads in place of a `msg_cb`/`user_cb`/`oper_cb`
    /// triple.
    pub async fn login(&mut self, nickname: &str) -> Result<mpsc::UnboundedReceiver<NodeEvent>, NodeError> {
        if self.logged.is_some() {
            return Err(NodeError::AlreadyLoggedIn);
        }
        let user_dir = self.user_dir(nickname);

        let keypair = Keypair::from_pem_file(user_dir.join("privkey.pem"))?;
        let id = keypair.public().id();

        let store = Arc::new(Store::open(user_dir.join("db"))?);
        let self_user = store
            .get_user(&id)
            .await?
            .ok_or(NodeError::SelfUserMissing)?;

        let subs_contents = std::fs::read_to_string(user_dir.join("subscriptions"))?;
        let subscriptions = Subscriptions::parse_file(&subs_contents)?;
        if subscriptions.is_empty() {
            return Err(NodeError::EmptySubscriptions);
        }

        let keypair = Arc::new(keypair);
        let (network, mut net_events) = NetworkManager::init(
            self.settings.port,
            self.settings.dial_tick,
            self.settings.connect_timeout,
            &user_dir.join("addresses"),
            self_user.clone(),
            keypair.clone(),
            subscriptions.clone(),
            self.settings.required_zero_bits,
        )
        .await?;

        let peers: Arc<AsyncMutex<HashMap<PeerHandle, PeerRecord>>> = Arc::new(AsyncMutex::new(HashMap::new()));
        let (node_event_tx, node_event_rx) = mpsc::unbounded_channel();

        let bridge_store = store.clone();
        let bridge_peers = peers.clone();
        let bridge_subs = subscriptions.clone();
        let bridge_task = tokio::spawn(async move {
            while let Some(event) = net_events.recv().await {
                match event {
                    NetworkEvent::Connected {
                        handle,
                        addr,
                        user,
                        subscriptions,
                        outbox,
                        kill,
                    } => {
                        if !bridge_store.has_entity(&user.id()).await.unwrap_or(true) {
                            if let Err(e) = bridge_store.put_user(&user).await {
                                warn!(error = %e, "storing newly-seen peer user failed");
                            }
                        }
                        let _ = node_event_tx.send(NodeEvent::User(user.clone()));
                        bridge_peers.lock().await.insert(
                            handle,
                            PeerRecord {
                                user,
                                subscriptions,
                                addr,
                                outbox,
                                kill,
                            },
                        );
                    }
                    NetworkEvent::Entity { handle, entity } => {
                        handle_incoming_entity(
                            &bridge_store,
                            &bridge_peers,
                            &bridge_subs,
                            &node_event_tx,
                            handle,
                            entity,
                        )
                        .await;
                    }
                    NetworkEvent::Disconnected { handle, reason } => {
                        bridge_peers.lock().await.remove(&handle);
                        debug!(?reason, "peer disconnected");
                    }
                }
            }
        });

        self.logged = Some(LoggedInState {
            user_dir,
            keypair,
            self_user,
            subscriptions,
            store,
            peers,
            network,
            bridge_task,
        });

        Ok(node_event_rx)
    }

    /// Free peers, shut down the network manager, release
    /// the store and keypair. A no-op (with a warning) if not logged in.
    pub async fn logout(&mut self) -> Result<(), NodeError> {
        let Some(logged) = self.logged.take() else {
            warn!("logout called while not logged in");
            return Ok(());
        };
        logged.bridge_task.abort();
        logged.network.uninit().await;
        Ok(())
    }

    /// Persist locally, then fan out to every
    /// handshaked peer whose declared subscriptions contain the message's
    /// topic.
    pub async fn send_message(
        &self,
        topic: Topic,
        subject: String,
        content: String,
        parent_id: Hash,
    ) -> Result<Message, NodeError> {
        let logged = self.logged.as_ref().ok_or(NodeError::NotLoggedIn)?;
        let msg = if parent_id == Hash::ZERO {
            Message::new_thread(
                &logged.keypair,
                logged.self_user.id(),
                topic,
                subject,
                content,
                now_utc_secs(),
            )
        } else {
            Message::new_reply(
                &logged.keypair,
                logged.self_user.id(),
                parent_id,
                topic,
                subject,
                content,
                now_utc_secs(),
            )
        };
        logged.store.put_message(&msg).await?;

        let peers = logged.peers.lock().await;
        for rec in peers.values() {
            if rec.subscriptions.is_relevant(&msg.topic) {
                let _ = rec.outbox.send(Entity::Message(msg.clone()));
            }
        }
        Ok(msg)
    }

    pub async fn get_message(&self, id: Hash) -> Result<Option<Message>, NodeError> {
        let logged = self.logged.as_ref().ok_or(NodeError::NotLoggedIn)?;
        Ok(logged.store.get_message(&id).await?)
    }

    /// Every stored message, newest-first.
    pub async fn get_messages(&self) -> Result<Vec<Message>, NodeError> {
        let logged = self.logged.as_ref().ok_or(NodeError::NotLoggedIn)?;
        Ok(logged.store.recent_messages().await?)
    }

    /// Thread roots, newest-first.
    pub async fn list_board(&self) -> Result<Vec<Message>, NodeError> {
        let logged = self.logged.as_ref().ok_or(NodeError::NotLoggedIn)?;
        Ok(logged.store.root_messages().await?)
    }

    /// Assemble the reply tree rooted at `root_id`.
    pub async fn list_thread(&self, root_id: Hash) -> Result<ThreadNode, NodeError> {
        let logged = self.logged.as_ref().ok_or(NodeError::NotLoggedIn)?;
        let root = logged
            .store
            .get_message(&root_id)
            .await?
            .ok_or(NodeError::MessageNotFound(root_id))?;
        Ok(build_thread(logged.store.clone(), root).await?)
    }

    /// `lspeer`: currently connected peers.
    pub async fn list_peers(&self) -> Result<Vec<PeerSummary>, NodeError> {
        let logged = self.logged.as_ref().ok_or(NodeError::NotLoggedIn)?;
        let peers = logged.peers.lock().await;
        Ok(peers
            .values()
            .map(|rec| PeerSummary {
                nickname: rec.user.nickname.clone(),
                user_id: rec.user.id(),
                addr: rec.addr,
            })
            .collect())
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    /// The directory a logged-in session is operating out of, for the
    /// out-of-scope REPL's own bookkeeping (e.g. displaying `whoami`).
    pub fn logged_in_dir(&self) -> Option<&std::path::Path> {
        self.logged.as_ref().map(|l| l.user_dir.as_path())
    }
}

/// Relevance filter: `is_relevant(subs, msg) := ∃ t ∈ subs .
/// contains(t, msg.topic)`. An incoming message that fails *our own*
/// relevance filter is the sending peer's protocol violation — they
/// should never have forwarded it — so the peer is killed, not just the
/// message dropped.
async fn handle_incoming_entity(
    store: &Arc<Store>,
    peers: &Arc<AsyncMutex<HashMap<PeerHandle, PeerRecord>>>,
    local_subscriptions: &Subscriptions,
    node_event_tx: &mpsc::UnboundedSender<NodeEvent>,
    handle: PeerHandle,
    entity: Entity,
) {
    match entity {
        Entity::User(user) => {
            if !store.has_entity(&user.id()).await.unwrap_or(true) {
                if let Err(e) = store.put_user(&user).await {
                    warn!(error = %e, "storing peer-announced user failed");
                }
            }
            let _ = node_event_tx.send(NodeEvent::User(user));
        }
        Entity::Message(msg) => {
            if !local_subscriptions.is_relevant(&msg.topic) {
                warn!(topic = %msg.topic, "peer sent an off-topic message, disconnecting");
                kill_peer(peers, handle, DisconnectReason::Violation("message outside our subscriptions".into())).await;
                return;
            }
            let author = match store.get_user(&msg.author_id).await {
                Ok(Some(author)) => author,
                Ok(None) => {
                    warn!(author_id = %msg.author_id, "message from unknown author, dropping");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "store lookup failed while ingesting message");
                    return;
                }
            };
            if !msg.verify(&author.public_key) {
                warn!(msg_id = %msg.id(), "message signature did not verify, disconnecting peer");
                kill_peer(peers, handle, DisconnectReason::Violation("bad message signature".into())).await;
                return;
            }
            if let Err(e) = store.put_message(&msg).await {
                error!(error = %e, "failed to persist incoming message");
                return;
            }
            let _ = node_event_tx.send(NodeEvent::Message(msg));
        }
        Entity::Operation(_) => {
            debug!("operation entity received, ingest not implemented");
            let _ = node_event_tx.send(NodeEvent::OperationIgnored);
        }
    }
}

async fn kill_peer(
    peers: &Arc<AsyncMutex<HashMap<PeerHandle, PeerRecord>>>,
    handle: PeerHandle,
    reason: DisconnectReason,
) {
    if let Some(rec) = peers.lock().await.get(&handle) {
        rec.kill.kill(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> NodeSettings {
        NodeSettings {
            port: 0,
            connect_timeout: std::time::Duration::from_millis(200),
            dial_tick: std::time::Duration::from_secs(3600),
            required_zero_bits: 1,
        }
    }

    fn write_subscriptions(node: &Node, nickname: &str, file_contents: &str) {
        std::fs::write(node.user_dir(nickname).join("subscriptions"), file_contents).unwrap();
    }

    /// Sequential by construction: only one test function in this module
    /// calls [`Node::register`], since [`PowSearch`] enforces a single
    /// process-wide search at a time and `cargo test` otherwise
    /// runs test functions concurrently.
    #[tokio::test]
    async fn register_login_post_list_logout_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = Node::init(dir.path(), fast_settings());

        node.register("alice", "hello".into()).await.unwrap();
        assert!(matches!(
            node.register("alice", "again".into()).await,
            Err(NodeError::AlreadyRegistered(_))
        ));

        assert!(matches!(
            node.send_message(Topic::parse("chat").unwrap(), "s".into(), "c".into(), Hash::ZERO)
                .await,
            Err(NodeError::NotLoggedIn)
        ));

        write_subscriptions(&node, "alice", "");
        assert!(matches!(
            node.login("alice").await,
            Err(NodeError::EmptySubscriptions)
        ));

        write_subscriptions(&node, "alice", "chat, food\n");
        let mut events = node.login("alice").await.unwrap();
        assert!(node.is_logged_in());
        assert!(matches!(node.login("alice").await, Err(NodeError::AlreadyLoggedIn)));

        let root = node
            .send_message(Topic::parse("chat").unwrap(), "hi".into(), "first post".into(), Hash::ZERO)
            .await
            .unwrap();
        let reply = node
            .send_message(Topic::parse("chat").unwrap(), "re: hi".into(), "a reply".into(), root.id())
            .await
            .unwrap();

        assert_eq!(node.get_message(root.id()).await.unwrap().unwrap().id(), root.id());
        let board = node.list_board().await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].id(), root.id());

        let thread = node.list_thread(root.id()).await.unwrap();
        let flat = thread.flatten_depth_first();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].id(), root.id());
        assert_eq!(flat[1].id(), reply.id());

        assert!(node.list_peers().await.unwrap().is_empty());

        // No peers are connected, so nothing was fanned out and the event
        // stream stays empty until logout closes it.
        assert!(events.try_recv().is_err());

        node.logout().await.unwrap();
        assert!(!node.is_logged_in());
        node.logout().await.unwrap();
    }

    fn signed_user(nickname: &str) -> (Keypair, User) {
        let kp = Keypair::generate();
        let user = User::emerge(&kp, 0, nickname.to_string(), "bio".into(), 1_700_000_000).unwrap();
        (kp, user)
    }

    async fn store_with_user(dir: &std::path::Path, nickname: &str) -> (Arc<Store>, Keypair, User) {
        let (kp, user) = signed_user(nickname);
        let store = Arc::new(Store::create_new(dir.join("db")).unwrap());
        store.put_user(&user).await.unwrap();
        (store, kp, user)
    }

    fn empty_peers() -> Arc<AsyncMutex<HashMap<PeerHandle, PeerRecord>>> {
        Arc::new(AsyncMutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn off_topic_message_kills_sending_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (store, author_kp, author) = store_with_user(dir.path(), "alice").await;
        let peers = empty_peers();
        let handle = PeerHandle { id: 1 };
        let kill = KillSwitch::new();
        let (outbox, _outbox_rx) = mpsc::unbounded_channel();
        peers.lock().await.insert(
            handle,
            PeerRecord {
                user: author.clone(),
                subscriptions: Subscriptions::new(vec![Topic::parse("chat").unwrap()]).unwrap(),
                addr: None,
                outbox,
                kill: kill.clone(),
            },
        );
        let local_subs = Subscriptions::new(vec![Topic::parse("food").unwrap()]).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let msg = Message::new_thread(
            &author_kp,
            author.id(),
            Topic::parse("chat").unwrap(),
            "subject".into(),
            "body".into(),
            1_700_000_001,
        );
        handle_incoming_entity(&store, &peers, &local_subs, &tx, handle, Entity::Message(msg)).await;

        assert!(kill.is_cancelled());
        assert!(matches!(kill.reason(), Some(DisconnectReason::Violation(msg)) if msg == "message outside our subscriptions"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bad_signature_kills_sending_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _author_kp, author) = store_with_user(dir.path(), "alice").await;
        let forger_kp = Keypair::generate();
        let peers = empty_peers();
        let handle = PeerHandle { id: 1 };
        let kill = KillSwitch::new();
        let (outbox, _outbox_rx) = mpsc::unbounded_channel();
        peers.lock().await.insert(
            handle,
            PeerRecord {
                user: author.clone(),
                subscriptions: Subscriptions::new(vec![Topic::parse("chat").unwrap()]).unwrap(),
                addr: None,
                outbox,
                kill: kill.clone(),
            },
        );
        let local_subs = Subscriptions::new(vec![Topic::parse("chat").unwrap()]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        // Signed by an impostor key, but claims to be authored by `author`.
        let msg = Message::new_thread(
            &forger_kp,
            author.id(),
            Topic::parse("chat").unwrap(),
            "subject".into(),
            "body".into(),
            1_700_000_001,
        );
        handle_incoming_entity(&store, &peers, &local_subs, &tx, handle, Entity::Message(msg)).await;

        assert!(kill.is_cancelled());
        assert!(matches!(kill.reason(), Some(DisconnectReason::Violation(msg)) if msg == "bad message signature"));
        assert!(store.get_message(&Hash::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn message_from_unknown_author_is_dropped_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::create_new(dir.path().join("db")).unwrap());
        let peers = empty_peers();
        let handle = PeerHandle { id: 7 };
        let local_subs = Subscriptions::new(vec![Topic::parse("chat").unwrap()]).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let stranger = Keypair::generate();
        let msg = Message::new_thread(
            &stranger,
            stranger.public().id(),
            Topic::parse("chat").unwrap(),
            "subject".into(),
            "body".into(),
            1_700_000_002,
        );
        let msg_id = msg.id();
        handle_incoming_entity(&store, &peers, &local_subs, &tx, handle, Entity::Message(msg)).await;

        assert!(store.get_message(&msg_id).await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn relevant_message_from_known_author_is_stored_and_announced() {
        let dir = tempfile::tempdir().unwrap();
        let (store, author_kp, author) = store_with_user(dir.path(), "alice").await;
        let peers = empty_peers();
        let handle = PeerHandle { id: 1 };
        let local_subs = Subscriptions::new(vec![Topic::parse("chat").unwrap()]).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let msg = Message::new_thread(
            &author_kp,
            author.id(),
            Topic::parse("chat").unwrap(),
            "subject".into(),
            "body".into(),
            1_700_000_003,
        );
        let msg_id = msg.id();
        handle_incoming_entity(&store, &peers, &local_subs, &tx, handle, Entity::Message(msg)).await;

        assert!(store.get_message(&msg_id).await.unwrap().is_some());
        match rx.try_recv() {
            Ok(NodeEvent::Message(m)) => assert_eq!(m.id(), msg_id),
            other => panic!("expected NodeEvent::Message, got {}", other.is_ok()),
        }
    }
}
