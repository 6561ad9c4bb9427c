//! The node's single owned context: peer sets, message store, per-connection
//! caches and collaborators. Protocol handlers live in `dispatch`, periodic
//! upkeep in `maintain`; both mutate this struct and queue [`Action`]s that the
//! event loop carries out against real sockets.

use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Config;
use crate::kv::KeyValueStore;
use crate::local_addr::LocalAddrs;
use crate::msg_store::MessageStore;
use crate::peer_cache::{CacheError, Extracted, PeerCache};
use crate::registry::{ConnId, PeerId, Registry, Removed, WaitStatus, WaitingPeer};
use crate::wire::{Body, Frame, WireError, MAX_PEER_AD};

#[derive(Debug, Clone)]
pub struct Settings {
    pub max_peer_ad: usize,
    pub neighbor_target: usize,
    pub auto_join: bool,
    pub search_key: Option<String>,
    pub heartbeat: Duration,
    pub probe: Duration,
    pub query: Duration,
    pub zombie: Duration,
    pub retention: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_peer_ad: MAX_PEER_AD,
            neighbor_target: 8,
            auto_join: true,
            search_key: None,
            heartbeat: Duration::from_secs(5),
            probe: Duration::from_secs(8),
            query: Duration::from_secs(10),
            zombie: Duration::from_secs(30),
            retention: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for Settings {
    fn from(cfg: &Config) -> Self {
        let t = &cfg.timing;
        Self {
            max_peer_ad: cfg.node.max_peer_ad,
            neighbor_target: cfg.node.neighbor_target,
            auto_join: cfg.node.auto_join,
            search_key: cfg.node.search_key.clone(),
            heartbeat: Duration::from_millis(t.heartbeat_ms),
            probe: Duration::from_millis(t.probe_ms),
            query: Duration::from_millis(t.query_ms),
            zombie: Duration::from_millis(t.zombie_ms),
            retention: Duration::from_millis(t.retention_ms),
        }
    }
}

/// A QUERY_HIT that answered a query this node originated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHit {
    pub msg_id: u32,
    pub key: Option<String>,
    pub responder: PeerId,
    pub values: Vec<u32>,
}

/// Side effects for the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(ConnId, Bytes),
    /// Registry and cache are already gone; shut the socket.
    Close(ConnId),
    /// Open an outbound connection to an urgent waiting peer.
    Connect(PeerId),
    Deliver(QueryHit),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("no peer cache for connection {0}")]
    UnknownConnection(ConnId),
    #[error(transparent)]
    CacheFull(#[from] CacheError),
}

/// Next-due instants of the periodic jobs; `None` fires on the next cycle.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    pub(crate) heartbeat_next: Option<Instant>,
    pub(crate) probe_next: Option<Instant>,
    pub(crate) query_next: Option<Instant>,
}

pub struct Overlay {
    pub(crate) me: PeerId,
    pub(crate) settings: Settings,
    pub(crate) registry: Registry,
    pub(crate) store: MessageStore,
    pub(crate) caches: HashMap<ConnId, PeerCache>,
    pub(crate) kv: Box<dyn KeyValueStore + Send>,
    pub(crate) local: Box<dyn LocalAddrs + Send>,
    pub(crate) schedule: Schedule,
    actions: Vec<Action>,
}

impl Overlay {
    pub fn new(
        me: PeerId,
        settings: Settings,
        kv: Box<dyn KeyValueStore + Send>,
        local: Box<dyn LocalAddrs + Send>,
    ) -> Self {
        let store = MessageStore::new(settings.retention);
        Self {
            me,
            settings,
            registry: Registry::new(),
            store,
            caches: HashMap::new(),
            kv,
            local,
            schedule: Schedule::default(),
            actions: Vec::new(),
        }
    }

    pub fn me(&self) -> PeerId {
        self.me
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn has_cache(&self, conn: ConnId) -> bool {
        self.caches.contains_key(&conn)
    }

    /// Queue the bootstrap peer; it is connected on the next maintenance cycle.
    pub fn add_bootstrap(&mut self, peer: PeerId, now: Instant) -> bool {
        if self.local.is_local(peer.ip, peer.port) || peer == self.me {
            warn!("⚠️  Bootstrap address {} is this node, ignoring", peer);
            return false;
        }
        self.registry.insert_waiting(WaitingPeer::discovered(peer, true, now))
    }

    /// Register a freshly accepted socket as a waiting peer.
    pub fn accept(&mut self, remote: SocketAddrV4, now: Instant) -> Option<ConnId> {
        let conn = self.registry.alloc_conn();
        let id = PeerId::from(remote);
        if !self.registry.insert_waiting(WaitingPeer::inbound(id, conn, now)) {
            warn!("⚠️  Connection from {} collides with a known peer, refusing", id);
            return None;
        }
        self.caches.insert(conn, PeerCache::new());
        info!("📥 Connection from {}, conn {}", id, conn);
        Some(conn)
    }

    /// Outbound connect to `peer` succeeded: attach the socket and send JOIN.
    pub fn connected(&mut self, peer: PeerId, now: Instant) -> Option<ConnId> {
        let conn = self.registry.alloc_conn();
        if !self.registry.attach_conn(&peer, conn) {
            return None;
        }
        self.caches.insert(conn, PeerCache::new());
        if let Some(w) = self.registry.waiting_peer_mut(&peer) {
            w.status = WaitStatus::Requested;
            w.urgent = false;
            w.last_seen = now;
        }
        self.send_new(conn, crate::wire::PING_TTL_HB, rand::random(), Body::Join(None));
        info!("📤 Connected to {}, JOIN sent on conn {}", peer, conn);
        Some(conn)
    }

    pub fn connect_failed(&mut self, peer: PeerId) {
        if self.registry.remove_waiting(&peer).is_some() {
            error!("❌ Connection failed, drop waiting node {}", peer);
        }
    }

    /// Bytes arrived on `conn`. Frames are dispatched in arrival order; an error
    /// means the connection is faulted and must be torn down by the caller.
    pub fn receive(&mut self, conn: ConnId, bytes: &[u8], now: Instant) -> Result<(), ReceiveError> {
        let cache = self.caches.get_mut(&conn).ok_or(ReceiveError::UnknownConnection(conn))?;
        let extracted = cache.feed(bytes)?;
        for item in extracted {
            // A BYE or aborted JOIN earlier in this batch ends the connection.
            if !self.caches.contains_key(&conn) {
                break;
            }
            match item {
                Extracted::Frame(frame) => {
                    if let Err(e) = self.handle_frame(conn, frame, now) {
                        warn!("🚫 Frame dropped on conn {}: {}", conn, e);
                    }
                }
                Extracted::Rejected(e) => warn!("🚫 Frame rejected on conn {}: {}", conn, e),
                Extracted::Resync(e) => warn!("🧹 Cache cleared on conn {}: {}", conn, e),
            }
        }
        Ok(())
    }

    /// Say BYE to every neighbor and drop every connection.
    pub fn leave(&mut self) {
        self.broadcast_new(crate::wire::PING_TTL_HB, rand::random(), Body::Bye, None);
        let conns: Vec<ConnId> = self.caches.keys().copied().collect();
        for conn in conns {
            self.drop_conn(conn);
        }
    }

    /// Forget everything about `conn` and have the loop close it.
    pub fn drop_conn(&mut self, conn: ConnId) -> Option<Removed> {
        self.caches.remove(&conn);
        let removed = self.registry.remove_conn(conn);
        self.actions.push(Action::Close(conn));
        removed
    }

    /// Socket-level teardown reported by the loop (EOF, read/write error).
    /// The socket is already gone, so no close is queued.
    pub fn connection_lost(&mut self, conn: ConnId) -> Option<Removed> {
        self.caches.remove(&conn);
        self.registry.remove_conn(conn)
    }

    pub(crate) fn new_frame(&self, ttl: u8, msg_id: u32, body: Body) -> Result<Frame, WireError> {
        Frame::new(ttl, self.me.ip, self.me.port, msg_id, body)
    }

    /// Originate a frame to `conn`. A body that cannot be framed is logged and not sent.
    pub(crate) fn send_new(&mut self, conn: ConnId, ttl: u8, msg_id: u32, body: Body) -> bool {
        match self.new_frame(ttl, msg_id, body) {
            Ok(frame) => {
                self.send(conn, &frame);
                true
            }
            Err(e) => {
                error!("❌ Cannot frame message [{:08X}] for conn {}: {}", msg_id, conn, e);
                false
            }
        }
    }

    /// Originate a frame to every neighbor except `except`.
    pub(crate) fn broadcast_new(&mut self, ttl: u8, msg_id: u32, body: Body, except: Option<ConnId>) -> usize {
        match self.new_frame(ttl, msg_id, body) {
            Ok(frame) => self.broadcast(&frame, except),
            Err(e) => {
                error!("❌ Cannot frame message [{:08X}]: {}", msg_id, e);
                0
            }
        }
    }

    pub(crate) fn send(&mut self, conn: ConnId, frame: &Frame) {
        debug!("📨 Out MSG [{:08X}] {:?} ttl {} to conn {}", frame.header.msg_id, frame.msg_type(), frame.header.ttl, conn);
        self.actions.push(Action::Send(conn, frame.encode()));
    }

    /// Send `frame` to every neighbor except `except`.
    pub(crate) fn broadcast(&mut self, frame: &Frame, except: Option<ConnId>) -> usize {
        let bytes = frame.encode();
        let targets: Vec<ConnId> = self.registry.neighbor_conns().into_iter().filter(|c| Some(*c) != except).collect();
        for conn in &targets {
            self.actions.push(Action::Send(*conn, bytes.clone()));
        }
        targets.len()
    }

    pub(crate) fn push_action(&mut self, action: Action) {
        self.actions.push(action);
    }
}
