//! Waiting and neighbor peer sets.
//!
//! A peer identity lives in at most one of the two sets. Records are looked up
//! either by identity or by the opaque [`ConnId`] of their current connection;
//! removing a record never touches sockets, that is the event loop's job.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

/// Overlay-level identity: address plus *listening* port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerId {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddrV4> for PeerId {
    fn from(addr: SocketAddrV4) -> Self {
        Self { ip: *addr.ip(), port: addr.port() }
    }
}

impl From<PeerId> for SocketAddrV4 {
    fn from(id: PeerId) -> Self {
        SocketAddrV4::new(id.ip, id.port)
    }
}

/// Handle of one TCP connection. Handles come from a counter and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Nothing exchanged yet.
    New,
    /// We sent JOIN.
    Requested,
    /// Idle for a heartbeat interval; evicted if still unconfirmed after another.
    Confirming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct WaitingPeer {
    pub id: PeerId,
    pub conn: Option<ConnId>,
    pub direction: Direction,
    pub status: WaitStatus,
    pub urgent: bool,
    pub last_seen: Instant,
}

impl WaitingPeer {
    /// A peer learned from a PONG or from configuration; no connection yet.
    pub fn discovered(id: PeerId, urgent: bool, now: Instant) -> Self {
        Self { id, conn: None, direction: Direction::Outbound, status: WaitStatus::New, urgent, last_seen: now }
    }

    pub fn inbound(id: PeerId, conn: ConnId, now: Instant) -> Self {
        Self { id, conn: Some(conn), direction: Direction::Inbound, status: WaitStatus::New, urgent: false, last_seen: now }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: PeerId,
    pub conn: ConnId,
    pub last_seen: Instant,
}

/// Which set a connection's record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerClass {
    Neighbor,
    Waiting,
}

#[derive(Debug, Clone)]
pub enum Removed {
    Neighbor(Neighbor),
    Waiting(WaitingPeer),
}

impl Removed {
    pub fn id(&self) -> PeerId {
        match self {
            Removed::Neighbor(n) => n.id,
            Removed::Waiting(w) => w.id,
        }
    }

    pub fn conn(&self) -> Option<ConnId> {
        match self {
            Removed::Neighbor(n) => Some(n.conn),
            Removed::Waiting(w) => w.conn,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    waiting: BTreeMap<PeerId, WaitingPeer>,
    neighbors: BTreeMap<PeerId, Neighbor>,
    by_conn: HashMap<ConnId, (PeerClass, PeerId)>,
    next_conn: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_conn(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn neighbor_len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn waiting(&self) -> impl Iterator<Item = &WaitingPeer> {
        self.waiting.values()
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.values()
    }

    pub fn neighbor_conns(&self) -> Vec<ConnId> {
        self.neighbors.values().map(|n| n.conn).collect()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.waiting.contains_key(id) || self.neighbors.contains_key(id)
    }

    pub fn is_neighbor(&self, id: &PeerId) -> bool {
        self.neighbors.contains_key(id)
    }

    pub fn waiting_peer(&self, id: &PeerId) -> Option<&WaitingPeer> {
        self.waiting.get(id)
    }

    pub fn waiting_peer_mut(&mut self, id: &PeerId) -> Option<&mut WaitingPeer> {
        self.waiting.get_mut(id)
    }

    pub fn neighbor(&self, id: &PeerId) -> Option<&Neighbor> {
        self.neighbors.get(id)
    }

    pub fn classify(&self, conn: ConnId) -> Option<(PeerClass, PeerId)> {
        self.by_conn.get(&conn).copied()
    }

    pub fn waiting_by_conn(&self, conn: ConnId) -> Option<&WaitingPeer> {
        match self.by_conn.get(&conn)? {
            (PeerClass::Waiting, id) => self.waiting.get(id),
            _ => None,
        }
    }

    pub fn waiting_by_conn_mut(&mut self, conn: ConnId) -> Option<&mut WaitingPeer> {
        match self.by_conn.get(&conn)? {
            (PeerClass::Waiting, id) => self.waiting.get_mut(id),
            _ => None,
        }
    }

    pub fn neighbor_by_conn(&self, conn: ConnId) -> Option<&Neighbor> {
        match self.by_conn.get(&conn)? {
            (PeerClass::Neighbor, id) => self.neighbors.get(id),
            _ => None,
        }
    }

    pub fn neighbor_by_conn_mut(&mut self, conn: ConnId) -> Option<&mut Neighbor> {
        match self.by_conn.get(&conn)? {
            (PeerClass::Neighbor, id) => self.neighbors.get_mut(id),
            _ => None,
        }
    }

    /// Refuses identities already present in either set.
    pub fn insert_waiting(&mut self, peer: WaitingPeer) -> bool {
        if self.contains(&peer.id) {
            return false;
        }
        if let Some(conn) = peer.conn {
            self.by_conn.insert(conn, (PeerClass::Waiting, peer.id));
        }
        self.waiting.insert(peer.id, peer);
        true
    }

    /// Refuses identities already present in either set.
    pub fn insert_neighbor(&mut self, nb: Neighbor) -> bool {
        if self.contains(&nb.id) {
            return false;
        }
        self.by_conn.insert(nb.conn, (PeerClass::Neighbor, nb.id));
        self.neighbors.insert(nb.id, nb);
        true
    }

    /// Give an unconnected waiting record its freshly established connection.
    pub fn attach_conn(&mut self, id: &PeerId, conn: ConnId) -> bool {
        match self.waiting.get_mut(id) {
            Some(peer) if peer.conn.is_none() => {
                peer.conn = Some(conn);
                self.by_conn.insert(conn, (PeerClass::Waiting, *id));
                true
            }
            _ => false,
        }
    }

    /// Change the identity of the waiting record on `conn`, e.g. from the
    /// ephemeral source port of an inbound socket to the advertised listen port.
    pub fn rekey_waiting(&mut self, conn: ConnId, new_id: PeerId) -> bool {
        let Some((PeerClass::Waiting, old_id)) = self.classify(conn) else {
            return false;
        };
        if old_id == new_id {
            return true;
        }
        if self.contains(&new_id) {
            return false;
        }
        let Some(mut peer) = self.waiting.remove(&old_id) else {
            return false;
        };
        peer.id = new_id;
        self.waiting.insert(new_id, peer);
        self.by_conn.insert(conn, (PeerClass::Waiting, new_id));
        true
    }

    /// Move the waiting record on `conn` into the neighbor set, keeping its
    /// identity and timestamp.
    pub fn promote(&mut self, conn: ConnId) -> Option<&Neighbor> {
        let Some((PeerClass::Waiting, id)) = self.classify(conn) else {
            return None;
        };
        if self.neighbors.contains_key(&id) {
            return None;
        }
        let peer = self.waiting.remove(&id)?;
        self.by_conn.insert(conn, (PeerClass::Neighbor, id));
        self.neighbors.insert(id, Neighbor { id, conn, last_seen: peer.last_seen });
        self.neighbors.get(&id)
    }

    pub fn remove_conn(&mut self, conn: ConnId) -> Option<Removed> {
        match self.by_conn.remove(&conn)? {
            (PeerClass::Neighbor, id) => self.neighbors.remove(&id).map(Removed::Neighbor),
            (PeerClass::Waiting, id) => self.waiting.remove(&id).map(Removed::Waiting),
        }
    }

    pub fn remove_waiting(&mut self, id: &PeerId) -> Option<WaitingPeer> {
        let peer = self.waiting.remove(id)?;
        if let Some(conn) = peer.conn {
            self.by_conn.remove(&conn);
        }
        Some(peer)
    }

    pub fn remove_neighbor(&mut self, id: &PeerId) -> Option<Neighbor> {
        let nb = self.neighbors.remove(id)?;
        self.by_conn.remove(&nb.conn);
        Some(nb)
    }
}
