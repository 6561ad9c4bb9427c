//! The event loop. One task owns the listener, every connection and the
//! [`Overlay`]; per-connection reader and writer tasks only move bytes.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use crate::config::Config;
use crate::kv::KeyValueStore;
use crate::local_addr::InterfaceAddrs;
use crate::overlay::{Action, Overlay, QueryHit, Settings};
use crate::registry::{ConnId, PeerId};

/// Bytes read from a socket per event.
const READ_CHUNK: usize = 2048;

#[derive(Debug)]
enum ConnEvent {
    Data(ConnId, Vec<u8>),
    /// EOF (`None`) or a read error.
    Closed(ConnId, Option<io::Error>),
    WriteFailed(ConnId, io::Error),
}

struct Link {
    tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct Node {
    overlay: Overlay,
    listener: TcpListener,
    local_addr: SocketAddrV4,
    tick: Duration,
    connect_timeout: Duration,
    hit_tx: broadcast::Sender<QueryHit>,
    links: HashMap<ConnId, Link>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    faulted: Vec<ConnId>,
}

impl Node {
    /// Bind the listener and build the overlay around it. The node's identity
    /// is the advertise address (or a concrete local address) plus the bound port.
    pub async fn bind(cfg: &Config, kv: Box<dyn KeyValueStore + Send>) -> Result<Node> {
        let listener = TcpListener::bind(cfg.node.listen)
            .await
            .with_context(|| format!("failed to listen on {}", cfg.node.listen))?;
        let local_addr = match listener.local_addr()? {
            SocketAddr::V4(addr) => addr,
            other => bail!("listener bound to non-IPv4 address {}", other),
        };
        let extra = [*cfg.node.listen.ip()].into_iter().chain(cfg.node.advertise_ip);
        let local = match InterfaceAddrs::discover(local_addr.port(), extra.clone()) {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("⚠️  {:#}, only loopback and configured addresses count as local", e);
                InterfaceAddrs::new(extra.chain([Ipv4Addr::LOCALHOST]), local_addr.port())
            }
        };
        let me = PeerId::new(advertised_ip(cfg.node.advertise_ip, *local_addr.ip(), &local), local_addr.port());

        let overlay = Overlay::new(me, Settings::from(cfg), kv, Box::new(local));
        let (hit_tx, _) = broadcast::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Node {
            overlay,
            listener,
            local_addr,
            tick: Duration::from_millis(cfg.timing.tick_ms),
            connect_timeout: Duration::from_millis(cfg.timing.connect_timeout_ms),
            hit_tx,
            links: HashMap::new(),
            events_tx,
            events_rx,
            faulted: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn hit_subscribe(&self) -> broadcast::Receiver<QueryHit> {
        self.hit_tx.subscribe()
    }

    pub fn add_bootstrap(&mut self, addr: SocketAddrV4) -> bool {
        let added = self.overlay.add_bootstrap(PeerId::from(addr), Instant::now());
        if added {
            info!("🔗 Bootstrap peer {} queued", addr);
        }
        added
    }

    /// Serve until `shutdown` fires (or its sender is dropped).
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("🚀 Node {} listening on {}", self.overlay.me(), self.local_addr);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, SocketAddr::V4(remote))) => self.on_accept(stream, remote),
                    Ok((_, remote)) => warn!("⚠️  Refusing non-IPv4 connection from {}", remote),
                    Err(e) => error!("❌ Accept failed: {}", e),
                },
                Some(event) = self.events_rx.recv() => {
                    self.on_event(event);
                    while let Ok(event) = self.events_rx.try_recv() {
                        self.on_event(event);
                    }
                }
                _ = tick.tick() => {}
            }
            self.end_pass().await;
        }

        info!("🛑 Shutting down, saying BYE to {} neighbors", self.overlay.registry().neighbor_len());
        self.overlay.leave();
        self.apply_actions().await;
        let conns: Vec<ConnId> = self.links.keys().copied().collect();
        let mut writers = Vec::with_capacity(conns.len());
        for conn in conns {
            if let Some(link) = self.links.remove(&conn) {
                link.reader.abort();
                drop(link.tx);
                writers.push(link.writer);
            }
        }
        for writer in writers {
            let _ = timeout(Duration::from_secs(1), writer).await;
        }
        Ok(())
    }

    fn on_accept(&mut self, stream: TcpStream, remote: SocketAddrV4) {
        if let Some(conn) = self.overlay.accept(remote, Instant::now()) {
            self.spawn_link(conn, stream);
        }
    }

    fn on_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Data(conn, bytes) => {
                // Already dropped earlier in this pass; the close is pending.
                if !self.overlay.has_cache(conn) {
                    return;
                }
                if let Err(e) = self.overlay.receive(conn, &bytes, Instant::now()) {
                    error!("❌ Conn {} faulted: {}", conn, e);
                    self.faulted.push(conn);
                }
            }
            ConnEvent::Closed(conn, err) => {
                match err {
                    None => debug!("🔌 Conn {} closed by peer", conn),
                    Some(e) => error!("❌ Read error on conn {}: {}", conn, e),
                }
                self.teardown(conn);
            }
            ConnEvent::WriteFailed(conn, e) => {
                error!("❌ Write error on conn {}: {}", conn, e);
                self.faulted.push(conn);
            }
        }
    }

    async fn end_pass(&mut self) {
        for conn in std::mem::take(&mut self.faulted) {
            self.teardown(conn);
        }
        self.overlay.maintain(Instant::now());
        self.apply_actions().await;
    }

    /// Carry out queued actions until handlers stop producing more.
    async fn apply_actions(&mut self) {
        loop {
            let actions = self.overlay.take_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                match action {
                    Action::Send(conn, bytes) => {
                        let sent = self.links.get(&conn).map(|link| link.tx.send(bytes).is_ok());
                        if sent == Some(false) {
                            self.faulted.push(conn);
                        }
                    }
                    Action::Close(conn) => self.close_link(conn),
                    Action::Connect(peer) => self.connect(peer).await,
                    Action::Deliver(hit) => {
                        // No subscribers is fine; the hit is already logged.
                        let _ = self.hit_tx.send(hit);
                    }
                }
            }
        }
    }

    async fn connect(&mut self, peer: PeerId) {
        let pending = self.overlay.registry().waiting_peer(&peer).map_or(false, |w| !w.is_connected());
        if !pending {
            return;
        }
        debug!("📞 Connecting to {}", peer);
        match timeout(self.connect_timeout, TcpStream::connect(SocketAddrV4::from(peer))).await {
            Ok(Ok(stream)) => {
                if let Some(conn) = self.overlay.connected(peer, Instant::now()) {
                    self.spawn_link(conn, stream);
                }
            }
            Ok(Err(e)) => {
                error!("❌ Connect to {} failed: {}", peer, e);
                self.overlay.connect_failed(peer);
            }
            Err(_) => {
                error!("⏱️  Connect to {} timed out", peer);
                self.overlay.connect_failed(peer);
            }
        }
    }

    fn spawn_link(&mut self, conn: ConnId, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on conn {}: {}", conn, e);
        }
        let (mut rd, mut wr) = stream.into_split();

        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) => {
                        let _ = events.send(ConnEvent::Closed(conn, None));
                        return;
                    }
                    Ok(n) => {
                        if events.send(ConnEvent::Data(conn, buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = events.send(ConnEvent::Closed(conn, Some(e)));
                        return;
                    }
                }
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let events = self.events_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = wr.write_all(&bytes).await {
                    let _ = events.send(ConnEvent::WriteFailed(conn, e));
                    return;
                }
            }
            let _ = wr.shutdown().await;
        });

        self.links.insert(conn, Link { tx, reader, writer });
    }

    /// Socket is gone or unusable: forget the peer and stop its tasks.
    fn teardown(&mut self, conn: ConnId) {
        if let Some(removed) = self.overlay.connection_lost(conn) {
            info!("🔌 Lost {} on conn {}", removed.id(), conn);
        }
        self.close_link(conn);
    }

    /// Queued writes are flushed before the write half shuts down.
    fn close_link(&mut self, conn: ConnId) {
        if let Some(link) = self.links.remove(&conn) {
            link.reader.abort();
            drop(link.tx);
        }
    }
}

/// The address peers see in our headers. A wildcard bind says nothing about
/// how we are reached, so it is replaced by a concrete local address.
fn advertised_ip(advertise: Option<Ipv4Addr>, bound: Ipv4Addr, local: &InterfaceAddrs) -> Ipv4Addr {
    if let Some(ip) = advertise.filter(|ip| !ip.is_unspecified()) {
        return ip;
    }
    if !bound.is_unspecified() {
        return bound;
    }
    let ip = match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => ip,
        _ => local.primary(),
    };
    info!("🌐 Listening on {}, advertising {}", bound, ip);
    ip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::wire::{Body, Frame, MsgType};

    fn loopback_config() -> Config {
        let mut cfg = Config::default();
        cfg.node.listen = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        cfg
    }

    #[test]
    fn identity_never_uses_the_wildcard_address() {
        let local = InterfaceAddrs::new([Ipv4Addr::LOCALHOST, Ipv4Addr::new(192, 168, 7, 7)], 7000);
        let public = Ipv4Addr::new(203, 0, 113, 9);
        assert_eq!(advertised_ip(Some(public), Ipv4Addr::UNSPECIFIED, &local), public);
        assert_eq!(advertised_ip(None, Ipv4Addr::LOCALHOST, &local), Ipv4Addr::LOCALHOST);
        assert!(!advertised_ip(None, Ipv4Addr::UNSPECIFIED, &local).is_unspecified());
        assert!(!advertised_ip(Some(Ipv4Addr::UNSPECIFIED), Ipv4Addr::UNSPECIFIED, &local).is_unspecified());
    }

    #[tokio::test]
    async fn write_failure_tears_the_neighbor_down_at_end_of_pass() {
        let mut node = Node::bind(&loopback_config(), Box::new(MemoryStore::new())).await.expect("bind");
        let mut client = TcpStream::connect(node.local_addr()).await.expect("connect");
        let (stream, remote) = node.listener.accept().await.expect("accept");
        let SocketAddr::V4(remote) = remote else { panic!("loopback is IPv4") };
        node.on_accept(stream, remote);

        let peer = PeerId::new(Ipv4Addr::LOCALHOST, 4450);
        let join = Frame::new(1, peer.ip, peer.port, 1, Body::Join(None)).unwrap();
        client.write_all(&join.encode()).await.unwrap();
        while !node.overlay.registry().is_neighbor(&peer) {
            let event = timeout(Duration::from_secs(2), node.events_rx.recv()).await.expect("join bytes");
            node.on_event(event.expect("events channel open"));
        }
        node.apply_actions().await;
        let conn = node.overlay.registry().neighbor(&peer).map(|n| n.conn).unwrap();

        node.on_event(ConnEvent::WriteFailed(conn, io::Error::from(io::ErrorKind::BrokenPipe)));
        assert_eq!(node.faulted, vec![conn]);
        assert!(node.overlay.registry().is_neighbor(&peer), "teardown waits for the end of the pass");

        node.end_pass().await;
        assert!(!node.overlay.registry().is_neighbor(&peer));
        assert!(!node.links.contains_key(&conn));
        assert!(node.faulted.is_empty());

        // The accept reply was flushed, then the socket closed.
        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .expect("socket closed")
            .expect("clean EOF");
        let accept = Frame::decode(&rest).expect("accept frame first");
        assert_eq!(accept.msg_type(), MsgType::Join);
    }

    #[tokio::test]
    async fn refused_connect_forgets_the_candidate() {
        let mut node = Node::bind(&loopback_config(), Box::new(MemoryStore::new())).await.expect("bind");
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(target) = closed.local_addr().unwrap() else { panic!("loopback is IPv4") };
        drop(closed);

        assert!(node.add_bootstrap(target));
        node.connect(PeerId::from(target)).await;
        assert!(!node.overlay.registry().contains(&PeerId::from(target)));
        assert!(node.links.is_empty());
    }
}
