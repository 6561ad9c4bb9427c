// Socket-level tests: real nodes on loopback with shortened timers

use floodmesh::config::Config;
use floodmesh::wire::{HitEntry, HEADER_LEN, JOIN_ACCEPT};
use floodmesh::{Body, Frame, MemoryStore, MsgType, Node};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.node.listen = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
    cfg.timing.tick_ms = 50;
    cfg.timing.heartbeat_ms = 200;
    cfg.timing.probe_ms = 300;
    cfg.timing.query_ms = 200;
    cfg.timing.zombie_ms = 5_000;
    cfg.timing.connect_timeout_ms = 1_000;
    cfg.timing.retention_ms = 2_000;
    cfg
}

async fn read_frame(sock: &mut TcpStream) -> Option<Frame> {
    let mut header = [0u8; HEADER_LEN];
    sock.read_exact(&mut header).await.ok()?;
    let len = u16::from_be_bytes([header[6], header[7]]) as usize;
    let mut buf = header.to_vec();
    buf.resize(HEADER_LEN + len, 0);
    sock.read_exact(&mut buf[HEADER_LEN..]).await.ok()?;
    Some(Frame::decode(&buf).expect("node sent a valid frame"))
}

/// Run `node` until shutdown, handing it back for inspection.
fn spawn_node(mut node: Node, shutdown: broadcast::Receiver<()>) -> JoinHandle<(Node, anyhow::Result<()>)> {
    tokio::spawn(async move {
        let result = node.run(shutdown).await;
        (node, result)
    })
}

/// Next frame of `msg_type`, skipping heartbeats and probes.
async fn next_of(sock: &mut TcpStream, msg_type: MsgType) -> Frame {
    timeout(Duration::from_secs(5), async {
        loop {
            let frame = read_frame(sock).await.expect("connection still open");
            if frame.msg_type() == msg_type {
                return frame;
            }
        }
    })
    .await
    .expect("frame arrived in time")
}

#[tokio::test]
async fn two_nodes_find_a_key() {
    println!("🧪 Node B bootstraps to A and searches for a key A holds...");
    let kv: MemoryStore = [("foo", 42u32)].into_iter().collect();
    let a = Node::bind(&fast_config(), Box::new(kv)).await.expect("bind A");
    let a_addr = a.local_addr();

    let mut cfg_b = fast_config();
    cfg_b.node.search_key = Some("foo".into());
    let mut b = Node::bind(&cfg_b, Box::new(MemoryStore::new())).await.expect("bind B");
    assert!(b.add_bootstrap(a_addr));
    let mut hits = b.hit_subscribe();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let run_a = spawn_node(a, shutdown_tx.subscribe());
    let run_b = spawn_node(b, shutdown_tx.subscribe());

    let hit = timeout(Duration::from_secs(10), hits.recv())
        .await
        .expect("hit within 10 s")
        .expect("hit channel open");
    assert_eq!(hit.key.as_deref(), Some("foo"));
    assert_eq!(hit.values, vec![42]);
    assert_eq!(hit.responder.port, a_addr.port());

    shutdown_tx.send(()).unwrap();
    run_a.await.unwrap().1.unwrap();
    run_b.await.unwrap().1.unwrap();
}

#[tokio::test]
async fn raw_peer_joins_queries_and_is_told_bye() {
    println!("🧪 Hand-rolled peer talking to a node...");
    let kv: MemoryStore = [("foo", 42u32)].into_iter().collect();
    let node = Node::bind(&fast_config(), Box::new(kv)).await.expect("bind");
    let addr = node.local_addr();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let running = spawn_node(node, shutdown_tx.subscribe());

    let mut sock = TcpStream::connect(addr).await.expect("connect");
    let join = Frame::new(1, Ipv4Addr::LOCALHOST, 4444, 0x0101, Body::Join(None)).unwrap();
    sock.write_all(&join.encode()).await.unwrap();
    let accept = next_of(&mut sock, MsgType::Join).await;
    assert_eq!(accept.header.msg_id, 0x0101);
    assert_eq!(accept.body, Body::Join(Some(JOIN_ACCEPT)));

    let ping = Frame::new(1, Ipv4Addr::LOCALHOST, 4444, 0x0202, Body::Ping).unwrap();
    sock.write_all(&ping.encode()).await.unwrap();
    let pong = next_of(&mut sock, MsgType::Pong).await;
    assert_eq!(pong.header.msg_id, 0x0202);
    assert_eq!(pong.body, Body::Pong(vec![]));

    // Query split across two writes.
    let query = Frame::new(3, Ipv4Addr::LOCALHOST, 4444, 0x0303, Body::Query("foo".into())).unwrap().encode();
    sock.write_all(&query[..5]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    sock.write_all(&query[5..]).await.unwrap();
    let hit = next_of(&mut sock, MsgType::QueryHit).await;
    assert_eq!(hit.header.msg_id, 0x0303);
    assert_eq!(hit.body, Body::QueryHit(vec![HitEntry { res_id: 0, value: 42 }]));

    shutdown_tx.send(()).unwrap();
    let bye = next_of(&mut sock, MsgType::Bye).await;
    assert_eq!(bye.msg_type(), MsgType::Bye);
    running.await.unwrap().1.unwrap();
    let mut rest = Vec::new();
    let eof = timeout(Duration::from_secs(2), sock.read_to_end(&mut rest)).await.expect("node closed the socket");
    assert!(eof.is_ok());
}

#[tokio::test]
async fn garbage_resyncs_without_dropping_the_peer() {
    let node = Node::bind(&fast_config(), Box::new(MemoryStore::new())).await.expect("bind");
    let addr = node.local_addr();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let running = spawn_node(node, shutdown_tx.subscribe());

    let mut sock = TcpStream::connect(addr).await.expect("connect");
    let join = Frame::new(1, Ipv4Addr::LOCALHOST, 4445, 1, Body::Join(None)).unwrap();
    sock.write_all(&join.encode()).await.unwrap();
    next_of(&mut sock, MsgType::Join).await;

    // Wrong version: the buffered bytes are discarded, the link survives.
    sock.write_all(&[9u8; HEADER_LEN]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ping = Frame::new(1, Ipv4Addr::LOCALHOST, 4445, 0x77, Body::Ping).unwrap();
    sock.write_all(&ping.encode()).await.unwrap();
    let pong = next_of(&mut sock, MsgType::Pong).await;
    assert_eq!(pong.header.msg_id, 0x77);

    shutdown_tx.send(()).unwrap();
    running.await.unwrap().1.unwrap();
}

#[tokio::test]
async fn wildcard_listener_advertises_a_concrete_address() {
    println!("🧪 Node bound to 0.0.0.0...");
    let mut cfg = fast_config();
    cfg.node.listen = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    let node = Node::bind(&cfg, Box::new(MemoryStore::new())).await.expect("bind");
    let me = node.overlay().me();
    assert!(!me.ip.is_unspecified(), "identity {} is not reachable", me);
    assert_eq!(me.port, node.local_addr().port());

    let port = node.local_addr().port();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let running = spawn_node(node, shutdown_tx.subscribe());

    let mut sock = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.expect("connect");
    let join = Frame::new(1, Ipv4Addr::LOCALHOST, 4447, 9, Body::Join(None)).unwrap();
    sock.write_all(&join.encode()).await.unwrap();
    let accept = next_of(&mut sock, MsgType::Join).await;
    assert_eq!((accept.header.org_ip, accept.header.org_port), (me.ip, me.port));

    shutdown_tx.send(()).unwrap();
    running.await.unwrap().1.unwrap();
}

#[tokio::test]
async fn unreachable_bootstrap_is_dropped() {
    let closed = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let target = match closed.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        other => panic!("unexpected {}", other),
    };
    drop(closed);

    let mut node = Node::bind(&fast_config(), Box::new(MemoryStore::new())).await.expect("bind");
    assert!(node.add_bootstrap(target));
    assert!(node.overlay().registry().contains(&target.into()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let running = spawn_node(node, shutdown_tx.subscribe());
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_tx.send(()).unwrap();
    let (node, result) = running.await.unwrap();
    result.unwrap();
    assert!(!node.overlay().registry().contains(&target.into()));
}

#[tokio::test]
async fn vanished_neighbor_is_removed_and_the_node_keeps_serving() {
    println!("🧪 A neighbor drops its socket mid-session...");
    let node = Node::bind(&fast_config(), Box::new(MemoryStore::new())).await.expect("bind");
    let addr = node.local_addr();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let running = spawn_node(node, shutdown_tx.subscribe());

    let mut first = TcpStream::connect(addr).await.expect("connect");
    let join = Frame::new(1, Ipv4Addr::LOCALHOST, 4446, 1, Body::Join(None)).unwrap();
    first.write_all(&join.encode()).await.unwrap();
    next_of(&mut first, MsgType::Join).await;
    drop(first);

    // Past a heartbeat, so the node has tried to write to the dead socket too.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut second = TcpStream::connect(addr).await.expect("node still accepting");
    let join = Frame::new(1, Ipv4Addr::LOCALHOST, 4448, 2, Body::Join(None)).unwrap();
    second.write_all(&join.encode()).await.unwrap();
    next_of(&mut second, MsgType::Join).await;
    let ping = Frame::new(1, Ipv4Addr::LOCALHOST, 4448, 0x88, Body::Ping).unwrap();
    second.write_all(&ping.encode()).await.unwrap();
    let pong = next_of(&mut second, MsgType::Pong).await;
    assert_eq!(pong.header.msg_id, 0x88);
    assert_eq!(pong.body, Body::Pong(vec![]), "the vanished neighbor is no longer advertised");

    shutdown_tx.send(()).unwrap();
    running.await.unwrap().1.unwrap();
}
