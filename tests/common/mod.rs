// Shared fixtures for driving an Overlay without sockets
#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use floodmesh::{Action, Body, ConnId, Frame, InterfaceAddrs, MemoryStore, Overlay, PeerId, Settings};

pub fn me() -> PeerId {
    PeerId::new(Ipv4Addr::new(10, 0, 0, 1), 7000)
}

pub fn peer(last: u8) -> PeerId {
    PeerId::new(Ipv4Addr::new(10, 0, 1, last), 7000)
}

pub fn overlay(pairs: &[(&str, u32)]) -> Overlay {
    overlay_with(Settings::default(), pairs)
}

/// An empty overlay running as `id` instead of [`me`].
pub fn overlay_as(id: PeerId) -> Overlay {
    let local = InterfaceAddrs::new([id.ip], id.port);
    Overlay::new(id, Settings::default(), Box::new(MemoryStore::new()), Box::new(local))
}

pub fn overlay_with(settings: Settings, pairs: &[(&str, u32)]) -> Overlay {
    let kv: MemoryStore = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    let local = InterfaceAddrs::new([me().ip], me().port);
    Overlay::new(me(), settings, Box::new(kv), Box::new(local))
}

/// Accept an inbound socket from `id` and complete its JOIN, leaving it a neighbor.
pub fn join_inbound(ov: &mut Overlay, id: PeerId, now: Instant) -> ConnId {
    let conn = ov
        .accept(SocketAddrV4::new(id.ip, 50_000), now)
        .expect("inbound connection accepted");
    let join = Frame::new(1, id.ip, id.port, rand::random(), Body::Join(None)).unwrap();
    ov.receive(conn, &join.encode(), now).expect("join delivered");
    assert!(ov.registry().is_neighbor(&id), "{} should be a neighbor", id);
    ov.take_actions();
    conn
}

pub fn frame_from(id: PeerId, ttl: u8, msg_id: u32, body: Body) -> Frame {
    Frame::new(ttl, id.ip, id.port, msg_id, body).expect("test frame is valid")
}

/// Frames queued for sending, decoded, in order.
pub fn sent(actions: &[Action]) -> Vec<(ConnId, Frame)> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Send(conn, bytes) => Some((*conn, Frame::decode(bytes).expect("queued bytes decode"))),
            _ => None,
        })
        .collect()
}

pub fn closed(actions: &[Action]) -> Vec<ConnId> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Close(conn) => Some(*conn),
            _ => None,
        })
        .collect()
}
