//! Protocol handlers: what a decoded frame does to the overlay.

use log::{debug, info};
use std::time::Instant;
use thiserror::Error;

use crate::overlay::{Action, Overlay, QueryHit};
use crate::registry::{ConnId, Direction, PeerClass, PeerId};
use crate::wire::{Body, Frame, Header, HitEntry, MsgType, PongEntry, JOIN_ACCEPT, MAX_TTL, PING_TTL_HB};

/// Reasons a single frame is discarded. None of these corrupt the stream, so
/// the bytes after the frame are still processed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("frame on connection {0} which has no registered peer")]
    UnknownSender(ConnId),
    #[error("{msg_type:?} from {peer}, which is not a neighbor")]
    NotNeighbor { msg_type: MsgType, peer: PeerId },
    #[error("JOIN out of sequence with {peer}: {reason}")]
    JoinSequence { peer: PeerId, reason: &'static str },
    #[error("{0} is already connected")]
    DuplicatePeer(PeerId),
    #[error("simultaneous JOIN with {0}, keeping our own connection")]
    SimultaneousJoin(PeerId),
    #[error("duplicate QUERY [{0:08X}]")]
    DuplicateQuery(u32),
    #[error("QUERY_HIT [{0:08X}] matches no stored query")]
    UnroutableHit(u32),
    #[error("repeated QUERY_HIT [{0:08X}] from the same responder")]
    DuplicateHit(u32),
}

impl Overlay {
    pub fn handle_frame(&mut self, conn: ConnId, frame: Frame, now: Instant) -> Result<(), DispatchError> {
        let (class, peer) = self.registry.classify(conn).ok_or(DispatchError::UnknownSender(conn))?;
        let msg_type = frame.msg_type();
        debug!(
            "📬 In MSG [{:08X}] {:?} len {} ttl {} from {} ({:?})",
            frame.header.msg_id, msg_type, frame.header.length, frame.header.ttl, peer, class
        );

        match class {
            PeerClass::Neighbor => {
                if let Some(nb) = self.registry.neighbor_by_conn_mut(conn) {
                    nb.last_seen = now;
                }
            }
            // Half-open peers only get to finish the handshake.
            PeerClass::Waiting if msg_type != MsgType::Join => {
                return Err(DispatchError::NotNeighbor { msg_type, peer });
            }
            PeerClass::Waiting => {}
        }

        match &frame.body {
            Body::Ping => {
                self.on_ping(conn, &frame.header);
                Ok(())
            }
            Body::Pong(entries) => {
                self.on_pong(peer, entries, now);
                Ok(())
            }
            Body::Bye => {
                info!("👋 BYE from {}", peer);
                self.drop_conn(conn);
                Ok(())
            }
            Body::Join(status) => self.on_join(conn, class, peer, &frame.header, *status, now),
            Body::Query(key) => self.on_query(conn, &frame, key, now),
            Body::QueryHit(entries) => self.on_query_hit(conn, &frame, entries, now),
        }
    }

    fn on_ping(&mut self, conn: ConnId, header: &Header) {
        let entries: Vec<PongEntry> = self
            .registry
            .neighbors()
            .filter(|n| n.conn != conn)
            .take(self.settings.max_peer_ad)
            .map(|n| PongEntry { ip: n.id.ip, port: n.id.port })
            .collect();
        self.send_new(conn, PING_TTL_HB, header.msg_id, Body::Pong(entries));
    }

    fn on_pong(&mut self, from: PeerId, entries: &[PongEntry], now: Instant) {
        for entry in entries {
            let id = PeerId::new(entry.ip, entry.port);
            if id.port == 0 || id.ip.is_unspecified() {
                continue;
            }
            if id == self.me || self.local.is_local(id.ip, id.port) {
                debug!("🔁 {} advertised us back, skipping", from);
                continue;
            }
            if self.registry.contains(&id) {
                continue;
            }
            self.registry.insert_waiting(crate::registry::WaitingPeer::discovered(id, false, now));
            info!("🔎 Discovered {} via {}", id, from);
        }
    }

    fn on_join(
        &mut self,
        conn: ConnId,
        class: PeerClass,
        peer: PeerId,
        header: &Header,
        status: Option<u16>,
        now: Instant,
    ) -> Result<(), DispatchError> {
        if class == PeerClass::Neighbor {
            return Err(DispatchError::JoinSequence { peer, reason: "already a neighbor" });
        }
        let direction = self
            .registry
            .waiting_by_conn(conn)
            .map(|w| w.direction)
            .ok_or(DispatchError::UnknownSender(conn))?;

        let reason = match (direction, status) {
            (Direction::Inbound, None) => return self.accept_join(conn, peer, header, now),
            (Direction::Outbound, Some(JOIN_ACCEPT)) => {
                if let Some(w) = self.registry.waiting_by_conn_mut(conn) {
                    w.last_seen = now;
                }
                if self.registry.promote(conn).is_none() {
                    self.drop_conn(conn);
                    return Err(DispatchError::DuplicatePeer(peer));
                }
                info!("🤝 {} accepted our JOIN, now a neighbor", peer);
                return Ok(());
            }
            (Direction::Inbound, Some(_)) => "JOIN response on a connection we did not open",
            (Direction::Outbound, None) => "JOIN request on our own outbound connection",
            (Direction::Outbound, Some(_)) => "JOIN refused",
        };
        self.drop_conn(conn);
        Err(DispatchError::JoinSequence { peer, reason })
    }

    /// JOIN request on an inbound connection: adopt the advertised listen port
    /// as the peer's identity, answer with an accept and promote.
    fn accept_join(&mut self, conn: ConnId, peer: PeerId, header: &Header, now: Instant) -> Result<(), DispatchError> {
        let claimed = PeerId::new(peer.ip, header.org_port);
        if claimed == self.me || self.registry.is_neighbor(&claimed) {
            self.drop_conn(conn);
            return Err(DispatchError::DuplicatePeer(claimed));
        }
        if claimed != peer {
            if let Some(other) = self.registry.waiting_peer(&claimed).map(|w| w.conn) {
                match other {
                    None => {
                        self.registry.remove_waiting(&claimed);
                    }
                    // Both sides dialled each other. The connection opened by the
                    // lower identity survives, on both ends.
                    Some(_) if self.me < claimed => {
                        self.drop_conn(conn);
                        return Err(DispatchError::SimultaneousJoin(claimed));
                    }
                    Some(ours) => {
                        debug!("🔀 Simultaneous JOIN with {}, yielding conn {}", claimed, ours);
                        self.drop_conn(ours);
                    }
                }
            }
            if !self.registry.rekey_waiting(conn, claimed) {
                self.drop_conn(conn);
                return Err(DispatchError::DuplicatePeer(claimed));
            }
        }

        self.send_new(conn, PING_TTL_HB, header.msg_id, Body::Join(Some(JOIN_ACCEPT)));
        if let Some(w) = self.registry.waiting_by_conn_mut(conn) {
            w.last_seen = now;
        }
        self.registry.promote(conn);
        info!("🤝 {} joined, now a neighbor", claimed);
        Ok(())
    }

    fn on_query(&mut self, conn: ConnId, frame: &Frame, key: &str, now: Instant) -> Result<(), DispatchError> {
        self.store.gc(now);
        let msg_id = frame.header.msg_id;
        if !self.store.record(msg_id, frame.encode(), Some(conn), now) {
            return Err(DispatchError::DuplicateQuery(msg_id));
        }

        if let Some(value) = self.kv.lookup(key) {
            info!("✅ Have '{}' = {}, answering [{:08X}]", key, value, msg_id);
            self.send_new(conn, MAX_TTL, msg_id, Body::QueryHit(vec![HitEntry { res_id: 0, value }]));
        }

        let next = frame.forwarded();
        if next.header.ttl > 0 {
            let n = self.broadcast(&next, Some(conn));
            debug!("🌊 Flooded [{:08X}] to {} neighbors with ttl {}", msg_id, n, next.header.ttl);
        }
        Ok(())
    }

    fn on_query_hit(&mut self, conn: ConnId, frame: &Frame, entries: &[HitEntry], now: Instant) -> Result<(), DispatchError> {
        let msg_id = frame.header.msg_id;
        let responder = PeerId::new(frame.header.org_ip, frame.header.org_port);
        let (source, payload) = match self.store.find_live(msg_id, now) {
            Some(stored) => (stored.source, stored.payload.clone()),
            None => return Err(DispatchError::UnroutableHit(msg_id)),
        };
        let back = match source {
            Some(back) if back != conn && self.registry.neighbor_by_conn(back).is_some() => Some(back),
            Some(_) => return Err(DispatchError::UnroutableHit(msg_id)),
            None => None,
        };
        // Only a hit that can go somewhere claims its dedup slot.
        if !self.store.note_hit(msg_id, responder, now) {
            return Err(DispatchError::DuplicateHit(msg_id));
        }

        match back {
            Some(back) => {
                debug!("↩️  Routing QUERY_HIT [{:08X}] back on conn {}", msg_id, back);
                self.send(back, frame);
                Ok(())
            }
            None => {
                let key = Frame::decode(&payload).ok().and_then(|f| match f.body {
                    Body::Query(k) => Some(k),
                    _ => None,
                });
                let values: Vec<u32> = entries.iter().map(|e| e.value).collect();
                info!(
                    "🎯 QUERY_HIT [{:08X}] for '{}' from {}: {:?}",
                    msg_id,
                    key.as_deref().unwrap_or("?"),
                    responder,
                    values
                );
                self.push_action(Action::Deliver(QueryHit { msg_id, key, responder, values }));
                Ok(())
            }
        }
    }
}
