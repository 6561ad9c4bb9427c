//! Periodic upkeep, run once per event loop pass.

use log::{debug, info, warn};
use rand::Rng;
use std::time::{Duration, Instant};

use crate::overlay::{Action, Overlay};
use crate::registry::{PeerId, WaitStatus};
use crate::wire::{Body, MAX_TTL, PING_TTL_HB};

fn due(next: Option<Instant>, now: Instant) -> bool {
    next.map_or(true, |t| now >= t)
}

impl Overlay {
    /// Evict zombies, age the waiting list, then emit whatever heartbeat,
    /// probe and search traffic is due.
    pub fn maintain(&mut self, now: Instant) {
        self.evict_zombies(now);
        self.age_waiting(now);

        if due(self.schedule.heartbeat_next, now) {
            self.ping_neighbors(PING_TTL_HB);
            self.schedule.heartbeat_next = Some(now + self.settings.heartbeat);
        }

        if due(self.schedule.probe_next, now) {
            let n = self.ping_neighbors(MAX_TTL);
            debug!("📡 Probe PING to {} neighbors", n);
            let jitter = jitter(self.settings.probe);
            self.schedule.probe_next = Some(now + self.settings.probe + jitter);
        }

        if let Some(key) = self.settings.search_key.clone() {
            if due(self.schedule.query_next, now) {
                self.send_query(&key, now);
                self.schedule.query_next = Some(now + self.settings.query);
            }
        }

        debug!("📊 Waiting: {} Neighbours: {}", self.registry.waiting_len(), self.registry.neighbor_len());
    }

    fn evict_zombies(&mut self, now: Instant) {
        let zombie = self.settings.zombie;
        let dead: Vec<_> = self
            .registry
            .neighbors()
            .filter(|n| now.saturating_duration_since(n.last_seen) > zombie)
            .map(|n| (n.id, n.conn))
            .collect();
        for (id, conn) in dead {
            warn!("💀 Neighbor {} silent for over {:?}, dropping", id, zombie);
            self.drop_conn(conn);
        }
    }

    fn age_waiting(&mut self, now: Instant) {
        let heartbeat = self.settings.heartbeat;
        let stale = self.settings.zombie / 2;
        let ids: Vec<PeerId> = self.registry.waiting().map(|w| w.id).collect();

        for id in ids {
            let Some(w) = self.registry.waiting_peer_mut(&id) else {
                continue;
            };
            let idle = now.saturating_duration_since(w.last_seen);
            let (conn, status, urgent) = (w.conn, w.status, w.urgent);
            match conn {
                Some(conn) if idle >= heartbeat => {
                    if status == WaitStatus::Confirming {
                        warn!("⌛ {} never completed JOIN, evicting", id);
                        self.drop_conn(conn);
                    } else {
                        w.status = WaitStatus::Confirming;
                        w.last_seen = now;
                    }
                }
                Some(_) => {}
                None if urgent => self.push_action(Action::Connect(id)),
                None if idle > stale => {
                    debug!("🍂 Forgetting stale discovery {}", id);
                    self.registry.remove_waiting(&id);
                }
                None => {}
            }
        }

        if !self.settings.auto_join || self.registry.neighbor_len() >= self.settings.neighbor_target {
            return;
        }
        let candidate = self
            .registry
            .waiting()
            .find(|w| !w.is_connected() && !w.urgent && w.status == WaitStatus::New)
            .map(|w| w.id);
        if let Some(id) = candidate {
            if let Some(w) = self.registry.waiting_peer_mut(&id) {
                w.urgent = true;
                debug!("🎯 {} marked for connection", id);
            }
        }
    }

    /// PING every neighbor; returns how many were pinged.
    pub fn ping_neighbors(&mut self, ttl: u8) -> usize {
        self.broadcast_new(ttl, rand::random(), Body::Ping, None)
    }

    /// Flood a QUERY for `key` as its originator. Returns the message id, or
    /// `None` when the key cannot be carried on the wire.
    pub fn send_query(&mut self, key: &str, now: Instant) -> Option<u32> {
        let msg_id: u32 = rand::random();
        let query = match self.new_frame(MAX_TTL, msg_id, Body::Query(key.to_string())) {
            Ok(query) => query,
            Err(e) => {
                warn!("🚫 Search key '{}' is not sendable: {}", key, e);
                return None;
            }
        };
        self.store.gc(now);
        if !self.store.record(msg_id, query.encode(), None, now) {
            return None;
        }
        let n = self.broadcast(&query, None);
        info!("🔍 QUERY [{:08X}] '{}' sent to {} neighbors", msg_id, key, n);
        Some(msg_id)
    }
}

fn jitter(probe: Duration) -> Duration {
    let span = probe.as_millis() as u64;
    if span == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..span))
}
