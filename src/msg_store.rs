//! Recently seen message ids, for flood loop suppression and QUERY_HIT routing.

use bytes::Bytes;
use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::registry::{ConnId, PeerId};

pub const RETENTION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub msg_id: u32,
    pub payload: Bytes,
    /// Arrival connection; `None` when this node originated the message.
    pub source: Option<ConnId>,
    pub received: Instant,
}

#[derive(Debug)]
pub struct MessageStore {
    entries: HashMap<u32, StoredMessage>,
    hits: HashMap<(u32, PeerId), Instant>,
    retention: Duration,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(RETENTION)
    }
}

impl MessageStore {
    pub fn new(retention: Duration) -> Self {
        Self { entries: HashMap::new(), hits: HashMap::new(), retention }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `false`, storing nothing, if `msg_id` is already held.
    pub fn record(&mut self, msg_id: u32, payload: Bytes, source: Option<ConnId>, now: Instant) -> bool {
        if self.entries.contains_key(&msg_id) {
            return false;
        }
        self.entries.insert(msg_id, StoredMessage { msg_id, payload, source, received: now });
        true
    }

    pub fn find(&self, msg_id: u32) -> Option<&StoredMessage> {
        self.entries.get(&msg_id)
    }

    /// Like [`find`](Self::find) but ignores entries past the retention window
    /// that a gc has not swept yet.
    pub fn find_live(&self, msg_id: u32, now: Instant) -> Option<&StoredMessage> {
        self.find(msg_id).filter(|m| now.saturating_duration_since(m.received) <= self.retention)
    }

    /// First QUERY_HIT for `msg_id` from `responder` returns true; repeats within
    /// the retention window return false.
    pub fn note_hit(&mut self, msg_id: u32, responder: PeerId, now: Instant) -> bool {
        let retention = self.retention;
        match self.hits.get(&(msg_id, responder)) {
            Some(seen) if now.saturating_duration_since(*seen) <= retention => false,
            _ => {
                self.hits.insert((msg_id, responder), now);
                true
            }
        }
    }

    pub fn gc(&mut self, now: Instant) -> usize {
        let retention = self.retention;
        let before = self.entries.len();
        self.entries.retain(|id, m| {
            let keep = now.saturating_duration_since(m.received) <= retention;
            if !keep {
                debug!("🗑️  Free msg [{:08X}] from the message store", id);
            }
            keep
        });
        self.hits.retain(|_, seen| now.saturating_duration_since(*seen) <= retention);
        before - self.entries.len()
    }
}
