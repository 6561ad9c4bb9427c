//! Per-connection stream reassembly.

use bytes::{Buf, BytesMut};
use log::debug;
use thiserror::Error;

use crate::wire::{Frame, Header, WireError, HEADER_LEN, MAX_FRAME_LEN};

/// Bytes a single connection may have buffered without a complete frame.
pub const CACHE_CAPACITY: usize = MAX_FRAME_LEN;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("peer cache full: {buffered} buffered + {incoming} incoming exceeds {capacity}")]
pub struct CacheError {
    pub buffered: usize,
    pub incoming: usize,
    pub capacity: usize,
}

/// What sits at the front of the buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Peek {
    Incomplete,
    Resync(WireError),
    /// A whole frame of `len` bytes is buffered; `frame` is its decode result.
    Ready { len: usize, frame: Result<Frame, WireError> },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Extracted {
    Frame(Frame),
    /// The header was valid but the frame was not; only its bytes were dropped.
    Rejected(WireError),
    /// The buffer was invalid at the header level and has been cleared.
    Resync(WireError),
}

#[derive(Debug)]
pub struct PeerCache {
    buf: BytesMut,
    capacity: usize,
}

impl Default for PeerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerCache {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity), capacity }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<(), CacheError> {
        if self.capacity - self.buf.len() < bytes.len() {
            return Err(CacheError {
                buffered: self.buf.len(),
                incoming: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn peek_frame(&self) -> Peek {
        if self.buf.len() < HEADER_LEN {
            return Peek::Incomplete;
        }
        let header = match Header::decode(&self.buf) {
            Ok(h) => h,
            Err(e) => return Peek::Resync(e),
        };
        let len = header.frame_len();
        if len > self.capacity {
            return Peek::Resync(WireError::Oversized(len));
        }
        if self.buf.len() < len {
            return Peek::Incomplete;
        }
        Peek::Ready { len, frame: Frame::decode(&self.buf[..len]) }
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the next frame off the front, compacting the buffer. `None` means
    /// more bytes are needed.
    pub fn extract_frame(&mut self) -> Option<Extracted> {
        match self.peek_frame() {
            Peek::Incomplete => None,
            Peek::Resync(err) => {
                debug!("🧹 Resync, dropping {} cached bytes starting {}", self.buf.len(), hex::encode(&self.buf[..HEADER_LEN]));
                self.clear();
                Some(Extracted::Resync(err))
            }
            Peek::Ready { len, frame } => {
                self.consume(len);
                Some(match frame {
                    Ok(f) => Extracted::Frame(f),
                    Err(e) => Extracted::Rejected(e),
                })
            }
        }
    }

    /// Append `bytes` and pull out everything that is now complete, in order.
    /// Extraction stops after a resync.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Extracted>, CacheError> {
        self.push(bytes)?;
        let mut out = Vec::new();
        while let Some(item) = self.extract_frame() {
            let stop = matches!(item, Extracted::Resync(_));
            out.push(item);
            if stop || self.buf.is_empty() {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Body, MsgType};
    use std::net::Ipv4Addr;

    fn ping(id: u32) -> Vec<u8> {
        Frame::new(1, Ipv4Addr::LOCALHOST, 7000, id, Body::Ping).unwrap().encode().to_vec()
    }

    #[test]
    fn partial_header_is_incomplete() {
        let mut pc = PeerCache::new();
        let raw = ping(1);
        assert!(pc.feed(&raw[..5]).unwrap().is_empty());
        assert_eq!(pc.len(), 5);
        let out = pc.feed(&raw[5..]).unwrap();
        assert_eq!(out.len(), 1);
        assert!(pc.is_empty());
    }

    #[test]
    fn partial_body_waits_for_more_bytes() {
        let mut pc = PeerCache::new();
        let raw = Frame::new(2, Ipv4Addr::LOCALHOST, 7000, 3, Body::Query("needle".into())).unwrap().encode();
        assert!(pc.feed(&raw[..HEADER_LEN + 2]).unwrap().is_empty());
        assert_eq!(pc.peek_frame(), Peek::Incomplete);
        let out = pc.feed(&raw[HEADER_LEN + 2..]).unwrap();
        assert!(matches!(&out[0], Extracted::Frame(f) if f.body == Body::Query("needle".into())));
    }

    #[test]
    fn bad_version_clears_everything() {
        let mut pc = PeerCache::new();
        let mut raw = ping(1);
        raw[0] = 9;
        raw.extend(ping(2));
        let out = pc.feed(&raw).unwrap();
        assert_eq!(out, vec![Extracted::Resync(WireError::BadVersion(9))]);
        assert!(pc.is_empty());
    }

    #[test]
    fn unknown_type_only_drops_its_own_frame() {
        let mut pc = PeerCache::new();
        let mut raw = ping(1);
        raw[2] = 0x55;
        raw.extend(ping(2));
        let out = pc.feed(&raw).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Extracted::Rejected(WireError::UnknownType(0x55)));
        assert!(matches!(&out[1], Extracted::Frame(f) if f.header.msg_id == 2 && f.msg_type() == MsgType::Ping));
    }

    #[test]
    fn overflow_is_reported() {
        let mut pc = PeerCache::with_capacity(20);
        pc.push(&[1; 10]).unwrap();
        let err = pc.push(&[1; 11]).unwrap_err();
        assert_eq!(err, CacheError { buffered: 10, incoming: 11, capacity: 20 });
    }

    #[test]
    fn frame_larger_than_capacity_resyncs() {
        let mut pc = PeerCache::with_capacity(64);
        let mut raw = ping(1);
        raw[6] = 0x01;
        let out = pc.feed(&raw).unwrap();
        assert_eq!(out, vec![Extracted::Resync(WireError::Oversized(HEADER_LEN + 256))]);
    }
}
