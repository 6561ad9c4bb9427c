//! Wire codec: the fixed 16-byte header and the per-type message bodies.
//! All multi-byte integers travel big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;
use thiserror::Error;

pub const P_VERSION: u8 = 1;
pub const MAX_TTL: u8 = 5;
/// TTL used for heartbeat PINGs and for direct replies (PONG, JOIN accept).
pub const PING_TTL_HB: u8 = 1;
pub const HEADER_LEN: usize = 16;
pub const JOIN_ACCEPT: u16 = 0x0200;
/// Upper bound on entries advertised in one PONG.
pub const MAX_PEER_AD: usize = 5;
pub const KEY_MAX: usize = 64;
/// Largest frame a peer can buffer, header included.
pub const MAX_FRAME_LEN: usize = 4096;
const BODY_MAX: usize = MAX_FRAME_LEN - HEADER_LEN;

const LIST_FRONT_LEN: usize = 4;
const PONG_ENTRY_LEN: usize = 8;
const HIT_ENTRY_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Ping,
    Pong,
    Bye,
    Join,
    Query,
    QueryHit,
}

impl MsgType {
    pub fn code(self) -> u8 {
        match self {
            MsgType::Ping => 0x00,
            MsgType::Pong => 0x01,
            MsgType::Bye => 0x02,
            MsgType::Join => 0x03,
            MsgType::Query => 0x80,
            MsgType::QueryHit => 0x81,
        }
    }
}

impl TryFrom<u8> for MsgType {
    type Error = WireError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x00 => Ok(MsgType::Ping),
            0x01 => Ok(MsgType::Pong),
            0x02 => Ok(MsgType::Bye),
            0x03 => Ok(MsgType::Join),
            0x80 => Ok(MsgType::Query),
            0x81 => Ok(MsgType::QueryHit),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("invalid protocol version {0}")]
    BadVersion(u8),
    #[error("invalid ttl {0}")]
    BadTtl(u8),
    #[error("frame of {0} bytes can never fit the peer cache")]
    Oversized(usize),
    #[error("unknown message type 0x{0:02X}")]
    UnknownType(u8),
    #[error("malformed {msg_type:?} body: {reason}")]
    BadBody { msg_type: MsgType, reason: &'static str },
    #[error("{msg_type:?} body of {len} bytes exceeds the {max}-byte limit")]
    BodyTooLarge { msg_type: MsgType, len: usize, max: usize },
}

impl WireError {
    /// Header-level faults mean the stream framing itself may be misaligned,
    /// so everything buffered for the connection has to go.
    pub fn needs_resync(&self) -> bool {
        matches!(self, WireError::BadVersion(_) | WireError::BadTtl(_) | WireError::Oversized(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub ttl: u8,
    /// Raw type code; unknown codes survive header decoding and are rejected per frame.
    pub msg_type: u8,
    pub reserved: u8,
    pub org_port: u16,
    pub length: u16,
    pub org_ip: Ipv4Addr,
    pub msg_id: u32,
}

impl Header {
    /// Decode and validate the header at the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Header, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated { need: HEADER_LEN, have: buf.len() });
        }
        let header = Header {
            version: buf[0],
            ttl: buf[1],
            msg_type: buf[2],
            reserved: buf[3],
            org_port: u16::from_be_bytes([buf[4], buf[5]]),
            length: u16::from_be_bytes([buf[6], buf[7]]),
            org_ip: Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]),
            msg_id: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        };
        if header.version != P_VERSION {
            return Err(WireError::BadVersion(header.version));
        }
        if header.ttl == 0 || header.ttl > MAX_TTL {
            return Err(WireError::BadTtl(header.ttl));
        }
        Ok(header)
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.version);
        out.put_u8(self.ttl);
        out.put_u8(self.msg_type);
        out.put_u8(self.reserved);
        out.put_u16(self.org_port);
        out.put_u16(self.length);
        out.put_slice(&self.org_ip.octets());
        out.put_u32(self.msg_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongEntry {
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitEntry {
    pub res_id: u16,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Ping,
    Pong(Vec<PongEntry>),
    Bye,
    /// `None` is a JOIN request, `Some(status)` a JOIN response.
    Join(Option<u16>),
    Query(String),
    QueryHit(Vec<HitEntry>),
}

impl Body {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Body::Ping => MsgType::Ping,
            Body::Pong(_) => MsgType::Pong,
            Body::Bye => MsgType::Bye,
            Body::Join(_) => MsgType::Join,
            Body::Query(_) => MsgType::Query,
            Body::QueryHit(_) => MsgType::QueryHit,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Body::Ping | Body::Bye | Body::Join(None) => 0,
            Body::Join(Some(_)) => 2,
            Body::Pong(entries) => LIST_FRONT_LEN + listed(entries.len(), PONG_ENTRY_LEN) * PONG_ENTRY_LEN,
            Body::Query(key) => key.len().min(BODY_MAX),
            Body::QueryHit(entries) => LIST_FRONT_LEN + listed(entries.len(), HIT_ENTRY_LEN) * HIT_ENTRY_LEN,
        }
    }

    /// Length the body would need without any capping.
    fn required_len(&self) -> usize {
        match self {
            Body::Pong(entries) => LIST_FRONT_LEN + entries.len() * PONG_ENTRY_LEN,
            Body::Query(key) => key.len(),
            Body::QueryHit(entries) => LIST_FRONT_LEN + entries.len() * HIT_ENTRY_LEN,
            _ => self.encoded_len(),
        }
    }

    fn validate(&self) -> Result<(), WireError> {
        let msg_type = self.msg_type();
        if let Body::Query(key) = self {
            let bad = |reason| WireError::BadBody { msg_type, reason };
            if key.is_empty() {
                return Err(bad("empty search key"));
            }
            if key.len() > KEY_MAX {
                return Err(bad("search key too long"));
            }
            if key.contains('\0') {
                return Err(bad("search key contains NUL"));
            }
        }
        let len = self.required_len();
        if len > BODY_MAX {
            return Err(WireError::BodyTooLarge { msg_type, len, max: BODY_MAX });
        }
        Ok(())
    }

    fn encode(&self, out: &mut BytesMut) {
        match self {
            Body::Ping | Body::Bye | Body::Join(None) => {}
            Body::Join(Some(status)) => out.put_u16(*status),
            Body::Pong(entries) => {
                let count = listed(entries.len(), PONG_ENTRY_LEN);
                out.put_u16(count as u16);
                out.put_u16(0);
                for e in &entries[..count] {
                    out.put_slice(&e.ip.octets());
                    out.put_u16(e.port);
                    out.put_u16(0);
                }
            }
            Body::Query(key) => out.put_slice(&key.as_bytes()[..key.len().min(BODY_MAX)]),
            Body::QueryHit(entries) => {
                let count = listed(entries.len(), HIT_ENTRY_LEN);
                out.put_u16(count as u16);
                out.put_u16(0);
                for e in &entries[..count] {
                    out.put_u16(e.res_id);
                    out.put_u16(0);
                    out.put_u32(e.value);
                }
            }
        }
    }

    fn decode(msg_type: MsgType, body: &[u8]) -> Result<Body, WireError> {
        let bad = |reason| WireError::BadBody { msg_type, reason };
        match msg_type {
            MsgType::Ping => Ok(Body::Ping),
            MsgType::Bye => Ok(Body::Bye),
            MsgType::Join => match body.len() {
                0 => Ok(Body::Join(None)),
                2 => Ok(Body::Join(Some(u16::from_be_bytes([body[0], body[1]])))),
                _ => Err(bad("join body must be empty or a 2-byte status")),
            },
            MsgType::Pong => {
                let count = list_count(body, PONG_ENTRY_LEN).ok_or_else(|| bad("entry count does not match length"))?;
                let entries = body[LIST_FRONT_LEN..]
                    .chunks_exact(PONG_ENTRY_LEN)
                    .take(count)
                    .map(|c| PongEntry {
                        ip: Ipv4Addr::new(c[0], c[1], c[2], c[3]),
                        port: u16::from_be_bytes([c[4], c[5]]),
                    })
                    .collect();
                Ok(Body::Pong(entries))
            }
            MsgType::QueryHit => {
                let count = list_count(body, HIT_ENTRY_LEN).ok_or_else(|| bad("entry count does not match length"))?;
                let entries = body[LIST_FRONT_LEN..]
                    .chunks_exact(HIT_ENTRY_LEN)
                    .take(count)
                    .map(|c| HitEntry {
                        res_id: u16::from_be_bytes([c[0], c[1]]),
                        value: u32::from_be_bytes([c[4], c[5], c[6], c[7]]),
                    })
                    .collect();
                Ok(Body::QueryHit(entries))
            }
            MsgType::Query => {
                // Keys may arrive NUL padded from C-string senders.
                let end = body.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                let key = &body[..end];
                if key.is_empty() {
                    return Err(bad("empty search key"));
                }
                if key.len() > KEY_MAX {
                    return Err(bad("search key too long"));
                }
                let key = std::str::from_utf8(key).map_err(|_| bad("search key is not UTF-8"))?;
                Ok(Body::Query(key.to_string()))
            }
        }
    }
}

/// Entries of a list body that fit in one frame.
fn listed(len: usize, entry_len: usize) -> usize {
    len.min((BODY_MAX - LIST_FRONT_LEN) / entry_len)
}

/// Entry count of a `(count, reserved, entries[])` body, if it agrees with the body length.
fn list_count(body: &[u8], entry_len: usize) -> Option<usize> {
    if body.len() < LIST_FRONT_LEN {
        return None;
    }
    let count = u16::from_be_bytes([body[0], body[1]]) as usize;
    (body.len() == LIST_FRONT_LEN + count * entry_len).then_some(count)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Body,
}

impl Frame {
    /// Build a frame whose header type and length agree with `body`. Refuses
    /// anything a peer would reject on decode.
    pub fn new(ttl: u8, org_ip: Ipv4Addr, org_port: u16, msg_id: u32, body: Body) -> Result<Frame, WireError> {
        if ttl == 0 || ttl > MAX_TTL {
            return Err(WireError::BadTtl(ttl));
        }
        body.validate()?;
        let length = u16::try_from(body.encoded_len()).map_err(|_| WireError::Oversized(body.encoded_len()))?;
        let header = Header {
            version: P_VERSION,
            ttl,
            msg_type: body.msg_type().code(),
            reserved: 0,
            org_port,
            length,
            org_ip,
            msg_id,
        };
        Ok(Frame { header, body })
    }

    pub fn msg_type(&self) -> MsgType {
        self.body.msg_type()
    }

    /// Decode one complete frame. `buf` may hold trailing bytes; only the
    /// header-declared length is read.
    pub fn decode(buf: &[u8]) -> Result<Frame, WireError> {
        let header = Header::decode(buf)?;
        let len = header.frame_len();
        if buf.len() < len {
            return Err(WireError::Truncated { need: len, have: buf.len() });
        }
        let msg_type = MsgType::try_from(header.msg_type)?;
        let body = Body::decode(msg_type, &buf[HEADER_LEN..len])?;
        Ok(Frame { header, body })
    }

    pub fn encode(&self) -> Bytes {
        let body_len = self.body.encoded_len();
        let mut out = BytesMut::with_capacity(HEADER_LEN + body_len);
        // List bodies are capped, so body_len never exceeds BODY_MAX.
        let header = Header { length: body_len as u16, ..self.header };
        header.encode(&mut out);
        self.body.encode(&mut out);
        out.freeze()
    }

    /// The same frame one hop further along: ttl reduced by one.
    pub fn forwarded(&self) -> Frame {
        let mut next = self.clone();
        next.header.ttl = self.header.ttl.saturating_sub(1);
        next
    }
}
