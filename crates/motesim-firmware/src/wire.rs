//! Wire format for reference-firmware payloads.
//!
//! Packets carry either a neighbor beacon (with piggybacked route adverts)
//! or a flooded message (ping, ping reply, transport segment). Flooded
//! messages carry an (origin, flood id) pair used for duplicate
//! suppression at relays and a hop-limit TTL.
//!
//! Encoding is fixed-layout big-endian. Decode validates the kind byte and
//! every length field and fails rather than guessing.

use motesim_common::NodeAddr;
use thiserror::Error;

/// Maximum number of route adverts piggybacked on one beacon.
pub const MAX_ROUTE_ADVERTS: usize = 255;

/// Transport segment payload limit in bytes.
pub const TRANSPORT_PAYLOAD_MAX: usize = 10;

const KIND_BEACON: u8 = 0x01;
const KIND_FLOOD: u8 = 0x02;

const FLOOD_PING: u8 = 0x01;
const FLOOD_PING_REPLY: u8 = 0x02;
const FLOOD_TRANSPORT: u8 = 0x03;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while decoding a payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Payload ended before the expected field.
    #[error("payload truncated at offset {0}")]
    Truncated(usize),

    /// Unknown top-level kind byte.
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u8),

    /// Unknown flood message kind byte.
    #[error("unknown flood kind {0:#04x}")]
    UnknownFloodKind(u8),

    /// Unknown transport segment flag byte.
    #[error("unknown segment flag {0:#04x}")]
    UnknownFlag(u8),

    /// A length field exceeds its limit.
    #[error("length field out of range: {0}")]
    BadLength(usize),

    /// Ping data is not valid UTF-8.
    #[error("ping data is not valid UTF-8")]
    InvalidUtf8,

    /// Trailing bytes after a complete message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

// ============================================================================
// Message Types
// ============================================================================

/// A route advert piggybacked on a beacon: "I can reach `dest` at `cost`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteAdvert {
    /// Advertised destination.
    pub dest: NodeAddr,
    /// Hop cost from the advertising mote.
    pub cost: u8,
}

/// Transport segment flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFlag {
    /// Connection open request.
    Syn,
    /// Acknowledgement.
    Ack,
    /// Connection close request.
    Fin,
    /// Data segment.
    Data,
}

impl SegmentFlag {
    fn to_byte(self) -> u8 {
        match self {
            SegmentFlag::Syn => 0,
            SegmentFlag::Ack => 1,
            SegmentFlag::Fin => 2,
            SegmentFlag::Data => 3,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(SegmentFlag::Syn),
            1 => Some(SegmentFlag::Ack),
            2 => Some(SegmentFlag::Fin),
            3 => Some(SegmentFlag::Data),
            _ => None,
        }
    }
}

impl std::fmt::Display for SegmentFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SegmentFlag::Syn => "SYN",
            SegmentFlag::Ack => "ACK",
            SegmentFlag::Fin => "FIN",
            SegmentFlag::Data => "DATA",
        };
        f.write_str(s)
    }
}

/// A transport segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Sending port.
    pub src_port: u8,
    /// Receiving port.
    pub dest_port: u8,
    /// Segment sequence number.
    pub seq: u16,
    /// Cumulative acknowledgement number.
    pub ack: u16,
    /// Advertised receive window, in segments.
    pub advert_window: u16,
    /// Segment flag.
    pub flag: SegmentFlag,
    /// Segment payload, at most [`TRANSPORT_PAYLOAD_MAX`] bytes.
    pub payload: Vec<u8>,
}

/// Payload of a flooded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloodPayload {
    /// A ping request.
    Ping {
        /// Final destination of the ping.
        target: NodeAddr,
        /// Opaque ping data.
        data: String,
    },
    /// A ping reply.
    PingReply {
        /// Final destination (the original pinger).
        target: NodeAddr,
        /// Flood id of the ping being answered.
        echo_id: u16,
    },
    /// A transport segment.
    Transport {
        /// Final destination of the segment.
        target: NodeAddr,
        /// The segment.
        segment: Segment,
    },
}

impl FloodPayload {
    /// The final destination of this flooded message.
    pub fn target(&self) -> NodeAddr {
        match self {
            FloodPayload::Ping { target, .. } => *target,
            FloodPayload::PingReply { target, .. } => *target,
            FloodPayload::Transport { target, .. } => *target,
        }
    }
}

/// A flooded message: hop-limited, duplicate-suppressed by
/// (origin, flood_id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloodMessage {
    /// Originating mote.
    pub origin: NodeAddr,
    /// Per-origin flood sequence number.
    pub flood_id: u16,
    /// Remaining hop budget.
    pub ttl: u8,
    /// The carried payload.
    pub payload: FloodPayload,
}

/// Decoded packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// A neighbor beacon with piggybacked route adverts.
    Beacon {
        /// Beacon sequence number of the sender.
        seq: u16,
        /// Route adverts.
        routes: Vec<RouteAdvert>,
    },
    /// A flooded message.
    Flood(FloodMessage),
}

// ============================================================================
// Encoding
// ============================================================================

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

impl PacketBody {
    /// Encode into payload bytes.
    ///
    /// Panics if a beacon carries more than [`MAX_ROUTE_ADVERTS`] adverts
    /// or a segment payload exceeds [`TRANSPORT_PAYLOAD_MAX`]; both are
    /// firmware bugs, not runtime conditions.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            PacketBody::Beacon { seq, routes } => {
                assert!(routes.len() <= MAX_ROUTE_ADVERTS, "too many route adverts");
                buf.push(KIND_BEACON);
                put_u16(&mut buf, *seq);
                buf.push(routes.len() as u8);
                for advert in routes {
                    put_u16(&mut buf, advert.dest.0);
                    buf.push(advert.cost);
                }
            }
            PacketBody::Flood(msg) => {
                buf.push(KIND_FLOOD);
                put_u16(&mut buf, msg.origin.0);
                put_u16(&mut buf, msg.flood_id);
                buf.push(msg.ttl);
                match &msg.payload {
                    FloodPayload::Ping { target, data } => {
                        assert!(data.len() <= u8::MAX as usize, "ping data too long");
                        buf.push(FLOOD_PING);
                        put_u16(&mut buf, target.0);
                        buf.push(data.len() as u8);
                        buf.extend_from_slice(data.as_bytes());
                    }
                    FloodPayload::PingReply { target, echo_id } => {
                        buf.push(FLOOD_PING_REPLY);
                        put_u16(&mut buf, target.0);
                        put_u16(&mut buf, *echo_id);
                    }
                    FloodPayload::Transport { target, segment } => {
                        assert!(
                            segment.payload.len() <= TRANSPORT_PAYLOAD_MAX,
                            "segment payload too long"
                        );
                        buf.push(FLOOD_TRANSPORT);
                        put_u16(&mut buf, target.0);
                        buf.push(segment.src_port);
                        buf.push(segment.dest_port);
                        put_u16(&mut buf, segment.seq);
                        put_u16(&mut buf, segment.ack);
                        put_u16(&mut buf, segment.advert_window);
                        buf.push(segment.flag.to_byte());
                        buf.push(segment.payload.len() as u8);
                        buf.extend_from_slice(&segment.payload);
                    }
                }
            }
        }
        buf
    }
}

// ============================================================================
// Decoding
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        let b = *self.buf.get(self.pos).ok_or(WireError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(len).ok_or(WireError::BadLength(len))?;
        if end > self.buf.len() {
            return Err(WireError::Truncated(self.pos));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn finish(&self) -> Result<(), WireError> {
        let remaining = self.buf.len() - self.pos;
        if remaining > 0 {
            return Err(WireError::TrailingBytes(remaining));
        }
        Ok(())
    }
}

impl PacketBody {
    /// Decode payload bytes.
    pub fn decode(payload: &[u8]) -> Result<PacketBody, WireError> {
        let mut r = Reader::new(payload);
        let body = match r.u8()? {
            KIND_BEACON => {
                let seq = r.u16()?;
                let count = r.u8()? as usize;
                let mut routes = Vec::with_capacity(count);
                for _ in 0..count {
                    let dest = NodeAddr(r.u16()?);
                    let cost = r.u8()?;
                    routes.push(RouteAdvert { dest, cost });
                }
                PacketBody::Beacon { seq, routes }
            }
            KIND_FLOOD => {
                let origin = NodeAddr(r.u16()?);
                let flood_id = r.u16()?;
                let ttl = r.u8()?;
                let payload = match r.u8()? {
                    FLOOD_PING => {
                        let target = NodeAddr(r.u16()?);
                        let len = r.u8()? as usize;
                        let data = std::str::from_utf8(r.bytes(len)?)
                            .map_err(|_| WireError::InvalidUtf8)?
                            .to_string();
                        FloodPayload::Ping { target, data }
                    }
                    FLOOD_PING_REPLY => {
                        let target = NodeAddr(r.u16()?);
                        let echo_id = r.u16()?;
                        FloodPayload::PingReply { target, echo_id }
                    }
                    FLOOD_TRANSPORT => {
                        let target = NodeAddr(r.u16()?);
                        let src_port = r.u8()?;
                        let dest_port = r.u8()?;
                        let seq = r.u16()?;
                        let ack = r.u16()?;
                        let advert_window = r.u16()?;
                        let flag_byte = r.u8()?;
                        let flag = SegmentFlag::from_byte(flag_byte)
                            .ok_or(WireError::UnknownFlag(flag_byte))?;
                        let len = r.u8()? as usize;
                        if len > TRANSPORT_PAYLOAD_MAX {
                            return Err(WireError::BadLength(len));
                        }
                        let payload = r.bytes(len)?.to_vec();
                        FloodPayload::Transport {
                            target,
                            segment: Segment {
                                src_port,
                                dest_port,
                                seq,
                                ack,
                                advert_window,
                                flag,
                                payload,
                            },
                        }
                    }
                    other => return Err(WireError::UnknownFloodKind(other)),
                };
                PacketBody::Flood(FloodMessage {
                    origin,
                    flood_id,
                    ttl,
                    payload,
                })
            }
            other => return Err(WireError::UnknownKind(other)),
        };
        r.finish()?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_round_trip() {
        let body = PacketBody::Beacon {
            seq: 517,
            routes: vec![
                RouteAdvert {
                    dest: NodeAddr(4),
                    cost: 2,
                },
                RouteAdvert {
                    dest: NodeAddr(9),
                    cost: 5,
                },
            ],
        };
        assert_eq!(PacketBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn test_transport_round_trip() {
        let body = PacketBody::Flood(FloodMessage {
            origin: NodeAddr(2),
            flood_id: 9,
            ttl: 16,
            payload: FloodPayload::Transport {
                target: NodeAddr(10),
                segment: Segment {
                    src_port: 20,
                    dest_port: 33,
                    seq: 3,
                    ack: 0,
                    advert_window: 1,
                    flag: SegmentFlag::Data,
                    payload: vec![1, 2, 3, 4],
                },
            },
        });
        assert_eq!(PacketBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn test_ping_round_trip() {
        let body = PacketBody::Flood(FloodMessage {
            origin: NodeAddr(1),
            flood_id: 0,
            ttl: 8,
            payload: FloodPayload::Ping {
                target: NodeAddr(9),
                data: "Test".to_string(),
            },
        });
        assert_eq!(PacketBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert_eq!(
            PacketBody::decode(&[0x7f]),
            Err(WireError::UnknownKind(0x7f))
        );
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let body = PacketBody::Flood(FloodMessage {
            origin: NodeAddr(1),
            flood_id: 1,
            ttl: 4,
            payload: FloodPayload::Ping {
                target: NodeAddr(2),
                data: "hello".to_string(),
            },
        });
        let mut bytes = body.encode();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            PacketBody::decode(&bytes),
            Err(WireError::Truncated(_))
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = PacketBody::Beacon {
            seq: 1,
            routes: vec![],
        }
        .encode();
        bytes.push(0);
        assert_eq!(PacketBody::decode(&bytes), Err(WireError::TrailingBytes(1)));
    }

    #[test]
    fn test_decode_rejects_oversize_segment_payload() {
        // Hand-build a transport segment claiming an oversize payload.
        let mut bytes = vec![0x02];
        bytes.extend_from_slice(&2u16.to_be_bytes()); // origin
        bytes.extend_from_slice(&0u16.to_be_bytes()); // flood_id
        bytes.push(16); // ttl
        bytes.push(0x03); // transport
        bytes.extend_from_slice(&10u16.to_be_bytes()); // target
        bytes.push(20); // src_port
        bytes.push(33); // dest_port
        bytes.extend_from_slice(&0u16.to_be_bytes()); // seq
        bytes.extend_from_slice(&0u16.to_be_bytes()); // ack
        bytes.extend_from_slice(&1u16.to_be_bytes()); // advert_window
        bytes.push(3); // DATA
        bytes.push((TRANSPORT_PAYLOAD_MAX + 1) as u8);
        bytes.extend_from_slice(&[0u8; TRANSPORT_PAYLOAD_MAX + 1]);
        assert_eq!(
            PacketBody::decode(&bytes),
            Err(WireError::BadLength(TRANSPORT_PAYLOAD_MAX + 1))
        );
    }
}
