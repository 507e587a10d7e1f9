//! # Discovery Wire Codec
//!
//! Framing and parse/serialize for the four discovery datagram kinds.
//!
//! ## Datagram layout
//!
//! ```text
//! [kind: u8] [sender-id: 64 bytes] [len: u8] [payload: len bytes]
//! ```
//!
//! The whole datagram never exceeds [`MAX_DATAGRAM_SIZE`] (1280) bytes and
//! the one-byte length prefix caps payloads at 255 bytes. Neighbors replies
//! that would not fit are split into fragments; the reply multiplexer on the
//! requesting side aggregates them.
//!
//! ## Payload encodings
//!
//! All integers are big-endian. Endpoints carry a one-byte IP length (4 or
//! 16) followed by the raw address bytes and the UDP/TCP ports.
//!
//! | Kind | Fields |
//! |------|--------|
//! | ping | version u32, from endpoint, to endpoint, expiration u64 |
//! | pong | to endpoint, expiration u64 |
//! | findnode | target 64 B, expiration u64 |
//! | neighbors | count u8, (endpoint + id) × count, expiration u64 |
//!
//! Expiration stamps are absolute unix seconds; receivers reject datagrams
//! whose stamp is in the past (checked in the transport, not here).

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};

use crate::identity::{Node, NodeId, NODE_ID_LEN};

/// Discovery protocol version carried in every ping.
pub const DISCOVERY_VERSION: u32 = 4;

/// Discovery datagrams are defined to be no larger than this.
pub const MAX_DATAGRAM_SIZE: usize = 1280;

/// Hard cap from the one-byte payload length prefix.
const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Header: kind byte, sender id, payload length byte.
const HEADER_LEN: usize = 1 + NODE_ID_LEN + 1;

/// Malformed-datagram failures. These abort the offending packet only; the
/// receive loop keeps running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram truncated")]
    Truncated,
    #[error("unknown packet kind: {0}")]
    UnknownKind(u8),
    #[error("payload length prefix does not match payload")]
    BadLength,
    #[error("payload too large for length prefix: {0} bytes")]
    OversizePayload(usize),
    #[error("bad endpoint ip length: {0}")]
    BadIpLength(u8),
}

/// Datagram kind discriminants. Zero is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Ping = 1,
    Pong = 2,
    FindNode = 3,
    Neighbors = 4,
}

impl PacketKind {
    fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            1 => Ok(Self::Ping),
            2 => Ok(Self::Pong),
            3 => Ok(Self::FindNode),
            4 => Ok(Self::Neighbors),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// A remote UDP/TCP endpoint as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, udp: u16, tcp: u16) -> Self {
        Self {
            ip: crate::identity::normalize_ip(ip),
            udp,
            tcp,
        }
    }

    pub fn from_addr(addr: std::net::SocketAddr, tcp: u16) -> Self {
        Self::new(addr.ip(), addr.port(), tcp)
    }

    pub fn udp_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.udp)
    }

    fn encoded_len(&self) -> usize {
        let ip_len = match self.ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        };
        1 + ip_len + 2 + 2
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self.ip {
            IpAddr::V4(v4) => {
                buf.put_u8(4);
                buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.put_u8(16);
                buf.put_slice(&v6.octets());
            }
        }
        buf.put_u16(self.udp);
        buf.put_u16(self.tcp);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        if buf.remaining() < 1 {
            return Err(WireError::Truncated);
        }
        let ip_len = buf.get_u8();
        let ip = match ip_len {
            4 => {
                if buf.remaining() < 4 {
                    return Err(WireError::Truncated);
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::from(octets)
            }
            16 => {
                if buf.remaining() < 16 {
                    return Err(WireError::Truncated);
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                crate::identity::normalize_ip(IpAddr::from(octets))
            }
            other => return Err(WireError::BadIpLength(other)),
        };
        if buf.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let udp = buf.get_u16();
        let tcp = buf.get_u16();
        Ok(Self { ip, udp, tcp })
    }
}

/// An endpoint plus the id claiming it, as listed in neighbors replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireNode {
    pub endpoint: Endpoint,
    pub id: NodeId,
}

impl WireNode {
    pub fn from_node(n: &Node) -> Self {
        Self {
            endpoint: Endpoint::new(n.ip, n.udp, n.tcp),
            id: n.id,
        }
    }

    /// Converts a wire entry into a usable node record, rejecting addresses
    /// no dial could ever reach.
    pub fn to_node(self) -> Option<Node> {
        let ip = self.endpoint.ip;
        if ip.is_multicast() || ip.is_unspecified() || self.endpoint.udp == 0 {
            return None;
        }
        Some(Node::new(ip, self.endpoint.udp, self.endpoint.tcp, self.id))
    }

    fn encoded_len(&self) -> usize {
        self.endpoint.encoded_len() + NODE_ID_LEN
    }

    /// Serializes the entry standalone, as stored in the node database.
    pub(crate) fn to_record_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.to_vec()
    }

    pub(crate) fn from_record_bytes(mut buf: &[u8]) -> Result<Self, WireError> {
        let node = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(WireError::BadLength);
        }
        Ok(node)
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.endpoint.encode(buf);
        buf.put_slice(self.id.as_bytes());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        let endpoint = Endpoint::decode(buf)?;
        if buf.remaining() < NODE_ID_LEN {
            return Err(WireError::Truncated);
        }
        let mut id = [0u8; NODE_ID_LEN];
        buf.copy_to_slice(&mut id);
        Ok(Self {
            endpoint,
            id: NodeId::from_bytes(id),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub version: u32,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    /// Mirrors the UDP envelope address of the ping, which lets the pinger
    /// discover its external address.
    pub to: Endpoint,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    /// Does not need to be the id of an actual node.
    pub target: NodeId,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbors {
    pub nodes: Vec<WireNode>,
    pub expiration: u64,
}

impl Neighbors {
    /// Splits `nodes` into as many replies as needed to respect the payload
    /// size cap. Always yields at least one fragment, even when empty.
    pub fn fragments(nodes: &[WireNode], expiration: u64) -> Vec<Neighbors> {
        let base = 1 + 8; // count byte + expiration
        let mut out = Vec::new();
        let mut current = Vec::new();
        let mut size = base;
        for node in nodes {
            let len = node.encoded_len();
            if size + len > MAX_PAYLOAD_SIZE && !current.is_empty() {
                out.push(Neighbors {
                    nodes: std::mem::take(&mut current),
                    expiration,
                });
                size = base;
            }
            size += len;
            current.push(*node);
        }
        out.push(Neighbors {
            nodes: current,
            expiration,
        });
        out
    }
}

/// One parsed discovery datagram body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Ping(_) => PacketKind::Ping,
            Packet::Pong(_) => PacketKind::Pong,
            Packet::FindNode(_) => PacketKind::FindNode,
            Packet::Neighbors(_) => PacketKind::Neighbors,
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            Packet::Ping(p) => p.expiration,
            Packet::Pong(p) => p.expiration,
            Packet::FindNode(p) => p.expiration,
            Packet::Neighbors(p) => p.expiration,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Packet::Ping(p) => {
                buf.put_u32(p.version);
                p.from.encode(buf);
                p.to.encode(buf);
                buf.put_u64(p.expiration);
            }
            Packet::Pong(p) => {
                p.to.encode(buf);
                buf.put_u64(p.expiration);
            }
            Packet::FindNode(p) => {
                buf.put_slice(p.target.as_bytes());
                buf.put_u64(p.expiration);
            }
            Packet::Neighbors(p) => {
                buf.put_u8(p.nodes.len() as u8);
                for node in &p.nodes {
                    node.encode(buf);
                }
                buf.put_u64(p.expiration);
            }
        }
    }

    fn decode_payload(kind: PacketKind, mut buf: &[u8]) -> Result<Self, WireError> {
        let buf = &mut buf;
        let packet = match kind {
            PacketKind::Ping => {
                if buf.remaining() < 4 {
                    return Err(WireError::Truncated);
                }
                let version = buf.get_u32();
                let from = Endpoint::decode(buf)?;
                let to = Endpoint::decode(buf)?;
                let expiration = decode_expiration(buf)?;
                Packet::Ping(Ping {
                    version,
                    from,
                    to,
                    expiration,
                })
            }
            PacketKind::Pong => {
                let to = Endpoint::decode(buf)?;
                let expiration = decode_expiration(buf)?;
                Packet::Pong(Pong { to, expiration })
            }
            PacketKind::FindNode => {
                if buf.remaining() < NODE_ID_LEN {
                    return Err(WireError::Truncated);
                }
                let mut target = [0u8; NODE_ID_LEN];
                buf.copy_to_slice(&mut target);
                let expiration = decode_expiration(buf)?;
                Packet::FindNode(FindNode {
                    target: NodeId::from_bytes(target),
                    expiration,
                })
            }
            PacketKind::Neighbors => {
                if buf.remaining() < 1 {
                    return Err(WireError::Truncated);
                }
                let count = buf.get_u8();
                let mut nodes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    nodes.push(WireNode::decode(buf)?);
                }
                let expiration = decode_expiration(buf)?;
                Packet::Neighbors(Neighbors { nodes, expiration })
            }
        };
        if buf.has_remaining() {
            return Err(WireError::BadLength);
        }
        Ok(packet)
    }
}

fn decode_expiration(buf: &mut &[u8]) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64())
}

/// Serializes a datagram: header, sender id, length prefix, payload.
pub fn encode_datagram(sender: &NodeId, packet: &Packet) -> Result<Vec<u8>, WireError> {
    let mut payload = BytesMut::with_capacity(MAX_PAYLOAD_SIZE);
    packet.encode_payload(&mut payload);
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::OversizePayload(payload.len()));
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(packet.kind() as u8);
    out.put_slice(sender.as_bytes());
    out.put_u8(payload.len() as u8);
    out.put_slice(&payload);
    Ok(out.to_vec())
}

/// Parses a datagram into its sender id and body.
pub fn decode_datagram(buf: &[u8]) -> Result<(NodeId, Packet), WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let kind = PacketKind::from_byte(buf[0])?;
    let mut sender = [0u8; NODE_ID_LEN];
    sender.copy_from_slice(&buf[1..1 + NODE_ID_LEN]);
    let payload_len = buf[HEADER_LEN - 1] as usize;
    let payload = &buf[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(WireError::BadLength);
    }
    let packet = Packet::decode_payload(kind, payload)?;
    Ok((NodeId::from_bytes(sender), packet))
}

/// True if the absolute unix-seconds stamp lies in the past.
pub fn expired(ts: u64) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    ts < now
}

/// An expiration stamp `ahead` from now.
pub fn expiration_from_now(ahead: std::time::Duration) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        + ahead.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn test_id(n: u8) -> NodeId {
        let mut id = [0u8; NODE_ID_LEN];
        id[0] = n;
        NodeId::from_bytes(id)
    }

    fn v4_endpoint(last: u8, udp: u16, tcp: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), udp, tcp)
    }

    fn round_trip(packet: Packet) {
        let sender = test_id(7);
        let bytes = encode_datagram(&sender, &packet).unwrap();
        assert!(bytes.len() <= MAX_DATAGRAM_SIZE);
        let (got_sender, got) = decode_datagram(&bytes).unwrap();
        assert_eq!(got_sender, sender);
        assert_eq!(got, packet);
    }

    #[test]
    fn ping_round_trip() {
        round_trip(Packet::Ping(Ping {
            version: DISCOVERY_VERSION,
            from: v4_endpoint(1, 3001, 3002),
            to: v4_endpoint(2, 4001, 0),
            expiration: 1_800_000_000,
        }));
    }

    #[test]
    fn pong_round_trip() {
        round_trip(Packet::Pong(Pong {
            to: v4_endpoint(3, 5000, 5001),
            expiration: 1_800_000_000,
        }));
    }

    #[test]
    fn findnode_round_trip() {
        round_trip(Packet::FindNode(FindNode {
            target: test_id(0xAB),
            expiration: 1_800_000_000,
        }));
    }

    #[test]
    fn neighbors_round_trip_mixed_ips() {
        let v6 = Endpoint::new(
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            9000,
            9001,
        );
        round_trip(Packet::Neighbors(Neighbors {
            nodes: vec![
                WireNode {
                    endpoint: v4_endpoint(4, 6000, 6001),
                    id: test_id(1),
                },
                WireNode {
                    endpoint: v6,
                    id: test_id(2),
                },
            ],
            expiration: 1_800_000_000,
        }));
    }

    #[test]
    fn neighbors_fragments_respect_payload_cap() {
        let nodes: Vec<WireNode> = (0..16)
            .map(|n| WireNode {
                endpoint: v4_endpoint(n, 1000 + n as u16, 1000 + n as u16),
                id: test_id(n),
            })
            .collect();
        let fragments = Neighbors::fragments(&nodes, 1_800_000_000);
        assert!(fragments.len() > 1, "16 nodes cannot fit one fragment");
        let total: usize = fragments.iter().map(|f| f.nodes.len()).sum();
        assert_eq!(total, 16);
        for fragment in fragments {
            let bytes =
                encode_datagram(&test_id(0), &Packet::Neighbors(fragment)).unwrap();
            assert!(bytes.len() <= MAX_DATAGRAM_SIZE);
        }
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let nodes: Vec<WireNode> = (0..16)
            .map(|n| WireNode {
                endpoint: v4_endpoint(n, 1, 1),
                id: test_id(n),
            })
            .collect();
        let packet = Packet::Neighbors(Neighbors {
            nodes,
            expiration: 0,
        });
        assert!(matches!(
            encode_datagram(&test_id(0), &packet),
            Err(WireError::OversizePayload(_))
        ));
    }

    #[test]
    fn unknown_kind_and_truncation() {
        let good = encode_datagram(
            &test_id(1),
            &Packet::FindNode(FindNode {
                target: test_id(2),
                expiration: 1,
            }),
        )
        .unwrap();

        let mut bad_kind = good.clone();
        bad_kind[0] = 9;
        assert_eq!(decode_datagram(&bad_kind), Err(WireError::UnknownKind(9)));

        assert_eq!(decode_datagram(&good[..10]), Err(WireError::Truncated));

        let mut short = good.clone();
        short.truncate(good.len() - 3);
        assert_eq!(decode_datagram(&short), Err(WireError::BadLength));
    }

    #[test]
    fn wire_node_rejects_unroutable_addresses() {
        let unspecified = WireNode {
            endpoint: Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 1, 1),
            id: test_id(1),
        };
        assert!(unspecified.to_node().is_none());

        let zero_port = WireNode {
            endpoint: v4_endpoint(1, 0, 1),
            id: test_id(1),
        };
        assert!(zero_port.to_node().is_none());

        let ok = WireNode {
            endpoint: v4_endpoint(1, 1, 1),
            id: test_id(1),
        };
        assert!(ok.to_node().is_some());
    }
}
