//! # Node Identity and Distance Metric
//!
//! This module defines the identity types used throughout xfsnet:
//!
//! - [`Keypair`]: ECDSA (secp256k1) signing keypair owned by the local node
//! - [`NodeId`]: 64-byte identifier, the uncompressed public key `X ‖ Y`
//! - [`NodeHash`]: SHA-256 of a [`NodeId`], the value distance math runs on
//! - [`Node`]: a network endpoint record (`ip`, `udp`, `tcp`, `id`, `hash`)
//!
//! ## Identity Model
//!
//! Two nodes are the same iff their ids are byte-equal. The routing table
//! never compares ids directly for distance; it uses the 32-byte hash so
//! that bucket indices stay uniformly distributed even for structured keys.
//!
//! ## Distance
//!
//! | Function | Meaning |
//! |----------|---------|
//! | [`logdist`] | `log2(a XOR b)`, an integer in `[0, 8*len]`, 0 for equal inputs |
//! | [`distcmp`] | orders `a` and `b` by XOR distance to a target, bytewise big-endian |
//!
//! ## Node URIs
//!
//! Nodes are written as `xfsnode://HOST:PORT/?id=HEX` where `HEX` is the
//! 128-character lower-hex node id. The UDP port defaults to the TCP port.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Length of a node identifier in bytes (uncompressed secp256k1 point, X ‖ Y).
pub const NODE_ID_LEN: usize = 64;

/// Length of a node hash in bytes.
pub const HASH_LEN: usize = 32;

/// Bit width of a node hash; the routing table has `HASH_BITS + 1` buckets.
pub const HASH_BITS: usize = HASH_LEN * 8;

/// URI scheme for node addresses.
pub const URI_SCHEME: &str = "xfsnode";

/// A 64-byte node identifier derived from the node's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// SHA-256 of the raw id. All bucket indexing and lookup ordering runs
    /// on this value, never on the id itself.
    pub fn hash(&self) -> NodeHash {
        let digest = Sha256::digest(self.0);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&digest);
        NodeHash(out)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 128-character hex id, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, UriError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != NODE_ID_LEN * 2 {
            return Err(UriError::IdLength { got: s.len() / 2 });
        }
        let bytes = hex::decode(s).map_err(|_| UriError::IdEncoding)?;
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full ids are unwieldy in logs; the first eight bytes identify a
        // node unambiguously in practice.
        write!(f, "NodeId({}…)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// serde's derive stops at 32-byte arrays, so the 64-byte id serializes as a
// plain byte string.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{NODE_ID_LEN} bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<NodeId, E> {
                if v.len() != NODE_ID_LEN {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut id = [0u8; NODE_ID_LEN];
                id.copy_from_slice(v);
                Ok(NodeId(id))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<NodeId, A::Error> {
                let mut id = [0u8; NODE_ID_LEN];
                for (i, byte) in id.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(NodeId(id))
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}

/// SHA-256 of a [`NodeId`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHash(pub [u8; HASH_LEN]);

impl NodeHash {
    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({}…)", hex::encode(&self.0[..8]))
    }
}

/// ECDSA keypair backing the local node's identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> anyhow::Result<Self> {
        let signing_key = SigningKey::from_bytes(bytes.into())?;
        Ok(Self { signing_key })
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    /// The node id is the uncompressed public point with the SEC1 0x04 tag
    /// stripped: 32 bytes of X followed by 32 bytes of Y.
    pub fn node_id(&self) -> NodeId {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&point.as_bytes()[1..]);
        NodeId(id)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// Logarithmic distance between `a` and `b`: `log2(a XOR b)`, i.e. the bit
/// length of the XOR. Equal inputs yield 0.
pub fn logdist(a: &[u8], b: &[u8]) -> usize {
    debug_assert_eq!(a.len(), b.len());
    let mut lz = 0usize;
    for (x, y) in a.iter().zip(b.iter()) {
        let d = x ^ y;
        if d == 0 {
            lz += 8;
        } else {
            lz += d.leading_zeros() as usize;
            break;
        }
    }
    a.len() * 8 - lz
}

/// Compares the XOR distances `target → a` and `target → b` as unsigned
/// big-endian integers. `Less` means `a` is closer to the target.
pub fn distcmp(target: &[u8], a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    for i in 0..target.len() {
        let da = a[i] ^ target[i];
        let db = b[i] ^ target[i];
        if da != db {
            return da.cmp(&db);
        }
    }
    std::cmp::Ordering::Equal
}

/// A known network endpoint: where to reach a node and who it claims to be.
///
/// Address fields are rewritten only after a successful pong from a
/// different source address; the id never changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
    pub id: NodeId,
    #[serde(skip, default = "zero_hash")]
    pub hash: NodeHash,
}

fn zero_hash() -> NodeHash {
    NodeHash([0u8; HASH_LEN])
}

impl Node {
    pub fn new(ip: IpAddr, udp: u16, tcp: u16, id: NodeId) -> Self {
        Self {
            ip: normalize_ip(ip),
            udp,
            tcp,
            id,
            hash: id.hash(),
        }
    }

    /// Restores the derived hash after deserialization from the node
    /// database, where only the wire fields are stored.
    pub fn rehash(mut self) -> Self {
        self.hash = self.id.hash();
        self
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp)
    }

    /// Parses the `xfsnode://HOST:PORT/?id=HEX` form. The UDP port defaults
    /// to the TCP port.
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let rest = raw
            .strip_prefix(URI_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or(UriError::Scheme)?;

        let (authority, query) = match rest.find(['/', '?']) {
            Some(pos) => {
                let (a, q) = rest.split_at(pos);
                (a, q.trim_start_matches('/').trim_start_matches('?'))
            }
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(UriError::MissingHost);
        }

        let (host, port) = split_host_port(authority)?;
        let ip = IpAddr::from_str(host).map_err(|_| UriError::InvalidIp)?;
        let tcp: u16 = port.parse().map_err(|_| UriError::InvalidPort)?;

        let id_hex = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("id="))
            .filter(|v| !v.is_empty())
            .ok_or(UriError::MissingId)?;
        let id = NodeId::from_hex(id_hex)?;

        Ok(Self::new(ip, tcp, tcp, id))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/?id={}",
            URI_SCHEME,
            self.tcp_addr(),
            hex::encode(self.id.0)
        )
    }
}

/// IPv4-mapped IPv6 addresses collapse to plain IPv4 so that equality and
/// wire encoding agree on a single form.
pub(crate) fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

fn split_host_port(authority: &str) -> Result<(&str, &str), UriError> {
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal: [::1]:port
        let end = rest.find(']').ok_or(UriError::MissingHost)?;
        let host = &rest[..end];
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or(UriError::InvalidPort)?;
        return Ok((host, port));
    }
    match authority.rfind(':') {
        Some(pos) if pos > 0 => Ok((&authority[..pos], &authority[pos + 1..])),
        Some(_) => Err(UriError::MissingHost),
        None => Err(UriError::InvalidPort),
    }
}

/// Node URI parse failures, one variant per way a URI can be malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("invalid URI scheme, want \"{URI_SCHEME}\"")]
    Scheme,
    #[error("URI does not contain a host")]
    MissingHost,
    #[error("host is not a valid IP address")]
    InvalidIp,
    #[error("port out of range")]
    InvalidPort,
    #[error("URI does not contain a node id")]
    MissingId,
    #[error("node id has wrong length, want {NODE_ID_LEN} bytes, got {got}")]
    IdLength { got: usize },
    #[error("node id is not valid hex")]
    IdEncoding,
}
