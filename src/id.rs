//! 160-bit node identifiers, the XOR metric, and the bucket-index/disguise
//! helpers built on top of it.
//!
//! A bare fixed-size byte array: this protocol carries no public key
//! material and IDs are not derived from anything, they are simply chosen
//! (randomly, or by `-u` override in the CLI driver).

use rand::Rng;
use std::fmt;
use std::net::Ipv4Addr;

/// Number of bytes in a [`NodeId`].
pub const ID_LEN: usize = 20;

/// Number of bits in a [`NodeId`], and therefore the number of buckets in a
/// [`crate::routing::RoutingTable`].
pub const ID_BITS: usize = ID_LEN * 8;

/// Opaque 160-bit identifier. Ordering is lexicographic byte order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub fn zero() -> Self {
        NodeId([0u8; ID_LEN])
    }

    /// Generates a uniformly random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut bytes);
        NodeId(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ID_LEN {
            return None;
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Some(NodeId(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// XOR distance between two ids (§3).
    pub fn distance(&self, other: &NodeId) -> Metric {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Metric(out)
    }

    /// `BucketDistance(a, b)` = `BucketIndex(a XOR b)`.
    pub fn bucket_distance(&self, other: &NodeId) -> usize {
        self.distance(other).bucket_index()
    }

    /// Returns a uniformly random id that shares with `self` all leading
    /// bytes/bits that are identical between `self` and `other`, then
    /// diverges randomly at the first differing bit and beyond.
    ///
    /// Used to disguise the real target of a lookup: advertise a midpoint
    /// between the target and the peer being asked, rather than the target
    /// itself, so the peer cannot trivially learn what is being searched
    /// for.
    pub fn random_midpoint(&self, other: &NodeId) -> NodeId {
        let dist = self.distance(other);
        // `shared_bits` leading bits of `self` and `other` agree: if they
        // differ at bit position `p` (0 = LSB, 159 = MSB) that is the
        // highest differing bit, then every bit above `p` (there are
        // `ID_BITS - 1 - p` of them) is shared. A zero distance means the
        // two ids are wholly identical, i.e. all `ID_BITS` bits are shared.
        let shared_bits = if dist.is_zero() {
            ID_BITS
        } else {
            ID_BITS - 1 - dist.bucket_index()
        };
        let mut out = self.0;
        let mut rng = rand::thread_rng();

        // Copy `shared_bits` leading bits from `self`, then randomize the
        // remainder.
        let shared_bytes = shared_bits / 8;
        let shared_rem_bits = shared_bits % 8;

        for i in shared_bytes..ID_LEN {
            if i == shared_bytes && shared_rem_bits > 0 {
                // Keep the top `shared_rem_bits` bits of this byte from
                // `self`, randomize the rest.
                let mask: u8 = 0xFFu8 << (8 - shared_rem_bits);
                let random_byte: u8 = rng.gen();
                out[i] = (self.0[i] & mask) | (random_byte & !mask);
            } else {
                out[i] = rng.gen();
            }
        }
        NodeId(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// XOR distance between two [`NodeId`]s, interpreted as a 160-bit unsigned
/// integer for ordering purposes (`Ord` is big-endian byte order, matching
/// the semantics of the unsigned value).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Metric(pub [u8; ID_LEN]);

impl Metric {
    /// Position of the highest set bit (0 = identical, `ID_BITS - 1` =
    /// maximally far). Panics if the metric is zero; callers that may see a
    /// zero metric (self-comparison) should use [`Metric::bucket_index_or_zero`].
    pub fn bucket_index(&self) -> usize {
        self.bucket_index_or_zero()
    }

    /// Like [`Metric::bucket_index`] but returns `0` for an all-zero metric
    /// instead of panicking, since "identical" and "bucket 0" coincide in
    /// this implementation's bucket-index convention (§3: "0 = identical").
    pub fn bucket_index_or_zero(&self) -> usize {
        for (byte_index, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return (ID_LEN - 1 - byte_index) * 8 + bit;
            }
        }
        0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// IPv4 address + UDP port, as carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Endpoint { ip, port }
    }

    pub fn to_socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(std::net::IpAddr::V4(self.ip), self.port)
    }
}

impl From<std::net::SocketAddrV4> for Endpoint {
    fn from(addr: std::net::SocketAddrV4) -> Self {
        Endpoint::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A (NodeId, Endpoint) pair. Equality requires both components to match;
/// ordering is NodeId-then-IP-then-port as specified in §3.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Contact {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

impl Contact {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Contact { id, endpoint }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_index_identical_is_zero() {
        let a = NodeId::zero();
        assert_eq!(a.distance(&a).bucket_index_or_zero(), 0);
    }

    #[test]
    fn bucket_index_top_bit() {
        let a = NodeId::zero();
        let mut other = [0u8; ID_LEN];
        other[0] = 0x80;
        let b = NodeId(other);
        assert_eq!(a.bucket_distance(&b), 159);
    }

    #[test]
    fn bucket_index_second_bucket() {
        let a = NodeId::zero();
        let mut other = [0u8; ID_LEN];
        other[0] = 0x40;
        let b = NodeId(other);
        assert_eq!(a.bucket_distance(&b), 158);
    }

    #[test]
    fn random_midpoint_shares_leading_bits() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let a_bytes: [u8; ID_LEN] = {
                let mut b = [0u8; ID_LEN];
                rng.fill(&mut b);
                b
            };
            let b_bytes: [u8; ID_LEN] = {
                let mut b = [0u8; ID_LEN];
                rng.fill(&mut b);
                b
            };
            let a = NodeId(a_bytes);
            let b = NodeId(b_bytes);
            let mid = a.random_midpoint(&b);
            let ab = a.distance(&b).bucket_index_or_zero();
            let amid = a.distance(&mid).bucket_index_or_zero();
            assert!(
                amid <= ab,
                "midpoint diverged further than the original peer: {} > {}",
                amid,
                ab
            );
        }
    }

    #[test]
    fn random_midpoint_identical_inputs_is_identity() {
        let a = NodeId::random();
        let mid = a.random_midpoint(&a);
        assert_eq!(mid, a);
    }
}
