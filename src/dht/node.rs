//! DHT node module
//!
//! 160-bit identifiers shared by nodes and info hashes, and the
//! value-like `Node` record referenced by routing and lookups.

use crate::error::DhtError;
use std::fmt;
use std::net::SocketAddrV4;

/// Length of an identifier in bytes
pub const ID_LEN: usize = 20;

/// Number of bits in an identifier (and buckets in the routing table)
pub const ID_BITS: usize = ID_LEN * 8;

/// DHT node identifier or info hash (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    /// Create a new NodeId from bytes
    pub fn new(id: [u8; ID_LEN]) -> Self {
        Self(id)
    }

    /// Build a NodeId from a byte string, failing unless it is exactly 20 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| DhtError::invalid_id(bytes.len()))?;
        Ok(Self(id))
    }

    /// Generate a uniformly random NodeId
    pub fn random() -> Self {
        use rand::Rng;
        let mut id = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    /// Get the NodeId as bytes
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Get the NodeId as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a NodeId from a hex string
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str)
            .ok()
            .and_then(|bytes| Self::from_bytes(&bytes).ok())
    }

    /// Bytewise XOR distance to another id
    pub fn xor_distance(&self, other: &NodeId) -> NodeId {
        let mut distance = [0u8; ID_LEN];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(distance)
    }

    /// Index of the highest set bit of the XOR distance, 0 when equal.
    ///
    /// Bit 159 is the most significant bit of byte 0. This is the bucket
    /// index of `other` in a routing table owned by `self`.
    pub fn log2_distance(&self, other: &NodeId) -> usize {
        let distance = self.xor_distance(other);
        for (i, byte) in distance.0.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return (ID_LEN - 1 - i) * 8 + bit;
            }
        }
        0
    }

    /// Random id whose distance to `self` falls in bucket `bucket_index`
    pub fn random_in_bucket(&self, bucket_index: usize) -> NodeId {
        use rand::Rng;
        let bucket_index = bucket_index.min(ID_BITS - 1);
        let mut distance = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut distance);

        // Clear everything above the bucket bit, force the bucket bit itself
        let byte_index = ID_LEN - 1 - bucket_index / 8;
        let bit = bucket_index % 8;
        for byte in distance.iter_mut().take(byte_index) {
            *byte = 0;
        }
        let keep_mask = ((1u16 << bit) - 1) as u8;
        distance[byte_index] = (distance[byte_index] & keep_mask) | (1 << bit);

        self.xor_distance(&NodeId(distance))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Represents a DHT node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Node {
    /// Node identifier
    pub id: NodeId,
    /// Node address
    pub addr: SocketAddrV4,
    /// Client version advertised in the `v` key, when it was 4 bytes long
    pub version: Option<[u8; 4]>,
}

impl Node {
    /// Create a new node
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Self {
            id,
            addr,
            version: None,
        }
    }

    /// Attach the version observed in a message from this node
    pub fn with_version(mut self, version: Option<&[u8]>) -> Self {
        self.version = version.and_then(|v| v.try_into().ok());
        self
    }

    /// Calculate XOR distance to a target id
    pub fn distance_to(&self, target: &NodeId) -> NodeId {
        self.id.xor_distance(target)
    }

    /// A node is addressable when its port is non-zero
    pub fn is_valid(&self) -> bool {
        self.addr.port() != 0
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", &self.id.to_hex()[..8], self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_from_bytes() {
        let id = NodeId::from_bytes(&[7u8; 20]).unwrap();
        assert_eq!(id, NodeId::new([7u8; 20]));

        let err = NodeId::from_bytes(&[7u8; 19]).unwrap_err();
        assert_eq!(err, DhtError::invalid_id(19));
        assert!(NodeId::from_bytes(&[0u8; 21]).is_err());
    }

    #[test]
    fn test_node_id_random() {
        let node_id1 = NodeId::random();
        let node_id2 = NodeId::random();
        assert_ne!(node_id1, node_id2);
    }

    #[test]
    fn test_node_id_hex() {
        let node_id = NodeId::new([0xABu8; 20]);
        let hex_str = node_id.to_hex();
        assert_eq!(hex_str.len(), 40);
        assert_eq!(NodeId::from_hex(&hex_str), Some(node_id));
        assert_eq!(NodeId::from_hex("abcd"), None);
    }

    #[test]
    fn test_xor_distance() {
        let a = NodeId::new([0xFFu8; 20]);
        let b = NodeId::new([0x0Fu8; 20]);
        assert_eq!(a.xor_distance(&b), NodeId::new([0xF0u8; 20]));
        assert_eq!(a.xor_distance(&a), NodeId::new([0u8; 20]));
    }

    #[test]
    fn test_log2_distance() {
        let zero = NodeId::new([0u8; 20]);
        assert_eq!(zero.log2_distance(&zero), 0);

        let mut last = [0u8; 20];
        last[19] = 1;
        assert_eq!(zero.log2_distance(&NodeId::new(last)), 0);
        last[19] = 0x80;
        assert_eq!(zero.log2_distance(&NodeId::new(last)), 7);

        let mut first = [0u8; 20];
        first[0] = 0x80;
        assert_eq!(zero.log2_distance(&NodeId::new(first)), 159);
        first[0] = 0x01;
        assert_eq!(zero.log2_distance(&NodeId::new(first)), 152);
    }

    #[test]
    fn test_random_in_bucket() {
        let local = NodeId::random();
        for bucket in [0usize, 1, 7, 8, 63, 100, 158, 159] {
            let id = local.random_in_bucket(bucket);
            assert_eq!(local.log2_distance(&id), bucket);
        }
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let mut low = [0u8; 20];
        low[0] = 1;
        let mut high = [0u8; 20];
        high[0] = 2;
        assert!(NodeId::new(low) < NodeId::new(high));
    }

    #[test]
    fn test_node_version() {
        let addr: SocketAddrV4 = "127.0.0.1:6881".parse().unwrap();
        let node = Node::new(NodeId::new([1u8; 20]), addr).with_version(Some(&b"UT\x01\x02"[..]));
        assert_eq!(node.version, Some(*b"UT\x01\x02"));

        let node = Node::new(NodeId::new([1u8; 20]), addr).with_version(Some(&b"long version"[..]));
        assert_eq!(node.version, None);
    }

    #[test]
    fn test_node_is_valid() {
        let id = NodeId::new([1u8; 20]);
        assert!(Node::new(id, "127.0.0.1:6881".parse().unwrap()).is_valid());
        assert!(!Node::new(id, "127.0.0.1:0".parse().unwrap()).is_valid());
    }
}
