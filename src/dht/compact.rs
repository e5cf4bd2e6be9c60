//! Compact address codec
//!
//! Binary pack/unpack of IPv4 peers (6 bytes), nodes (26 bytes) and
//! IPv6-capable `nodes2` entries (38 bytes, IPv4-mapped only).

use crate::dht::node::{Node, NodeId, ID_LEN};
use crate::error::DhtError;
use bytes::BufMut;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::debug;

/// Bytes per compact IPv4 address
pub const COMPACT_ADDR_LEN: usize = 6;

/// Bytes per compact IPv4 node (id || addr)
pub const COMPACT_NODE_LEN: usize = ID_LEN + COMPACT_ADDR_LEN;

/// Bytes per `nodes2` entry (id || 16-byte address || port)
pub const COMPACT_NODE2_LEN: usize = ID_LEN + 16 + 2;

const IPV4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// Pack an IPv4 address: 4 octets followed by the big-endian port
pub fn pack_addr(addr: &SocketAddrV4) -> Result<[u8; COMPACT_ADDR_LEN], DhtError> {
    if addr.port() == 0 {
        return Err(DhtError::address_error_with_addr("port 0 is not addressable", addr.to_string()));
    }
    let mut packed = [0u8; COMPACT_ADDR_LEN];
    let mut buf = &mut packed[..];
    buf.put_slice(&addr.ip().octets());
    buf.put_u16(addr.port());
    Ok(packed)
}

/// Unpack a 6-byte compact address
pub fn unpack_addr(data: &[u8]) -> Result<SocketAddrV4, DhtError> {
    if data.len() != COMPACT_ADDR_LEN {
        return Err(DhtError::address_error(format!(
            "compact address must be {} bytes, got {}",
            COMPACT_ADDR_LEN,
            data.len()
        )));
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    if port == 0 {
        return Err(DhtError::address_error_with_addr("port 0 is not addressable", ip.to_string()));
    }
    Ok(SocketAddrV4::new(ip, port))
}

/// Pack nodes as concatenated `id || addr`; nodes with port 0 are left out
pub fn pack_nodes(nodes: &[Node]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        match pack_addr(&node.addr) {
            Ok(addr) => {
                buffer.put_slice(node.id.as_bytes());
                buffer.put_slice(&addr);
            }
            Err(e) => debug!("Not packing node {}: {}", node, e),
        }
    }
    buffer
}

/// Unpack a compact node list.
///
/// The whole list is rejected when its length is not a multiple of 26;
/// individual entries with an unusable address are skipped.
pub fn unpack_nodes(data: &[u8]) -> Result<Vec<Node>, DhtError> {
    if data.len() % COMPACT_NODE_LEN != 0 {
        return Err(DhtError::codec_error(format!(
            "node list length {} is not a multiple of {}",
            data.len(),
            COMPACT_NODE_LEN
        )));
    }

    let mut nodes = Vec::with_capacity(data.len() / COMPACT_NODE_LEN);
    for chunk in data.chunks_exact(COMPACT_NODE_LEN) {
        let id = NodeId::from_bytes(&chunk[..ID_LEN])?;
        match unpack_addr(&chunk[ID_LEN..]) {
            Ok(addr) => nodes.push(Node::new(id, addr)),
            Err(e) => debug!("Skipping node {}: {}", id, e),
        }
    }
    Ok(nodes)
}

/// Pack nodes in the 38-byte `nodes2` layout using IPv4-mapped addresses
pub fn pack_nodes2(nodes: &[Node]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(nodes.len() * COMPACT_NODE2_LEN);
    for node in nodes.iter().filter(|n| n.is_valid()) {
        buffer.put_slice(node.id.as_bytes());
        buffer.put_slice(&IPV4_MAPPED_PREFIX);
        buffer.put_slice(&node.addr.ip().octets());
        buffer.put_u16(node.addr.port());
    }
    buffer
}

/// Unpack a `nodes2` list, keeping only IPv4-mapped entries.
///
/// IPv6 nodes are tolerated on the wire but never routed.
pub fn unpack_nodes2(data: &[u8]) -> Result<Vec<Node>, DhtError> {
    if data.len() % COMPACT_NODE2_LEN != 0 {
        return Err(DhtError::codec_error(format!(
            "nodes2 length {} is not a multiple of {}",
            data.len(),
            COMPACT_NODE2_LEN
        )));
    }

    let mut nodes = Vec::new();
    for chunk in data.chunks_exact(COMPACT_NODE2_LEN) {
        let id = NodeId::from_bytes(&chunk[..ID_LEN])?;
        let address = &chunk[ID_LEN..];
        if address[..12] != IPV4_MAPPED_PREFIX {
            debug!("Skipping IPv6 node {} in nodes2", id);
            continue;
        }
        match unpack_addr(&address[12..]) {
            Ok(addr) => nodes.push(Node::new(id, addr)),
            Err(e) => debug!("Skipping nodes2 entry {}: {}", id, e),
        }
    }
    Ok(nodes)
}

/// Pack peers as individual 6-byte strings, as carried in `values`
pub fn pack_peers(peers: &[SocketAddrV4]) -> Vec<Vec<u8>> {
    peers
        .iter()
        .filter_map(|peer| pack_addr(peer).ok())
        .map(|packed| packed.to_vec())
        .collect()
}

/// Unpack the entries of a `values` list, skipping unusable ones
pub fn unpack_peers<'a, I>(values: I) -> Vec<SocketAddrV4>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    values
        .into_iter()
        .filter_map(|value| match unpack_addr(value) {
            Ok(addr) => Some(addr),
            Err(e) => {
                debug!("Skipping peer value: {}", e);
                None
            }
        })
        .collect()
}
