//! Short-lived cache of lookup results

use crate::dht::node::NodeId;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

/// Default lifetime of a cache entry
pub const CACHE_VALID_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    inserted_at: Instant,
    peers: Vec<SocketAddrV4>,
}

/// Peers found by recent lookups, keyed by info hash.
///
/// An entry expires `valid_period` after it was created, however many
/// peers were appended to it since.
#[derive(Debug)]
pub struct PeerCache {
    entries: HashMap<NodeId, CacheEntry>,
    valid_period: Duration,
}

impl PeerCache {
    pub fn new(valid_period: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            valid_period,
        }
    }

    /// Cached peers for `info_hash`, `None` when there are none
    pub fn get(&mut self, info_hash: &NodeId, now: Instant) -> Option<Vec<SocketAddrV4>> {
        self.sweep(now);
        self.entries
            .get(info_hash)
            .filter(|entry| !entry.peers.is_empty())
            .map(|entry| entry.peers.clone())
    }

    /// Append peers, skipping ones already cached
    pub fn put(&mut self, info_hash: NodeId, peers: &[SocketAddrV4], now: Instant) {
        self.sweep(now);
        let entry = self.entries.entry(info_hash).or_insert_with(|| CacheEntry {
            inserted_at: now,
            peers: Vec::new(),
        });
        for peer in peers {
            if !entry.peers.contains(peer) {
                entry.peers.push(*peer);
            }
        }
    }

    /// Remove expired entries
    pub fn sweep(&mut self, now: Instant) {
        let valid_period = self.valid_period;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) < valid_period);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn test_put_get_dedup() {
        let now = Instant::now();
        let mut cache = PeerCache::new(CACHE_VALID_PERIOD);
        let info_hash = NodeId::new([4u8; 20]);
        assert_eq!(cache.get(&info_hash, now), None);

        cache.put(info_hash, &[peer("1.2.3.4:6881"), peer("5.6.7.8:6881")], now);
        cache.put(info_hash, &[peer("5.6.7.8:6881"), peer("9.9.9.9:6881")], now);
        assert_eq!(
            cache.get(&info_hash, now),
            Some(vec![peer("1.2.3.4:6881"), peer("5.6.7.8:6881"), peer("9.9.9.9:6881")])
        );
    }

    #[test]
    fn test_entry_expires_from_creation() {
        let start = Instant::now();
        let mut cache = PeerCache::new(CACHE_VALID_PERIOD);
        let info_hash = NodeId::new([4u8; 20]);
        cache.put(info_hash, &[peer("1.2.3.4:6881")], start);
        cache.put(info_hash, &[peer("5.6.7.8:6881")], start + Duration::from_secs(200));

        assert!(cache.get(&info_hash, start + Duration::from_secs(299)).is_some());
        assert_eq!(cache.get(&info_hash, start + CACHE_VALID_PERIOD), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_put_is_a_miss() {
        let now = Instant::now();
        let mut cache = PeerCache::new(CACHE_VALID_PERIOD);
        let info_hash = NodeId::new([4u8; 20]);
        cache.put(info_hash, &[], now);
        assert_eq!(cache.get(&info_hash, now), None);
        assert_eq!(cache.len(), 1);
    }
}
