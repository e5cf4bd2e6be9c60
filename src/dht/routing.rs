//! DHT routing table module
//!
//! Implements the Kademlia routing table (160 buckets indexed by the
//! log2 XOR distance to the local id) and the RoutingManager that keeps
//! it fresh: liveness bookkeeping, replacement caches, maintenance pings
//! and refresh lookups.

use crate::dht::bootstrap::BootstrapState;
use crate::dht::message::Query;
use crate::dht::node::{Node, NodeId, ID_BITS};
use crate::dht::querier::QueryRequest;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Kademlia constant - number of nodes per bucket
pub const K: usize = 8;

/// Consecutive failures after which a node is evicted
pub const MAX_FAILURES: u8 = 3;

/// A bucket not refreshed for this long gets maintenance
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Pings sent per maintenance pass
pub const MAINTENANCE_PING_BATCH: usize = 3;

const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_secs(5);
const BUSY_MAINTENANCE_DELAY: Duration = Duration::from_secs(2);
const MIN_MAINTENANCE_DELAY: Duration = Duration::from_secs(1);
const MAX_MAINTENANCE_DELAY: Duration = Duration::from_secs(60);

/// A node held by the routing table, with liveness bookkeeping
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub node: Node,
    /// Last time the node proved alive; `None` for unverified candidates
    pub last_seen: Option<Instant>,
    pub consecutive_failures: u8,
    /// Round-trip time of the last answered query
    pub rtt: Option<Duration>,
    ping_pending: bool,
}

impl RoutingEntry {
    fn verified(node: Node, now: Instant) -> Self {
        Self {
            node,
            last_seen: Some(now),
            consecutive_failures: 0,
            rtt: None,
            ping_pending: false,
        }
    }

    fn candidate(node: Node) -> Self {
        Self {
            node,
            last_seen: None,
            consecutive_failures: 0,
            rtt: None,
            ping_pending: false,
        }
    }

    /// Whether the node has been silent for a full refresh interval
    pub fn is_stale(&self, now: Instant) -> bool {
        self.last_seen
            .map_or(true, |seen| now.saturating_duration_since(seen) >= BUCKET_REFRESH_INTERVAL)
    }
}

/// A bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Live nodes, at most K
    pub entries: Vec<RoutingEntry>,
    /// Candidates that arrived while the bucket was full, at most K
    pub replacements: Vec<RoutingEntry>,
    /// When this bucket was last refreshed
    pub last_refreshed: Instant,
}

impl KBucket {
    /// Create a new KBucket
    pub fn new(now: Instant) -> Self {
        Self {
            entries: Vec::with_capacity(K),
            replacements: Vec::new(),
            last_refreshed: now,
        }
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &NodeId) -> Option<&RoutingEntry> {
        self.entries.iter().find(|e| e.node.id == *id)
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.node.id == *id)
    }

    fn replacement_position(&self, id: &NodeId) -> Option<usize> {
        self.replacements.iter().position(|e| e.node.id == *id)
    }

    /// Get the number of nodes in the bucket
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if the bucket is full
    pub fn is_full(&self) -> bool {
        self.entries.len() >= K
    }

    /// Index of the least recently seen entry
    fn oldest_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(i, _)| i)
    }

    /// Insert into the live entries, dropping any candidate copy of the same node
    fn push_entry(&mut self, entry: RoutingEntry) {
        if let Some(pos) = self.replacement_position(&entry.node.id) {
            self.replacements.remove(pos);
        }
        self.entries.push(entry);
    }

    /// Store a candidate, evicting the least useful one when the cache is full
    fn add_replacement(&mut self, entry: RoutingEntry) {
        if self.position(&entry.node.id).is_some() {
            return;
        }
        if let Some(pos) = self.replacement_position(&entry.node.id) {
            let existing = &mut self.replacements[pos];
            if entry.last_seen.is_some() {
                existing.last_seen = entry.last_seen;
                existing.node = entry.node;
            }
            return;
        }
        if self.replacements.len() >= K {
            // Unverified candidates sort first (None < Some), then the oldest verified
            if let Some((worst, _)) = self.replacements.iter().enumerate().min_by_key(|(_, e)| e.last_seen) {
                if entry.last_seen.is_none() && self.replacements[worst].last_seen.is_some() {
                    return;
                }
                self.replacements.remove(worst);
            }
        }
        self.replacements.push(entry);
    }

    /// Take the best replacement: most recently seen verified first, then the newest candidate
    fn take_best_replacement(&mut self) -> Option<RoutingEntry> {
        let best = self
            .replacements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.last_seen.is_some())
            .max_by_key(|(_, e)| e.last_seen)
            .map(|(i, _)| i)
            .or_else(|| self.replacements.len().checked_sub(1))?;
        Some(self.replacements.remove(best))
    }
}

/// Kademlia routing table
#[derive(Debug)]
pub struct RoutingTable {
    /// Our node ID
    pub our_id: NodeId,
    /// One bucket per bit of distance
    pub buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(our_id: NodeId, now: Instant) -> Self {
        Self {
            our_id,
            buckets: (0..ID_BITS).map(|_| KBucket::new(now)).collect(),
        }
    }

    /// Get the bucket index for a node ID
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        self.our_id.log2_distance(id)
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &NodeId) -> Option<&RoutingEntry> {
        self.buckets[self.bucket_index(id)].find_node(id)
    }

    /// Get all nodes in the routing table
    pub fn get_nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.node))
            .collect()
    }

    /// Get the number of nodes in the routing table
    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

/// Work produced by one maintenance pass
#[derive(Debug, Default)]
pub struct Maintenance {
    /// Delay until the next pass
    pub next_delay: Duration,
    /// Pings and bootstrap queries to send
    pub queries: Vec<QueryRequest>,
    /// Target of a refresh lookup to start
    pub lookup: Option<NodeId>,
}

/// Keeps the routing table fresh and answers closest-node queries
#[derive(Debug)]
pub struct RoutingManager {
    table: RoutingTable,
    local_node: Node,
    bootstrap_addrs: Vec<SocketAddrV4>,
    bootstrapping: bool,
}

impl RoutingManager {
    /// Create a manager for the local node
    pub fn new(local_node: Node, now: Instant) -> Self {
        Self {
            table: RoutingTable::new(local_node.id, now),
            local_node,
            bootstrap_addrs: Vec::new(),
            bootstrapping: false,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_node.id
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Addresses contacted while the table is empty
    pub fn add_bootstrap_addrs(&mut self, addrs: impl IntoIterator<Item = SocketAddrV4>) {
        for addr in addrs {
            if addr.port() != 0 && !self.bootstrap_addrs.contains(&addr) {
                self.bootstrap_addrs.push(addr);
            }
        }
    }

    pub fn bootstrap_addrs(&self) -> &[SocketAddrV4] {
        &self.bootstrap_addrs
    }

    pub fn node_count(&self) -> usize {
        self.table.node_count()
    }

    pub fn find(&self, id: &NodeId) -> Option<&RoutingEntry> {
        self.table.find_node(id)
    }

    fn accepts(&self, node: &Node) -> bool {
        node.is_valid() && node.id != self.local_node.id
    }

    /// A node sent us a query.
    ///
    /// Returns a ping for the oldest entry when the bucket is full and that
    /// entry has gone quiet, so a dead node can make room.
    pub fn on_inbound_query(&mut self, node: Node, now: Instant) -> Option<QueryRequest> {
        if !self.accepts(&node) {
            return None;
        }
        let index = self.table.bucket_index(&node.id);
        let bucket = &mut self.table.buckets[index];

        if let Some(pos) = bucket.position(&node.id) {
            bucket.entries[pos].last_seen = Some(now);
            return None;
        }
        if !bucket.is_full() {
            debug!("Adding {} to bucket {}", node, index);
            bucket.push_entry(RoutingEntry::verified(node, now));
            return None;
        }

        bucket.add_replacement(RoutingEntry::verified(node, now));
        let oldest = bucket.oldest_index()?;
        let entry = &mut bucket.entries[oldest];
        if entry.ping_pending || !entry.is_stale(now) {
            return None;
        }
        entry.ping_pending = true;
        Some(QueryRequest::ping(entry.node))
    }

    /// A node answered one of our queries
    pub fn on_response(&mut self, node: Node, rtt: Option<Duration>, extra_nodes: &[Node], now: Instant) {
        if self.accepts(&node) {
            let index = self.table.bucket_index(&node.id);
            let bucket = &mut self.table.buckets[index];
            bucket.last_refreshed = now;

            if let Some(pos) = bucket.position(&node.id) {
                let entry = &mut bucket.entries[pos];
                entry.node = node;
                entry.last_seen = Some(now);
                entry.consecutive_failures = 0;
                entry.rtt = rtt.or(entry.rtt);
                entry.ping_pending = false;
            } else {
                if let Some(pos) = bucket.replacement_position(&node.id) {
                    bucket.replacements.remove(pos);
                }
                let mut entry = RoutingEntry::verified(node, now);
                entry.rtt = rtt;
                if bucket.is_full() {
                    bucket.add_replacement(entry);
                } else {
                    debug!("Adding {} to bucket {}", node, index);
                    bucket.push_entry(entry);
                }
            }
        }

        for extra in extra_nodes {
            if !self.accepts(extra) {
                continue;
            }
            let index = self.table.bucket_index(&extra.id);
            let bucket = &mut self.table.buckets[index];
            if bucket.position(&extra.id).is_none() {
                bucket.add_replacement(RoutingEntry::candidate(*extra));
            }
        }
    }

    /// A query to `addr` timed out
    pub fn on_timeout(&mut self, addr: SocketAddrV4, id: Option<NodeId>) {
        let Some(id) = id.or_else(|| self.id_for_addr(addr)) else {
            return;
        };
        if id == self.local_node.id {
            return;
        }
        let index = self.table.bucket_index(&id);
        let bucket = &mut self.table.buckets[index];

        if let Some(pos) = bucket.position(&id) {
            let entry = &mut bucket.entries[pos];
            entry.ping_pending = false;
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            debug!("{} failed {} time(s) in a row", entry.node, entry.consecutive_failures);
            if entry.consecutive_failures >= MAX_FAILURES {
                let removed = bucket.entries.remove(pos);
                info!("Evicting {} from bucket {}", removed.node, index);
                if let Some(promoted) = bucket.take_best_replacement() {
                    debug!("Promoting {} into bucket {}", promoted.node, index);
                    bucket.push_entry(promoted);
                }
            }
        } else if let Some(pos) = bucket.replacement_position(&id) {
            bucket.replacements.remove(pos);
        }
    }

    /// A queried node answered with an error
    pub fn on_error(&mut self, addr: SocketAddrV4, id: Option<NodeId>) {
        self.on_timeout(addr, id);
    }

    fn id_for_addr(&self, addr: SocketAddrV4) -> Option<NodeId> {
        self.table
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().chain(b.replacements.iter()))
            .find(|e| e.node.addr == addr)
            .map(|e| e.node.id)
    }

    /// Run one maintenance pass
    pub fn do_maintenance(&mut self, now: Instant) -> Maintenance {
        if self.table.node_count() == 0 {
            return self.bootstrap();
        }
        if self.bootstrapping {
            // First nodes arrived: fill the table around our own id
            self.bootstrapping = false;
            info!("Bootstrap answered, {} node(s) known; looking up own id", self.table.node_count());
            return Maintenance {
                next_delay: BUSY_MAINTENANCE_DELAY,
                queries: Vec::new(),
                lookup: Some(self.local_node.id),
            };
        }

        let mut queries = self.verify_candidates();
        let mut lookup = None;

        let oldest = self
            .table
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .min_by_key(|(_, b)| b.last_refreshed)
            .map(|(i, _)| i);

        if let Some(index) = oldest {
            let bucket = &mut self.table.buckets[index];
            if now.saturating_duration_since(bucket.last_refreshed) >= BUCKET_REFRESH_INTERVAL {
                bucket.last_refreshed = now;
                let stale: Vec<&mut RoutingEntry> = bucket
                    .entries
                    .iter_mut()
                    .filter(|e| e.is_stale(now) && !e.ping_pending)
                    .take(MAINTENANCE_PING_BATCH)
                    .collect();
                if stale.is_empty() {
                    let target = self.local_node.id.random_in_bucket(index);
                    debug!("Refreshing bucket {} with a lookup for {}", index, target);
                    lookup = Some(target);
                } else {
                    debug!("Pinging {} stale node(s) in bucket {}", stale.len(), index);
                    for entry in stale {
                        entry.ping_pending = true;
                        queries.push(QueryRequest::ping(entry.node));
                    }
                }
            }
        }

        let next_delay = if !queries.is_empty() || lookup.is_some() {
            BUSY_MAINTENANCE_DELAY
        } else {
            self.next_refresh_delay(now)
        };
        Maintenance {
            next_delay,
            queries,
            lookup,
        }
    }

    fn bootstrap(&mut self) -> Maintenance {
        if self.bootstrap_addrs.is_empty() {
            return Maintenance {
                next_delay: MAX_MAINTENANCE_DELAY,
                ..Default::default()
            };
        }
        self.bootstrapping = true;
        debug!("Routing table empty, querying {} bootstrap node(s)", self.bootstrap_addrs.len());
        let target = self.local_node.id;
        let queries = self
            .bootstrap_addrs
            .iter()
            .map(|addr| QueryRequest::new(*addr, None, Query::FindNode { target }))
            .collect();
        Maintenance {
            next_delay: BOOTSTRAP_RETRY_DELAY,
            queries,
            lookup: None,
        }
    }

    /// Ping unverified candidates sitting in buckets that have room
    fn verify_candidates(&mut self) -> Vec<QueryRequest> {
        let mut queries = Vec::new();
        for bucket in self.table.buckets.iter_mut() {
            if bucket.is_full() {
                continue;
            }
            while let Some(pos) = bucket.replacements.iter().position(|e| e.last_seen.is_some()) {
                if bucket.is_full() {
                    break;
                }
                let promoted = bucket.replacements.remove(pos);
                bucket.push_entry(promoted);
            }
            for candidate in bucket.replacements.iter_mut().filter(|e| !e.ping_pending) {
                if queries.len() >= MAINTENANCE_PING_BATCH {
                    return queries;
                }
                candidate.ping_pending = true;
                queries.push(QueryRequest::ping(candidate.node));
            }
        }
        queries
    }

    fn next_refresh_delay(&self, now: Instant) -> Duration {
        let oldest = self
            .table
            .buckets
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.last_refreshed)
            .min();
        let delay = match oldest {
            Some(refreshed) => (refreshed + BUCKET_REFRESH_INTERVAL).saturating_duration_since(now),
            None => MAX_MAINTENANCE_DELAY,
        };
        delay.clamp(MIN_MAINTENANCE_DELAY, MAX_MAINTENANCE_DELAY)
    }

    /// Up to `k` nodes ordered by XOR distance to `target`, ties broken on id
    pub fn get_closest(&self, target: &NodeId, k: usize, include_self: bool) -> Vec<Node> {
        let mut nodes = self.table.get_nodes();
        if include_self {
            nodes.push(self.local_node);
        }
        nodes.sort_by(|a, b| {
            a.distance_to(target)
                .cmp(&b.distance_to(target))
                .then_with(|| a.id.cmp(&b.id))
        });
        nodes.truncate(k);
        nodes
    }

    /// Nodes persisted with the state file
    pub fn get_main_nodes(&self) -> Vec<Node> {
        self.table.get_nodes()
    }

    /// Local id and node addresses for the state file
    pub fn snapshot(&self) -> BootstrapState {
        BootstrapState {
            local_id: self.local_node.id,
            addrs: self.get_main_nodes().into_iter().map(|n| n.addr).collect(),
        }
    }
}
