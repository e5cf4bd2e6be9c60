//! Outstanding query tracking
//!
//! Allocates transaction ids, remembers what was asked of whom, and
//! matches responses (or timeouts) back to the pending query.

use crate::dht::lookup::LookupHandle;
use crate::dht::message::{OutgoingMessage, Query, QueryType};
use crate::dht::node::{Node, NodeId};
use crate::error::DhtError;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Transaction id length in bytes
pub const TID_LEN: usize = 2;

/// Attempts at finding a transaction id unused for a destination
pub const TID_ATTEMPTS: usize = 16;

/// Default time before an unanswered query counts as failed
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// A query someone wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub destination: SocketAddrV4,
    /// Id of the node behind `destination`, unknown for bootstrap routers
    pub expected_id: Option<NodeId>,
    pub query: Query,
    /// Lookup to notify when the query completes
    pub lookup: Option<LookupHandle>,
}

impl QueryRequest {
    pub fn new(destination: SocketAddrV4, expected_id: Option<NodeId>, query: Query) -> Self {
        Self {
            destination,
            expected_id,
            query,
            lookup: None,
        }
    }

    /// Liveness probe for a known node
    pub fn ping(node: Node) -> Self {
        Self::new(node.addr, Some(node.id), Query::Ping)
    }

    pub fn for_lookup(mut self, lookup: LookupHandle) -> Self {
        self.lookup = Some(lookup);
        self
    }
}

/// Identifies a registered query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(u64);

/// A query waiting for its response
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub id: QueryId,
    pub tid: Vec<u8>,
    pub query_type: QueryType,
    pub destination: SocketAddrV4,
    pub expected_id: Option<NodeId>,
    pub query: Query,
    pub lookup: Option<LookupHandle>,
    pub sent_at: Instant,
    pub deadline: Instant,
}

impl PendingQuery {
    /// Round-trip time if the response arrives at `now`
    pub fn rtt(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.sent_at)
    }
}

/// Tracks outstanding queries.
///
/// Responses are matched on their source address and the first byte of
/// the transaction id; when several queries share both, the oldest wins.
#[derive(Debug)]
pub struct Querier {
    pending: HashMap<(SocketAddrV4, u8), Vec<PendingQuery>>,
    timeout: Duration,
    next_id: u64,
    count: usize,
}

impl Querier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            next_id: 0,
            count: 0,
        }
    }

    /// Number of outstanding queries
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn tid_in_use(&self, destination: SocketAddrV4, tid: &[u8; TID_LEN]) -> bool {
        self.pending
            .get(&(destination, tid[0]))
            .map_or(false, |queries| queries.iter().any(|q| q.tid == tid))
    }

    /// Allocate a transaction id, record the query and return the datagram to send
    pub fn register(
        &mut self,
        request: QueryRequest,
        message: &OutgoingMessage,
        now: Instant,
    ) -> Result<(Vec<u8>, QueryId), DhtError> {
        let query_type = message
            .query_type()
            .ok_or_else(|| DhtError::message_error("only queries can be registered"))?;

        let tid = (0..TID_ATTEMPTS)
            .map(|_| rand::random::<[u8; TID_LEN]>())
            .find(|tid| !self.tid_in_use(request.destination, tid))
            .ok_or_else(|| DhtError::tid_exhausted(request.destination.to_string()))?;

        let datagram = message.encode(&tid);
        trace!("Registered {} to {} (tid {})", query_type, request.destination, hex::encode(tid));
        let id = self.insert(request, tid, query_type, now);
        Ok((datagram, id))
    }

    fn insert(&mut self, request: QueryRequest, tid: [u8; TID_LEN], query_type: QueryType, now: Instant) -> QueryId {
        let id = QueryId(self.next_id);
        self.next_id += 1;
        self.pending
            .entry((request.destination, tid[0]))
            .or_default()
            .push(PendingQuery {
                id,
                tid: tid.to_vec(),
                query_type,
                destination: request.destination,
                expected_id: request.expected_id,
                query: request.query,
                lookup: request.lookup,
                sent_at: now,
                deadline: now + self.timeout,
            });
        self.count += 1;
        id
    }

    /// Mark every transaction id towards `destination` as in use
    #[cfg(test)]
    pub(crate) fn occupy_all_tids(&mut self, destination: SocketAddrV4, now: Instant) {
        for tid in 0..=u16::MAX {
            let request = QueryRequest::new(destination, None, Query::Ping);
            self.insert(request, tid.to_be_bytes(), QueryType::Ping, now);
        }
    }

    /// Take the oldest query to `source` whose tid starts with `tid[0]`
    pub fn match_response(&mut self, tid: &[u8], source: SocketAddrV4) -> Option<PendingQuery> {
        let key = (source, *tid.first()?);
        let queries = self.pending.get_mut(&key)?;
        let oldest = queries
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| (q.sent_at, q.id))
            .map(|(i, _)| i)?;
        let query = queries.remove(oldest);
        if queries.is_empty() {
            self.pending.remove(&key);
        }
        self.count -= 1;
        Some(query)
    }

    /// Remove and return every query whose deadline has passed, oldest first
    pub fn collect_timeouts(&mut self, now: Instant) -> Vec<PendingQuery> {
        let mut expired = Vec::new();
        self.pending.retain(|_, queries| {
            let (gone, kept): (Vec<_>, Vec<_>) = queries.drain(..).partition(|q| q.deadline <= now);
            expired.extend(gone);
            *queries = kept;
            !queries.is_empty()
        });
        self.count -= expired.len();
        expired.sort_by_key(|q| q.id);
        if !expired.is_empty() {
            debug!("{} quer(ies) timed out", expired.len());
        }
        expired
    }

    /// Earliest deadline among outstanding queries
    pub fn next_timeout(&self) -> Option<Instant> {
        self.pending.values().flatten().map(|q| q.deadline).min()
    }
}
