//! Iterative lookups
//!
//! get_peers and find_node lookups share one state machine:
//! `Init -> Probing -> Terminating -> Done`. The engine never sends
//! anything itself; every operation returns the queries to register and
//! the events to deliver.

use crate::dht::message::{Query, Response};
use crate::dht::node::{Node, NodeId};
use crate::dht::querier::QueryRequest;
use crate::dht::routing::{RoutingManager, K};
use crate::error::DhtError;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Queries in flight per lookup
pub const ALPHA: usize = 3;

/// Default time a lookup may go without progress
pub const PENDING_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before retrying a lookup that found no nodes to start from
pub const INIT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Caller-chosen lookup identifier, echoed in every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupId(pub u64);

impl fmt::Display for LookupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Engine-assigned key of a running lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupHandle(u64);

/// Progress reported to whoever started a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupEvent {
    /// A batch of peers as received; `from` is `None` for cached results
    Peers {
        lookup_id: LookupId,
        peers: Vec<SocketAddrV4>,
        from: Option<Node>,
    },
    /// The lookup finished; delivered exactly once
    Done {
        lookup_id: LookupId,
        from: Option<Node>,
    },
}

impl LookupEvent {
    pub fn lookup_id(&self) -> LookupId {
        match self {
            LookupEvent::Peers { lookup_id, .. } | LookupEvent::Done { lookup_id, .. } => *lookup_id,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, LookupEvent::Done { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    GetPeers,
    FindNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    Init,
    Probing,
    Terminating,
    Done,
}

/// Everything a lookup operation asks the caller to do
#[derive(Debug, Default)]
pub struct LookupOutput {
    pub queries: Vec<QueryRequest>,
    pub events: Vec<(LookupHandle, LookupEvent)>,
    /// `(info_hash, port)` pairs to record in the local peer store
    pub self_announces: Vec<(NodeId, u16)>,
}

impl LookupOutput {
    pub fn append(&mut self, mut other: LookupOutput) {
        self.queries.append(&mut other.queries);
        self.events.append(&mut other.events);
        self.self_announces.append(&mut other.self_announces);
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.events.is_empty() && self.self_announces.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CandidateStatus {
    Fresh,
    InFlight,
    Responded { token: Option<Vec<u8>> },
}

#[derive(Debug, Clone)]
struct Candidate {
    node: Node,
    distance: NodeId,
    status: CandidateStatus,
}

#[derive(Debug)]
struct Lookup {
    handle: LookupHandle,
    lookup_id: LookupId,
    kind: LookupKind,
    target: NodeId,
    state: LookupState,
    /// Ordered by distance to target, then id; at most K entries
    shortlist: Vec<Candidate>,
    /// Every address this lookup has sent a query to
    queried: HashSet<SocketAddrV4>,
    in_flight: usize,
    peers_found: HashSet<SocketAddrV4>,
    bt_port: Option<u16>,
    started_at: Instant,
    last_progress: Instant,
    retry_at: Option<Instant>,
    last_responder: Option<Node>,
}

impl Lookup {
    fn query(&self) -> Query {
        match self.kind {
            LookupKind::GetPeers => Query::GetPeers {
                info_hash: self.target,
            },
            LookupKind::FindNode => Query::FindNode { target: self.target },
        }
    }

    fn insert_candidate(&mut self, node: Node, local_id: &NodeId) {
        if node.id == *local_id || !node.is_valid() || self.queried.contains(&node.addr) {
            return;
        }
        if self
            .shortlist
            .iter()
            .any(|c| c.node.id == node.id || c.node.addr == node.addr)
        {
            return;
        }
        let candidate = Candidate {
            node,
            distance: node.distance_to(&self.target),
            status: CandidateStatus::Fresh,
        };
        let pos = self
            .shortlist
            .iter()
            .position(|c| (candidate.distance, candidate.node.id) < (c.distance, c.node.id))
            .unwrap_or(self.shortlist.len());
        self.shortlist.insert(pos, candidate);
        self.shortlist.truncate(K);
    }

    fn seed(&mut self, routing: &RoutingManager, local_id: &NodeId) -> bool {
        for node in routing.get_closest(&self.target, ALPHA, false) {
            self.insert_candidate(node, local_id);
        }
        !self.shortlist.is_empty()
    }

    /// Keep ALPHA queries in flight, closest fresh candidates first
    fn fill(&mut self, out: &mut LookupOutput) {
        while self.in_flight < ALPHA {
            let Some(candidate) = self
                .shortlist
                .iter_mut()
                .find(|c| c.status == CandidateStatus::Fresh)
            else {
                break;
            };
            candidate.status = CandidateStatus::InFlight;
            let node = candidate.node;
            self.queried.insert(node.addr);
            self.in_flight += 1;
            out.queries
                .push(QueryRequest::new(node.addr, Some(node.id), self.query()).for_lookup(self.handle));
        }
    }

    /// The ALPHA closest candidates answered, or nothing is left to ask
    fn is_settled(&self) -> bool {
        let closest_answered = !self.shortlist.is_empty()
            && self
                .shortlist
                .iter()
                .take(ALPHA)
                .all(|c| matches!(c.status, CandidateStatus::Responded { .. }));
        let exhausted = self.in_flight == 0 && !self.shortlist.iter().any(|c| c.status == CandidateStatus::Fresh);
        closest_answered || exhausted
    }

    fn step(&mut self, out: &mut LookupOutput) {
        self.fill(out);
        if self.is_settled() {
            self.terminate(out);
        }
    }

    fn terminate(&mut self, out: &mut LookupOutput) {
        self.state = LookupState::Terminating;
        if let (LookupKind::GetPeers, Some(port)) = (self.kind, self.bt_port) {
            let mut announced = 0;
            for candidate in self.shortlist.iter().take(K) {
                if let CandidateStatus::Responded { token: Some(token) } = &candidate.status {
                    let query = Query::AnnouncePeer {
                        info_hash: self.target,
                        port,
                        token: token.clone(),
                        implied_port: false,
                    };
                    out.queries
                        .push(QueryRequest::new(candidate.node.addr, Some(candidate.node.id), query));
                    announced += 1;
                }
            }
            debug!("Lookup {} announcing port {} to {} node(s)", self.lookup_id, port, announced);
            out.self_announces.push((self.target, port));
        }
        self.finish(out);
    }

    fn finish(&mut self, out: &mut LookupOutput) {
        self.state = LookupState::Done;
        info!(
            "Lookup {} for {} done: {} peer(s), {} node(s) queried",
            self.lookup_id,
            self.target,
            self.peers_found.len(),
            self.queried.len()
        );
        out.events.push((
            self.handle,
            LookupEvent::Done {
                lookup_id: self.lookup_id,
                from: self.last_responder,
            },
        ));
    }

    fn deadline(&self, lookup_timeout: Duration) -> Instant {
        match (self.state, self.retry_at) {
            (LookupState::Init, Some(retry_at)) => retry_at.min(self.started_at + lookup_timeout),
            _ => self.last_progress + lookup_timeout,
        }
    }
}

/// Runs all active lookups
#[derive(Debug)]
pub struct LookupEngine {
    local_id: NodeId,
    lookups: HashMap<LookupHandle, Lookup>,
    next_handle: u64,
    lookup_timeout: Duration,
}

impl LookupEngine {
    pub fn new(local_id: NodeId, lookup_timeout: Duration) -> Self {
        Self {
            local_id,
            lookups: HashMap::new(),
            next_handle: 0,
            lookup_timeout,
        }
    }

    /// Number of active lookups
    pub fn len(&self) -> usize {
        self.lookups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookups.is_empty()
    }

    pub fn contains(&self, handle: LookupHandle) -> bool {
        self.lookups.contains_key(&handle)
    }

    pub fn state(&self, handle: LookupHandle) -> Option<LookupState> {
        self.lookups.get(&handle).map(|l| l.state)
    }

    /// Start a get_peers lookup; with `bt_port` set it ends by announcing
    pub fn start_get_peers(
        &mut self,
        lookup_id: LookupId,
        info_hash: NodeId,
        bt_port: Option<u16>,
        routing: &RoutingManager,
        now: Instant,
    ) -> (LookupHandle, LookupOutput) {
        self.start(lookup_id, LookupKind::GetPeers, info_hash, bt_port, routing, now)
    }

    pub fn start_find_node(
        &mut self,
        lookup_id: LookupId,
        target: NodeId,
        routing: &RoutingManager,
        now: Instant,
    ) -> (LookupHandle, LookupOutput) {
        self.start(lookup_id, LookupKind::FindNode, target, None, routing, now)
    }

    fn start(
        &mut self,
        lookup_id: LookupId,
        kind: LookupKind,
        target: NodeId,
        bt_port: Option<u16>,
        routing: &RoutingManager,
        now: Instant,
    ) -> (LookupHandle, LookupOutput) {
        let handle = LookupHandle(self.next_handle);
        self.next_handle += 1;

        let mut lookup = Lookup {
            handle,
            lookup_id,
            kind,
            target,
            state: LookupState::Init,
            shortlist: Vec::with_capacity(K),
            queried: HashSet::new(),
            in_flight: 0,
            peers_found: HashSet::new(),
            bt_port,
            started_at: now,
            last_progress: now,
            retry_at: None,
            last_responder: None,
        };
        info!("Starting {:?} lookup {} for {}", kind, lookup_id, target);

        let mut out = LookupOutput::default();
        if lookup.seed(routing, &self.local_id) {
            lookup.state = LookupState::Probing;
            lookup.step(&mut out);
        } else {
            debug!("Lookup {} has no nodes to start from, retrying", lookup_id);
            lookup.retry_at = Some(now + INIT_RETRY_DELAY);
        }
        self.keep_unless_done(lookup);
        (handle, out)
    }

    fn keep_unless_done(&mut self, lookup: Lookup) {
        if lookup.state != LookupState::Done {
            self.lookups.insert(lookup.handle, lookup);
        }
    }

    /// `from` answered a query sent for `handle`.
    ///
    /// `from` carries the address the response came from; its id may differ
    /// from the one the query was addressed to.
    pub fn on_response(&mut self, handle: LookupHandle, from: Node, response: &Response, now: Instant) -> LookupOutput {
        let mut out = LookupOutput::default();
        let Some(mut lookup) = self.lookups.remove(&handle) else {
            return out;
        };
        lookup.in_flight = lookup.in_flight.saturating_sub(1);
        lookup.last_progress = now;
        lookup.last_responder = Some(from);

        let token = match response {
            Response::GetPeers { token, .. } => token.clone(),
            _ => None,
        };
        match lookup.shortlist.iter_mut().find(|c| c.node.addr == from.addr) {
            Some(candidate) => {
                if candidate.node.id != from.id {
                    debug!("Lookup {}: {} answered as {}", lookup.lookup_id, candidate.node, from.id);
                }
                candidate.status = CandidateStatus::Responded { token };
            }
            None => debug!("Lookup {}: response from {} outside the shortlist", lookup.lookup_id, from),
        }

        if let (LookupKind::GetPeers, Response::GetPeers { peers, .. }) = (lookup.kind, response) {
            if !peers.is_empty() {
                lookup.peers_found.extend(peers.iter().copied());
                out.events.push((
                    handle,
                    LookupEvent::Peers {
                        lookup_id: lookup.lookup_id,
                        peers: peers.clone(),
                        from: Some(from),
                    },
                ));
            }
        }
        for node in response.nodes() {
            lookup.insert_candidate(*node, &self.local_id);
        }

        lookup.step(&mut out);
        self.keep_unless_done(lookup);
        out
    }

    /// The query to `addr` for `handle` timed out, failed or could not be sent
    pub fn on_timeout(&mut self, handle: LookupHandle, addr: SocketAddrV4) -> LookupOutput {
        let mut out = LookupOutput::default();
        let Some(mut lookup) = self.lookups.remove(&handle) else {
            return out;
        };
        lookup.in_flight = lookup.in_flight.saturating_sub(1);
        lookup.queried.insert(addr);
        lookup.shortlist.retain(|c| c.node.addr != addr);
        debug!("Lookup {}: no answer from {}", lookup.lookup_id, addr);

        lookup.step(&mut out);
        self.keep_unless_done(lookup);
        out
    }

    /// Retry lookups waiting for nodes and end the ones that stalled
    pub fn poll(&mut self, routing: &RoutingManager, now: Instant) -> LookupOutput {
        let mut out = LookupOutput::default();
        let handles: Vec<LookupHandle> = self.lookups.keys().copied().collect();
        for handle in handles {
            let Some(mut lookup) = self.lookups.remove(&handle) else {
                continue;
            };
            let mut step = LookupOutput::default();
            match lookup.state {
                LookupState::Init if lookup.retry_at.map_or(false, |at| at <= now) => {
                    if lookup.seed(routing, &self.local_id) {
                        lookup.state = LookupState::Probing;
                        lookup.retry_at = None;
                        lookup.step(&mut step);
                    } else if now.saturating_duration_since(lookup.started_at) >= self.lookup_timeout {
                        debug!("{}: no nodes to start from", DhtError::lookup_timeout(lookup.lookup_id.0));
                        lookup.finish(&mut step);
                    } else {
                        lookup.retry_at = Some(now + INIT_RETRY_DELAY);
                    }
                }
                LookupState::Probing if now.saturating_duration_since(lookup.last_progress) >= self.lookup_timeout => {
                    debug!("{}: no progress, terminating", DhtError::lookup_timeout(lookup.lookup_id.0));
                    lookup.terminate(&mut step);
                }
                _ => {}
            }
            out.append(step);
            self.keep_unless_done(lookup);
        }
        out
    }

    /// End every lookup, one `Done` each, without announcing
    pub fn cancel_all(&mut self) -> Vec<(LookupHandle, LookupEvent)> {
        let mut out = LookupOutput::default();
        let mut lookups: Vec<Lookup> = self.lookups.drain().map(|(_, l)| l).collect();
        lookups.sort_by_key(|l| l.handle);
        for mut lookup in lookups {
            lookup.finish(&mut out);
        }
        out.events
    }

    /// Earliest time `poll` has something to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lookups.values().map(|l| l.deadline(self.lookup_timeout)).min()
    }
}
