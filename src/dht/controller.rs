//! DHT controller
//!
//! Glue between the components. The controller never performs network
//! I/O: every entry point returns the datagrams to send and the time at
//! which `main_loop` wants to run next.

use crate::dht::bencode;
use crate::dht::bootstrap::BootstrapState;
use crate::dht::cache::{PeerCache, CACHE_VALID_PERIOD};
use crate::dht::lookup::{LookupEngine, LookupEvent, LookupHandle, LookupId, LookupOutput, PENDING_LOOKUP_TIMEOUT};
use crate::dht::message::{
    interpret_response, Body, IncomingMessage, MessageFactory, Query, MAX_TID_LEN, PROTOCOL_ERROR, PROTOCOL_ERROR_MSG,
};
use crate::dht::node::{Node, NodeId};
use crate::dht::querier::{PendingQuery, Querier, QueryRequest, QUERY_TIMEOUT};
use crate::dht::responder::{Responder, MAX_VALUES, PEER_ANNOUNCE_LIFETIME};
use crate::dht::routing::RoutingManager;
use crate::dht::token::{TokenManager, TOKEN_ROTATION_INTERVAL};
use crate::error::DhtError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Receives the events of one lookup
pub type LookupCallback = Box<dyn FnMut(LookupEvent) + Send>;

/// How often the routing table is written to the state file
pub const SAVE_STATE_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest delay `main_loop` ever asks for
pub const MIN_TICK: Duration = Duration::from_secs(1);

/// Lookup id used for lookups the controller starts on its own
const MAINTENANCE_LOOKUP_ID: LookupId = LookupId(u64::MAX);

/// Tunable timings and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    pub query_timeout_ms: u64,
    pub lookup_timeout_secs: u64,
    pub save_state_interval_secs: u64,
    pub cache_valid_secs: u64,
    pub max_values: usize,
    pub peer_ttl_secs: u64,
    pub token_rotation_secs: u64,
    pub min_tick_ms: u64,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            query_timeout_ms: QUERY_TIMEOUT.as_millis() as u64,
            lookup_timeout_secs: PENDING_LOOKUP_TIMEOUT.as_secs(),
            save_state_interval_secs: SAVE_STATE_INTERVAL.as_secs(),
            cache_valid_secs: CACHE_VALID_PERIOD.as_secs(),
            max_values: MAX_VALUES,
            peer_ttl_secs: PEER_ANNOUNCE_LIFETIME.as_secs(),
            token_rotation_secs: TOKEN_ROTATION_INTERVAL.as_secs(),
            min_tick_ms: MIN_TICK.as_millis() as u64,
        }
    }
}

impl DhtSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn save_state_interval(&self) -> Duration {
        Duration::from_secs(self.save_state_interval_secs)
    }

    pub fn cache_valid_period(&self) -> Duration {
        Duration::from_secs(self.cache_valid_secs)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }

    pub fn token_rotation(&self) -> Duration {
        Duration::from_secs(self.token_rotation_secs)
    }

    pub fn min_tick(&self) -> Duration {
        Duration::from_millis(self.min_tick_ms)
    }
}

/// A datagram to hand to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub addr: SocketAddrV4,
}

struct Subscription {
    target: NodeId,
    callback: Option<LookupCallback>,
}

/// Single-threaded DHT core
pub struct Controller {
    settings: DhtSettings,
    local_addr: SocketAddrV4,
    state_path: Option<PathBuf>,
    private_label: Option<Vec<u8>>,
    factory: MessageFactory,
    routing: RoutingManager,
    querier: Querier,
    lookups: LookupEngine,
    responder: Responder,
    cache: PeerCache,
    subscriptions: HashMap<LookupHandle, Subscription>,
    next_maintenance: Instant,
    next_save_state: Option<Instant>,
    shut_down: bool,
}

impl Controller {
    /// Create a controller with default settings, restoring the state file if present
    pub fn new(
        local_addr: SocketAddrV4,
        state_path: Option<PathBuf>,
        bootstrap_mode: bool,
        private_label: Option<Vec<u8>>,
    ) -> Self {
        Self::with_settings(local_addr, state_path, bootstrap_mode, private_label, DhtSettings::default())
    }

    pub fn with_settings(
        local_addr: SocketAddrV4,
        state_path: Option<PathBuf>,
        bootstrap_mode: bool,
        private_label: Option<Vec<u8>>,
        settings: DhtSettings,
    ) -> Self {
        let saved = state_path.as_deref().and_then(|path| match BootstrapState::load(path) {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring state file: {}", e);
                None
            }
        });
        let local_id = saved.as_ref().map_or_else(NodeId::random, |s| s.local_id);

        let mut controller = Self::with_identity(
            local_id,
            local_addr,
            state_path,
            bootstrap_mode,
            private_label,
            settings,
            Instant::now(),
        );
        if let Some(saved) = saved {
            info!("Restored id {} and {} node address(es)", saved.local_id, saved.addrs.len());
            controller.routing.add_bootstrap_addrs(saved.addrs);
        }
        controller
    }

    /// Create a controller with a fixed id, ignoring any saved state
    pub fn with_identity(
        local_id: NodeId,
        local_addr: SocketAddrV4,
        state_path: Option<PathBuf>,
        bootstrap_mode: bool,
        private_label: Option<Vec<u8>>,
        settings: DhtSettings,
        now: Instant,
    ) -> Self {
        let factory = MessageFactory::new(local_id, private_label.clone());
        let responder = Responder::new(
            factory.clone(),
            TokenManager::new(settings.token_rotation(), now),
            settings.peer_ttl(),
            settings.max_values,
            bootstrap_mode,
        );
        let next_save_state = state_path.as_ref().map(|_| now + settings.save_state_interval());
        info!("DHT node {} on {}", local_id, local_addr);

        Self {
            local_addr,
            state_path,
            private_label,
            routing: RoutingManager::new(Node::new(local_id, local_addr), now),
            querier: Querier::new(settings.query_timeout()),
            lookups: LookupEngine::new(local_id, settings.lookup_timeout()),
            responder,
            cache: PeerCache::new(settings.cache_valid_period()),
            factory,
            subscriptions: HashMap::new(),
            next_maintenance: now,
            next_save_state,
            shut_down: false,
            settings,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.factory.local_id()
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn settings(&self) -> &DhtSettings {
        &self.settings
    }

    pub fn routing(&self) -> &RoutingManager {
        &self.routing
    }

    pub fn peer_cache(&self) -> &PeerCache {
        &self.cache
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// Number of queries awaiting an answer
    pub fn pending_queries(&self) -> usize {
        self.querier.len()
    }

    pub fn active_lookups(&self) -> usize {
        self.lookups.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Addresses to contact while the routing table is empty
    pub fn add_bootstrap_addrs(&mut self, addrs: impl IntoIterator<Item = SocketAddrV4>) {
        self.routing.add_bootstrap_addrs(addrs);
    }

    /// Look up peers for `info_hash`.
    ///
    /// With `use_cache` and a cache hit the callback runs right away and no
    /// datagram is produced. With `bt_port` the lookup ends by announcing
    /// that port.
    pub fn get_peers(
        &mut self,
        lookup_id: LookupId,
        info_hash: NodeId,
        callback: LookupCallback,
        bt_port: Option<u16>,
        use_cache: bool,
    ) -> Vec<Datagram> {
        self.get_peers_at(lookup_id, info_hash, callback, bt_port, use_cache, Instant::now())
    }

    pub fn get_peers_at(
        &mut self,
        lookup_id: LookupId,
        info_hash: NodeId,
        mut callback: LookupCallback,
        bt_port: Option<u16>,
        use_cache: bool,
        now: Instant,
    ) -> Vec<Datagram> {
        if self.shut_down {
            callback(LookupEvent::Done { lookup_id, from: None });
            return Vec::new();
        }
        if use_cache {
            if let Some(peers) = self.cache.get(&info_hash, now) {
                debug!("Lookup {} served {} cached peer(s)", lookup_id, peers.len());
                callback(LookupEvent::Peers {
                    lookup_id,
                    peers,
                    from: None,
                });
                callback(LookupEvent::Done { lookup_id, from: None });
                return Vec::new();
            }
        }

        let (handle, output) = self
            .lookups
            .start_get_peers(lookup_id, info_hash, bt_port, &self.routing, now);
        self.subscriptions.insert(
            handle,
            Subscription {
                target: info_hash,
                callback: Some(callback),
            },
        );
        let mut datagrams = Vec::new();
        self.run(output, now, &mut datagrams);
        datagrams
    }

    /// Look up the nodes closest to `target`
    pub fn find_node(&mut self, lookup_id: LookupId, target: NodeId, callback: LookupCallback) -> Vec<Datagram> {
        self.find_node_at(lookup_id, target, callback, Instant::now())
    }

    pub fn find_node_at(
        &mut self,
        lookup_id: LookupId,
        target: NodeId,
        mut callback: LookupCallback,
        now: Instant,
    ) -> Vec<Datagram> {
        if self.shut_down {
            callback(LookupEvent::Done { lookup_id, from: None });
            return Vec::new();
        }
        let mut datagrams = Vec::new();
        self.start_find_node(lookup_id, target, Some(callback), now, &mut datagrams);
        datagrams
    }

    fn start_find_node(
        &mut self,
        lookup_id: LookupId,
        target: NodeId,
        callback: Option<LookupCallback>,
        now: Instant,
        datagrams: &mut Vec<Datagram>,
    ) {
        let (handle, output) = self.lookups.start_find_node(lookup_id, target, &self.routing, now);
        self.subscriptions.insert(handle, Subscription { target, callback });
        self.run(output, now, datagrams);
    }

    /// Ping an address, adding the node behind it once it answers
    pub fn ping(&mut self, addr: SocketAddrV4) -> Vec<Datagram> {
        self.ping_at(addr, Instant::now())
    }

    pub fn ping_at(&mut self, addr: SocketAddrV4, now: Instant) -> Vec<Datagram> {
        let mut datagrams = Vec::new();
        if !self.shut_down {
            let output = LookupOutput {
                queries: vec![QueryRequest::new(addr, None, Query::Ping)],
                ..Default::default()
            };
            self.run(output, now, &mut datagrams);
        }
        datagrams
    }

    /// Feed one received datagram
    pub fn on_datagram_received(&mut self, data: &[u8], source: SocketAddr) -> (Instant, Vec<Datagram>) {
        self.on_datagram_received_at(data, source, Instant::now())
    }

    pub fn on_datagram_received_at(
        &mut self,
        data: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> (Instant, Vec<Datagram>) {
        let mut datagrams = Vec::new();
        if self.shut_down {
            return (now + self.settings.min_tick(), datagrams);
        }
        let source = match source {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().map(|ip| SocketAddrV4::new(ip, v6.port())),
        };
        match source {
            Some(source) if source.port() != 0 => self.handle_datagram(data, source, now, &mut datagrams),
            _ => debug!("Dropping datagram from unsupported source"),
        }
        (self.next_tick_at(now), datagrams)
    }

    fn handle_datagram(&mut self, data: &[u8], source: SocketAddrV4, now: Instant, datagrams: &mut Vec<Datagram>) {
        let message = match IncomingMessage::decode(data, self.private_label.as_deref()) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", source, e);
                if matches!(e, DhtError::MessageError { .. }) {
                    datagrams.extend(self.protocol_error_reply(data, source));
                }
                return;
            }
        };

        match &message.body {
            Body::Query { query, .. } => {
                trace!("{:?} from {}", query.query_type(), source);
                let reply = self.responder.handle_query(source, query, &self.routing, now);
                datagrams.push(Datagram {
                    data: reply.encode(&message.tid),
                    addr: source,
                });
                if let Some(sender) = message.sender(source) {
                    if let Some(ping) = self.routing.on_inbound_query(sender, now) {
                        let output = LookupOutput {
                            queries: vec![ping],
                            ..Default::default()
                        };
                        self.run(output, now, datagrams);
                    }
                }
            }
            Body::Response { fields, .. } => {
                let Some(pending) = self.querier.match_response(&message.tid, source) else {
                    debug!("Dropping unsolicited response from {}", source);
                    return;
                };
                let Some(sender) = message.sender(source) else {
                    return;
                };
                match interpret_response(pending.query_type, fields) {
                    Ok(response) => {
                        if pending.expected_id.map_or(false, |id| id != sender.id) {
                            debug!("{} answered from {} with a different id", source, sender.id);
                        }
                        self.routing
                            .on_response(sender, Some(pending.rtt(now)), response.nodes(), now);
                        if let Some(handle) = pending.lookup {
                            let output = self.lookups.on_response(handle, sender, &response, now);
                            self.run(output, now, datagrams);
                        }
                    }
                    Err(e) => {
                        debug!("Bad {} response from {}: {}", pending.query_type, source, e);
                        self.query_failed(pending, now, datagrams);
                    }
                }
            }
            Body::Error { code, message: text } => {
                let Some(pending) = self.querier.match_response(&message.tid, source) else {
                    debug!("Dropping unsolicited error from {}", source);
                    return;
                };
                debug!(
                    "{} answered {} with error {} ({})",
                    source,
                    pending.query_type,
                    code,
                    String::from_utf8_lossy(text)
                );
                self.query_failed(pending, now, datagrams);
            }
        }
    }

    /// Error or unusable answer: counts as a timeout for the node
    fn query_failed(&mut self, pending: PendingQuery, now: Instant, datagrams: &mut Vec<Datagram>) {
        self.routing.on_error(pending.destination, pending.expected_id);
        if let Some(handle) = pending.lookup {
            let output = self.lookups.on_timeout(handle, pending.destination);
            self.run(output, now, datagrams);
        }
    }

    /// A 203 reply for a query we could not make sense of, when it has a usable tid
    fn protocol_error_reply(&self, data: &[u8], source: SocketAddrV4) -> Option<Datagram> {
        let value = bencode::decode(data).ok()?;
        let dict = value.as_dict()?;
        if dict.get(b"y".as_slice())?.as_bytes()? != b"q" {
            return None;
        }
        if let Some(label) = &self.private_label {
            if dict.get(b"d".as_slice()).and_then(|v| v.as_bytes()) != Some(label.as_slice()) {
                return None;
            }
        }
        let tid = dict
            .get(b"t".as_slice())?
            .as_bytes()
            .filter(|t| (1..=MAX_TID_LEN).contains(&t.len()))?;
        Some(Datagram {
            data: self.factory.error(PROTOCOL_ERROR, PROTOCOL_ERROR_MSG).encode(tid),
            addr: source,
        })
    }

    /// Periodic work: timeouts, lookup retries, maintenance and state saving
    pub fn main_loop(&mut self) -> (Instant, Vec<Datagram>) {
        self.main_loop_at(Instant::now())
    }

    pub fn main_loop_at(&mut self, now: Instant) -> (Instant, Vec<Datagram>) {
        let mut datagrams = Vec::new();
        if self.shut_down {
            return (now + self.settings.min_tick(), datagrams);
        }

        let mut output = LookupOutput::default();
        for pending in self.querier.collect_timeouts(now) {
            trace!("{} to {} timed out", pending.query_type, pending.destination);
            self.routing.on_timeout(pending.destination, pending.expected_id);
            if let Some(handle) = pending.lookup {
                output.append(self.lookups.on_timeout(handle, pending.destination));
            }
        }
        output.append(self.lookups.poll(&self.routing, now));

        let mut refresh_target = None;
        if now >= self.next_maintenance {
            let maintenance = self.routing.do_maintenance(now);
            self.next_maintenance = now + maintenance.next_delay;
            output.queries.extend(maintenance.queries);
            refresh_target = maintenance.lookup;
            self.responder.sweep(now);
            self.cache.sweep(now);
        }
        self.run(output, now, &mut datagrams);
        if let Some(target) = refresh_target {
            self.start_find_node(MAINTENANCE_LOOKUP_ID, target, None, now, &mut datagrams);
        }

        if let Some(due) = self.next_save_state {
            if now >= due {
                self.save_state();
                self.next_save_state = Some(now + self.settings.save_state_interval());
            }
        }
        (self.next_tick_at(now), datagrams)
    }

    /// Persist state and end every lookup; the controller is inert afterwards
    pub fn shutdown(&mut self) -> Vec<Datagram> {
        self.shutdown_at(Instant::now())
    }

    pub fn shutdown_at(&mut self, now: Instant) -> Vec<Datagram> {
        if self.shut_down {
            return Vec::new();
        }
        info!("Shutting down DHT node {}", self.local_id());
        let output = LookupOutput {
            events: self.lookups.cancel_all(),
            ..Default::default()
        };
        let mut datagrams = Vec::new();
        self.run(output, now, &mut datagrams);
        self.save_state();
        self.shut_down = true;
        datagrams
    }

    fn save_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let mut state = self.routing.snapshot();
        if state.addrs.is_empty() {
            state.addrs = self.routing.bootstrap_addrs().to_vec();
        }
        if let Err(e) = state.save(path) {
            warn!("Failed to save DHT state: {}", e);
        }
    }

    /// When [`Controller::main_loop`] should next run
    pub fn next_tick(&self) -> Instant {
        self.next_tick_at(Instant::now())
    }

    pub fn next_tick_at(&self, now: Instant) -> Instant {
        let earliest = [
            self.querier.next_timeout(),
            Some(self.next_maintenance),
            self.next_save_state,
            self.lookups.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(now);
        earliest.max(now + self.settings.min_tick())
    }

    /// Deliver events and send queries until nothing new comes out
    fn run(&mut self, mut output: LookupOutput, now: Instant, datagrams: &mut Vec<Datagram>) {
        loop {
            for (info_hash, port) in output.self_announces.drain(..) {
                if self.local_addr.ip().is_unspecified() {
                    debug!("Not recording own announce for {}: local address unknown", info_hash);
                } else {
                    self.responder
                        .store_peer(info_hash, SocketAddrV4::new(*self.local_addr.ip(), port), now);
                }
            }
            for (handle, event) in output.events.drain(..) {
                self.deliver(handle, event, now);
            }

            let mut next = LookupOutput::default();
            for request in output.queries.drain(..) {
                let (lookup, destination) = (request.lookup, request.destination);
                let message = self.factory.query(&request.query);
                match self.querier.register(request, &message, now) {
                    Ok((data, _)) => datagrams.push(Datagram {
                        data,
                        addr: destination,
                    }),
                    Err(e) => {
                        debug!("Not sending to {}: {}", destination, e);
                        if let Some(handle) = lookup {
                            next.append(self.lookups.on_timeout(handle, destination));
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            output = next;
        }
    }

    fn deliver(&mut self, handle: LookupHandle, event: LookupEvent, now: Instant) {
        let done = event.is_done();
        if let Some(subscription) = self.subscriptions.get_mut(&handle) {
            if let LookupEvent::Peers { peers, .. } = &event {
                self.cache.put(subscription.target, peers, now);
            }
            if let Some(callback) = subscription.callback.as_mut() {
                callback(event);
            }
        }
        if done {
            self.subscriptions.remove(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::message::{GetPeersReply, OutgoingMessage, QueryType, CLIENT_VERSION};
    use std::sync::{Arc, Mutex};

    const C_ADDR: &str = "10.0.0.1:6881";
    const S_ADDR: &str = "10.0.0.2:6881";

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn controller(id: u8, address: &str, now: Instant) -> Controller {
        Controller::with_identity(
            NodeId::new([id; 20]),
            addr(address),
            None,
            false,
            None,
            DhtSettings::default(),
            now,
        )
    }

    type Events = Arc<Mutex<Vec<LookupEvent>>>;

    fn recorder() -> (Events, LookupCallback) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, Box::new(move |event| sink.lock().unwrap().push(event)))
    }

    /// A node as seen in a message sent by one of ours
    fn remote(id: NodeId, address: SocketAddrV4) -> Node {
        Node {
            version: Some(CLIENT_VERSION),
            ..Node::new(id, address)
        }
    }

    fn decode(datagram: &Datagram) -> IncomingMessage {
        IncomingMessage::decode(&datagram.data, None).unwrap()
    }

    fn query_of(datagram: &Datagram) -> Query {
        match decode(datagram).body {
            Body::Query { query, .. } => query,
            other => panic!("not a query: {:?}", other),
        }
    }

    /// Answer `query` as a node with `id` would, using a hand-built reply
    fn answer(query: &Datagram, id: u8, build: impl Fn(&MessageFactory) -> OutgoingMessage) -> Vec<u8> {
        let factory = MessageFactory::new(NodeId::new([id; 20]), None);
        build(&factory).encode(&decode(query).tid)
    }

    /// Deliver datagrams between in-memory controllers until none are left
    fn pump(nodes: &mut [&mut Controller], mut queue: Vec<(SocketAddrV4, Datagram)>, now: Instant) {
        while let Some((from, datagram)) = queue.pop() {
            if let Some(node) = nodes.iter_mut().find(|n| n.local_addr() == datagram.addr) {
                let (_, replies) = node.on_datagram_received_at(&datagram.data, SocketAddr::V4(from), now);
                let sender = node.local_addr();
                queue.extend(replies.into_iter().map(|d| (sender, d)));
            }
        }
    }

    fn outgoing(from: &Controller, datagrams: Vec<Datagram>) -> Vec<(SocketAddrV4, Datagram)> {
        datagrams.into_iter().map(|d| (from.local_addr(), d)).collect()
    }

    /// Make `client` know `server_id` at `server_addr` through a ping round trip
    fn learn(client: &mut Controller, server_id: u8, server_addr: &str, now: Instant) {
        let ping = client.ping_at(addr(server_addr), now);
        let reply = answer(&ping[0], server_id, |f| f.ping_response());
        client.on_datagram_received_at(&reply, SocketAddr::V4(addr(server_addr)), now);
    }

    #[test]
    fn test_ping_round_trip() {
        let now = Instant::now();
        let mut client = controller(1, C_ADDR, now);
        let mut server = controller(2, S_ADDR, now);

        let ping = client.ping_at(addr(S_ADDR), now);
        assert_eq!(ping.len(), 1);
        assert_eq!(query_of(&ping[0]), Query::Ping);
        let tid = decode(&ping[0]).tid;

        let (_, replies) = server.on_datagram_received_at(&ping[0].data, SocketAddr::V4(addr(C_ADDR)), now);
        let mut expected = b"d1:rd2:id20:".to_vec();
        expected.extend_from_slice(&[2u8; 20]);
        expected.extend_from_slice(b"e1:t2:");
        expected.extend_from_slice(&tid);
        expected.extend_from_slice(b"1:v4:DT\x00\x011:y1:re");
        assert_eq!(replies[0].data, expected);
        assert_eq!(replies[0].addr, addr(C_ADDR));

        client.on_datagram_received_at(&replies[0].data, SocketAddr::V4(addr(S_ADDR)), now);
        let entry = client.routing().find(&NodeId::new([2u8; 20])).unwrap();
        assert_eq!(entry.consecutive_failures, 0);
        assert_eq!(client.pending_queries(), 0);
        // The server learned the client from its query
        assert!(server.routing().find(&NodeId::new([1u8; 20])).is_some());
    }

    #[test]
    fn test_find_node_empty_result() {
        let now = Instant::now();
        let mut client = controller(1, C_ADDR, now);
        learn(&mut client, 2, S_ADDR, now);

        let (events, callback) = recorder();
        let sent = client.find_node_at(LookupId(9), NodeId::new([3u8; 20]), callback, now);
        assert_eq!(sent.len(), 1);
        assert_eq!(query_of(&sent[0]), Query::FindNode { target: NodeId::new([3u8; 20]) });

        let reply = answer(&sent[0], 2, |f| f.find_node_response(&[]));
        let (_, more) = client.on_datagram_received_at(&reply, SocketAddr::V4(addr(S_ADDR)), now);
        assert!(more.is_empty());

        let server = remote(NodeId::new([2u8; 20]), addr(S_ADDR));
        assert_eq!(
            *events.lock().unwrap(),
            vec![LookupEvent::Done {
                lookup_id: LookupId(9),
                from: Some(server),
            }]
        );
    }

    #[test]
    fn test_unsendable_query_counts_as_timeout() {
        let now = Instant::now();
        let mut client = controller(1, C_ADDR, now);
        learn(&mut client, 2, S_ADDR, now);
        client.querier.occupy_all_tids(addr(S_ADDR), now);

        let (events, callback) = recorder();
        let sent = client.get_peers_at(LookupId(5), NodeId::new([4u8; 20]), callback, None, false, now);
        assert!(sent.is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![LookupEvent::Done {
                lookup_id: LookupId(5),
                from: None,
            }]
        );
        assert_eq!(client.active_lookups(), 0);
    }

    #[test]
    fn test_get_peers_values_fill_cache() {
        let now = Instant::now();
        let mut client = controller(1, C_ADDR, now);
        learn(&mut client, 2, S_ADDR, now);
        let info_hash = NodeId::new([4u8; 20]);

        let (events, callback) = recorder();
        let sent = client.get_peers_at(LookupId(3), info_hash, callback, None, false, now);
        assert_eq!(query_of(&sent[0]), Query::GetPeers { info_hash });

        let peers = vec![addr("1.2.3.4:6881"), addr("5.6.7.8:6881")];
        let reply = answer(&sent[0], 2, |f| {
            f.get_peers_response(&[0xde, 0xad, 0xbe, 0xef, 1, 2, 3, 4], &GetPeersReply::Values(peers.clone()))
        });
        client.on_datagram_received_at(&reply, SocketAddr::V4(addr(S_ADDR)), now);

        let server = Some(remote(NodeId::new([2u8; 20]), addr(S_ADDR)));
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                LookupEvent::Peers {
                    lookup_id: LookupId(3),
                    peers: peers.clone(),
                    from: server,
                },
                LookupEvent::Done {
                    lookup_id: LookupId(3),
                    from: server,
                },
            ]
        );

        // A second lookup is answered from the cache without traffic
        let (cached, callback) = recorder();
        let sent = client.get_peers_at(LookupId(4), info_hash, callback, None, true, now);
        assert!(sent.is_empty());
        assert_eq!(
            *cached.lock().unwrap(),
            vec![
                LookupEvent::Peers {
                    lookup_id: LookupId(4),
                    peers,
                    from: None,
                },
                LookupEvent::Done {
                    lookup_id: LookupId(4),
                    from: None,
                },
            ]
        );
    }

    #[test]
    fn test_get_peers_nodes_then_values() {
        let start = Instant::now();
        let mut client = controller(1, C_ADDR, start);
        learn(&mut client, 0x80, S_ADDR, start);
        let info_hash = NodeId::new([4u8; 20]);

        let (events, callback) = recorder();
        let sent = client.get_peers_at(LookupId(1), info_hash, callback, None, false, start);

        let closer: Vec<Node> = (0..8u8)
            .map(|i| {
                let mut id = [4u8; 20];
                id[19] = (i + 1) << 4;
                Node::new(NodeId::new(id), addr(&format!("10.0.3.{}:6881", i + 1)))
            })
            .collect();
        let reply = answer(&sent[0], 0x80, |f| f.get_peers_response(b"t1", &GetPeersReply::Nodes(closer.clone())));
        let (_, sent) = client.on_datagram_received_at(&reply, SocketAddr::V4(addr(S_ADDR)), start);
        let asked: Vec<SocketAddrV4> = sent.iter().map(|d| d.addr).collect();
        assert_eq!(asked, vec![closer[0].addr, closer[1].addr, closer[2].addr]);

        let s2 = closer[1];
        let reply = {
            let factory = MessageFactory::new(s2.id, None);
            factory
                .get_peers_response(b"t2", &GetPeersReply::Values(vec![addr("9.9.9.9:6881")]))
                .encode(&decode(&sent[1]).tid)
        };
        client.on_datagram_received_at(&reply, SocketAddr::V4(s2.addr), start);
        let s2 = remote(s2.id, s2.addr);

        // Everyone else stays silent until the lookup gives up on them
        for tick in 1..=10u32 {
            client.main_loop_at(start + Duration::from_secs(2) * tick);
            if client.active_lookups() == 0 {
                break;
            }
        }
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                LookupEvent::Peers {
                    lookup_id: LookupId(1),
                    peers: vec![addr("9.9.9.9:6881")],
                    from: Some(s2),
                },
                LookupEvent::Done {
                    lookup_id: LookupId(1),
                    from: Some(s2),
                },
            ]
        );
    }

    #[test]
    fn test_announce_after_lookup() {
        let now = Instant::now();
        let mut client = controller(1, C_ADDR, now);
        let mut server = controller(2, S_ADDR, now);
        let mut third = controller(3, "10.0.0.3:6881", now);
        let info_hash = NodeId::new([4u8; 20]);

        let ping = client.ping_at(addr(S_ADDR), now);
        let queue = outgoing(&client, ping);
        pump(&mut [&mut client, &mut server], queue, now);

        let (events, callback) = recorder();
        let sent = client.get_peers_at(LookupId(5), info_hash, callback, Some(6881), false, now);
        let queue = outgoing(&client, sent);
        pump(&mut [&mut client, &mut server], queue, now);
        assert!(events.lock().unwrap().last().unwrap().is_done());
        assert_eq!(client.pending_queries(), 0);

        // The client recorded itself too
        assert_eq!(client.responder().peer_store().len(), 1);

        // Anyone asking the server now gets the client as a peer
        let ping = third.ping_at(addr(S_ADDR), now);
        let queue = outgoing(&third, ping);
        pump(&mut [&mut third, &mut server], queue, now);
        let (found, callback) = recorder();
        let sent = third.get_peers_at(LookupId(6), info_hash, callback, None, false, now);
        let queue = outgoing(&third, sent);
        pump(&mut [&mut third, &mut server], queue, now);

        let found = found.lock().unwrap();
        match &found[0] {
            LookupEvent::Peers { peers, .. } => assert_eq!(peers, &vec![addr("10.0.0.1:6881")]),
            other => panic!("expected peers, got {:?}", other),
        }
    }

    #[test]
    fn test_timeouts_evict_node() {
        let start = Instant::now();
        let mut client = controller(1, C_ADDR, start);
        learn(&mut client, 2, S_ADDR, start);
        let server_id = NodeId::new([2u8; 20]);

        for round in 0..3u32 {
            let now = start + Duration::from_secs(10) * round;
            let (events, callback) = recorder();
            let sent = client.get_peers_at(LookupId(u64::from(round)), NodeId::new([4u8; 20]), callback, None, false, now);
            assert_eq!(sent.len(), 1);

            let (next_tick, _) = client.main_loop_at(now + Duration::from_secs(2));
            assert!(next_tick >= now + Duration::from_secs(3));
            assert_eq!(
                *events.lock().unwrap(),
                vec![LookupEvent::Done {
                    lookup_id: LookupId(u64::from(round)),
                    from: None,
                }]
            );
            if round < 2 {
                assert_eq!(client.routing().find(&server_id).unwrap().consecutive_failures, round as u8 + 1);
            }
        }
        assert!(client.routing().find(&server_id).is_none());
    }

    #[test]
    fn test_error_reply_counts_as_failure() {
        let now = Instant::now();
        let mut client = controller(1, C_ADDR, now);
        learn(&mut client, 2, S_ADDR, now);

        let (events, callback) = recorder();
        let sent = client.get_peers_at(LookupId(1), NodeId::new([4u8; 20]), callback, None, false, now);
        let reply = answer(&sent[0], 2, |f| f.error(202, "Server Error"));
        client.on_datagram_received_at(&reply, SocketAddr::V4(addr(S_ADDR)), now);

        assert!(events.lock().unwrap()[0].is_done());
        let entry = client.routing().find(&NodeId::new([2u8; 20])).unwrap();
        assert_eq!(entry.consecutive_failures, 1);
    }

    #[test]
    fn test_unsolicited_response_ignored() {
        let now = Instant::now();
        let mut client = controller(1, C_ADDR, now);
        let factory = MessageFactory::new(NodeId::new([2u8; 20]), None);
        let reply = factory.ping_response().encode(b"zz");
        let (_, out) = client.on_datagram_received_at(&reply, SocketAddr::V4(addr(S_ADDR)), now);
        assert!(out.is_empty());
        assert_eq!(client.routing().node_count(), 0);
    }

    #[test]
    fn test_malformed_query_gets_protocol_error() {
        let now = Instant::now();
        let mut server = controller(2, S_ADDR, now);
        // find_node without a target
        let (_, out) = server.on_datagram_received_at(
            b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q9:find_node1:t2:xy1:y1:qe",
            SocketAddr::V4(addr(C_ADDR)),
            now,
        );
        assert_eq!(out.len(), 1);
        match decode(&out[0]).body {
            Body::Error { code, .. } => assert_eq!(code, PROTOCOL_ERROR),
            other => panic!("expected error, got {:?}", other),
        }

        let (_, out) = server.on_datagram_received_at(b"garbage", SocketAddr::V4(addr(C_ADDR)), now);
        assert!(out.is_empty());
    }

    #[test]
    fn test_private_label_isolates() {
        let now = Instant::now();
        let mut client = Controller::with_identity(
            NodeId::new([1u8; 20]),
            addr(C_ADDR),
            None,
            false,
            Some(b"lab".to_vec()),
            DhtSettings::default(),
            now,
        );
        let mut public = controller(2, S_ADDR, now);
        let ping = client.ping_at(addr(S_ADDR), now);
        let (_, out) = public.on_datagram_received_at(&ping[0].data, SocketAddr::V4(addr(C_ADDR)), now);
        // The public node answers, but the reply lacks the label
        let (_, back) = client.on_datagram_received_at(&out[0].data, SocketAddr::V4(addr(S_ADDR)), now);
        assert!(back.is_empty());
        assert_eq!(client.routing().node_count(), 0);
    }

    #[test]
    fn test_bootstrap_then_self_lookup() {
        let now = Instant::now();
        let mut client = controller(1, C_ADDR, now);
        client.add_bootstrap_addrs(vec![addr(S_ADDR)]);

        let (_, sent) = client.main_loop_at(now);
        assert_eq!(sent.len(), 1);
        assert_eq!(query_of(&sent[0]), Query::FindNode { target: NodeId::new([1u8; 20]) });

        let reply = answer(&sent[0], 2, |f| f.find_node_response(&[]));
        client.on_datagram_received_at(&reply, SocketAddr::V4(addr(S_ADDR)), now);
        assert_eq!(client.routing().node_count(), 1);

        let (_, sent) = client.main_loop_at(now + Duration::from_secs(5));
        assert_eq!(client.active_lookups(), 1);
        assert_eq!(sent.len(), 1);
        assert_eq!(query_of(&sent[0]), Query::FindNode { target: NodeId::new([1u8; 20]) });
    }

    #[test]
    fn test_next_tick_has_floor() {
        let now = Instant::now();
        let mut client = controller(1, C_ADDR, now);
        let (next_tick, sent) = client.main_loop_at(now);
        assert!(sent.is_empty());
        assert!(next_tick >= now + Duration::from_secs(1));
    }

    #[test]
    fn test_shutdown_delivers_done_and_saves_state() {
        let now = Instant::now();
        let path = std::env::temp_dir().join(format!("dht-tracker-controller-{}.state", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut client = Controller::with_identity(
            NodeId::new([1u8; 20]),
            addr(C_ADDR),
            Some(path.clone()),
            false,
            None,
            DhtSettings::default(),
            now,
        );
        learn(&mut client, 2, S_ADDR, now);
        let (events, callback) = recorder();
        client.get_peers_at(LookupId(8), NodeId::new([4u8; 20]), callback, None, false, now);

        client.shutdown_at(now);
        assert!(client.is_shut_down());
        assert_eq!(
            *events.lock().unwrap(),
            vec![LookupEvent::Done {
                lookup_id: LookupId(8),
                from: None,
            }]
        );
        // Nothing more happens after shutdown
        assert!(client.shutdown_at(now).is_empty());
        assert!(client.main_loop_at(now).1.is_empty());

        let restored = Controller::new(addr(C_ADDR), Some(path.clone()), false, None);
        assert_eq!(restored.local_id(), NodeId::new([1u8; 20]));
        assert_eq!(restored.routing().bootstrap_addrs(), &[addr(S_ADDR)]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_settings_from_partial_json() {
        let settings: DhtSettings = serde_json::from_str(r#"{"query_timeout_ms": 500}"#).unwrap();
        assert_eq!(settings.query_timeout(), Duration::from_millis(500));
        assert_eq!(settings.max_values, 50);
        assert_eq!(settings.min_tick(), Duration::from_secs(1));
    }

    #[test]
    fn test_query_type_of_registered_ping() {
        let now = Instant::now();
        let mut client = controller(1, C_ADDR, now);
        let sent = client.ping_at(addr(S_ADDR), now);
        let message = decode(&sent[0]);
        match message.body {
            Body::Query { query, sender_id } => {
                assert_eq!(query.query_type(), Some(QueryType::Ping));
                assert_eq!(sender_id, NodeId::new([1u8; 20]));
            }
            other => panic!("not a query: {:?}", other),
        }
    }
}
