//! Inbound query handling
//!
//! Answers ping, find_node, get_peers and announce_peer, and keeps the
//! store of peers announced to this node.

use crate::dht::message::{
    GetPeersReply, MessageFactory, OutgoingMessage, Query, GENERIC_ERROR, METHOD_UNKNOWN_MSG, PROTOCOL_ERROR,
    PROTOCOL_ERROR_MSG,
};
use crate::dht::node::NodeId;
use crate::dht::routing::{RoutingManager, K};
use crate::dht::token::TokenManager;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Peers kept per info hash
pub const MAX_PEERS_PER_INFO_HASH: usize = 1000;

/// Default lifetime of an announced peer
pub const PEER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Default cap on `values` in a get_peers reply
pub const MAX_VALUES: usize = 50;

#[derive(Debug, Clone)]
struct AnnouncedPeer {
    addr: SocketAddrV4,
    announced_at: Instant,
}

/// Peers announced to this node, by info hash
#[derive(Debug)]
pub struct PeerStore {
    peers: HashMap<NodeId, Vec<AnnouncedPeer>>,
    ttl: Duration,
}

impl PeerStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            ttl,
        }
    }

    /// Record a peer; re-announcing refreshes it
    pub fn add_peer(&mut self, info_hash: NodeId, addr: SocketAddrV4, now: Instant) {
        let ttl = self.ttl;
        let peers = self.peers.entry(info_hash).or_default();
        peers.retain(|p| now.saturating_duration_since(p.announced_at) < ttl && p.addr != addr);

        if peers.len() >= MAX_PEERS_PER_INFO_HASH {
            peers.remove(0);
        }
        peers.push(AnnouncedPeer {
            addr,
            announced_at: now,
        });
    }

    /// Up to `max` live peers, most recently announced first
    pub fn get_peers(&mut self, info_hash: &NodeId, max: usize, now: Instant) -> Vec<SocketAddrV4> {
        let ttl = self.ttl;
        let Some(peers) = self.peers.get_mut(info_hash) else {
            return Vec::new();
        };
        peers.retain(|p| now.saturating_duration_since(p.announced_at) < ttl);
        let found: Vec<SocketAddrV4> = peers.iter().rev().take(max).map(|p| p.addr).collect();
        if peers.is_empty() {
            self.peers.remove(info_hash);
        }
        found
    }

    /// Drop expired peers and empty info hashes
    pub fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.peers.retain(|_, peers| {
            peers.retain(|p| now.saturating_duration_since(p.announced_at) < ttl);
            !peers.is_empty()
        });
    }

    /// Number of info hashes with at least one stored peer
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Answers inbound queries on behalf of the local node
#[derive(Debug)]
pub struct Responder {
    factory: MessageFactory,
    tokens: TokenManager,
    store: PeerStore,
    max_values: usize,
    bootstrap_mode: bool,
}

impl Responder {
    pub fn new(
        factory: MessageFactory,
        tokens: TokenManager,
        peer_ttl: Duration,
        max_values: usize,
        bootstrap_mode: bool,
    ) -> Self {
        Self {
            factory,
            tokens,
            store: PeerStore::new(peer_ttl),
            max_values,
            bootstrap_mode,
        }
    }

    /// Build the reply to `query` received from `source`
    pub fn handle_query(
        &mut self,
        source: SocketAddrV4,
        query: &Query,
        routing: &RoutingManager,
        now: Instant,
    ) -> OutgoingMessage {
        match query {
            Query::Ping => self.factory.ping_response(),
            Query::FindNode { target } => {
                let nodes = routing.get_closest(target, K, false);
                self.factory.find_node_response(&nodes)
            }
            Query::GetPeers { info_hash } => {
                let token = self.tokens.token(*source.ip(), now);
                let peers = self.store.get_peers(info_hash, self.max_values, now);
                let reply = if peers.is_empty() {
                    GetPeersReply::Nodes(routing.get_closest(info_hash, K, false))
                } else {
                    trace!("Returning {} peer(s) for {} to {}", peers.len(), info_hash, source);
                    GetPeersReply::Values(peers)
                };
                self.factory.get_peers_response(&token, &reply)
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !self.tokens.validate(*source.ip(), token, now) {
                    debug!("Rejecting announce for {} from {}: bad token", info_hash, source);
                    return self.factory.error(PROTOCOL_ERROR, PROTOCOL_ERROR_MSG);
                }
                let port = if *implied_port { source.port() } else { *port };
                if port == 0 {
                    return self.factory.error(PROTOCOL_ERROR, PROTOCOL_ERROR_MSG);
                }
                if !self.bootstrap_mode {
                    let peer = SocketAddrV4::new(*source.ip(), port);
                    debug!("Storing peer {} for {}", peer, info_hash);
                    self.store.add_peer(*info_hash, peer, now);
                }
                self.factory.announce_peer_response()
            }
            Query::Unknown { name } => {
                debug!("Unknown method {:?} from {}", String::from_utf8_lossy(name), source);
                self.factory.error(GENERIC_ERROR, METHOD_UNKNOWN_MSG)
            }
        }
    }

    /// Record a peer in the local store directly
    pub fn store_peer(&mut self, info_hash: NodeId, addr: SocketAddrV4, now: Instant) {
        if !self.bootstrap_mode {
            self.store.add_peer(info_hash, addr, now);
        }
    }

    pub fn peer_store(&self) -> &PeerStore {
        &self.store
    }

    /// Expire announced peers
    pub fn sweep(&mut self, now: Instant) {
        self.store.sweep(now);
    }
}
