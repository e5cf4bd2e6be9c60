//! DHT (Distributed Hash Table) module
//!
//! Implements a mainline (BEP 5) DHT node for peer discovery. The core is
//! sans-IO: [`Controller`] consumes datagrams and clock ticks and returns the
//! datagrams to send, while [`server`] drives it from a tokio UDP socket.

pub mod node;
pub mod compact;
pub mod bencode;
pub mod message;
pub mod routing;
pub mod querier;
pub mod lookup;
pub mod token;
pub mod responder;
pub mod cache;
pub mod bootstrap;
pub mod controller;
pub mod server;

// Re-exports for convenience
pub use node::{Node, NodeId};
pub use routing::{KBucket, RoutingManager, RoutingTable, K};
pub use message::{IncomingMessage, MessageFactory, OutgoingMessage, Query, QueryType, Response};
pub use bencode::{BencodeDict, Value as BencodeValue};
pub use querier::{Querier, QueryRequest};
pub use lookup::{LookupEngine, LookupEvent, LookupId, ALPHA};
pub use responder::{PeerStore, Responder};
pub use cache::PeerCache;
pub use bootstrap::{resolve_bootstrap_nodes, BootstrapState, DEFAULT_BOOTSTRAP_NODES};
pub use controller::{Controller, Datagram, DhtSettings, LookupCallback};
pub use server::{collect_peers, DhtHandle, DhtServer, ServerOptions};
