//! dht-tracker
//!
//! A mainline DHT node: finds BitTorrent peers for an info hash, announces
//! ours, and answers other nodes' queries.

pub mod dht;
pub mod cli;
pub mod error;

pub use error::DhtError;

pub use dht::{
    Node, NodeId, Controller, Datagram, DhtSettings, LookupCallback, LookupEvent, LookupId,
    DhtServer, DhtHandle, ServerOptions, BootstrapState, collect_peers,
};
pub use cli::{CliArgs, Config};
