//! DHT server
//!
//! Drives a [`Controller`] from a tokio UDP socket. The controller is owned
//! by a single task; the rest of the program talks to it through a cloneable
//! [`DhtHandle`].

use crate::dht::bootstrap::resolve_bootstrap_nodes;
use crate::dht::controller::{Controller, Datagram, DhtSettings};
use crate::dht::lookup::{LookupEvent, LookupId};
use crate::dht::node::NodeId;
use crate::error::DhtError;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Largest datagram we accept
const RECV_BUFFER_LEN: usize = 4096;

/// Everything the server needs besides the bind address
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub state_path: Option<PathBuf>,
    pub bootstrap_mode: bool,
    pub private_label: Option<Vec<u8>>,
    /// `host:port` strings resolved at startup
    pub bootstrap_nodes: Vec<String>,
    pub settings: DhtSettings,
}

enum Command {
    GetPeers {
        lookup_id: LookupId,
        info_hash: NodeId,
        bt_port: Option<u16>,
        use_cache: bool,
        events: mpsc::UnboundedSender<LookupEvent>,
    },
    FindNode {
        lookup_id: LookupId,
        target: NodeId,
        events: mpsc::UnboundedSender<LookupEvent>,
    },
    Ping {
        addr: SocketAddrV4,
    },
    NodeCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable access to a running [`DhtServer`]
#[derive(Clone)]
pub struct DhtHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_lookup_id: Arc<AtomicU64>,
    local_addr: SocketAddrV4,
}

impl DhtHandle {
    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    fn send(&self, command: Command) -> Result<(), DhtError> {
        self.commands
            .send(command)
            .map_err(|_| DhtError::network_error("DHT server is not running"))
    }

    fn lookup_id(&self) -> LookupId {
        LookupId(self.next_lookup_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Start a peer lookup; the receiver yields its events and closes after `Done`
    pub fn get_peers(
        &self,
        info_hash: NodeId,
        bt_port: Option<u16>,
        use_cache: bool,
    ) -> Result<mpsc::UnboundedReceiver<LookupEvent>, DhtError> {
        let (events, rx) = mpsc::unbounded_channel();
        self.send(Command::GetPeers {
            lookup_id: self.lookup_id(),
            info_hash,
            bt_port,
            use_cache,
            events,
        })?;
        Ok(rx)
    }

    pub fn find_node(&self, target: NodeId) -> Result<mpsc::UnboundedReceiver<LookupEvent>, DhtError> {
        let (events, rx) = mpsc::unbounded_channel();
        self.send(Command::FindNode {
            lookup_id: self.lookup_id(),
            target,
            events,
        })?;
        Ok(rx)
    }

    pub fn ping(&self, addr: SocketAddrV4) -> Result<(), DhtError> {
        self.send(Command::Ping { addr })
    }

    /// Nodes currently in the routing table
    pub async fn node_count(&self) -> Result<usize, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::NodeCount { reply })?;
        rx.await
            .map_err(|_| DhtError::network_error("DHT server stopped before answering"))
    }

    /// Stop the server, ending all lookups and saving state
    pub async fn shutdown(&self) -> Result<(), DhtError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Shutdown { done })?;
        rx.await
            .map_err(|_| DhtError::network_error("DHT server stopped before shutting down"))
    }
}

/// Collect the peers of a lookup until it reports `Done`
pub async fn collect_peers(mut events: mpsc::UnboundedReceiver<LookupEvent>) -> Vec<SocketAddrV4> {
    let mut peers = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            LookupEvent::Peers { peers: found, .. } => {
                for peer in found {
                    if !peers.contains(&peer) {
                        peers.push(peer);
                    }
                }
            }
            LookupEvent::Done { .. } => break,
        }
    }
    peers
}

/// UDP front end of a DHT node
pub struct DhtServer {
    socket: UdpSocket,
    controller: Controller,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl DhtServer {
    /// Bind the socket, restore state and resolve bootstrap nodes
    pub async fn bind(bind_addr: SocketAddrV4, options: ServerOptions) -> Result<(Self, DhtHandle), DhtError> {
        info!("Creating DHT server on {}", bind_addr);

        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind UDP socket to {}: {}", bind_addr, e);
            DhtError::network_error_full("Failed to bind UDP socket", bind_addr.to_string(), e.to_string())
        })?;
        let local_addr = match socket.local_addr() {
            Ok(SocketAddr::V4(addr)) => addr,
            Ok(other) => {
                return Err(DhtError::network_error_full(
                    "Socket is not bound to an IPv4 address",
                    other.to_string(),
                    "unsupported address family",
                ))
            }
            Err(e) => {
                error!("Failed to get local address: {}", e);
                return Err(DhtError::network_error_full(
                    "Failed to get local address",
                    bind_addr.to_string(),
                    e.to_string(),
                ));
            }
        };

        let mut controller = Controller::with_settings(
            local_addr,
            options.state_path,
            options.bootstrap_mode,
            options.private_label,
            options.settings,
        );
        if !options.bootstrap_nodes.is_empty() {
            let addrs = resolve_bootstrap_nodes(&options.bootstrap_nodes).await;
            if addrs.is_empty() {
                warn!("None of {} bootstrap node(s) resolved", options.bootstrap_nodes.len());
            }
            controller.add_bootstrap_addrs(addrs);
        }
        info!("DHT listening on {}", local_addr);

        let (tx, commands) = mpsc::unbounded_channel();
        let handle = DhtHandle {
            commands: tx,
            next_lookup_id: Arc::new(AtomicU64::new(1)),
            local_addr,
        };
        Ok((
            Self {
                socket,
                controller,
                commands,
            },
            handle,
        ))
    }

    /// Serve until shut down through a handle or until every handle is dropped
    pub async fn run(mut self) -> Result<(), DhtError> {
        info!("Starting DHT event loop");
        let mut buffer = vec![0u8; RECV_BUFFER_LEN];
        let (mut next_tick, datagrams) = self.controller.main_loop();
        send_all(&self.socket, datagrams).await;

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, from)) => {
                            let (tick, datagrams) = self.controller.on_datagram_received(&buffer[..len], from);
                            next_tick = tick;
                            send_all(&self.socket, datagrams).await;
                        }
                        // ICMP errors from earlier sends surface here on some platforms
                        Err(e) => debug!("Error receiving datagram: {}", e),
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(next_tick)) => {
                    let (tick, datagrams) = self.controller.main_loop();
                    next_tick = tick;
                    send_all(&self.socket, datagrams).await;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown { done }) => {
                            self.stop().await;
                            let _ = done.send(());
                            break;
                        }
                        None => {
                            self.stop().await;
                            break;
                        }
                        Some(command) => {
                            let datagrams = self.handle_command(command);
                            // A new lookup may have an earlier deadline than the current sleep
                            next_tick = next_tick.min(self.controller.next_tick());
                            send_all(&self.socket, datagrams).await;
                        }
                    }
                }
            }
        }

        info!("DHT event loop stopped");
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Vec<Datagram> {
        match command {
            Command::GetPeers {
                lookup_id,
                info_hash,
                bt_port,
                use_cache,
                events,
            } => {
                debug!("Lookup {} for peers of {}", lookup_id, info_hash);
                self.controller
                    .get_peers(lookup_id, info_hash, forward_to(events), bt_port, use_cache)
            }
            Command::FindNode {
                lookup_id,
                target,
                events,
            } => {
                debug!("Lookup {} for nodes near {}", lookup_id, target);
                self.controller.find_node(lookup_id, target, forward_to(events))
            }
            Command::Ping { addr } => self.controller.ping(addr),
            Command::NodeCount { reply } => {
                let _ = reply.send(self.controller.routing().node_count());
                Vec::new()
            }
            // Handled by the event loop
            Command::Shutdown { .. } => Vec::new(),
        }
    }

    async fn stop(&mut self) {
        let datagrams = self.controller.shutdown();
        send_all(&self.socket, datagrams).await;
    }

}

/// Borrows only the socket, keeping the event loop future `Send`
async fn send_all(socket: &UdpSocket, datagrams: Vec<Datagram>) {
    for datagram in datagrams {
        trace!("Sending {} bytes to {}", datagram.data.len(), datagram.addr);
        if let Err(e) = socket.send_to(&datagram.data, datagram.addr).await {
            debug!("Failed to send to {}: {}", datagram.addr, e);
        }
    }
}

fn forward_to(events: mpsc::UnboundedSender<LookupEvent>) -> crate::dht::controller::LookupCallback {
    Box::new(move |event| {
        // The caller may have stopped listening
        let _ = events.send(event);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn spawn_server() -> DhtHandle {
        spawn_server_with(ServerOptions::default()).await
    }

    async fn spawn_server_with(options: ServerOptions) -> DhtHandle {
        let (server, handle) = DhtServer::bind("127.0.0.1:0".parse().unwrap(), options).await.unwrap();
        tokio::spawn(server.run());
        handle
    }

    async fn wait_for_nodes(handle: &DhtHandle, count: usize) {
        for _ in 0..100 {
            if handle.node_count().await.unwrap() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("node never learned {} node(s)", count);
    }

    #[tokio::test]
    async fn test_bind() {
        let handle = spawn_server().await;
        assert_eq!(*handle.local_addr().ip(), std::net::Ipv4Addr::LOCALHOST);
        assert_ne!(handle.local_addr().port(), 0);
        assert_eq!(handle.node_count().await.unwrap(), 0);
        handle.shutdown().await.unwrap();
        assert!(handle.node_count().await.is_err());
    }

    #[tokio::test]
    async fn test_ping_over_udp() {
        let a = spawn_server().await;
        let b = spawn_server().await;
        b.ping(a.local_addr()).unwrap();
        wait_for_nodes(&a, 1).await;
        wait_for_nodes(&b, 1).await;
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_announce_then_get_peers() {
        let a = spawn_server().await;
        let b = spawn_server().await;
        b.ping(a.local_addr()).unwrap();
        wait_for_nodes(&b, 1).await;

        let info_hash = NodeId::new([7u8; 20]);
        let events = b.get_peers(info_hash, Some(6881), false).unwrap();
        assert!(collect_peers(events).await.is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = b.get_peers(info_hash, None, false).unwrap();
        let peers = collect_peers(events).await;
        assert_eq!(peers, vec!["127.0.0.1:6881".parse::<SocketAddrV4>().unwrap()]);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_lookups() {
        let handle = spawn_server().await;
        let events = handle.get_peers(NodeId::new([1u8; 20]), None, true).unwrap();
        handle.shutdown().await.unwrap();
        assert!(collect_peers(events).await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_without_nodes_ends_on_its_own_deadline() {
        let options = ServerOptions {
            settings: DhtSettings {
                lookup_timeout_secs: 2,
                ..DhtSettings::default()
            },
            ..ServerOptions::default()
        };
        let handle = spawn_server_with(options).await;
        let started = std::time::Instant::now();
        let events = handle.get_peers(NodeId::new([2u8; 20]), None, false).unwrap();

        // Maintenance would not wake the loop for a minute
        let peers = tokio::time::timeout(Duration::from_secs(10), collect_peers(events))
            .await
            .expect("lookup should end at its deadline");
        assert!(peers.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(2));
        handle.shutdown().await.unwrap();
    }
}
