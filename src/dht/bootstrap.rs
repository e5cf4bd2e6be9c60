//! DHT bootstrap module
//!
//! Persistence of the local id and known node addresses between runs,
//! and resolution of the well-known bootstrap routers.

use crate::dht::compact::{pack_addr, unpack_addr, COMPACT_ADDR_LEN};
use crate::dht::node::{NodeId, ID_LEN};
use crate::error::DhtError;
use bytes::BufMut;
use std::fs;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::Path;
use tracing::{debug, warn};

/// Leading byte of the state file, bumped when the layout changes
pub const STATE_MAGIC: u8 = 0x01;

/// Default state file name
pub const DEFAULT_STATE_FILE: &str = "dht.state";

/// Well-known routers used when nothing else is known
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

const HEADER_LEN: usize = 1 + ID_LEN + 2;

/// What survives a restart: our id and the addresses of nodes we knew
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapState {
    pub local_id: NodeId,
    pub addrs: Vec<SocketAddrV4>,
}

impl BootstrapState {
    /// Serialize as `magic || id || count (u16 BE) || count x addr`
    pub fn to_bytes(&self) -> Vec<u8> {
        let packed: Vec<[u8; COMPACT_ADDR_LEN]> = self
            .addrs
            .iter()
            .filter_map(|addr| pack_addr(addr).ok())
            .take(u16::MAX as usize)
            .collect();

        let mut buf = Vec::with_capacity(HEADER_LEN + packed.len() * COMPACT_ADDR_LEN);
        buf.put_u8(STATE_MAGIC);
        buf.put_slice(self.local_id.as_bytes());
        buf.put_u16(packed.len() as u16);
        for addr in &packed {
            buf.put_slice(addr);
        }
        buf
    }

    /// Parse a state file body; any length other than the declared one is an error
    pub fn from_bytes(data: &[u8]) -> Result<Self, DhtError> {
        if data.len() < HEADER_LEN {
            return Err(DhtError::codec_error(format!("state file truncated ({} bytes)", data.len())));
        }
        if data[0] != STATE_MAGIC {
            return Err(DhtError::codec_error(format!("unknown state file version {:#04x}", data[0])));
        }
        let local_id = NodeId::from_bytes(&data[1..1 + ID_LEN])?;
        let count = u16::from_be_bytes([data[1 + ID_LEN], data[2 + ID_LEN]]) as usize;
        let body = &data[HEADER_LEN..];
        if body.len() != count * COMPACT_ADDR_LEN {
            return Err(DhtError::codec_error(format!(
                "state file declares {} address(es) but carries {} bytes",
                count,
                body.len()
            )));
        }

        let mut addrs = Vec::with_capacity(count);
        for chunk in body.chunks_exact(COMPACT_ADDR_LEN) {
            match unpack_addr(chunk) {
                Ok(addr) => addrs.push(addr),
                Err(e) => debug!("Skipping saved address: {}", e),
            }
        }
        Ok(Self { local_id, addrs })
    }

    /// Write to a sibling temp file, then rename over `path`
    pub fn save(&self, path: &Path) -> Result<(), DhtError> {
        let shown = path.display().to_string();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| DhtError::state_io_error_full("cannot create state directory", &shown, e.to_string()))?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = Path::new(&tmp);
        fs::write(tmp, self.to_bytes())
            .map_err(|e| DhtError::state_io_error_full("cannot write state file", &shown, e.to_string()))?;
        fs::rename(tmp, path)
            .map_err(|e| DhtError::state_io_error_full("cannot replace state file", &shown, e.to_string()))?;
        debug!("Saved {} node address(es) to {}", self.addrs.len(), shown);
        Ok(())
    }

    /// Load a saved state; `Ok(None)` when there is no file yet
    pub fn load(path: &Path) -> Result<Option<Self>, DhtError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DhtError::state_io_error_full(
                    "cannot read state file",
                    path.display().to_string(),
                    e.to_string(),
                ))
            }
        };
        Self::from_bytes(&data)
            .map(Some)
            .map_err(|e| e.with_context(path.display().to_string()))
    }
}

/// Resolve `host:port` strings to IPv4 addresses, skipping failures
pub async fn resolve_bootstrap_nodes<S: AsRef<str>>(hosts: &[S]) -> Vec<SocketAddrV4> {
    let mut resolved = Vec::new();
    for host in hosts {
        let host = host.as_ref();
        match tokio::net::lookup_host(host).await {
            Ok(addrs) => {
                let before = resolved.len();
                for addr in addrs {
                    if let SocketAddr::V4(v4) = addr {
                        if !resolved.contains(&v4) {
                            resolved.push(v4);
                        }
                    }
                }
                debug!("Resolved {} to {} address(es)", host, resolved.len() - before);
            }
            Err(e) => warn!("Cannot resolve bootstrap node {}: {}", host, e),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dht-tracker-{}-{}", std::process::id(), name))
    }

    fn sample() -> BootstrapState {
        BootstrapState {
            local_id: NodeId::new([9u8; 20]),
            addrs: vec!["1.2.3.4:6881".parse().unwrap(), "5.6.7.8:51413".parse().unwrap()],
        }
    }

    #[test]
    fn test_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + 12);
        assert_eq!(bytes[0], STATE_MAGIC);
        assert_eq!(&bytes[1..21], &[9u8; 20]);
        assert_eq!(&bytes[21..23], &[0, 2]);
        assert_eq!(&bytes[23..29], &[1, 2, 3, 4, 0x1A, 0xE1]);
        assert_eq!(BootstrapState::from_bytes(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_rejects_bad_files() {
        let bytes = sample().to_bytes();
        assert!(BootstrapState::from_bytes(&bytes[..10]).is_err());
        assert!(BootstrapState::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut wrong_magic = bytes.clone();
        wrong_magic[0] = 0x02;
        assert!(matches!(
            BootstrapState::from_bytes(&wrong_magic),
            Err(DhtError::CodecError { .. })
        ));

        let mut trailing = bytes;
        trailing.push(0);
        assert!(BootstrapState::from_bytes(&trailing).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path("save.state");
        let _ = fs::remove_file(&path);
        assert_eq!(BootstrapState::load(&path).unwrap(), None);

        sample().save(&path).unwrap();
        assert_eq!(BootstrapState::load(&path).unwrap(), Some(sample()));

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        assert!(!Path::new(&tmp).exists());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_corrupt_file() {
        let path = temp_path("corrupt.state");
        fs::write(&path, b"garbage").unwrap();
        assert!(BootstrapState::load(&path).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let resolved = resolve_bootstrap_nodes(&["127.0.0.1:6881", "127.0.0.1:6881", "[::1]:6881"]).await;
        assert_eq!(resolved, vec!["127.0.0.1:6881".parse::<SocketAddrV4>().unwrap()]);
    }
}
