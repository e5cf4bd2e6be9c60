//! CLI configuration module
//!
//! Turns command-line arguments into a validated runtime configuration.

use crate::cli::args::CliArgs;
use crate::dht::bootstrap::DEFAULT_BOOTSTRAP_NODES;
use crate::dht::controller::DhtSettings;
use crate::dht::node::NodeId;
use crate::dht::server::ServerOptions;
use crate::error::DhtError;
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Longest accepted private DHT label
pub const MAX_PRIVATE_LABEL_LEN: usize = 64;

/// Configuration for the DHT node
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the UDP socket to
    pub bind_addr: SocketAddrV4,
    /// State file
    pub state_file: PathBuf,
    /// Do not store announced peers
    pub bootstrap_mode: bool,
    /// Private DHT label
    pub private_label: Option<Vec<u8>>,
    /// Bootstrap nodes as HOST:PORT
    pub bootstrap_nodes: Vec<String>,
    /// Timings and limits
    pub settings: DhtSettings,
    /// Hex info hash to look up, if any
    pub info_hash: Option<String>,
    /// Port to announce after the lookup
    pub announce_port: Option<u16>,
    /// Use cached lookup results
    pub use_cache: bool,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments, reading the settings file if given
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let ip: Ipv4Addr = args
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", args.bind))?;
        let settings = match &args.settings {
            Some(path) => load_settings(path)?,
            None => DhtSettings::default(),
        };
        let bootstrap_nodes = if args.bootstrap_nodes.is_empty() {
            DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect()
        } else {
            args.bootstrap_nodes.clone()
        };

        Ok(Self {
            bind_addr: SocketAddrV4::new(ip, args.port),
            state_file: args.state_file.clone(),
            bootstrap_mode: args.bootstrap_mode,
            private_label: args.private_label.as_ref().map(|l| l.as_bytes().to_vec()),
            bootstrap_nodes,
            settings,
            info_hash: args.info_hash.clone(),
            announce_port: args.announce_port,
            use_cache: !args.no_cache,
            verbose: args.verbose,
            quiet: args.quiet,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.port() == 0 {
            return Err(anyhow::anyhow!("Port cannot be 0"));
        }

        if self.state_file.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("state_file cannot be empty"));
        }

        if let Some(label) = &self.private_label {
            if label.is_empty() || label.len() > MAX_PRIVATE_LABEL_LEN {
                return Err(anyhow::anyhow!(
                    "private_label must be 1 to {} bytes long",
                    MAX_PRIVATE_LABEL_LEN
                ));
            }
        }

        self.lookup_target()?;

        if self.announce_port == Some(0) {
            return Err(anyhow::anyhow!("announce_port cannot be 0"));
        }
        if self.announce_port.is_some() && self.info_hash.is_none() {
            return Err(anyhow::anyhow!("announce_port requires info_hash"));
        }

        if self.settings.min_tick_ms == 0 || self.settings.query_timeout_ms == 0 {
            return Err(anyhow::anyhow!("min_tick_ms and query_timeout_ms must be positive"));
        }

        Ok(())
    }

    /// The info hash to look up, parsed
    pub fn lookup_target(&self) -> Result<Option<NodeId>> {
        match &self.info_hash {
            Some(hex) => {
                let id = NodeId::from_hex(hex).ok_or_else(|| {
                    DhtError::config_error_with_field(format!("expected 40 hex characters, got '{}'", hex), "info_hash")
                })?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Options for [`crate::dht::server::DhtServer::bind`]
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            state_path: Some(self.state_file.clone()),
            bootstrap_mode: self.bootstrap_mode,
            private_label: self.private_label.clone(),
            bootstrap_nodes: self.bootstrap_nodes.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

/// Read a JSON settings file; missing fields keep their defaults
pub fn load_settings(path: &Path) -> Result<DhtSettings> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file '{}'", path.display()))?;
    let settings: DhtSettings = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse settings file '{}'", path.display()))?;
    debug!("Loaded settings from {}: {:?}", path.display(), settings);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(extra: &[&str]) -> Config {
        let args = CliArgs::try_parse_from(std::iter::once("dht-tracker").chain(extra.iter().copied())).unwrap();
        Config::from_args(&args).unwrap()
    }

    #[test]
    fn test_config_from_args() {
        let config = config(&["--bind", "127.0.0.1", "--port", "6882", "--no-cache", "--bootstrap-mode"]);

        assert_eq!(config.bind_addr, "127.0.0.1:6882".parse::<SocketAddrV4>().unwrap());
        assert!(!config.use_cache);
        assert!(config.bootstrap_mode);
        assert_eq!(config.bootstrap_nodes.len(), DEFAULT_BOOTSTRAP_NODES.len());
        assert_eq!(config.settings, DhtSettings::default());
        assert!(config.validate().is_ok());

        let options = config.server_options();
        assert_eq!(options.state_path, Some(PathBuf::from("dht.state")));
        assert!(options.bootstrap_mode);
    }

    #[test]
    fn test_config_validate_invalid_port() {
        assert!(config(&["--port", "0"]).validate().is_err());
    }

    #[test]
    fn test_config_validate_info_hash() {
        let good = config(&["--info-hash", "0123456789abcdef0123456789abcdef01234567"]);
        assert!(good.validate().is_ok());
        assert!(good.lookup_target().unwrap().is_some());

        assert!(config(&["--info-hash", "abcd"]).validate().is_err());
        assert!(config(&["--announce-port", "6881"]).validate().is_err());
    }

    #[test]
    fn test_config_validate_label() {
        assert!(config(&["--private-label", "lab"]).validate().is_ok());
        let long = "x".repeat(MAX_PRIVATE_LABEL_LEN + 1);
        assert!(config(&["--private-label", &long]).validate().is_err());
    }

    #[test]
    fn test_bad_bind_address() {
        let args = CliArgs::try_parse_from(["dht-tracker", "--bind", "localhost"]).unwrap();
        assert!(Config::from_args(&args).is_err());
    }

    #[test]
    fn test_settings_file() {
        let path = std::env::temp_dir().join(format!("dht-tracker-settings-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"max_values": 20, "lookup_timeout_secs": 10}"#).unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.max_values, 20);
        assert_eq!(settings.lookup_timeout_secs, 10);
        assert_eq!(settings.query_timeout_ms, 2000);

        std::fs::write(&path, "not json").unwrap();
        assert!(load_settings(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
