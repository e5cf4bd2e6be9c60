//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use crate::dht::bootstrap::DEFAULT_STATE_FILE;
use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the DHT node
#[derive(Debug, Parser)]
#[command(name = "dht-tracker")]
#[command(about = "A mainline DHT node that looks up and announces BitTorrent peers", long_about = None)]
pub struct CliArgs {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// IPv4 address to bind; announced as our own address when it is not 0.0.0.0
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: String,

    /// File holding our node id and known nodes between runs
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_STATE_FILE)]
    pub state_file: PathBuf,

    /// Answer queries without storing announced peers
    #[arg(long)]
    pub bootstrap_mode: bool,

    /// Join a private DHT identified by this label
    #[arg(long, value_name = "LABEL")]
    pub private_label: Option<String>,

    /// Bootstrap node as HOST:PORT (repeatable; defaults to the well-known routers)
    #[arg(long = "bootstrap-node", value_name = "HOST:PORT")]
    pub bootstrap_nodes: Vec<String>,

    /// JSON file overriding timing and limit settings
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Look up peers for this info hash (40 hex characters) and exit
    #[arg(short, long, value_name = "HEX")]
    pub info_hash: Option<String>,

    /// Announce this BitTorrent port for --info-hash once the lookup ends
    #[arg(short, long, value_name = "PORT")]
    pub announce_port: Option<u16>,

    /// Always query the network, even if recent results are cached
    #[arg(long)]
    pub no_cache: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["dht-tracker"]).unwrap();

        assert_eq!(args.port, 6881);
        assert_eq!(args.bind, "0.0.0.0");
        assert_eq!(args.state_file, PathBuf::from("dht.state"));
        assert!(!args.bootstrap_mode);
        assert!(args.bootstrap_nodes.is_empty());
        assert!(args.info_hash.is_none());
        assert!(!args.no_cache);
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_lookup_arguments() {
        let args = CliArgs::try_parse_from([
            "dht-tracker",
            "--port",
            "7000",
            "--bootstrap-node",
            "127.0.0.1:6881",
            "--bootstrap-node",
            "10.0.0.1:6881",
            "--info-hash",
            "0123456789abcdef0123456789abcdef01234567",
            "--announce-port",
            "51413",
            "--private-label",
            "lab",
            "-v",
        ])
        .unwrap();

        assert_eq!(args.port, 7000);
        assert_eq!(args.bootstrap_nodes, vec!["127.0.0.1:6881", "10.0.0.1:6881"]);
        assert_eq!(args.announce_port, Some(51413));
        assert_eq!(args.private_label.as_deref(), Some("lab"));
        assert!(args.is_verbose());
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }
}
