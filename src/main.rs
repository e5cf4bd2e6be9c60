//! dht-tracker - Main entry point
//!
//! Runs a DHT node until interrupted, or performs a single peer lookup.

use anyhow::{Context, Result};
use dht_tracker::{CliArgs, Config, DhtHandle, DhtServer, LookupEvent, NodeId};
use std::collections::HashSet;
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic handler
    setup_panic_handler();

    // Parse CLI arguments
    let args = CliArgs::parse_args();

    // Initialize logging
    init_logging(&args);
    info!("dht-tracker starting");
    debug!("CLI arguments: {:?}", args);

    // Create configuration
    let config = Config::from_args(&args).context("Invalid configuration")?;

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    let (server, handle) = DhtServer::bind(config.bind_addr, config.server_options())
        .await
        .map_err(|e| {
            error!("Failed to start DHT server: {}", e);
            anyhow::Error::from(e)
        })
        .context("Failed to start DHT server")?;
    let server_task = tokio::spawn(server.run());

    let result = match config.lookup_target()? {
        Some(info_hash) => run_lookup(&handle, info_hash, &config).await,
        None => run_node(&handle).await,
    };

    handle.shutdown().await.context("Failed to stop DHT server")?;
    server_task
        .await
        .context("DHT server task failed")?
        .context("DHT server stopped with an error")?;

    info!("dht-tracker finished");
    result
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level {:?}", level);
}

/// Serve other nodes until Ctrl-C
async fn run_node(handle: &DhtHandle) -> Result<()> {
    info!("Serving on {}; press Ctrl-C to stop", handle.local_addr());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!(
        "Interrupted with {} node(s) in the routing table",
        handle.node_count().await.unwrap_or_default()
    );
    Ok(())
}

/// Look up peers for one info hash and print them as they arrive
async fn run_lookup(handle: &DhtHandle, info_hash: NodeId, config: &Config) -> Result<()> {
    info!("Looking up peers for {}", info_hash);
    let mut events = handle.get_peers(info_hash, config.announce_port, config.use_cache)?;

    let mut found = HashSet::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(LookupEvent::Peers { peers, from, .. }) => {
                    debug!("{} peer(s) from {:?}", peers.len(), from);
                    for peer in peers {
                        if found.insert(peer) {
                            println!("{}", peer);
                        }
                    }
                }
                Some(LookupEvent::Done { .. }) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Lookup interrupted");
                break;
            }
        }
    }

    if !config.is_quiet() {
        eprintln!("Found {} peer(s) for {}", found.len(), info_hash);
    }
    if let Some(port) = config.announce_port {
        info!("Announced port {} for {}", port, info_hash);
    }
    Ok(())
}
