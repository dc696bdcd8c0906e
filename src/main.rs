//! math-proxy: a Stratum proxy that validates shares before relaying them
//!
//! - Accepts Stratum v1 miners over TCP
//! - Hashes every submitted share and checks it against the session target
//! - Relays accepted shares toward the upstream pool
//! - Configuration via CLI arguments or a JSON/TOML file

use std::sync::Arc;

use math_proxy::config::Config;
use math_proxy::hasher::Sha256Rounds;
use math_proxy::server::Server;
use math_proxy::upstream::LoggingUpstream;
use tokio::signal::unix::{self, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    for warning in &config.warnings {
        warn!("Could not load config file: {warning}");
    }

    info!(
        listen = %config.listen_addr,
        upstream = %config.upstream_addr,
        difficulty = config.difficulty,
        extranonce2_size = config.extranonce2_size,
        max_connections = config.max_connections,
        debug = config.debug,
        "Starting math-proxy"
    );

    let upstream = Arc::new(LoggingUpstream::new(&config.upstream_addr));
    let mut server = Server::bind(&config, Arc::new(Sha256Rounds), upstream.clone()).await?;
    server.start();

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT");
        },
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        },
    }

    let closed = server.shutdown().await;
    info!(
        sessions_closed = closed,
        shares_relayed = upstream.relayed(),
        "Exiting"
    );

    Ok(())
}
