//! Run the analysis peer from the command line
//!
//! `framelink-peer [ADDR]`, where `ADDR` defaults to `127.0.0.1:8000`.

use anyhow::Context;
use framelink_diagnostics::{init_logging, DEFAULT_LOG_FILTER};
use framelink_peer::{AnalysisPeer, PeerConfig};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(DEFAULT_LOG_FILTER)?;

    let mut config = PeerConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address: {}", addr))?;
    }

    let peer = AnalysisPeer::bind(config).await?;
    tracing::info!("Clients can connect to {}", peer.endpoint());

    let handle = peer.spawn();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    let stats = handle.stats();
    tracing::info!(
        "Shutting down after {} connections, {} frames analysed",
        stats.connections_accepted,
        stats.frames_analysed
    );
    handle.shutdown();
    Ok(())
}
