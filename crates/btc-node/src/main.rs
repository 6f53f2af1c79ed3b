//! btc-node binary: parse flags, wire up logging and signals, run the
//! supervisor.

use anyhow::{Context, Result};
use btc_network::Services;
use btc_node::config::{DEFAULT_FIRST_PEER, DEFAULT_MIN_PEERS};
use btc_node::{Node, NodeConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Outbound-only Bitcoin P2P node that syncs and persists blocks.
#[derive(Parser, Debug)]
#[command(name = "btc-node", version, about)]
struct Args {
    /// First peer to connect with
    #[arg(long, default_value = DEFAULT_FIRST_PEER)]
    peer: String,

    /// Minimum number of peers the node must stay connected with
    #[arg(long, default_value_t = DEFAULT_MIN_PEERS)]
    min_peers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let first_peer: SocketAddr = tokio::net::lookup_host(&args.peer)
        .await
        .with_context(|| format!("could not resolve first peer {}", args.peer))?
        .next()
        .context("first peer resolved to no addresses")?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting btc-node");

    let config = NodeConfig {
        min_peers: args.min_peers,
        ..NodeConfig::default()
    };
    let node = Node::new(config);
    let state = node.state();

    let restored = state
        .restore_blocks()
        .context("could not read block snapshot")?;
    if restored > 0 {
        info!(restored, "restored blocks from snapshot");
    }

    state
        .add_peer(first_peer, Services::NODE_NETWORK)
        .await
        .with_context(|| format!("could not connect to first peer {first_peer}"))?;

    spawn_signal_handler(Arc::clone(&state))?;

    node.run().await;
    info!("goodbye");
    Ok(())
}

/// Quit the node cleanly on SIGINT, SIGTERM or SIGQUIT.
fn spawn_signal_handler(state: Arc<btc_node::NodeState>) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }
        info!("shutdown signal received");
        state.quit();
    });
    Ok(())
}
