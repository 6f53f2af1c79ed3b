//! Node configuration.

use btc_network::{HandshakeConfig, Services, PROTOCOL_VERSION, USER_AGENT};
use std::path::PathBuf;
use std::time::Duration;

/// Default first peer to dial.
///
/// https://bitnodes.io/nodes/46.166.142.2:8333/
pub const DEFAULT_FIRST_PEER: &str = "46.166.142.2:8333";

/// Default minimum number of live peers the node maintains.
pub const DEFAULT_MIN_PEERS: usize = 5;

/// Default block snapshot file, relative to the working directory.
pub const DEFAULT_BLOCKS_FILE: &str = "blocks.dat";

/// Immutable node configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Protocol version advertised and accepted up to.
    pub protocol_version: i32,
    /// Services advertised to peers.
    pub services: Services,
    /// Minimum number of live peers to maintain.
    pub min_peers: usize,
    /// User agent advertised in the version message.
    pub user_agent: String,
    /// Interval of the supervisor's periodic sync tick.
    pub tick_interval: Duration,
    /// Bound on dialing and on each handshake step.
    pub dial_timeout: Duration,
    /// How long to wait for a getaddr reply before dropping the peer.
    pub getaddr_wait: Duration,
    /// Path of the block snapshot.
    pub blocks_file: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            services: Services::NODE_NETWORK,
            min_peers: DEFAULT_MIN_PEERS,
            user_agent: USER_AGENT.to_string(),
            tick_interval: Duration::from_secs(20),
            dial_timeout: Duration::from_secs(10),
            getaddr_wait: Duration::from_secs(10),
            blocks_file: PathBuf::from(DEFAULT_BLOCKS_FILE),
        }
    }
}

impl NodeConfig {
    /// Handshake parameters derived from this configuration.
    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            protocol_version: self.protocol_version,
            local_services: self.services,
            user_agent: self.user_agent.clone(),
            dial_timeout: self.dial_timeout,
        }
    }
}
