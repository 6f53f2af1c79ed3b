//! # btc-node
//!
//! The node supervisor: maintains a pool of live peer connections,
//! discovers new peers from the ones it trusts, pulls blocks in order
//! from the genesis block, and persists the block set across restarts.

pub mod config;
pub mod node;

pub use config::NodeConfig;
pub use node::{Node, NodeState};
