//! # btc-network
//!
//! P2P networking layer for a Bitcoin client node.
//!
//! This crate provides:
//! - The Bitcoin wire protocol message codec
//! - The version/verack opening handshake (with BIP 339 wtxidrelay)
//! - The peer actor: one connection driven by reader, dispatcher and
//!   writer tasks

pub mod block;
pub mod codec;
mod error;
pub mod handshake;
pub mod message;
pub mod peer;

pub use block::{BlockPayload, Hash256, OutPoint, TxIn, TxOut, TxPayload, TxWitness};
pub use codec::{checksum, encode_message, read_message, Message, MessageHeader};
pub use error::{NetworkError, NetworkResult};
pub use handshake::{perform_handshake, HandshakeConfig};
pub use message::{
    Address, AddrPayload, Command, GetBlocksPayload, GetDataPayload, Inventory, InventoryType,
    InvPayload, NetworkAddress, Payload, PingPayload, PongPayload, Services, VersionPayload,
};
pub use peer::{OnQuit, Peer, PeerEvent, PeerId};

/// Default P2P port for mainnet.
pub const DEFAULT_PORT: u16 = 8333;

/// Protocol magic value for mainnet, written little-endian on the wire.
pub const MAINNET_MAGIC: u32 = 0xD9B4_BEF9;

/// Highest protocol version this node speaks.
pub const PROTOCOL_VERSION: i32 = 70015;

/// Protocol version at which the wtxidrelay exchange becomes mandatory
/// (BIP 339).
pub const WTXID_RELAY_VERSION: i32 = 70016;

/// User agent advertised in our version message (BIP 14 form).
pub const USER_AGENT: &str = "/btc-rust-node:0.1.0/";

/// Maximum payload size accepted in a message header.
pub const MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

/// Maximum length of a signature or pubkey script.
pub const MAX_SCRIPT_SIZE: u64 = 10_000;

/// Maximum number of entries in an inv or getdata message.
pub const MAX_INV_ENTRIES: u64 = 50_000;

/// Maximum number of entries in an addr message.
pub const MAX_ADDR_ENTRIES: u64 = 1_000;

/// Hash of the genesis block, little-endian byte order.
///
/// https://bitcoinexplorer.org/block/000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f
pub const GENESIS_BLOCK_HASH: Hash256 = Hash256([
    0x6f, 0xe2, 0x8c, 0x0a, 0xb6, 0xf1, 0xb3, 0x72, 0xc1, 0xa6, 0xa2, 0x46, 0xae, 0x63, 0xf7,
    0x4f, 0x93, 0x1e, 0x83, 0x65, 0xe1, 0x5a, 0x08, 0x9c, 0x68, 0xd6, 0x19, 0x00, 0x00, 0x00,
    0x00, 0x00,
]);
