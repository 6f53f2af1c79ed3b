//! Network error types.

use crate::message::Command;
use thiserror::Error;

/// Errors produced by the wire codec, the handshake and the peer actor.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Header announced a payload larger than the 32 MiB cap.
    #[error("payload too big: {length} bytes")]
    PayloadTooBig { length: u32 },

    /// Payload checksum did not match the header.
    #[error("invalid checksum")]
    InvalidChecksum,

    /// A command that carries no payload arrived with a non-empty one.
    #[error("invalid payload length for {command}: {length} bytes")]
    InvalidPayloadLength { command: Command, length: u32 },

    /// Signature or pubkey script exceeded the 10 000 byte cap.
    #[error("script too long: {length} bytes")]
    ScriptTooLong { length: u64 },

    /// inv or getdata exceeded the 50 000 entry cap.
    #[error("exceeded max inv count: {count}")]
    TooManyInventories { count: u64 },

    /// addr exceeded the 1 000 entry cap.
    #[error("exceeded max address count: {count}")]
    TooManyAddresses { count: u64 },

    /// Payload ended before the field being read. Fatal to the peer.
    #[error("truncated {0}")]
    Truncated(&'static str),

    /// Command tag outside the known set. Recoverable: the reader logs
    /// and skips the frame.
    #[error("unknown command: {command:?}")]
    UnknownCommand { command: String },

    /// A handshake step received a different command than it required.
    #[error("invalid command: expected {expected}, got {got}")]
    InvalidCommand { expected: Command, got: Command },

    /// Message carried a magic value for a different network.
    #[error("invalid magic: {0:#010x}")]
    InvalidMagic(u32),

    /// The remote advertises a protocol version newer than ours.
    #[error("protocol version not supported: {0}")]
    VersionNotSupported(i32),

    /// A handshake step did not complete within its deadline.
    #[error("handshake timed out during {0}")]
    HandshakeTimeout(&'static str),

    /// The transport was closed by the remote or by a local quit.
    #[error("connection closed")]
    ConnectionClosed,

    /// An address request is already waiting for its reply.
    #[error("getaddr request already in flight")]
    GetAddrInFlight,

    /// I/O error on the transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// True for errors the peer reader may skip over instead of quitting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, NetworkError::UnknownCommand { .. })
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
