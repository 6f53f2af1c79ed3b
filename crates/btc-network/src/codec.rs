//! Bitcoin P2P message framing.
//!
//! Every message on the wire is a 24-byte header followed by the payload:
//!
//! ```text
//! +----------+-----------+----------+----------+
//! |  Magic   |  Command  |  Length  | Checksum |
//! | 4 bytes  | 12 bytes  | 4 bytes  | 4 bytes  |
//! +----------+-----------+----------+----------+
//! |                 Payload                    |
//! |              (Length bytes)                |
//! +--------------------------------------------+
//! ```
//!
//! - Magic: network identifier, little-endian
//! - Command: ASCII command name, right-padded with zero bytes
//! - Length: payload length in bytes, little-endian
//! - Checksum: first 4 bytes of SHA256(SHA256(payload))

use crate::error::{NetworkError, NetworkResult};
use crate::message::{Command, Payload};
use crate::{MAINNET_MAGIC, MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Header size: magic (4) + command (12) + length (4) + checksum (4).
pub const HEADER_SIZE: usize = 24;

/// Checksum of the empty payload, as carried by verack and getaddr.
pub const EMPTY_PAYLOAD_CHECKSUM: [u8; 4] = [0x5D, 0xF6, 0xE0, 0xE2];

/// First 4 bytes of the double SHA-256 of the payload.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = Sha256::digest(Sha256::digest(payload));
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Header of a framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Magic value indicating the originating network.
    pub magic: u32,
    /// Raw 12-byte command name.
    pub command: [u8; 12],
    /// Number of payload bytes following the header.
    pub length: u32,
    /// First 4 bytes of the double SHA-256 of the payload.
    pub checksum: [u8; 4],
}

impl MessageHeader {
    /// Parse a header and validate the announced payload length.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> NetworkResult<Self> {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut command = [0u8; 12];
        command.copy_from_slice(&bytes[4..16]);
        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);

        if length > MAX_PAYLOAD_SIZE {
            return Err(NetworkError::PayloadTooBig { length });
        }

        Ok(Self {
            magic,
            command,
            length,
            checksum,
        })
    }
}

/// A decoded message together with the magic value it arrived under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Magic value from the header.
    pub magic: u32,
    /// Decoded payload.
    pub payload: Payload,
}

impl Message {
    /// Command tag of the payload.
    pub fn command(&self) -> Command {
        self.payload.command()
    }
}

/// Encode a payload into a complete framed message for mainnet.
pub fn encode_message(payload: &Payload) -> Bytes {
    let body = payload.encode();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());

    buf.put_u32_le(MAINNET_MAGIC);
    buf.put_slice(&payload.command().to_bytes());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&checksum(&body));
    buf.put_slice(&body);

    buf.freeze()
}

/// Read one framed message from the transport.
///
/// The payload-length cap is enforced before any payload byte is read.
/// The whole frame is consumed before command dispatch, so an unknown
/// command leaves the stream aligned on the next header and the caller
/// may keep reading.
pub async fn read_message<R>(reader: &mut R) -> NetworkResult<Message>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).await.map_err(map_eof)?;
    let header = MessageHeader::parse(&header_bytes)?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;

    if checksum(&payload) != header.checksum {
        return Err(NetworkError::InvalidChecksum);
    }

    let command = Command::from_wire(&header.command)?;
    let payload = Payload::decode(command, &payload)?;

    Ok(Message {
        magic: header.magic,
        payload,
    })
}

fn map_eof(e: std::io::Error) -> NetworkError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        NetworkError::ConnectionClosed
    } else {
        NetworkError::Io(e)
    }
}

/// Fail with a truncation error unless `needed` bytes remain.
pub fn ensure(buf: &impl Buf, needed: usize, what: &'static str) -> NetworkResult<()> {
    if buf.remaining() < needed {
        return Err(NetworkError::Truncated(what));
    }
    Ok(())
}

/// Decode a variable-length integer.
///
/// Any well-formed encoding is accepted; minimality is not enforced.
pub fn read_varint(buf: &mut &[u8]) -> NetworkResult<u64> {
    ensure(buf, 1, "varint")?;
    match buf.get_u8() {
        0xFD => {
            ensure(buf, 2, "varint")?;
            Ok(u64::from(buf.get_u16_le()))
        }
        0xFE => {
            ensure(buf, 4, "varint")?;
            Ok(u64::from(buf.get_u32_le()))
        }
        0xFF => {
            ensure(buf, 8, "varint")?;
            Ok(buf.get_u64_le())
        }
        small => Ok(u64::from(small)),
    }
}

/// Encode a variable-length integer in its smallest form.
pub fn write_varint(buf: &mut BytesMut, value: u64) {
    if value < 0xFD {
        buf.put_u8(value as u8);
    } else if value <= 0xFFFF {
        buf.put_u8(0xFD);
        buf.put_u16_le(value as u16);
    } else if value <= 0xFFFF_FFFF {
        buf.put_u8(0xFE);
        buf.put_u32_le(value as u32);
    } else {
        buf.put_u8(0xFF);
        buf.put_u64_le(value);
    }
}
