//! Protocol messages and their payload codecs.
//!
//! The payload of every known command is one variant of the tagged
//! [`Payload`] enum; the codec dispatches on the header's command name and
//! produces the matching variant, so a command can never be paired with the
//! wrong payload shape.
//!
//! Reference: https://en.bitcoin.it/wiki/Protocol_documentation

use crate::block::{read_hash, BlockPayload, Hash256, TxPayload};
use crate::codec::{ensure, read_varint, write_varint};
use crate::error::{NetworkError, NetworkResult};
use crate::{MAX_ADDR_ENTRIES, MAX_INV_ENTRIES};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// ASCII command names of the known message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    WtxidRelay,
    SendAddrV2,
    GetAddr,
    Addr,
    GetBlocks,
    Inv,
    GetData,
    Block,
    Tx,
    Ping,
    Pong,
}

impl Command {
    /// Command name as it appears in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::WtxidRelay => "wtxidrelay",
            Command::SendAddrV2 => "sendaddrv2",
            Command::GetAddr => "getaddr",
            Command::Addr => "addr",
            Command::GetBlocks => "getblocks",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::Block => "block",
            Command::Tx => "tx",
            Command::Ping => "ping",
            Command::Pong => "pong",
        }
    }

    /// The 12-byte command field, right-padded with zero bytes.
    pub fn to_bytes(&self) -> [u8; 12] {
        let name = self.as_str().as_bytes();
        let mut padded = [0u8; 12];
        padded[..name.len()].copy_from_slice(name);
        padded
    }

    /// Parse a wire command field. Unrecognised names yield the
    /// recoverable unknown-command error carrying the offending tag.
    pub fn from_wire(bytes: &[u8; 12]) -> NetworkResult<Self> {
        let name = match std::str::from_utf8(bytes) {
            Ok(s) => s.trim_end_matches('\0'),
            Err(_) => "",
        };
        match name {
            "version" => Ok(Command::Version),
            "verack" => Ok(Command::Verack),
            "wtxidrelay" => Ok(Command::WtxidRelay),
            "sendaddrv2" => Ok(Command::SendAddrV2),
            "getaddr" => Ok(Command::GetAddr),
            "addr" => Ok(Command::Addr),
            "getblocks" => Ok(Command::GetBlocks),
            "inv" => Ok(Command::Inv),
            "getdata" => Ok(Command::GetData),
            "block" => Ok(Command::Block),
            "tx" => Ok(Command::Tx),
            "ping" => Ok(Command::Ping),
            "pong" => Ok(Command::Pong),
            _ => Err(NetworkError::UnknownCommand {
                command: String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .to_string(),
            }),
        }
    }

    /// True for commands whose payload must be empty.
    pub fn is_empty_payload(&self) -> bool {
        matches!(
            self,
            Command::Verack | Command::WtxidRelay | Command::SendAddrV2 | Command::GetAddr
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service flags advertised by a node, encoded as a little-endian u64
/// bitfield in version messages and network addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Services(pub u64);

impl Services {
    /// Not a full node.
    pub const UNNAMED: Services = Services(0);
    /// Full node, can be asked for full blocks.
    pub const NODE_NETWORK: Services = Services(1);
    /// Responds to getutxo (BIP 64). Not supported by maintained nodes.
    pub const NODE_GETUTXO: Services = Services(2);
    /// Handles bloom-filtered connections (BIP 111).
    pub const NODE_BLOOM: Services = Services(4);
    /// Serves blocks and transactions with witness data (BIP 144).
    pub const NODE_WITNESS: Services = Services(8);
    /// Supports Xtreme Thinblocks. Not supported by maintained nodes.
    pub const NODE_XTHIN: Services = Services(16);
    /// Serves compact block filters (BIP 157).
    pub const NODE_COMPACT_FILTERS: Services = Services(64);
    /// Full node keeping at least the last 288 blocks (BIP 159).
    pub const NODE_NETWORK_LIMITED: Services = Services(1024);

    /// True if every bit of `other` is set.
    pub const fn contains(self, other: Services) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Network address of a node as carried in version and addr payloads:
/// services (8 bytes LE), IP (16 bytes BE, IPv4-mapped form for v4),
/// port (2 bytes BE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub services: Services,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(services: Services, ip: IpAddr, port: u16) -> Self {
        Self { services, ip, port }
    }

    /// The address in its canonical 16-byte wire form.
    pub fn ip_octets(&self) -> [u8; 16] {
        match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.services.0);
        buf.put_slice(&self.ip_octets());
        buf.put_u16(self.port);
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> NetworkResult<Self> {
        ensure(buf, 8 + 16 + 2, "network address")?;
        let services = Services(buf.get_u64_le());
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port = buf.get_u16();
        Ok(Self { services, ip, port })
    }
}

/// The version payload opens every connection (it is the only payload
/// accepted before the handshake completes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    /// Highest protocol version understood by the transmitting node.
    pub version: i32,
    /// Services supported by the transmitting node.
    pub services: Services,
    /// Unix time according to the transmitting node's clock.
    pub timestamp: i64,
    /// Receiving node as perceived by the transmitting node.
    pub addr_recv: NetworkAddress,
    /// Transmitting node.
    pub addr_from: NetworkAddress,
    /// Random nonce used to detect connections to self.
    pub nonce: u64,
    /// User agent (BIP 14).
    pub user_agent: String,
    /// Height of the transmitting node's best block.
    pub start_height: i32,
    /// Whether the remote peer should announce relayed transactions
    /// (BIP 37).
    pub relay: bool,
}

impl VersionPayload {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services.0);
        buf.put_i64_le(self.timestamp);
        self.addr_recv.encode_into(buf);
        self.addr_from.encode_into(buf);
        buf.put_u64_le(self.nonce);
        write_varint(buf, self.user_agent.len() as u64);
        buf.put_slice(self.user_agent.as_bytes());
        buf.put_i32_le(self.start_height);
        buf.put_u8(u8::from(self.relay));
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> NetworkResult<Self> {
        ensure(buf, 4 + 8 + 8, "version payload")?;
        let version = buf.get_i32_le();
        let services = Services(buf.get_u64_le());
        let timestamp = buf.get_i64_le();
        let addr_recv = NetworkAddress::decode(buf)?;
        let addr_from = NetworkAddress::decode(buf)?;
        ensure(buf, 8, "version nonce")?;
        let nonce = buf.get_u64_le();
        let agent_len = read_varint(buf)? as usize;
        ensure(buf, agent_len, "user agent")?;
        let user_agent = String::from_utf8_lossy(&buf[..agent_len]).into_owned();
        buf.advance(agent_len);
        ensure(buf, 4 + 1, "version payload")?;
        let start_height = buf.get_i32_le();
        let relay = buf.get_u8() != 0;
        Ok(Self {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// One entry of an addr payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Last-seen time of the node.
    pub timestamp: u32,
    pub address: NetworkAddress,
}

/// Known addresses of other nodes, sent in reply to getaddr or
/// unsolicited as a self-announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrPayload {
    pub addresses: Vec<Address>,
}

impl AddrPayload {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        write_varint(buf, self.addresses.len() as u64);
        for entry in &self.addresses {
            buf.put_u32_le(entry.timestamp);
            entry.address.encode_into(buf);
        }
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> NetworkResult<Self> {
        let count = read_varint(buf)?;
        if count > MAX_ADDR_ENTRIES {
            return Err(NetworkError::TooManyAddresses { count });
        }
        let mut addresses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ensure(buf, 4, "addr entry")?;
            let timestamp = buf.get_u32_le();
            let address = NetworkAddress::decode(buf)?;
            addresses.push(Address { timestamp, address });
        }
        Ok(Self { addresses })
    }
}

/// Type tag of an inventory entry, a little-endian u32 on the wire.
/// Unassigned values are carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryType(pub u32);

impl InventoryType {
    pub const ERROR: InventoryType = InventoryType(0);
    pub const TX: InventoryType = InventoryType(1);
    pub const BLOCK: InventoryType = InventoryType(2);
    pub const FILTERED_BLOCK: InventoryType = InventoryType(3);
    pub const CMPCT_BLOCK: InventoryType = InventoryType(4);
    pub const WITNESS_TX: InventoryType = InventoryType(0x4000_0001);
    pub const WITNESS_BLOCK: InventoryType = InventoryType(0x4000_0002);
    pub const WITNESS_FILTERED_BLOCK: InventoryType = InventoryType(0x4000_0003);

    /// True for the plain and witness block tags.
    pub fn is_block(&self) -> bool {
        *self == Self::BLOCK || *self == Self::WITNESS_BLOCK
    }
}

/// A (type, hash) pair identifying an advertised or requested object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inventory {
    pub kind: InventoryType,
    pub hash: Hash256,
}

fn write_inventories(buf: &mut BytesMut, inventories: &[Inventory]) {
    write_varint(buf, inventories.len() as u64);
    for inv in inventories {
        buf.put_u32_le(inv.kind.0);
        buf.put_slice(&inv.hash.0);
    }
}

fn read_inventories(buf: &mut &[u8]) -> NetworkResult<Vec<Inventory>> {
    let count = read_varint(buf)?;
    if count > MAX_INV_ENTRIES {
        return Err(NetworkError::TooManyInventories { count });
    }
    let mut inventories = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ensure(buf, 4, "inventory entry")?;
        let kind = InventoryType(buf.get_u32_le());
        let hash = read_hash(buf, "inventory hash")?;
        inventories.push(Inventory { kind, hash });
    }
    Ok(inventories)
}

/// Objects the sender advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvPayload {
    pub inventories: Vec<Inventory>,
}

/// Objects the sender requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDataPayload {
    pub inventories: Vec<Inventory>,
}

/// Asks a peer for an inv of up to 500 blocks following the locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksPayload {
    /// Protocol version, same value as in the version message.
    pub version: u32,
    /// Block hashes in reverse height order; the peer finds the first one
    /// it knows and replies with the blocks after it.
    pub locator_hashes: Vec<Hash256>,
    /// Hash of the last desired block; zero requests the maximum (500).
    pub hash_stop: Hash256,
}

impl GetBlocksPayload {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.version);
        write_varint(buf, self.locator_hashes.len() as u64);
        for hash in &self.locator_hashes {
            buf.put_slice(&hash.0);
        }
        buf.put_slice(&self.hash_stop.0);
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> NetworkResult<Self> {
        ensure(buf, 4, "getblocks payload")?;
        let version = buf.get_u32_le();
        let count = read_varint(buf)?;
        let mut locator_hashes = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            locator_hashes.push(read_hash(buf, "locator hash")?);
        }
        let hash_stop = read_hash(buf, "hash stop")?;
        Ok(Self {
            version,
            locator_hashes,
            hash_stop,
        })
    }
}

/// Liveness probe; the receiver answers with a pong carrying the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPayload {
    pub nonce: u64,
}

/// Reply to a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongPayload {
    pub nonce: u64,
}

fn read_nonce(buf: &mut &[u8], what: &'static str) -> NetworkResult<u64> {
    ensure(buf, 8, what)?;
    Ok(buf.get_u64_le())
}

/// Payload of a protocol message, tagged by command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Version(VersionPayload),
    Verack,
    WtxidRelay,
    SendAddrV2,
    GetAddr,
    Addr(AddrPayload),
    GetBlocks(GetBlocksPayload),
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
    Ping(PingPayload),
    Pong(PongPayload),
}

impl Payload {
    /// Command tag this payload travels under.
    pub fn command(&self) -> Command {
        match self {
            Payload::Version(_) => Command::Version,
            Payload::Verack => Command::Verack,
            Payload::WtxidRelay => Command::WtxidRelay,
            Payload::SendAddrV2 => Command::SendAddrV2,
            Payload::GetAddr => Command::GetAddr,
            Payload::Addr(_) => Command::Addr,
            Payload::GetBlocks(_) => Command::GetBlocks,
            Payload::Inv(_) => Command::Inv,
            Payload::GetData(_) => Command::GetData,
            Payload::Block(_) => Command::Block,
            Payload::Tx(_) => Command::Tx,
            Payload::Ping(_) => Command::Ping,
            Payload::Pong(_) => Command::Pong,
        }
    }

    /// Encode the payload body (without the frame header).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Payload::Version(p) => p.encode_into(&mut buf),
            Payload::Verack | Payload::WtxidRelay | Payload::SendAddrV2 | Payload::GetAddr => {}
            Payload::Addr(p) => p.encode_into(&mut buf),
            Payload::GetBlocks(p) => p.encode_into(&mut buf),
            Payload::Inv(p) => write_inventories(&mut buf, &p.inventories),
            Payload::GetData(p) => write_inventories(&mut buf, &p.inventories),
            Payload::Block(p) => p.encode_into(&mut buf),
            Payload::Tx(p) => p.encode_into(&mut buf),
            Payload::Ping(p) => buf.put_u64_le(p.nonce),
            Payload::Pong(p) => buf.put_u64_le(p.nonce),
        }
        buf.freeze()
    }

    /// Decode the payload body for a known command.
    ///
    /// Trailing bytes after the last field are tolerated, except for the
    /// commands that carry no payload at all.
    pub fn decode(command: Command, payload: &[u8]) -> NetworkResult<Self> {
        if command.is_empty_payload() && !payload.is_empty() {
            return Err(NetworkError::InvalidPayloadLength {
                command,
                length: payload.len() as u32,
            });
        }
        let mut buf = payload;
        let decoded = match command {
            Command::Version => Payload::Version(VersionPayload::decode(&mut buf)?),
            Command::Verack => Payload::Verack,
            Command::WtxidRelay => Payload::WtxidRelay,
            Command::SendAddrV2 => Payload::SendAddrV2,
            Command::GetAddr => Payload::GetAddr,
            Command::Addr => Payload::Addr(AddrPayload::decode(&mut buf)?),
            Command::GetBlocks => Payload::GetBlocks(GetBlocksPayload::decode(&mut buf)?),
            Command::Inv => Payload::Inv(InvPayload {
                inventories: read_inventories(&mut buf)?,
            }),
            Command::GetData => Payload::GetData(GetDataPayload {
                inventories: read_inventories(&mut buf)?,
            }),
            Command::Block => Payload::Block(BlockPayload::decode(&mut buf)?),
            Command::Tx => Payload::Tx(TxPayload::decode(&mut buf)?),
            Command::Ping => Payload::Ping(PingPayload {
                nonce: read_nonce(&mut buf, "ping nonce")?,
            }),
            Command::Pong => Payload::Pong(PongPayload {
                nonce: read_nonce(&mut buf, "pong nonce")?,
            }),
        };
        Ok(decoded)
    }
}
