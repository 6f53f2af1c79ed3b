//! Block and transaction payloads.
//!
//! Reference: https://en.bitcoin.it/wiki/Protocol_documentation#block

use crate::codec::{ensure, read_varint, write_varint};
use crate::error::{NetworkError, NetworkResult};
use crate::MAX_SCRIPT_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 256-bit identifier stored in little-endian byte order on the wire.
/// Displayed big-endian, the way block explorers print it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash, used as the genesis parent sentinel and as the
    /// "no stop" marker in getblocks.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Read a 32-byte hash off the buffer.
pub(crate) fn read_hash(buf: &mut &[u8], what: &'static str) -> NetworkResult<Hash256> {
    ensure(buf, 32, what)?;
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Ok(Hash256(bytes))
}

fn read_script(buf: &mut &[u8], what: &'static str) -> NetworkResult<Vec<u8>> {
    let length = read_varint(buf)?;
    if length > MAX_SCRIPT_SIZE {
        return Err(NetworkError::ScriptTooLong { length });
    }
    ensure(buf, length as usize, what)?;
    let script = buf[..length as usize].to_vec();
    buf.advance(length as usize);
    Ok(script)
}

/// Reference to one output of a previous transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutPoint {
    /// Hash of the referenced transaction.
    pub hash: Hash256,
    /// Index of the output within it, starting at 0.
    pub index: u32,
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    /// Script confirming authorization to spend, at most 10 000 bytes.
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.previous_output.hash.0);
        buf.put_u32_le(self.previous_output.index);
        write_varint(buf, self.signature_script.len() as u64);
        buf.put_slice(&self.signature_script);
        buf.put_u32_le(self.sequence);
    }

    fn decode(buf: &mut &[u8]) -> NetworkResult<Self> {
        let hash = read_hash(buf, "outpoint hash")?;
        ensure(buf, 4, "outpoint index")?;
        let index = buf.get_u32_le();
        let signature_script = read_script(buf, "signature script")?;
        ensure(buf, 4, "input sequence")?;
        let sequence = buf.get_u32_le();
        Ok(Self {
            previous_output: OutPoint { hash, index },
            signature_script,
            sequence,
        })
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Value in satoshis, signed on the wire.
    pub value: i64,
    /// Script setting the conditions to claim this output, at most
    /// 10 000 bytes.
    pub pk_script: Vec<u8>,
}

impl TxOut {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.value);
        write_varint(buf, self.pk_script.len() as u64);
        buf.put_slice(&self.pk_script);
    }

    fn decode(buf: &mut &[u8]) -> NetworkResult<Self> {
        ensure(buf, 8, "output value")?;
        let value = buf.get_i64_le();
        let pk_script = read_script(buf, "pubkey script")?;
        Ok(Self { value, pk_script })
    }
}

/// Witness data of one input: a counted list of byte blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxWitness {
    pub components: Vec<Vec<u8>>,
}

impl TxWitness {
    fn encode_into(&self, buf: &mut BytesMut) {
        write_varint(buf, self.components.len() as u64);
        for component in &self.components {
            write_varint(buf, component.len() as u64);
            buf.put_slice(component);
        }
    }

    fn decode(buf: &mut &[u8]) -> NetworkResult<Self> {
        let count = read_varint(buf)?;
        let mut components = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let length = read_varint(buf)? as usize;
            ensure(buf, length, "witness component")?;
            components.push(buf[..length].to_vec());
            buf.advance(length);
        }
        Ok(Self { components })
    }
}

/// A transaction, segwit-aware (BIP 144).
///
/// When witnesses are present the two marker bytes `0x00 0x01` follow the
/// version field and exactly one witness per input follows the outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPayload {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    /// One entry per input when present, empty otherwise.
    pub witnesses: Vec<TxWitness>,
    /// Block number or timestamp at which the transaction unlocks.
    pub lock_time: u32,
}

impl TxPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.version);
        if !self.witnesses.is_empty() {
            buf.put_slice(&[0x00, 0x01]);
        }
        write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode_into(buf);
        }
        write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode_into(buf);
        }
        for witness in &self.witnesses {
            witness.encode_into(buf);
        }
        buf.put_u32_le(self.lock_time);
    }

    pub fn decode(buf: &mut &[u8]) -> NetworkResult<Self> {
        ensure(buf, 4, "transaction version")?;
        let version = buf.get_u32_le();

        // Segwit marker: a zero input count is impossible, so 0x00 0x01
        // here can only be the witness flag.
        let has_witnesses = buf.len() >= 2 && buf[0] == 0x00 && buf[1] == 0x01;
        if has_witnesses {
            buf.advance(2);
        }

        let input_count = read_varint(buf)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            inputs.push(TxIn::decode(buf)?);
        }

        let output_count = read_varint(buf)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            outputs.push(TxOut::decode(buf)?);
        }

        let mut witnesses = Vec::new();
        if has_witnesses {
            witnesses.reserve(inputs.len());
            for _ in 0..inputs.len() {
                witnesses.push(TxWitness::decode(buf)?);
            }
        }

        ensure(buf, 4, "transaction lock time")?;
        let lock_time = buf.get_u32_le();

        Ok(Self {
            version,
            inputs,
            outputs,
            witnesses,
            lock_time,
        })
    }
}

/// A block: the six header fields followed by its transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPayload {
    /// Block version, signed.
    pub version: i32,
    /// Hash of the previous block this one references.
    pub prev_block: Hash256,
    /// Merkle root over the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp of block creation.
    pub timestamp: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Nonce used to vary the header hash.
    pub nonce: u32,
    pub transactions: Vec<TxPayload>,
}

impl BlockPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        self.encode_header_into(buf);
        write_varint(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(buf);
        }
    }

    fn encode_header_into(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.version);
        buf.put_slice(&self.prev_block.0);
        buf.put_slice(&self.merkle_root.0);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
    }

    pub fn decode(buf: &mut &[u8]) -> NetworkResult<Self> {
        ensure(buf, 4, "block version")?;
        let version = buf.get_i32_le();
        let prev_block = read_hash(buf, "previous block hash")?;
        let merkle_root = read_hash(buf, "merkle root")?;
        ensure(buf, 4 + 4 + 4, "block header")?;
        let timestamp = buf.get_u32_le();
        let bits = buf.get_u32_le();
        let nonce = buf.get_u32_le();

        let tx_count = read_varint(buf)?;
        let mut transactions = Vec::with_capacity(tx_count.min(1024) as usize);
        for _ in 0..tx_count {
            transactions.push(TxPayload::decode(buf)?);
        }

        Ok(Self {
            version,
            prev_block,
            merkle_root,
            timestamp,
            bits,
            nonce,
            transactions,
        })
    }

    /// The block identifier: double SHA-256 over the 80-byte header
    /// (the transactions do not participate).
    pub fn block_hash(&self) -> Hash256 {
        let mut header = BytesMut::with_capacity(80);
        self.encode_header_into(&mut header);
        let hash = Sha256::digest(Sha256::digest(&header));
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Hash256(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_message;
    use crate::message::{Command, Payload};
    use crate::GENESIS_BLOCK_HASH;

    // Hexdump example of the tx message from
    // https://en.bitcoin.it/wiki/Protocol_documentation#tx
    #[test]
    fn test_tx_message_encodes_to_known_bytes() {
        let expected = hex::decode(
            "F9BEB4D974780000000000000000000002010000E293CDBE01000000016DBDDB085B1D8A\
             F75184F0BC01FAD58D1266E9B63B50881990E4B40D6AEE3629000000008B483045022100F3581E\
             1972AE8AC7C7367A7A253BC1135223ADB9A468BB3A59233F45BC578380022059AF01CA17D00E41\
             837A1D58E97AA31BAE584EDEC28D35BD96923690913BAE9A0141049C02BFC97EF236CE6D8FE5D9\
             4013C721E915982ACD2B12B65D9B7D59E20A842005F8FC4E02532E873D37B96F09D6D4511ADA8F\
             14042F46614A4C70C0F14BEFF5FFFFFFFF02404B4C00000000001976A9141AA0CD1CBEA6E7458A\
             7ABAD512A9D9EA1AFB225E88AC80FAE9C7000000001976A9140EAB5BEA436A0484CFAB12485EFD\
             A0B78B4ECC5288AC00000000",
        )
        .unwrap();

        let outpoint_hash: [u8; 32] =
            hex::decode("6DBDDB085B1D8AF75184F0BC01FAD58D1266E9B63B50881990E4B40D6AEE3629")
                .unwrap()
                .try_into()
                .unwrap();
        let signature_script = hex::decode(
            "483045022100F3581E1972AE8AC7C7367A7A253BC1135223ADB9A468BB3A59233F45BC57\
             8380022059AF01CA17D00E41837A1D58E97AA31BAE584EDEC28D35BD96923690913BAE9A014104\
             9C02BFC97EF236CE6D8FE5D94013C721E915982ACD2B12B65D9B7D59E20A842005F8FC4E02532E\
             873D37B96F09D6D4511ADA8F14042F46614A4C70C0F14BEFF5",
        )
        .unwrap();
        let pk_script_1 =
            hex::decode("76A9141AA0CD1CBEA6E7458A7ABAD512A9D9EA1AFB225E88AC").unwrap();
        let pk_script_2 =
            hex::decode("76A9140EAB5BEA436A0484CFAB12485EFDA0B78B4ECC5288AC").unwrap();

        let payload = TxPayload {
            version: 1,
            inputs: vec![TxIn {
                previous_output: OutPoint {
                    hash: Hash256(outpoint_hash),
                    index: 0,
                },
                signature_script,
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![
                TxOut {
                    value: 5_000_000,
                    pk_script: pk_script_1,
                },
                TxOut {
                    value: 3_355_443_200,
                    pk_script: pk_script_2,
                },
            ],
            witnesses: Vec::new(),
            lock_time: 0,
        };

        let encoded = encode_message(&Payload::Tx(payload.clone()));
        assert_eq!(encoded.as_ref(), &expected[..]);

        let decoded = Payload::decode(Command::Tx, &encoded[24..]).unwrap();
        assert_eq!(decoded, Payload::Tx(payload));
    }

    #[test]
    fn test_witness_tx_roundtrip() {
        let tx = TxPayload {
            version: 2,
            inputs: vec![TxIn {
                previous_output: OutPoint {
                    hash: Hash256([0x11; 32]),
                    index: 1,
                },
                signature_script: Vec::new(),
                sequence: 0xFFFF_FFFD,
            }],
            outputs: vec![TxOut {
                value: 1_000,
                pk_script: vec![0x51],
            }],
            witnesses: vec![TxWitness {
                components: vec![vec![0xAA; 71], vec![0xBB; 33]],
            }],
            lock_time: 0,
        };

        let encoded = tx.encode();
        // marker bytes follow the version
        assert_eq!(&encoded[4..6], &[0x00, 0x01]);

        let mut slice = &encoded[..];
        let decoded = TxPayload::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(decoded, tx);
    }

    // Marker present but no inputs: the witness list is empty and the
    // lock time follows immediately.
    #[test]
    fn test_witness_marker_with_zero_inputs() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&[0x00, 0x01]); // marker
        raw.push(0x00); // input count
        raw.push(0x00); // output count
        raw.extend_from_slice(&7u32.to_le_bytes()); // lock time

        let mut slice = raw.as_slice();
        let tx = TxPayload::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert!(tx.inputs.is_empty());
        assert!(tx.witnesses.is_empty());
        assert_eq!(tx.lock_time, 7);
    }

    #[test]
    fn test_oversized_signature_script_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.push(0x01); // one input
        raw.extend_from_slice(&[0u8; 36]); // outpoint
        // script length 10 001
        raw.push(0xFD);
        raw.extend_from_slice(&10_001u16.to_le_bytes());

        let mut slice = raw.as_slice();
        let err = TxPayload::decode(&mut slice).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::ScriptTooLong { length: 10_001 }
        ));
    }

    // The genesis block, byte for byte. Its header must hash to the
    // well-known genesis identifier.
    #[test]
    fn test_genesis_block_decodes_and_hashes() {
        let raw = hex::decode(
            "0100000000000000000000000000000000000000000000000000000000000000000000003\
             BA3EDFD7A7B12B27AC72C3E67768F617FC81BC3888A51323A9FB8AA4B1E5E4A29AB5F49FFFF001\
             D1DAC2B7C0101000000010000000000000000000000000000000000000000000000000000000000\
             000000FFFFFFFF4D04FFFF001D0104455468652054696D65732030332F4A616E2F32303039204\
             368616E63656C6C6F72206F6E206272696E6B206F66207365636F6E64206261696C6F757420666\
             F722062616E6B73FFFFFFFF0100F2052A01000000434104678AFDB0FE5548271967F1A67130B71\
             05CD6A828E03909A67962E0EA1F61DEB649F6BC3F4CEF38C4F35504E51EC112DE5C384DF7BA0B8\
             D578A4C702B6BF11D5FAC00000000",
        )
        .unwrap();
        assert_eq!(raw.len(), 285);

        let mut slice = raw.as_slice();
        let block = BlockPayload::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(block.version, 1);
        assert!(block.prev_block.is_zero());
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.block_hash(), GENESIS_BLOCK_HASH);
        assert_eq!(
            block.block_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );

        assert_eq!(block.encode().as_ref(), &raw[..]);
    }

    #[test]
    fn test_block_roundtrip_with_transactions() {
        let block = BlockPayload {
            version: 2,
            prev_block: Hash256([0x22; 32]),
            merkle_root: Hash256([0x33; 32]),
            timestamp: 1_700_000_000,
            bits: 0x1D00_FFFF,
            nonce: 42,
            transactions: vec![TxPayload {
                version: 1,
                inputs: vec![TxIn {
                    previous_output: OutPoint {
                        hash: Hash256::ZERO,
                        index: 0xFFFF_FFFF,
                    },
                    signature_script: vec![0x01, 0x02],
                    sequence: 0xFFFF_FFFF,
                }],
                outputs: vec![TxOut {
                    value: 5_000_000_000,
                    pk_script: vec![0x6A],
                }],
                witnesses: Vec::new(),
                lock_time: 0,
            }],
        };

        let encoded = block.encode();
        let mut slice = &encoded[..];
        let decoded = BlockPayload::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_hash_display_is_big_endian_hex() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xAB;
        assert_eq!(
            Hash256(bytes).to_string(),
            "00000000000000000000000000000000000000000000000000000000000000ab"
        );
    }
}
