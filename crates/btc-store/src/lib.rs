//! # btc-store
//!
//! Append-only block collection with an O(1) hash index and a wire-format
//! snapshot on disk.
//!
//! The snapshot is a varint block count followed by that many block
//! payloads encoded exactly as on the wire, with no frame headers.

use btc_network::codec::{read_varint, write_varint};
use btc_network::{BlockPayload, Hash256, NetworkError};
use bytes::BytesMut;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from snapshot persistence.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store holds no blocks; nothing is written.
    #[error("no blocks to snapshot")]
    Empty,

    /// A block in the snapshot failed to decode.
    #[error("snapshot decode failed: {0}")]
    Decode(#[from] NetworkError),

    /// I/O error reading or writing the snapshot.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Default)]
struct StoreInner {
    /// Blocks in insertion order.
    blocks: Vec<BlockPayload>,
    /// Hashes of every stored block.
    index: HashSet<Hash256>,
}

/// The node's block set. One lock guards both collections so the ordered
/// list and the hash index always agree in membership.
#[derive(Default)]
pub struct BlockStore {
    inner: RwLock<StoreInner>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block unless its hash is already indexed. Returns whether
    /// the block was new.
    pub fn insert(&self, block: BlockPayload) -> bool {
        let hash = block.block_hash();
        let mut inner = self.inner.write();
        if !inner.index.insert(hash) {
            return false;
        }
        inner.blocks.push(block);
        true
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.inner.read().index.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().blocks.is_empty()
    }

    /// Hash of the block with the greatest timestamp, the node's working
    /// notion of its tip.
    pub fn tip_hash(&self) -> Option<Hash256> {
        let inner = self.inner.read();
        inner
            .blocks
            .iter()
            .max_by_key(|block| block.timestamp)
            .map(BlockPayload::block_hash)
    }

    /// Previous-block hashes referenced by stored blocks but not stored
    /// themselves. The zero hash marks the genesis parent and is never
    /// reported.
    pub fn missing_parent_hashes(&self) -> Vec<Hash256> {
        let inner = self.inner.read();
        inner
            .blocks
            .iter()
            .filter(|block| {
                !block.prev_block.is_zero() && !inner.index.contains(&block.prev_block)
            })
            .map(|block| block.prev_block)
            .collect()
    }

    /// Write a snapshot of every stored block to `path`.
    ///
    /// The data is staged under /tmp and renamed over the target, so a
    /// crash mid-write cannot leave a truncated snapshot at the target.
    pub fn dump(&self, path: &Path) -> StoreResult<usize> {
        let (count, encoded) = {
            let inner = self.inner.read();
            if inner.blocks.is_empty() {
                return Err(StoreError::Empty);
            }
            let mut buf = BytesMut::new();
            write_varint(&mut buf, inner.blocks.len() as u64);
            for block in &inner.blocks {
                block.encode_into(&mut buf);
            }
            (inner.blocks.len(), buf.freeze())
        };

        let staging = staging_path(path);
        fs::write(&staging, &encoded)?;
        fs::rename(&staging, path)?;
        Ok(count)
    }

    /// Load a snapshot from `path`, ingesting each block through the
    /// normal dedup path. A missing file leaves the store empty; any
    /// decode error is fatal.
    pub fn restore(&self, path: &Path) -> StoreResult<usize> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot found, starting fresh");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut buf = data.as_slice();
        let count = read_varint(&mut buf)?;
        let mut restored = 0;
        for _ in 0..count {
            let block = BlockPayload::decode(&mut buf)?;
            if self.insert(block) {
                restored += 1;
            }
        }
        Ok(restored)
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let name = target.file_name().unwrap_or_else(|| OsStr::new("blocks"));
    Path::new("/tmp").join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(prev: Hash256, timestamp: u32) -> BlockPayload {
        BlockPayload {
            version: 1,
            prev_block: prev,
            merkle_root: Hash256([0x77; 32]),
            timestamp,
            bits: 0x1D00_FFFF,
            nonce: 0,
            transactions: Vec::new(),
        }
    }

    #[test]
    fn test_insert_deduplicates_by_hash() {
        let store = BlockStore::new();
        let b = block(Hash256::ZERO, 1);

        assert!(store.insert(b.clone()));
        assert!(!store.insert(b.clone()));
        assert_eq!(store.len(), 1);
        assert!(store.contains(&b.block_hash()));
    }

    #[test]
    fn test_tip_is_block_with_greatest_timestamp() {
        let store = BlockStore::new();
        assert_eq!(store.tip_hash(), None);

        let older = block(Hash256::ZERO, 10);
        let newer = block(older.block_hash(), 20);
        let newest = block(newer.block_hash(), 30);
        store.insert(newest.clone());
        store.insert(older);
        store.insert(newer);

        assert_eq!(store.tip_hash(), Some(newest.block_hash()));
    }

    #[test]
    fn test_missing_parent_hashes() {
        let store = BlockStore::new();

        let genesis_like = block(Hash256::ZERO, 1);
        let child = block(genesis_like.block_hash(), 2);
        let orphan = block(Hash256([0xAB; 32]), 3);

        store.insert(genesis_like);
        store.insert(child);
        assert!(store.missing_parent_hashes().is_empty());

        store.insert(orphan);
        assert_eq!(store.missing_parent_hashes(), vec![Hash256([0xAB; 32])]);
    }

    #[test]
    fn test_dump_and_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store-roundtrip.dat");

        let store = BlockStore::new();
        let first = block(Hash256::ZERO, 1);
        let second = block(first.block_hash(), 2);
        store.insert(first);
        store.insert(second.clone());

        assert_eq!(store.dump(&path).unwrap(), 2);

        let restored = BlockStore::new();
        assert_eq!(restored.restore(&path).unwrap(), 2);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.tip_hash(), Some(second.block_hash()));
        assert!(restored.missing_parent_hashes().is_empty());
    }

    #[test]
    fn test_restore_missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new();
        assert_eq!(store.restore(&dir.path().join("absent.dat")).unwrap(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_restore_rejects_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store-corrupt.dat");
        // claims one block, provides three bytes
        fs::write(&path, [0x01, 0xAA, 0xBB, 0xCC]).unwrap();

        let store = BlockStore::new();
        assert!(matches!(
            store.restore(&path),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn test_dump_refuses_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new();
        assert!(matches!(
            store.dump(&dir.path().join("store-empty.dat")),
            Err(StoreError::Empty)
        ));
    }
}
