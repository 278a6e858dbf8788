//! Local chunk inventory — the chunks this peer can serve.
//!
//! On disk an inventory is a bincode-encoded map from lowercase hex
//! digest to chunk bytes. The same format is written when a download
//! completes, so a peer can restart with a finished download as its
//! inventory and serve those chunks back.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::chunk::ChunkHash;

/// The in-memory chunk store. Uploads borrow views of these bytes;
/// completed downloads are inserted here before the task is torn down.
#[derive(Debug, Default)]
pub struct Inventory {
    chunks: HashMap<ChunkHash, Bytes>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a serialized inventory file. Keys that are not well-formed
    /// digests fail the decode.
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let raw = std::fs::read(path).map_err(|e| InventoryError::Read(path.to_path_buf(), e))?;
        let map: BTreeMap<ChunkHash, Vec<u8>> = bincode::deserialize(&raw)
            .map_err(|e| InventoryError::Decode(path.to_path_buf(), e))?;
        Ok(Self {
            chunks: map
                .into_iter()
                .map(|(digest, data)| (digest, Bytes::from(data)))
                .collect(),
        })
    }

    /// Serialize back to the on-disk format.
    pub fn save(&self, path: &Path) -> Result<(), InventoryError> {
        let map: BTreeMap<ChunkHash, &[u8]> = self
            .chunks
            .iter()
            .map(|(digest, data)| (*digest, data.as_ref()))
            .collect();
        write_encoded(path, &map)
    }

    pub fn contains(&self, digest: &ChunkHash) -> bool {
        self.chunks.contains_key(digest)
    }

    pub fn get(&self, digest: &ChunkHash) -> Option<&Bytes> {
        self.chunks.get(digest)
    }

    pub fn insert(&mut self, digest: ChunkHash, data: Bytes) {
        self.chunks.insert(digest, data);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn digests(&self) -> impl Iterator<Item = &ChunkHash> {
        self.chunks.keys()
    }
}

/// Persist a completed download's chunk map in the inventory format.
pub fn write_map(path: &Path, chunks: &HashMap<ChunkHash, Vec<u8>>) -> Result<(), InventoryError> {
    let map: BTreeMap<ChunkHash, &[u8]> = chunks
        .iter()
        .map(|(digest, data)| (*digest, data.as_slice()))
        .collect();
    write_encoded(path, &map)
}

fn write_encoded(path: &Path, map: &BTreeMap<ChunkHash, &[u8]>) -> Result<(), InventoryError> {
    let raw = bincode::serialize(map).map_err(InventoryError::Encode)?;
    std::fs::write(path, raw).map_err(|e| InventoryError::Write(path.to_path_buf(), e))
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("failed to decode {0}: {1}")]
    Decode(PathBuf, bincode::Error),

    #[error("failed to encode chunk map: {0}")]
    Encode(bincode::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
