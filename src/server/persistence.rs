//! Durable chunk storage.
//!
//! The world only needs a key-value blob table: save a chunk's sparse
//! payload under its chunk coordinate, load it back, bulk-save on shutdown.
//! Failures are logged and degraded. A broken store must never take the
//! world down; the chunk just regenerates next time.

use crate::shared::chunk_payload::{decode_chunk, encode_chunk};
use crate::shared::spatial::ChunkPosition;
use crate::shared::voxel::ChunkBuffer;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::Path;

/// Persistence port. One implementation is an embedded key-value table keyed
/// by chunk coordinate with the SCO1 payload as value.
pub trait ChunkPersistence: Send {
    /// Upsert. False on failure (already logged).
    fn save_chunk(&self, chunk: &ChunkBuffer) -> bool;

    /// `None` for absent keys and for malformed blobs (after logging).
    fn load_chunk(&self, position: ChunkPosition) -> Option<ChunkBuffer>;

    /// Best-effort bulk save.
    fn save_all(&self, chunks: &HashMap<ChunkPosition, ChunkBuffer>) {
        for chunk in chunks.values() {
            self.save_chunk(chunk);
        }
    }
}

/// sled-backed chunk store: one `chunks` tree, key = `(x, y, z)` as three
/// little-endian i32s, value = SCO1 bytes.
pub struct SledChunkStore {
    // The Db handle keeps the on-disk context alive for the tree.
    _db: sled::Db,
    tree: sled::Tree,
}

fn chunk_key(position: ChunkPosition) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[0..4].copy_from_slice(&position.x.to_le_bytes());
    key[4..8].copy_from_slice(&position.y.to_le_bytes());
    key[8..12].copy_from_slice(&position.z.to_le_bytes());
    key
}

impl SledChunkStore {
    /// Open (creating if absent) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        let tree = db.open_tree("chunks")?;
        Ok(Self { _db: db, tree })
    }

    /// Number of stored chunks (test and tooling helper).
    pub fn chunk_count(&self) -> usize {
        self.tree.len()
    }

    pub fn contains(&self, position: ChunkPosition) -> bool {
        self.tree.contains_key(chunk_key(position)).unwrap_or(false)
    }
}

impl ChunkPersistence for SledChunkStore {
    fn save_chunk(&self, chunk: &ChunkBuffer) -> bool {
        let position = chunk.position();
        let blob = encode_chunk(chunk);
        match self.tree.insert(chunk_key(position), blob) {
            Ok(_) => {
                debug!("saved chunk {position:?}");
                true
            }
            Err(error) => {
                warn!("failed to save chunk {position:?}: {error}");
                false
            }
        }
    }

    fn load_chunk(&self, position: ChunkPosition) -> Option<ChunkBuffer> {
        let blob = match self.tree.get(chunk_key(position)) {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(error) => {
                warn!("failed to load chunk {position:?}: {error}");
                return None;
            }
        };
        match decode_chunk(&blob, position) {
            Ok(chunk) => Some(chunk),
            Err(error) => {
                warn!("discarding malformed blob for chunk {position:?}: {error}");
                None
            }
        }
    }

    fn save_all(&self, chunks: &HashMap<ChunkPosition, ChunkBuffer>) {
        for chunk in chunks.values() {
            self.save_chunk(chunk);
        }
        if let Err(error) = self.tree.flush() {
            warn!("failed to flush chunk store: {error}");
        }
    }
}
