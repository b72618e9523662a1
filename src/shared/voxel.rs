use crate::shared::spatial::{ChunkPosition, LocalPosition};
use serde::{Deserialize, Serialize};

/// Chunk edge lengths in blocks. All three must stay <= 256 so a local
/// coordinate packs into the `(x << 16) | (y << 8) | z` sparse-codec key.
pub const CHUNK_WIDTH: u32 = 255;
pub const CHUNK_HEIGHT: u32 = 255;
pub const CHUNK_DEPTH: u32 = 255;

/// Blocks per chunk. Fits a 32-bit dense index.
pub const CHUNK_VOLUME: usize =
    CHUNK_WIDTH as usize * CHUNK_HEIGHT as usize * CHUNK_DEPTH as usize;

/// Distance between consecutive y rows in the dense layout.
pub const STRIDE_Y: usize = CHUNK_WIDTH as usize;
/// Distance between consecutive z slices in the dense layout.
pub const STRIDE_Z: usize = CHUNK_WIDTH as usize * CHUNK_HEIGHT as usize;

// ---------------------------------------------------------------------------
// Block — one voxel's type id
// ---------------------------------------------------------------------------

/// Block type id. `Empty` is the default and the sentinel that sparse
/// encodings omit; `Empty` and `Air` are the only pass-through values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Block {
    #[default]
    Empty = 0,
    Air = 1,
    Grass = 2,
    Stone = 3,
    Water = 4,
    Sand = 5,
    Wood = 6,
    Leaves = 7,
    Bedrock = 8,
    Dirt = 9,
}

impl Block {
    #[inline]
    pub fn is_empty(self) -> bool {
        self == Block::Empty
    }

    /// True for blocks an entity can occupy.
    #[inline]
    pub fn is_transparent(self) -> bool {
        matches!(self, Block::Empty | Block::Air)
    }

    /// Decode a block id from its raw byte. `None` for ids this build does
    /// not know, so malformed payloads are rejected instead of aliased.
    pub fn from_raw(value: u8) -> Option<Block> {
        Some(match value {
            0 => Block::Empty,
            1 => Block::Air,
            2 => Block::Grass,
            3 => Block::Stone,
            4 => Block::Water,
            5 => Block::Sand,
            6 => Block::Wood,
            7 => Block::Leaves,
            8 => Block::Bedrock,
            9 => Block::Dirt,
            _ => return None,
        })
    }

    /// Decode the wire representation (the protocol widens block ids to u32).
    pub fn from_wire(value: u32) -> Option<Block> {
        u8::try_from(value).ok().and_then(Block::from_raw)
    }

    #[inline]
    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

// ---------------------------------------------------------------------------
// ChunkBuffer — owning dense storage for one chunk
// ---------------------------------------------------------------------------

/// Dense `CHUNK_WIDTH x CHUNK_HEIGHT x CHUNK_DEPTH` block array tagged with
/// its chunk-grid position. Every buffer is fully initialized on
/// construction; valid local reads never observe anything but a written
/// block.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkBuffer {
    position: ChunkPosition,
    blocks: Box<[Block]>,
}

impl ChunkBuffer {
    /// A fresh all-`Empty` buffer at `position`.
    pub fn new(position: ChunkPosition) -> Self {
        Self {
            position,
            blocks: vec![Block::Empty; CHUNK_VOLUME].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn position(&self) -> ChunkPosition {
        self.position
    }

    /// Dense index of a local coordinate: `x + y*STRIDE_Y + z*STRIDE_Z`.
    #[inline]
    pub fn index_of(local: LocalPosition) -> usize {
        local.x as usize + local.y as usize * STRIDE_Y + local.z as usize * STRIDE_Z
    }

    #[inline]
    pub fn get(&self, local: LocalPosition) -> Block {
        self.blocks[Self::index_of(local)]
    }

    #[inline]
    pub fn set(&mut self, local: LocalPosition, block: Block) {
        self.blocks[Self::index_of(local)] = block;
    }

    #[inline]
    pub fn as_slice(&self) -> &[Block] {
        &self.blocks
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    /// Overwrite every cell with `block`.
    pub fn fill(&mut self, block: Block) {
        self.blocks.fill(block);
    }

    /// Copy another buffer's cells into this one (positions may differ; only
    /// the storage is copied).
    pub fn copy_blocks_from(&mut self, other: &ChunkBuffer) {
        self.blocks.copy_from_slice(&other.blocks);
    }

    /// Count of non-`Empty` cells (the sparse codec entry count).
    pub fn non_empty_count(&self) -> usize {
        self.blocks.iter().filter(|b| !b.is_empty()).count()
    }
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("position", &self.position)
            .field("non_empty", &self.non_empty_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::spatial::LocalPosition;

    #[test]
    fn new_buffer_is_all_empty() {
        let buf = ChunkBuffer::new(ChunkPosition::new(1, -2, 3));
        assert_eq!(buf.non_empty_count(), 0);
        assert_eq!(buf.get(LocalPosition::new(0, 0, 0).unwrap()), Block::Empty);
        assert_eq!(
            buf.get(LocalPosition::new(CHUNK_WIDTH - 1, CHUNK_HEIGHT - 1, CHUNK_DEPTH - 1).unwrap()),
            Block::Empty
        );
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut buf = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        let pos = LocalPosition::new(10, 20, 30).unwrap();
        buf.set(pos, Block::Stone);
        assert_eq!(buf.get(pos), Block::Stone);
        assert_eq!(buf.non_empty_count(), 1);
    }

    #[test]
    fn index_formula_matches_strides() {
        let local = LocalPosition::new(3, 5, 7).unwrap();
        assert_eq!(
            ChunkBuffer::index_of(local),
            3 + 5 * STRIDE_Y + 7 * STRIDE_Z
        );
    }

    #[test]
    fn block_wire_round_trip_rejects_unknown() {
        for raw in 0u8..=9 {
            let block = Block::from_raw(raw).expect("known id");
            assert_eq!(block.to_wire(), u32::from(raw));
            assert_eq!(Block::from_wire(u32::from(raw)), Some(block));
        }
        assert_eq!(Block::from_raw(10), None);
        assert_eq!(Block::from_wire(0x1_00), None);
    }

    #[test]
    fn only_empty_and_air_are_transparent() {
        assert!(Block::Empty.is_transparent());
        assert!(Block::Air.is_transparent());
        assert!(!Block::Stone.is_transparent());
        assert!(!Block::Water.is_transparent());
    }
}
