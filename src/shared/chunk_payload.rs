use crate::shared::spatial::{ChunkPosition, LocalPosition};
use crate::shared::voxel::{Block, ChunkBuffer, CHUNK_DEPTH, CHUNK_HEIGHT, CHUNK_WIDTH};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// SCO1 sparse chunk codec
//
// The one chunk byte format used everywhere a chunk leaves memory: RPC
// payloads and persistence blobs. Little-endian throughout.
//
//   magic      "SCO1"            4 bytes
//   version    u8 (=1)           1
//   reserved   u8 (=0)           1
//   block_size u16 (=1)          2
//   count      u32               4
//   entries    count x (packed_index: u32, block: u8)
//
// `packed_index` is `(x << 16) | (y << 8) | z`, valid because every chunk
// dimension is <= 256. Entries are sorted ascending and `Empty` cells are
// omitted, so equal chunks always serialize to identical bytes.
// ---------------------------------------------------------------------------

pub const SCO_MAGIC: [u8; 4] = *b"SCO1";
pub const SCO_VERSION: u8 = 1;
const SCO_RESERVED: u8 = 0;
const SCO_BLOCK_SIZE: u16 = 1;
const SCO_HEADER_LEN: usize = 4 + 1 + 1 + 2 + 4;
const SCO_ENTRY_LEN: usize = 4 + 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkCodecError {
    TooShort { len: usize },
    BadMagic { actual: [u8; 4] },
    UnsupportedVersion { expected: u8, actual: u8 },
    BlockSizeMismatch { expected: u16, actual: u16 },
    LengthMismatch { expected: usize, actual: usize },
    KeyOutOfRange { key: u32 },
    UnknownBlock { value: u8 },
}

impl fmt::Display for ChunkCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "payload of {len} bytes is shorter than the header"),
            Self::BadMagic { actual } => write!(f, "bad magic {actual:02x?}"),
            Self::UnsupportedVersion { expected, actual } => {
                write!(f, "unsupported codec version: expected {expected}, got {actual}")
            }
            Self::BlockSizeMismatch { expected, actual } => {
                write!(f, "block size mismatch: expected {expected}, got {actual}")
            }
            Self::LengthMismatch { expected, actual } => {
                write!(f, "payload length mismatch: expected {expected} bytes, got {actual}")
            }
            Self::KeyOutOfRange { key } => {
                write!(f, "packed index {key:#08x} exceeds chunk dimensions")
            }
            Self::UnknownBlock { value } => write!(f, "unknown block id {value}"),
        }
    }
}

impl std::error::Error for ChunkCodecError {}

/// Pack a local coordinate into the sparse-codec key.
#[inline]
pub fn pack_key(local: LocalPosition) -> u32 {
    (local.x << 16) | (local.y << 8) | local.z
}

/// Unpack a sparse-codec key. Fails when a component exceeds the chunk
/// dimensions (255 keeps all components in 8 bits, but x carries 16).
pub fn unpack_key(key: u32) -> Result<LocalPosition, ChunkCodecError> {
    let x = key >> 16;
    let y = (key >> 8) & 0xFF;
    let z = key & 0xFF;
    if x >= CHUNK_WIDTH || y >= CHUNK_HEIGHT || z >= CHUNK_DEPTH {
        return Err(ChunkCodecError::KeyOutOfRange { key });
    }
    Ok(LocalPosition { x, y, z })
}

fn write_header(out: &mut Vec<u8>, count: u32) {
    out.extend_from_slice(&SCO_MAGIC);
    out.push(SCO_VERSION);
    out.push(SCO_RESERVED);
    out.extend_from_slice(&SCO_BLOCK_SIZE.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
}

/// Validate the header and return the declared entry count.
fn read_header(data: &[u8]) -> Result<usize, ChunkCodecError> {
    if data.len() < SCO_HEADER_LEN {
        return Err(ChunkCodecError::TooShort { len: data.len() });
    }
    if data[0..4] != SCO_MAGIC {
        let mut actual = [0u8; 4];
        actual.copy_from_slice(&data[0..4]);
        return Err(ChunkCodecError::BadMagic { actual });
    }
    if data[4] != SCO_VERSION {
        return Err(ChunkCodecError::UnsupportedVersion {
            expected: SCO_VERSION,
            actual: data[4],
        });
    }
    let block_size = u16::from_le_bytes([data[6], data[7]]);
    if block_size != SCO_BLOCK_SIZE {
        return Err(ChunkCodecError::BlockSizeMismatch {
            expected: SCO_BLOCK_SIZE,
            actual: block_size,
        });
    }
    let count = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
    let expected = SCO_HEADER_LEN + count * SCO_ENTRY_LEN;
    if data.len() != expected {
        return Err(ChunkCodecError::LengthMismatch {
            expected,
            actual: data.len(),
        });
    }
    Ok(count)
}

fn decode_entries(
    data: &[u8],
    count: usize,
    mut apply: impl FnMut(LocalPosition, Block),
) -> Result<(), ChunkCodecError> {
    let mut cursor = SCO_HEADER_LEN;
    for _ in 0..count {
        let key = u32::from_le_bytes([data[cursor], data[cursor + 1], data[cursor + 2], data[cursor + 3]]);
        let raw = data[cursor + 4];
        cursor += SCO_ENTRY_LEN;

        let local = unpack_key(key)?;
        let block = Block::from_raw(raw).ok_or(ChunkCodecError::UnknownBlock { value: raw })?;
        // Empty entries are tolerated on decode but never re-emitted.
        if !block.is_empty() {
            apply(local, block);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dense buffer <-> SCO1
// ---------------------------------------------------------------------------

/// Serialize a dense chunk. Iteration is x-major so packed keys come out
/// ascending without a sort.
pub fn encode_chunk(buffer: &ChunkBuffer) -> Vec<u8> {
    let count = buffer.non_empty_count() as u32;
    let mut out = Vec::with_capacity(SCO_HEADER_LEN + count as usize * SCO_ENTRY_LEN);
    write_header(&mut out, count);
    for x in 0..CHUNK_WIDTH {
        for y in 0..CHUNK_HEIGHT {
            for z in 0..CHUNK_DEPTH {
                let local = LocalPosition { x, y, z };
                let block = buffer.get(local);
                if !block.is_empty() {
                    out.extend_from_slice(&pack_key(local).to_le_bytes());
                    out.push(block as u8);
                }
            }
        }
    }
    out
}

/// Deserialize a dense chunk. The position tag comes from the caller; SCO1
/// payloads are coordinate-free and always travel beside their chunk key.
pub fn decode_chunk(data: &[u8], position: ChunkPosition) -> Result<ChunkBuffer, ChunkCodecError> {
    let count = read_header(data)?;
    let mut buffer = ChunkBuffer::new(position);
    decode_entries(data, count, |local, block| buffer.set(local, block))?;
    Ok(buffer)
}

// ---------------------------------------------------------------------------
// SparseChunkOverlay — mutable non-Empty edit set
// ---------------------------------------------------------------------------

/// Sparse per-chunk edit layer: only non-`Empty` cells are stored. Used as
/// the mutable post-generation edit overlay and as the natural in-memory
/// form of an SCO1 payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseChunkOverlay {
    blocks: HashMap<u32, Block>,
}

impl SparseChunkOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block at `local`, `Empty` when unset.
    pub fn get(&self, local: LocalPosition) -> Block {
        self.blocks.get(&pack_key(local)).copied().unwrap_or(Block::Empty)
    }

    /// Record an edit. Writing `Empty` removes the entry, keeping the map
    /// sparse.
    pub fn set(&mut self, local: LocalPosition, block: Block) {
        let key = pack_key(local);
        if block.is_empty() {
            self.blocks.remove(&key);
        } else {
            self.blocks.insert(key, block);
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterate edits in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, Block)> + '_ {
        self.blocks.iter().map(|(&k, &b)| (k, b))
    }

    /// Capture every non-`Empty` cell of a dense buffer.
    pub fn from_buffer(buffer: &ChunkBuffer) -> Self {
        let mut overlay = Self::new();
        for x in 0..CHUNK_WIDTH {
            for y in 0..CHUNK_HEIGHT {
                for z in 0..CHUNK_DEPTH {
                    let local = LocalPosition { x, y, z };
                    let block = buffer.get(local);
                    if !block.is_empty() {
                        overlay.blocks.insert(pack_key(local), block);
                    }
                }
            }
        }
        overlay
    }

    /// Serialize with entries sorted ascending by packed key so equal edit
    /// sets produce identical bytes regardless of mutation history.
    pub fn encode(&self) -> Vec<u8> {
        let mut keys: Vec<u32> = self.blocks.keys().copied().collect();
        keys.sort_unstable();

        let mut out = Vec::with_capacity(SCO_HEADER_LEN + keys.len() * SCO_ENTRY_LEN);
        write_header(&mut out, keys.len() as u32);
        for key in keys {
            out.extend_from_slice(&key.to_le_bytes());
            out.push(self.blocks[&key] as u8);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ChunkCodecError> {
        let count = read_header(data)?;
        let mut overlay = Self::new();
        decode_entries(data, count, |local, block| overlay.set(local, block))?;
        Ok(overlay)
    }
}
