use crate::shared::voxel::{CHUNK_DEPTH, CHUNK_HEIGHT, CHUNK_WIDTH};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Coordinate spaces
//
// Precise (f64) -> Block (i64) -> Chunk (i32) + Local (u32, bounded).
// All narrowing conversions floor toward negative infinity so that
// `chunk_origin(chunk(b)) + local(b) == b` holds for every block position.
// ---------------------------------------------------------------------------

/// Entity-space position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecisePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One voxel in the global grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPosition {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

/// One chunk in the global chunk grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// A voxel's offset inside its chunk. Invariant:
/// `x < CHUNK_WIDTH && y < CHUNK_HEIGHT && z < CHUNK_DEPTH`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LocalPosition {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpatialError {
    /// A chunk coordinate fell outside the i32 chunk grid.
    ChunkOutOfRange { axis: char, value: i64 },
    /// A precise coordinate was NaN or infinite, or floored outside i64.
    NonFinite { axis: char },
    /// A local coordinate exceeded the chunk dimensions.
    LocalOutOfRange { axis: char, value: u32 },
}

impl fmt::Display for SpatialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChunkOutOfRange { axis, value } => {
                write!(f, "chunk coordinate {value} on axis {axis} does not fit i32")
            }
            Self::NonFinite { axis } => {
                write!(f, "precise coordinate on axis {axis} is not a finite block position")
            }
            Self::LocalOutOfRange { axis, value } => {
                write!(f, "local coordinate {value} on axis {axis} exceeds chunk dimensions")
            }
        }
    }
}

impl std::error::Error for SpatialError {}

impl PrecisePosition {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Floor each component to the containing voxel.
    pub fn to_block(self) -> Result<BlockPosition, SpatialError> {
        let floor_axis = |v: f64, axis: char| -> Result<i64, SpatialError> {
            if !v.is_finite() {
                return Err(SpatialError::NonFinite { axis });
            }
            let floored = v.floor();
            if floored < i64::MIN as f64 || floored > i64::MAX as f64 {
                return Err(SpatialError::NonFinite { axis });
            }
            Ok(floored as i64)
        };
        Ok(BlockPosition {
            x: floor_axis(self.x, 'x')?,
            y: floor_axis(self.y, 'y')?,
            z: floor_axis(self.z, 'z')?,
        })
    }
}

impl BlockPosition {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// The chunk containing this block. Floor division, so negatives group
    /// toward negative infinity rather than truncating toward zero.
    pub fn to_chunk(self) -> Result<ChunkPosition, SpatialError> {
        let divide = |v: i64, dim: u32, axis: char| -> Result<i32, SpatialError> {
            let q = v.div_euclid(i64::from(dim));
            i32::try_from(q).map_err(|_| SpatialError::ChunkOutOfRange { axis, value: q })
        };
        Ok(ChunkPosition {
            x: divide(self.x, CHUNK_WIDTH, 'x')?,
            y: divide(self.y, CHUNK_HEIGHT, 'y')?,
            z: divide(self.z, CHUNK_DEPTH, 'z')?,
        })
    }

    /// Offset of this block inside its chunk. Always in range by
    /// construction (`rem_euclid` of a positive dimension).
    pub fn to_local(self) -> LocalPosition {
        LocalPosition {
            x: self.x.rem_euclid(i64::from(CHUNK_WIDTH)) as u32,
            y: self.y.rem_euclid(i64::from(CHUNK_HEIGHT)) as u32,
            z: self.z.rem_euclid(i64::from(CHUNK_DEPTH)) as u32,
        }
    }
}

impl ChunkPosition {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Block-space origin of this chunk: `(x*W, y*H, z*D)`.
    pub fn origin(self) -> BlockPosition {
        BlockPosition {
            x: i64::from(self.x) * i64::from(CHUNK_WIDTH),
            y: i64::from(self.y) * i64::from(CHUNK_HEIGHT),
            z: i64::from(self.z) * i64::from(CHUNK_DEPTH),
        }
    }

    /// Squared Euclidean distance in chunk units. Used for the residency
    /// sphere test.
    pub fn distance_sq(self, other: ChunkPosition) -> i64 {
        let dx = i64::from(self.x) - i64::from(other.x);
        let dy = i64::from(self.y) - i64::from(other.y);
        let dz = i64::from(self.z) - i64::from(other.z);
        dx * dx + dy * dy + dz * dz
    }

    /// Chebyshev (L-infinity) distance in chunk units. Used for the
    /// updated-chunks render cube.
    pub fn chebyshev_distance(self, other: ChunkPosition) -> i64 {
        let dx = (i64::from(self.x) - i64::from(other.x)).abs();
        let dy = (i64::from(self.y) - i64::from(other.y)).abs();
        let dz = (i64::from(self.z) - i64::from(other.z)).abs();
        dx.max(dy).max(dz)
    }
}

impl LocalPosition {
    /// Checked constructor; the unchecked struct literal is reserved for
    /// code that derives coordinates from loop bounds.
    pub fn new(x: u32, y: u32, z: u32) -> Result<Self, SpatialError> {
        if x >= CHUNK_WIDTH {
            return Err(SpatialError::LocalOutOfRange { axis: 'x', value: x });
        }
        if y >= CHUNK_HEIGHT {
            return Err(SpatialError::LocalOutOfRange { axis: 'y', value: y });
        }
        if z >= CHUNK_DEPTH {
            return Err(SpatialError::LocalOutOfRange { axis: 'z', value: z });
        }
        Ok(Self { x, y, z })
    }

    /// Block position of this offset within chunk `chunk`.
    pub fn to_block(self, chunk: ChunkPosition) -> BlockPosition {
        let origin = chunk.origin();
        BlockPosition {
            x: origin.x + i64::from(self.x),
            y: origin.y + i64::from(self.y),
            z: origin.z + i64::from(self.z),
        }
    }
}
