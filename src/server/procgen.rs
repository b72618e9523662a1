//! Compositional chunk generation.
//!
//! A chunk is produced by applying [`Overlay`] layers bottom-to-top: each
//! layer writes a destination buffer given the previous layer's output as an
//! optional parent. Overlays are plain values, deterministic in their
//! configuration, the shared noise field, and the destination buffer's chunk
//! position.

use crate::server::noise::{NoiseField, PerlinNoise};
use crate::shared::chunk_payload::SparseChunkOverlay;
use crate::shared::spatial::{ChunkPosition, LocalPosition};
use crate::shared::voxel::{Block, ChunkBuffer, CHUNK_DEPTH, CHUNK_HEIGHT, CHUNK_WIDTH, STRIDE_Y, STRIDE_Z};

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

/// One chunk-wide generation layer.
#[derive(Clone, Debug)]
pub enum Overlay {
    /// Writes `Empty` everywhere; ignores the parent.
    Empty,
    /// Writes `block` everywhere; ignores the parent.
    Fill { block: Block },
    /// Fills every cell whose world y lies below `height`; copies the
    /// parent above.
    Slab { height: i64, block: Block },
    /// Copies the parent (or `Empty`), then applies a sparse edit set.
    SparseEdit(SparseChunkOverlay),
    /// Octave-noise heightmap that only writes cells the parent left
    /// `Empty`: per column the fill reaches
    /// `start_height + noise01 * (max_height - start_height)`.
    NoiseFill {
        scale: f64,
        octaves: u32,
        start_height: i64,
        max_height: i64,
        block: Block,
    },
    /// Column band keyed off a noise threshold: thickness is
    /// `base_thickness` plus `extra` where the sample exceeds `threshold`.
    /// Cells below the band take `block`; the rest fall through to the
    /// parent. The original bedrock floor.
    NoiseBand {
        frequency: f64,
        threshold: f64,
        base_thickness: i64,
        extra: i64,
        block: Block,
    },
    /// Heightmap terrain: per-column surface at
    /// `base_height + floor(noise01 * variation)`; fills `block` up to the
    /// surface, copies the parent above it.
    TerrainHeight {
        frequency: f64,
        base_height: i64,
        variation: i64,
        block: Block,
    },
    /// Per column, finds the topmost non-`Empty` cell and rewrites
    /// `from -> to` in the `thickness` cells starting `from_top` below it.
    LayerReplace {
        from: Block,
        to: Block,
        from_top: u32,
        thickness: u32,
    },
    /// Places `block` directly above the topmost non-`Empty` cell of each
    /// column, when there is headroom.
    Surface { block: Block },
    /// Ordered bottom-to-top application; an empty chain yields all-`Empty`.
    Chain(Vec<Overlay>),
    /// Applies both sides to copies and keeps the first's cell wherever it
    /// is non-`Empty`, otherwise the second's.
    Merge(Box<Overlay>, Box<Overlay>),
}

/// Copy the parent into `dst`, or clear it when there is no parent.
fn copy_parent_or_empty(dst: &mut ChunkBuffer, parent: Option<&ChunkBuffer>) {
    match parent {
        Some(parent) => dst.copy_blocks_from(parent),
        None => dst.fill(Block::Empty),
    }
}

impl Overlay {
    /// Write `dst` from this layer's configuration and an optional parent
    /// layer's output. `dst`'s position tag supplies the world origin.
    pub fn generate_into(
        &self,
        noise: &dyn NoiseField,
        dst: &mut ChunkBuffer,
        parent: Option<&ChunkBuffer>,
    ) {
        let origin = dst.position().origin();
        match self {
            Overlay::Empty => dst.fill(Block::Empty),

            Overlay::Fill { block } => dst.fill(*block),

            Overlay::Slab { height, block } => {
                copy_parent_or_empty(dst, parent);
                for y in 0..CHUNK_HEIGHT {
                    if origin.y + i64::from(y) >= *height {
                        continue;
                    }
                    for z in 0..CHUNK_DEPTH {
                        let row = y as usize * STRIDE_Y + z as usize * STRIDE_Z;
                        dst.as_mut_slice()[row..row + CHUNK_WIDTH as usize].fill(*block);
                    }
                }
            }

            Overlay::NoiseFill {
                scale,
                octaves,
                start_height,
                max_height,
                block,
            } => {
                copy_parent_or_empty(dst, parent);
                for z in 0..CHUNK_DEPTH {
                    for x in 0..CHUNK_WIDTH {
                        let wx = (origin.x + i64::from(x)) as f64;
                        let wz = (origin.z + i64::from(z)) as f64;
                        let n = noise.octave01(wx / scale, wz / scale, *octaves);
                        let height = start_height
                            + (n * (*max_height - *start_height) as f64) as i64;

                        let column = x as usize + z as usize * STRIDE_Z;
                        for y in 0..CHUNK_HEIGHT {
                            let world_y = origin.y + i64::from(y);
                            if world_y > height || world_y > *max_height {
                                continue;
                            }
                            let idx = column + y as usize * STRIDE_Y;
                            if dst.as_slice()[idx].is_empty() {
                                dst.as_mut_slice()[idx] = *block;
                            }
                        }
                    }
                }
            }

            Overlay::SparseEdit(edits) => {
                copy_parent_or_empty(dst, parent);
                for (key, block) in edits.iter() {
                    // Keys come from the bounded overlay API, so unpack
                    // cannot fail here.
                    let local = LocalPosition {
                        x: key >> 16,
                        y: (key >> 8) & 0xFF,
                        z: key & 0xFF,
                    };
                    dst.set(local, block);
                }
            }

            Overlay::NoiseBand {
                frequency,
                threshold,
                base_thickness,
                extra,
                block,
            } => {
                for z in 0..CHUNK_DEPTH {
                    for x in 0..CHUNK_WIDTH {
                        // World-space sample inputs: chunk-local integers
                        // would alias columns across chunks.
                        let wx = (origin.x + i64::from(x)) as f64;
                        let wz = (origin.z + i64::from(z)) as f64;
                        let n = noise.sample01(wx * frequency, wz * frequency);
                        let thickness =
                            base_thickness + if n > *threshold { *extra } else { 0 };

                        let column = x as usize + z as usize * STRIDE_Z;
                        for y in 0..CHUNK_HEIGHT {
                            let idx = column + y as usize * STRIDE_Y;
                            let world_y = origin.y + i64::from(y);
                            dst.as_mut_slice()[idx] = if world_y < thickness {
                                *block
                            } else {
                                parent.map_or(Block::Empty, |p| p.as_slice()[idx])
                            };
                        }
                    }
                }
            }

            Overlay::TerrainHeight {
                frequency,
                base_height,
                variation,
                block,
            } => {
                copy_parent_or_empty(dst, parent);
                for z in 0..CHUNK_DEPTH {
                    for x in 0..CHUNK_WIDTH {
                        let wx = (origin.x + i64::from(x)) as f64;
                        let wz = (origin.z + i64::from(z)) as f64;
                        let n = noise.sample01(wx * frequency, wz * frequency);
                        let surface = base_height + (n * *variation as f64) as i64;

                        let column = x as usize + z as usize * STRIDE_Z;
                        for y in 0..CHUNK_HEIGHT {
                            let world_y = origin.y + i64::from(y);
                            if world_y <= surface {
                                dst.as_mut_slice()[column + y as usize * STRIDE_Y] = *block;
                            }
                        }
                    }
                }
            }

            Overlay::LayerReplace {
                from,
                to,
                from_top,
                thickness,
            } => {
                copy_parent_or_empty(dst, parent);
                if parent.is_none() {
                    // Nothing to rewrite without terrain underneath.
                    return;
                }
                for z in 0..CHUNK_DEPTH {
                    for x in 0..CHUNK_WIDTH {
                        let column = x as usize + z as usize * STRIDE_Z;
                        let Some(surface_y) = top_non_empty(dst, column) else {
                            continue;
                        };
                        let start = surface_y as i64 - i64::from(*from_top);
                        for step in 0..i64::from(*thickness) {
                            let y = start - step;
                            if y < 0 || y >= i64::from(CHUNK_HEIGHT) {
                                continue;
                            }
                            let idx = column + y as usize * STRIDE_Y;
                            if dst.as_slice()[idx] == *from {
                                dst.as_mut_slice()[idx] = *to;
                            }
                        }
                    }
                }
            }

            Overlay::Surface { block } => {
                copy_parent_or_empty(dst, parent);
                if parent.is_none() {
                    return;
                }
                for z in 0..CHUNK_DEPTH {
                    for x in 0..CHUNK_WIDTH {
                        let column = x as usize + z as usize * STRIDE_Z;
                        if let Some(surface_y) = top_non_empty(dst, column) {
                            if surface_y + 1 < CHUNK_HEIGHT {
                                dst.as_mut_slice()[column + (surface_y + 1) as usize * STRIDE_Y] =
                                    *block;
                            }
                        }
                    }
                }
            }

            Overlay::Chain(layers) => match layers.split_last() {
                None => dst.fill(Block::Empty),
                Some((top, below)) => {
                    let mut carried: Option<ChunkBuffer> = None;
                    for layer in below {
                        let mut scratch = ChunkBuffer::new(dst.position());
                        layer.generate_into(noise, &mut scratch, carried.as_ref());
                        carried = Some(scratch);
                    }
                    top.generate_into(noise, dst, carried.as_ref());
                }
            },

            Overlay::Merge(first, second) => {
                let mut a = ChunkBuffer::new(dst.position());
                let mut b = ChunkBuffer::new(dst.position());
                first.generate_into(noise, &mut a, parent);
                second.generate_into(noise, &mut b, parent);
                let out = dst.as_mut_slice();
                for (idx, cell) in out.iter_mut().enumerate() {
                    let primary = a.as_slice()[idx];
                    *cell = if primary.is_empty() {
                        b.as_slice()[idx]
                    } else {
                        primary
                    };
                }
            }
        }
    }
}

/// Topmost non-`Empty` y of a column, scanning down from the chunk ceiling.
fn top_non_empty(buffer: &ChunkBuffer, column: usize) -> Option<u32> {
    for y in (0..CHUNK_HEIGHT).rev() {
        if !buffer.as_slice()[column + y as usize * STRIDE_Y].is_empty() {
            return Some(y);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Generators — strategy port used by the world
// ---------------------------------------------------------------------------

/// Chunk generation strategy. `None` means generation failed for that chunk;
/// the world substitutes an `Empty` buffer and keeps going.
pub trait ChunkGenerator: Send + Sync {
    fn generate(&self, position: ChunkPosition, seed: u64) -> Option<ChunkBuffer>;
}

/// All-`Empty` chunks.
pub struct EmptyChunkGenerator;

impl ChunkGenerator for EmptyChunkGenerator {
    fn generate(&self, position: ChunkPosition, _seed: u64) -> Option<ChunkBuffer> {
        Some(ChunkBuffer::new(position))
    }
}

/// Uniform slab world: solid below `height`, empty above.
pub struct FlatChunkGenerator {
    pub height: i64,
    pub block: Block,
}

impl ChunkGenerator for FlatChunkGenerator {
    fn generate(&self, position: ChunkPosition, seed: u64) -> Option<ChunkBuffer> {
        let noise = PerlinNoise::new(seed);
        let mut buffer = ChunkBuffer::new(position);
        Overlay::Slab {
            height: self.height,
            block: self.block,
        }
        .generate_into(&noise, &mut buffer, None);
        Some(buffer)
    }
}

/// The stock terrain pipeline: stone heightmap, a dirt band under the
/// surface, a grass cap, a noise-thickened bedrock floor, and water filling
/// whatever the terrain left open below sea level.
pub struct TerrainChunkGenerator;

impl TerrainChunkGenerator {
    pub const SEA_LEVEL: i64 = 36;

    pub fn chain() -> Overlay {
        let land = Overlay::Chain(vec![
            Overlay::TerrainHeight {
                frequency: 0.01,
                base_height: 32,
                variation: 16,
                block: Block::Stone,
            },
            Overlay::LayerReplace {
                from: Block::Stone,
                to: Block::Dirt,
                from_top: 0,
                thickness: 3,
            },
            Overlay::Surface { block: Block::Grass },
            Overlay::NoiseBand {
                frequency: 0.07,
                threshold: 0.55,
                base_thickness: 2,
                extra: 1,
                block: Block::Bedrock,
            },
        ]);
        let ocean = Overlay::Slab {
            height: Self::SEA_LEVEL,
            block: Block::Water,
        };
        Overlay::Merge(Box::new(land), Box::new(ocean))
    }
}

impl ChunkGenerator for TerrainChunkGenerator {
    fn generate(&self, position: ChunkPosition, seed: u64) -> Option<ChunkBuffer> {
        let noise = PerlinNoise::new(seed);
        let mut buffer = ChunkBuffer::new(position);
        Self::chain().generate_into(&noise, &mut buffer, None);
        Some(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(x: u32, y: u32, z: u32) -> LocalPosition {
        LocalPosition::new(x, y, z).unwrap()
    }

    fn noise() -> PerlinNoise {
        PerlinNoise::new(42)
    }

    #[test]
    fn empty_overlay_clears_everything() {
        let mut dst = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        dst.set(local(1, 1, 1), Block::Stone);
        Overlay::Empty.generate_into(&noise(), &mut dst, None);
        assert_eq!(dst.non_empty_count(), 0);
    }

    #[test]
    fn empty_chain_yields_all_empty() {
        let mut dst = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        dst.set(local(5, 5, 5), Block::Wood);
        Overlay::Chain(vec![]).generate_into(&noise(), &mut dst, None);
        assert_eq!(dst.non_empty_count(), 0);
    }

    #[test]
    fn compose_identity_single_empty_layer() {
        let mut dst = ChunkBuffer::new(ChunkPosition::new(3, -1, 2));
        dst.set(local(5, 5, 5), Block::Wood);
        Overlay::Chain(vec![Overlay::Empty]).generate_into(&noise(), &mut dst, None);
        assert_eq!(dst.non_empty_count(), 0);
    }

    #[test]
    fn sparse_edit_applies_over_parent() {
        let mut parent = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        parent.set(local(0, 0, 0), Block::Stone);
        parent.set(local(1, 0, 0), Block::Stone);

        let mut edits = SparseChunkOverlay::new();
        edits.set(local(1, 0, 0), Block::Water);
        edits.set(local(2, 0, 0), Block::Sand);

        let mut dst = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        Overlay::SparseEdit(edits).generate_into(&noise(), &mut dst, Some(&parent));

        assert_eq!(dst.get(local(0, 0, 0)), Block::Stone);
        assert_eq!(dst.get(local(1, 0, 0)), Block::Water);
        assert_eq!(dst.get(local(2, 0, 0)), Block::Sand);
    }

    #[test]
    fn chain_top_sparse_overlay_wins() {
        let mut bottom = SparseChunkOverlay::new();
        bottom.set(local(7, 7, 7), Block::Stone);
        let mut top = SparseChunkOverlay::new();
        top.set(local(7, 7, 7), Block::Sand);

        let chain = Overlay::Chain(vec![
            Overlay::SparseEdit(bottom),
            Overlay::SparseEdit(top),
        ]);
        let mut dst = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        chain.generate_into(&noise(), &mut dst, None);
        assert_eq!(dst.get(local(7, 7, 7)), Block::Sand);
    }

    #[test]
    fn merge_second_fills_gaps_of_first() {
        let mut a = SparseChunkOverlay::new();
        a.set(local(0, 0, 0), Block::Stone);
        let mut b = SparseChunkOverlay::new();
        b.set(local(0, 0, 0), Block::Sand);
        b.set(local(1, 0, 0), Block::Water);

        let merge = Overlay::Merge(
            Box::new(Overlay::SparseEdit(a)),
            Box::new(Overlay::SparseEdit(b)),
        );
        let mut dst = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        merge.generate_into(&noise(), &mut dst, None);

        assert_eq!(dst.get(local(0, 0, 0)), Block::Stone, "first layer wins where set");
        assert_eq!(dst.get(local(1, 0, 0)), Block::Water, "second fills the gap");
    }

    #[test]
    fn noise_band_respects_world_y() {
        let band = Overlay::NoiseBand {
            frequency: 0.07,
            threshold: 0.55,
            base_thickness: 2,
            extra: 1,
            block: Block::Bedrock,
        };

        // Chunk at y=0 holds the band; a chunk one level up is far above it.
        let mut ground = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        band.generate_into(&noise(), &mut ground, None);
        for x in 0..8 {
            for z in 0..8 {
                assert_eq!(ground.get(local(x, 0, z)), Block::Bedrock);
                assert_eq!(ground.get(local(x, 1, z)), Block::Bedrock);
                assert_eq!(ground.get(local(x, 4, z)), Block::Empty);
            }
        }

        let mut sky = ChunkBuffer::new(ChunkPosition::new(0, 1, 0));
        band.generate_into(&noise(), &mut sky, None);
        assert_eq!(sky.non_empty_count(), 0);
    }

    #[test]
    fn fill_overlay_writes_every_cell() {
        let mut dst = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        Overlay::Fill { block: Block::Stone }.generate_into(&noise(), &mut dst, None);
        assert_eq!(dst.non_empty_count(), CHUNK_VOLUME_USIZE);
        assert_eq!(dst.get(local(254, 254, 254)), Block::Stone);
    }

    #[test]
    fn slab_overlay_fills_below_height_and_keeps_parent_above() {
        let mut parent = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        parent.set(local(3, 100, 3), Block::Wood);

        let mut dst = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        Overlay::Slab {
            height: 4,
            block: Block::Sand,
        }
        .generate_into(&noise(), &mut dst, Some(&parent));

        assert_eq!(dst.get(local(0, 0, 0)), Block::Sand);
        assert_eq!(dst.get(local(0, 3, 0)), Block::Sand);
        assert_eq!(dst.get(local(0, 4, 0)), Block::Empty);
        assert_eq!(dst.get(local(3, 100, 3)), Block::Wood);
    }

    #[test]
    fn noise_fill_only_writes_cells_the_parent_left_empty() {
        let mut parent = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        parent.set(local(0, 5, 0), Block::Stone);

        // start == max pins the fill height regardless of the noise value.
        let mut dst = ChunkBuffer::new(ChunkPosition::new(0, 0, 0));
        Overlay::NoiseFill {
            scale: 64.0,
            octaves: 3,
            start_height: 10,
            max_height: 10,
            block: Block::Sand,
        }
        .generate_into(&noise(), &mut dst, Some(&parent));

        assert_eq!(dst.get(local(0, 5, 0)), Block::Stone, "occupied cells are kept");
        assert_eq!(dst.get(local(0, 0, 0)), Block::Sand);
        assert_eq!(dst.get(local(0, 10, 0)), Block::Sand);
        assert_eq!(dst.get(local(0, 12, 0)), Block::Empty);
    }

    #[test]
    fn terrain_water_stays_at_or_below_sea_level() {
        let chunk = TerrainChunkGenerator
            .generate(ChunkPosition::new(0, 0, 0), 42)
            .unwrap();
        for x in 0..CHUNK_WIDTH {
            for z in 0..CHUNK_DEPTH {
                for y in 0..64 {
                    if chunk.get(local(x, y, z)) == Block::Water {
                        assert!(
                            i64::from(y) < TerrainChunkGenerator::SEA_LEVEL,
                            "water at y={y} above sea level"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn terrain_chain_is_deterministic() {
        let gen = TerrainChunkGenerator;
        let a = gen.generate(ChunkPosition::new(1, 0, -2), 42).unwrap();
        let b = gen.generate(ChunkPosition::new(1, 0, -2), 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn terrain_chain_has_expected_strata() {
        let chunk = TerrainChunkGenerator
            .generate(ChunkPosition::new(0, 0, 0), 42)
            .unwrap();

        let mut bedrock_at_floor = 0;
        let mut stone_below_surface = 0;
        let mut grass_cap = 0;
        for x in 0..CHUNK_WIDTH {
            for z in 0..CHUNK_DEPTH {
                if chunk.get(local(x, 0, z)) == Block::Bedrock {
                    bedrock_at_floor += 1;
                }
                if chunk.get(local(x, 20, z)) == Block::Stone {
                    stone_below_surface += 1;
                }
                for y in 30..50 {
                    if chunk.get(local(x, y, z)) == Block::Grass {
                        grass_cap += 1;
                        break;
                    }
                }
            }
        }
        assert!(bedrock_at_floor > 0, "terrain should have a bedrock floor");
        assert!(stone_below_surface > 0, "terrain should have stone under the surface");
        assert!(grass_cap > 0, "terrain should have a grass surface");
    }

    #[test]
    fn flat_generator_fills_below_height() {
        let gen = FlatChunkGenerator {
            height: 4,
            block: Block::Grass,
        };
        let chunk = gen.generate(ChunkPosition::new(0, 0, 0), 0).unwrap();
        assert_eq!(chunk.get(local(10, 0, 10)), Block::Grass);
        assert_eq!(chunk.get(local(10, 3, 10)), Block::Grass);
        assert_eq!(chunk.get(local(10, 4, 10)), Block::Empty);

        // A chunk below the slab is solid; one above is empty.
        let below = gen.generate(ChunkPosition::new(0, -1, 0), 0).unwrap();
        assert_eq!(below.non_empty_count(), CHUNK_VOLUME_USIZE);
        let above = gen.generate(ChunkPosition::new(0, 1, 0), 0).unwrap();
        assert_eq!(above.non_empty_count(), 0);
    }

    const CHUNK_VOLUME_USIZE: usize = crate::shared::voxel::CHUNK_VOLUME;
}
