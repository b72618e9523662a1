//! The authoritative world: an in-memory chunk registry driven by load
//! anchors.
//!
//! The world owns every resident chunk exclusively; callers borrow. A chunk
//! is resident iff it lies within the Euclidean chunk-sphere of at least one
//! anchor (static anchors, callback anchors, and live session positions).
//! `ensure_chunks_loaded` converges the registry onto that set: missing
//! chunks are loaded from persistence, else generated, else created empty;
//! chunks that drifted out of every sphere are saved and evicted.

use crate::server::persistence::ChunkPersistence;
use crate::server::procgen::ChunkGenerator;
use crate::server::session::{Session, SessionManager};
use crate::shared::spatial::{BlockPosition, ChunkPosition, PrecisePosition};
use crate::shared::voxel::{Block, ChunkBuffer};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub type AnchorFn = Box<dyn Fn() -> Vec<BlockPosition> + Send>;

pub struct WorldConfig {
    pub generator: Option<Box<dyn ChunkGenerator>>,
    pub static_anchors: Vec<BlockPosition>,
    pub anchor_fn: Option<AnchorFn>,
    /// Anchor radius in chunks (Euclidean).
    pub anchor_radius: u32,
    pub seed: u64,
    pub persistence: Option<Box<dyn ChunkPersistence>>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            generator: None,
            static_anchors: vec![BlockPosition::new(0, 0, 0)],
            anchor_fn: None,
            anchor_radius: 1,
            seed: 0,
            persistence: None,
        }
    }
}

pub struct World {
    chunks: HashMap<ChunkPosition, ChunkBuffer>,
    generator: Option<Box<dyn ChunkGenerator>>,
    static_anchors: Vec<BlockPosition>,
    anchor_fn: Option<AnchorFn>,
    anchor_radius: u32,
    seed: u64,
    persistence: Option<Box<dyn ChunkPersistence>>,
    sessions: Arc<SessionManager>,
    next_player_id: u64,
}

impl World {
    pub fn new(config: WorldConfig) -> Self {
        Self {
            chunks: HashMap::new(),
            generator: config.generator,
            static_anchors: config.static_anchors,
            anchor_fn: config.anchor_fn,
            anchor_radius: config.anchor_radius,
            seed: config.seed,
            persistence: config.persistence,
            sessions: Arc::new(SessionManager::new()),
            next_player_id: 0,
        }
    }

    pub fn anchor_radius(&self) -> u32 {
        self.anchor_radius
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Shared handle to the session table; the server runtime clones this so
    /// session checks never need the world lock.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn set_static_anchors(&mut self, anchors: Vec<BlockPosition>) {
        self.static_anchors = anchors;
    }

    pub fn resident_chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn resident_chunks(&self) -> impl Iterator<Item = ChunkPosition> + '_ {
        self.chunks.keys().copied()
    }

    // -- anchor geometry ----------------------------------------------------

    /// Every anchor in block space: the static set, the callback's set, and
    /// each live session's position.
    fn collect_anchor_blocks(&self) -> Vec<BlockPosition> {
        let mut anchors = self.static_anchors.clone();
        if let Some(supply) = &self.anchor_fn {
            anchors.extend(supply());
        }
        for session in self.sessions.active_sessions() {
            match session.position.to_block() {
                Ok(block) => anchors.push(block),
                Err(error) => {
                    warn!("ignoring anchor for session of {}: {error}", session.player_name);
                }
            }
        }
        anchors
    }

    fn anchor_chunks(&self, anchors: &[BlockPosition]) -> Vec<ChunkPosition> {
        anchors
            .iter()
            .filter_map(|anchor| match anchor.to_chunk() {
                Ok(chunk) => Some(chunk),
                Err(error) => {
                    warn!("ignoring out-of-range anchor {anchor:?}: {error}");
                    None
                }
            })
            .collect()
    }

    // -- load / evict state machine -----------------------------------------

    /// Converge residency onto the union of anchor spheres. Idempotent.
    pub fn ensure_chunks_loaded(&mut self) {
        let anchors = self.collect_anchor_blocks();
        let anchor_chunks = self.anchor_chunks(&anchors);
        let radius = i64::from(self.anchor_radius);
        let r_sq = radius * radius;

        // Ordered target set so load order (and with it log output and
        // generation timing) is reproducible.
        let mut wanted: BTreeSet<ChunkPosition> = BTreeSet::new();
        for anchor in &anchor_chunks {
            for dx in -radius..=radius {
                for dy in -radius..=radius {
                    for dz in -radius..=radius {
                        if dx * dx + dy * dy + dz * dz > r_sq {
                            continue;
                        }
                        let (Some(x), Some(y), Some(z)) = (
                            anchor.x.checked_add(dx as i32),
                            anchor.y.checked_add(dy as i32),
                            anchor.z.checked_add(dz as i32),
                        ) else {
                            continue;
                        };
                        wanted.insert(ChunkPosition::new(x, y, z));
                    }
                }
            }
        }

        for position in &wanted {
            if self.chunks.contains_key(position) {
                continue;
            }
            let chunk = self.load_or_generate(*position);
            self.chunks.insert(*position, chunk);
        }

        let evicted: Vec<ChunkPosition> = self
            .chunks
            .keys()
            .filter(|position| !wanted.contains(position))
            .copied()
            .collect();
        for position in evicted {
            if let Some(chunk) = self.chunks.remove(&position) {
                if let Some(persistence) = &self.persistence {
                    if !persistence.save_chunk(&chunk) {
                        // The in-memory copy is dropped regardless; a
                        // wedged store must not pin unbounded memory.
                        warn!("evicting chunk {position:?} despite failed save");
                    }
                }
                debug!("evicted chunk {position:?}");
            }
        }
    }

    /// Persistence wins over generation: once a chunk has been persisted,
    /// its stored state is authoritative.
    fn load_or_generate(&self, position: ChunkPosition) -> ChunkBuffer {
        if let Some(persistence) = &self.persistence {
            if let Some(chunk) = persistence.load_chunk(position) {
                debug!("loaded chunk {position:?} from persistence");
                return chunk;
            }
        }
        if let Some(generator) = &self.generator {
            match generator.generate(position, self.seed) {
                Some(chunk) => {
                    debug!("generated chunk {position:?}");
                    return chunk;
                }
                None => {
                    warn!("generation failed for chunk {position:?}; inserting empty");
                }
            }
        }
        ChunkBuffer::new(position)
    }

    // -- chunk and block access ---------------------------------------------

    pub fn chunk_at(&self, position: ChunkPosition) -> Option<&ChunkBuffer> {
        self.chunks.get(&position)
    }

    pub fn get_block_if_loaded(&self, position: BlockPosition) -> Option<Block> {
        let chunk_pos = position.to_chunk().ok()?;
        let chunk = self.chunks.get(&chunk_pos)?;
        Some(chunk.get(position.to_local()))
    }

    /// False iff the containing chunk is not resident. Writes never
    /// auto-persist; durability comes from eviction, explicit saves, and
    /// shutdown.
    pub fn set_block_if_loaded(&mut self, position: BlockPosition, block: Block) -> bool {
        let Ok(chunk_pos) = position.to_chunk() else {
            return false;
        };
        let Some(chunk) = self.chunks.get_mut(&chunk_pos) else {
            return false;
        };
        chunk.set(position.to_local(), block);
        true
    }

    /// Best-effort save of every resident chunk.
    pub fn save_all_loaded_chunks(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.save_all(&self.chunks);
            info!("saved {} loaded chunks", self.chunks.len());
        }
    }

    // -- player facade ------------------------------------------------------

    /// Spawn a player and issue their session.
    pub fn connect_player(&mut self, name: &str, spawn: PrecisePosition) -> (String, u64) {
        self.next_player_id += 1;
        let player_id = self.next_player_id;
        let token = self.sessions.create(name, player_id, spawn);
        info!("player '{name}' connected as id {player_id}");
        (token, player_id)
    }

    pub fn disconnect_by_session(&mut self, token: &str) -> Option<Session> {
        let session = self.sessions.remove(token);
        if let Some(session) = &session {
            info!("player '{}' disconnected", session.player_name);
        }
        session
    }

    /// Sweep expired sessions; their positions stop anchoring at the next
    /// `ensure_chunks_loaded`.
    pub fn cleanup_expired_sessions(&self) -> Vec<String> {
        self.sessions.remove_expired()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        self.save_all_loaded_chunks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::procgen::FlatChunkGenerator;
    use crate::shared::chunk_payload::{decode_chunk, encode_chunk};
    use crate::shared::spatial::LocalPosition;
    use crate::shared::voxel::{CHUNK_DEPTH, CHUNK_HEIGHT, CHUNK_WIDTH};
    use std::sync::Mutex;

    /// Clonable in-memory store so two worlds can share one "database".
    #[derive(Clone, Default)]
    struct MemoryChunkStore {
        blobs: Arc<Mutex<HashMap<ChunkPosition, Vec<u8>>>>,
    }

    impl MemoryChunkStore {
        fn contains(&self, position: ChunkPosition) -> bool {
            self.blobs.lock().unwrap().contains_key(&position)
        }
    }

    impl ChunkPersistence for MemoryChunkStore {
        fn save_chunk(&self, chunk: &ChunkBuffer) -> bool {
            self.blobs
                .lock()
                .unwrap()
                .insert(chunk.position(), encode_chunk(chunk));
            true
        }

        fn load_chunk(&self, position: ChunkPosition) -> Option<ChunkBuffer> {
            let blobs = self.blobs.lock().unwrap();
            let blob = blobs.get(&position)?;
            decode_chunk(blob, position).ok()
        }
    }

    #[test]
    fn anchor_coverage_is_exactly_the_sphere() {
        let mut world = World::new(WorldConfig {
            anchor_radius: 1,
            ..Default::default()
        });
        world.ensure_chunks_loaded();

        // Radius-1 sphere around the origin chunk: center plus 6 face
        // neighbors (diagonals are at distance sqrt(2) > 1).
        let mut expected: Vec<ChunkPosition> = vec![
            ChunkPosition::new(0, 0, 0),
            ChunkPosition::new(1, 0, 0),
            ChunkPosition::new(-1, 0, 0),
            ChunkPosition::new(0, 1, 0),
            ChunkPosition::new(0, -1, 0),
            ChunkPosition::new(0, 0, 1),
            ChunkPosition::new(0, 0, -1),
        ];
        expected.sort();
        let mut resident: Vec<ChunkPosition> = world.resident_chunks().collect();
        resident.sort();
        assert_eq!(resident, expected);

        // Idempotent.
        world.ensure_chunks_loaded();
        assert_eq!(world.resident_chunk_count(), 7);
    }

    #[test]
    fn moving_the_anchor_evicts_and_reloads() {
        let store = MemoryChunkStore::default();
        let mut world = World::new(WorldConfig {
            anchor_radius: 0,
            persistence: Some(Box::new(store.clone())),
            ..Default::default()
        });
        world.ensure_chunks_loaded();

        let edit_pos = BlockPosition::new(3, 4, 5);
        assert!(world.set_block_if_loaded(edit_pos, Block::Wood));

        // Anchor far away: the origin chunk leaves every sphere, is saved,
        // and is dropped from memory.
        let far = BlockPosition::new(
            10 * i64::from(CHUNK_WIDTH),
            10 * i64::from(CHUNK_HEIGHT),
            10 * i64::from(CHUNK_DEPTH),
        );
        world.set_static_anchors(vec![far]);
        world.ensure_chunks_loaded();
        assert!(world.chunk_at(ChunkPosition::new(0, 0, 0)).is_none());
        assert!(store.contains(ChunkPosition::new(0, 0, 0)));

        // Anchor back: the persisted copy is authoritative.
        world.set_static_anchors(vec![BlockPosition::new(0, 0, 0)]);
        world.ensure_chunks_loaded();
        assert_eq!(world.get_block_if_loaded(edit_pos), Some(Block::Wood));
    }

    #[test]
    fn persistence_wins_over_generation() {
        let store = MemoryChunkStore::default();
        let position = ChunkPosition::new(0, 0, 0);
        let mut persisted = ChunkBuffer::new(position);
        persisted.set(LocalPosition::new(0, 0, 0).unwrap(), Block::Sand);
        store.save_chunk(&persisted);

        let mut world = World::new(WorldConfig {
            anchor_radius: 0,
            generator: Some(Box::new(FlatChunkGenerator {
                height: 8,
                block: Block::Grass,
            })),
            persistence: Some(Box::new(store)),
            ..Default::default()
        });
        world.ensure_chunks_loaded();

        // The flat generator would have written Grass here.
        assert_eq!(
            world.get_block_if_loaded(BlockPosition::new(0, 0, 0)),
            Some(Block::Sand)
        );
        assert_eq!(
            world.get_block_if_loaded(BlockPosition::new(1, 0, 0)),
            Some(Block::Empty)
        );
    }

    #[test]
    fn generator_fills_chunks_missing_from_persistence() {
        let mut world = World::new(WorldConfig {
            anchor_radius: 0,
            generator: Some(Box::new(FlatChunkGenerator {
                height: 8,
                block: Block::Grass,
            })),
            ..Default::default()
        });
        world.ensure_chunks_loaded();
        assert_eq!(
            world.get_block_if_loaded(BlockPosition::new(10, 0, 10)),
            Some(Block::Grass)
        );
    }

    #[test]
    fn writes_to_unloaded_chunks_are_refused() {
        let mut world = World::new(WorldConfig::default());
        let far = BlockPosition::new(100_000, 0, 0);
        assert!(!world.set_block_if_loaded(far, Block::Stone));
        assert_eq!(world.get_block_if_loaded(far), None);
    }

    #[test]
    fn world_persistence_round_trip_across_instances() {
        let store = MemoryChunkStore::default();
        let edit_pos = BlockPosition::new(7, 8, 9);
        {
            let mut world = World::new(WorldConfig {
                anchor_radius: 0,
                persistence: Some(Box::new(store.clone())),
                ..Default::default()
            });
            world.ensure_chunks_loaded();
            assert!(world.set_block_if_loaded(edit_pos, Block::Leaves));
            // Dropping the world saves all loaded chunks.
        }

        let mut reopened = World::new(WorldConfig {
            anchor_radius: 0,
            persistence: Some(Box::new(store)),
            ..Default::default()
        });
        reopened.ensure_chunks_loaded();
        assert_eq!(reopened.get_block_if_loaded(edit_pos), Some(Block::Leaves));
    }

    #[test]
    fn session_positions_anchor_chunks() {
        let mut world = World::new(WorldConfig {
            anchor_radius: 0,
            static_anchors: vec![],
            ..Default::default()
        });
        world.ensure_chunks_loaded();
        assert_eq!(world.resident_chunk_count(), 0);

        let spawn = PrecisePosition::new(
            f64::from(CHUNK_WIDTH) * 2.5,
            10.0,
            f64::from(CHUNK_DEPTH) * -1.5,
        );
        world.connect_player("alice", spawn);
        world.ensure_chunks_loaded();
        assert!(world.chunk_at(ChunkPosition::new(2, 0, -2)).is_some());
        assert_eq!(world.resident_chunk_count(), 1);
    }
}
