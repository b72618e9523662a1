//! Server runtime: the TCP RPC service over the authoritative world.
//!
//! One thread per connection reads length-prefixed request envelopes and
//! answers through a per-connection writer thread; a background ticker
//! sweeps expired sessions. Handlers take at most the session table, then
//! the world lock, then the dirty set, in that order.

pub mod noise;
pub mod persistence;
pub mod procgen;
pub mod session;
pub mod world;

pub use persistence::{ChunkPersistence, SledChunkStore};
pub use procgen::{ChunkGenerator, EmptyChunkGenerator, FlatChunkGenerator, Overlay, TerrainChunkGenerator};
pub use session::{Session, SessionManager};
pub use world::{World, WorldConfig};

use crate::shared::chunk_payload::encode_chunk;
use crate::shared::protocol::{
    read_frame, write_frame, Request, RequestEnvelope, Response, ResponseEnvelope,
    SESSION_CLEANUP_INTERVAL,
};
use crate::shared::spatial::{BlockPosition, ChunkPosition};
use crate::shared::voxel::Block;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Which generation strategy a server world uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorldGeneratorKind {
    Empty,
    Flat,
    Terrain,
}

impl WorldGeneratorKind {
    pub fn build(self) -> Box<dyn ChunkGenerator> {
        match self {
            WorldGeneratorKind::Empty => Box::new(EmptyChunkGenerator),
            WorldGeneratorKind::Flat => Box::new(FlatChunkGenerator {
                height: 4,
                block: Block::Grass,
            }),
            WorldGeneratorKind::Terrain => Box::new(TerrainChunkGenerator),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub bind: String,
    /// Chunk database location; `None` runs without persistence.
    pub db_path: Option<PathBuf>,
    pub seed: u64,
    pub anchor_radius: u32,
    pub static_anchors: Vec<BlockPosition>,
    pub generator: WorldGeneratorKind,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:4000".to_string(),
            db_path: None,
            seed: 1337,
            anchor_radius: 1,
            static_anchors: vec![BlockPosition::new(0, 0, 0)],
            generator: WorldGeneratorKind::Terrain,
        }
    }
}

type SharedWorld = Arc<Mutex<World>>;
type DirtySet = Arc<Mutex<HashSet<ChunkPosition>>>;

pub struct Server {
    world: SharedWorld,
    dirty: DirtySet,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    accept_thread: Option<JoinHandle<()>>,
    cleanup_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind, warm the static-anchor neighborhood, and start serving.
    pub fn start(config: RuntimeConfig) -> std::io::Result<Server> {
        let persistence: Option<Box<dyn ChunkPersistence>> = match &config.db_path {
            Some(path) => {
                let store = SledChunkStore::open(path)
                    .map_err(|e| std::io::Error::other(format!("chunk store: {e}")))?;
                Some(Box::new(store))
            }
            None => None,
        };

        let mut world = World::new(WorldConfig {
            generator: Some(config.generator.build()),
            static_anchors: config.static_anchors.clone(),
            anchor_fn: None,
            anchor_radius: config.anchor_radius,
            seed: config.seed,
            persistence,
        });
        world.ensure_chunks_loaded();
        info!(
            "world ready: {} chunks resident around {} static anchors",
            world.resident_chunk_count(),
            config.static_anchors.len()
        );

        let sessions = world.sessions().clone();
        let world: SharedWorld = Arc::new(Mutex::new(world));
        let dirty: DirtySet = Arc::new(Mutex::new(HashSet::new()));
        let running = Arc::new(AtomicBool::new(true));

        let listener = TcpListener::bind(&config.bind)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        info!("listening on {local_addr}");

        let accept_thread = {
            let world = world.clone();
            let sessions = sessions.clone();
            let dirty = dirty.clone();
            let running = running.clone();
            let info_line = format!(
                "voxelstream server v{} on {local_addr}",
                env!("CARGO_PKG_VERSION")
            );
            thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            spawn_connection(
                                stream,
                                peer,
                                world.clone(),
                                sessions.clone(),
                                dirty.clone(),
                                info_line.clone(),
                            );
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                        Err(e) => {
                            error!("accept failed: {e}");
                            thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                    }
                }
            })
        };

        let cleanup_thread = {
            let sessions = sessions.clone();
            let running = running.clone();
            thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    thread::sleep(SESSION_CLEANUP_INTERVAL);
                    let expired = sessions.remove_expired();
                    if !expired.is_empty() {
                        info!("expired {} session(s)", expired.len());
                    }
                }
            })
        };

        Ok(Server {
            world,
            dirty,
            running,
            local_addr,
            accept_thread: Some(accept_thread),
            cleanup_thread: Some(cleanup_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Direct handle to the world, for embedding and tests.
    pub fn world(&self) -> &SharedWorld {
        &self.world
    }

    /// Chunks currently marked dirty and not yet drained by any client.
    pub fn dirty_chunk_count(&self) -> usize {
        self.dirty.lock().expect("dirty set lock poisoned").len()
    }

    /// Stop accepting, join background threads, flush the world.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.cleanup_thread.take() {
            let _ = handle.join();
        }
        self.world
            .lock()
            .expect("world lock poisoned")
            .save_all_loaded_chunks();
        info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    world: SharedWorld,
    sessions: Arc<SessionManager>,
    dirty: DirtySet,
    info_line: String,
) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_nonblocking(false);

    let writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!("failed to clone stream for {peer}: {e}");
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<ResponseEnvelope>();
    thread::spawn(move || {
        let mut writer = BufWriter::new(writer_stream);
        while let Ok(envelope) = rx.recv() {
            if write_frame(&mut writer, &envelope).is_err() {
                break;
            }
        }
    });

    thread::spawn(move || {
        info!("client connected from {peer}");
        let mut reader = BufReader::new(stream);
        loop {
            let envelope: RequestEnvelope = match read_frame(&mut reader) {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e) => {
                    warn!("read error for {peer}: {e}");
                    break;
                }
            };
            let response =
                handle_request(&world, &sessions, &dirty, &info_line, envelope.request);
            let reply = ResponseEnvelope {
                request_id: envelope.request_id,
                response,
            };
            if tx.send(reply).is_err() {
                break;
            }
        }
        info!("client {peer} disconnected");
    });
}

fn error_response(message: impl Into<String>) -> Response {
    Response::Error {
        message: message.into(),
    }
}

fn handle_request(
    world: &SharedWorld,
    sessions: &SessionManager,
    dirty: &DirtySet,
    info_line: &str,
    request: Request,
) -> Response {
    match request {
        Request::Ping => Response::Pong,

        Request::GetServerInfo => Response::ServerInfo {
            info: info_line.to_string(),
        },

        Request::ConnectPlayer { name, spawn } => {
            if name.is_empty() {
                return error_response("Player name cannot be empty");
            }
            let mut guard = world.lock().expect("world lock poisoned");
            let (token, player_id) = guard.connect_player(&name, spawn);
            guard.ensure_chunks_loaded();
            Response::PlayerConnected {
                token,
                player_id,
                spawn,
            }
        }

        Request::RefreshSession { token } => {
            if token.is_empty() {
                return error_response("Session token cannot be empty");
            }
            if sessions.refresh(&token) {
                Response::Ack
            } else {
                error_response("Invalid or expired session token")
            }
        }

        Request::UpdatePlayerPosition { token, position } => {
            if token.is_empty() {
                return error_response("Session token cannot be empty");
            }
            if !sessions.update_position(&token, position) {
                return error_response("Invalid or expired session token");
            }
            // The new position is now an anchor; converge residency on it.
            let mut guard = world.lock().expect("world lock poisoned");
            guard.ensure_chunks_loaded();
            Response::Ack
        }

        Request::DisconnectPlayer { token } => {
            if token.is_empty() {
                return error_response("Session token cannot be empty");
            }
            let mut guard = world.lock().expect("world lock poisoned");
            match guard.disconnect_by_session(&token) {
                Some(_) => Response::Ack,
                None => error_response("Invalid session token"),
            }
        }

        Request::GetChunk { position, chunk } => {
            let mut guard = world.lock().expect("world lock poisoned");
            // A client advertising a position may be asking slightly ahead
            // of the last ensure pass; converge once before answering.
            if guard.chunk_at(chunk).is_none() && position.is_some() {
                guard.ensure_chunks_loaded();
            }
            match guard.chunk_at(chunk) {
                Some(buffer) => {
                    let data = encode_chunk(buffer);
                    debug!("serving chunk {chunk:?} ({} bytes)", data.len());
                    Response::Chunk {
                        chunk,
                        data: Some(data),
                    }
                }
                // Absence is a valid answer, not an error.
                None => Response::Chunk { chunk, data: None },
            }
        }

        Request::GetUpdatedChunks {
            position,
            render_distance,
        } => {
            let player_chunk = match position.to_block().and_then(|b| b.to_chunk()) {
                Ok(chunk) => chunk,
                Err(e) => return error_response(format!("player position invalid: {e}")),
            };
            let mut dirty_guard = dirty.lock().expect("dirty set lock poisoned");
            let chunks = drain_updated_chunks(&mut dirty_guard, player_chunk, render_distance);
            Response::UpdatedChunks { chunks }
        }

        Request::PlaceBlock {
            position: _,
            block_pos,
            block,
        } => {
            let Some(block) = Block::from_wire(block) else {
                return error_response(format!("Unknown block type {block}"));
            };
            place_block(world, dirty, block_pos, block)
        }

        Request::BreakBlock {
            position: _,
            block_pos,
        } => place_block(world, dirty, block_pos, Block::Empty),

        Request::GetBlockAt { block_pos } => {
            let guard = world.lock().expect("world lock poisoned");
            // Non-resident chunks read as Empty; the call still succeeds.
            let block = guard.get_block_if_loaded(block_pos).unwrap_or(Block::Empty);
            Response::BlockAt {
                block: block.to_wire(),
            }
        }
    }
}

fn place_block(
    world: &SharedWorld,
    dirty: &DirtySet,
    block_pos: BlockPosition,
    block: Block,
) -> Response {
    let chunk_pos = match block_pos.to_chunk() {
        Ok(chunk) => chunk,
        Err(e) => return error_response(format!("block position invalid: {e}")),
    };
    let placed = {
        let mut guard = world.lock().expect("world lock poisoned");
        guard.set_block_if_loaded(block_pos, block)
    };
    if !placed {
        return error_response("Chunk not loaded");
    }
    dirty
        .lock()
        .expect("dirty set lock poisoned")
        .insert(chunk_pos);
    Response::Ack
}

/// Pull the dirty entries within the Chebyshev render cube around
/// `player_chunk`, removing exactly those from the set. Chebyshev distance
/// is never negative, so a negative `render_distance` matches nothing.
fn drain_updated_chunks(
    dirty: &mut HashSet<ChunkPosition>,
    player_chunk: ChunkPosition,
    render_distance: i32,
) -> Vec<ChunkPosition> {
    let range = i64::from(render_distance);
    let drained: Vec<ChunkPosition> = dirty
        .iter()
        .filter(|chunk| chunk.chebyshev_distance(player_chunk) <= range)
        .copied()
        .collect();
    for chunk in &drained {
        dirty.remove(chunk);
    }
    drained
}
