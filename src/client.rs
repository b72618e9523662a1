//! Asynchronous chunk-streaming client.
//!
//! Chunk fetches never block the caller: `request_chunk` either returns the
//! cached buffer or kicks an async `GetChunk` and returns nothing, and the
//! caller drains completions later (typically once per frame) with
//! `process_pending_requests`. Outstanding chunk calls are capped; overflow
//! requests wait in a FIFO backlog. Responses arrive in whatever order the
//! server produces them; each completion is independent, matched back to
//! its request by the envelope id.
//!
//! Block and session operations are ordinary synchronous RPCs with a
//! deadline.

use crate::shared::chunk_payload::decode_chunk;
use crate::shared::protocol::{
    read_frame, write_frame, Request, RequestEnvelope, Response, ResponseEnvelope,
    CHUNK_REQUEST_TIMEOUT, CLIENT_CACHE_CAP, DISCONNECT_DRAIN_TIMEOUT, MAX_INFLIGHT_REQUESTS,
};
use crate::shared::spatial::{BlockPosition, ChunkPosition, PrecisePosition};
use crate::shared::voxel::{Block, ChunkBuffer};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long one completion drain waits for the first event.
const DRAIN_FIRST_EVENT_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum ClientError {
    /// The transport is gone (never connected, dropped, or shut down).
    Disconnected,
    /// No response within the RPC deadline.
    Timeout,
    /// The server answered with an error message.
    Server(String),
    /// The server answered with the wrong response shape.
    UnexpectedResponse,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "not connected to server"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Server(message) => write!(f, "server error: {message}"),
            Self::UnexpectedResponse => write!(f, "unexpected response type"),
        }
    }
}

impl std::error::Error for ClientError {}

#[derive(Clone, Copy, Debug)]
pub struct ClientConfig {
    /// Cap on outstanding `GetChunk` calls.
    pub max_inflight: usize,
    /// Chunk cache capacity in entries.
    pub cache_cap: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_inflight: MAX_INFLIGHT_REQUESTS,
            cache_cap: CLIENT_CACHE_CAP,
        }
    }
}

#[derive(Default)]
struct PlayerState {
    id: Option<u64>,
    position: PrecisePosition,
}

#[derive(Clone, Copy, Debug)]
struct InflightRequest {
    position: ChunkPosition,
    requested_at: Instant,
}

pub struct StreamClient {
    connected: Arc<AtomicBool>,
    stream: TcpStream,
    writer_tx: mpsc::Sender<RequestEnvelope>,
    next_request_id: AtomicU64,

    /// Waiters for synchronous calls, keyed by request id. The reader thread
    /// routes responses here first; anything unclaimed is a chunk completion.
    sync_waiters: Arc<Mutex<HashMap<u64, mpsc::Sender<Response>>>>,
    completions: Mutex<mpsc::Receiver<(u64, Response)>>,

    // Chunk pipeline tables. Acquisition order when several are needed:
    // requested -> in-flight -> backlog -> cache.
    requested: Mutex<HashSet<ChunkPosition>>,
    inflight: Mutex<HashMap<u64, InflightRequest>>,
    backlog: Mutex<VecDeque<ChunkPosition>>,
    cache: Mutex<HashMap<ChunkPosition, Arc<ChunkBuffer>>>,

    session_token: Mutex<Option<String>>,
    player: Mutex<PlayerState>,

    max_inflight: usize,
    cache_cap: usize,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    pub fn connect(addr: impl ToSocketAddrs) -> std::io::Result<StreamClient> {
        Self::connect_with(addr, ClientConfig::default())
    }

    pub fn connect_with(addr: impl ToSocketAddrs, config: ClientConfig) -> std::io::Result<StreamClient> {
        let stream = TcpStream::connect(addr)?;
        let _ = stream.set_nodelay(true);

        let connected = Arc::new(AtomicBool::new(true));
        let sync_waiters: Arc<Mutex<HashMap<u64, mpsc::Sender<Response>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let (writer_tx, writer_rx) = mpsc::channel::<RequestEnvelope>();
        {
            let writer_stream = stream.try_clone()?;
            let connected = connected.clone();
            thread::spawn(move || {
                let mut writer = BufWriter::new(writer_stream);
                while let Ok(envelope) = writer_rx.recv() {
                    if write_frame(&mut writer, &envelope).is_err() {
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            });
        }

        let (completion_tx, completion_rx) = mpsc::channel::<(u64, Response)>();
        let reader_handle = {
            let reader_stream = stream.try_clone()?;
            let connected = connected.clone();
            let sync_waiters = sync_waiters.clone();
            thread::spawn(move || {
                let mut reader = BufReader::new(reader_stream);
                loop {
                    let envelope: ResponseEnvelope = match read_frame(&mut reader) {
                        Ok(Some(envelope)) => envelope,
                        Ok(None) => break,
                        Err(e) => {
                            if connected.load(Ordering::SeqCst) {
                                warn!("connection read error: {e}");
                            }
                            break;
                        }
                    };
                    let waiter = sync_waiters
                        .lock()
                        .expect("sync waiter table lock poisoned")
                        .remove(&envelope.request_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(envelope.response);
                        }
                        None => {
                            if completion_tx
                                .send((envelope.request_id, envelope.response))
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
            })
        };

        Ok(StreamClient {
            connected,
            stream,
            writer_tx,
            next_request_id: AtomicU64::new(0),
            sync_waiters,
            completions: Mutex::new(completion_rx),
            requested: Mutex::new(HashSet::new()),
            inflight: Mutex::new(HashMap::new()),
            backlog: Mutex::new(VecDeque::new()),
            cache: Mutex::new(HashMap::new()),
            session_token: Mutex::new(None),
            player: Mutex::new(PlayerState::default()),
            max_inflight: config.max_inflight,
            cache_cap: config.cache_cap,
            reader_handle: Mutex::new(Some(reader_handle)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn alloc_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn player_position(&self) -> PrecisePosition {
        self.player.lock().expect("player state lock poisoned").position
    }

    pub fn set_player_position(&self, position: PrecisePosition) {
        self.player.lock().expect("player state lock poisoned").position = position;
    }

    pub fn player_id(&self) -> Option<u64> {
        self.player.lock().expect("player state lock poisoned").id
    }

    pub fn session_token(&self) -> Option<String> {
        self.session_token
            .lock()
            .expect("session token lock poisoned")
            .clone()
    }

    pub fn has_session(&self) -> bool {
        self.session_token().is_some()
    }

    fn clear_session(&self) {
        self.session_token
            .lock()
            .expect("session token lock poisoned")
            .take();
    }

    // -- synchronous RPC ----------------------------------------------------

    /// One blocking round trip with the standard deadline. Server-side
    /// failures surface as `ClientError::Server`.
    fn call(&self, request: Request) -> Result<Response, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }
        let request_id = self.alloc_request_id();
        let (tx, rx) = mpsc::channel();
        self.sync_waiters
            .lock()
            .expect("sync waiter table lock poisoned")
            .insert(request_id, tx);

        let envelope = RequestEnvelope {
            request_id,
            request,
        };
        if self.writer_tx.send(envelope).is_err() {
            self.sync_waiters
                .lock()
                .expect("sync waiter table lock poisoned")
                .remove(&request_id);
            return Err(ClientError::Disconnected);
        }

        match rx.recv_timeout(CHUNK_REQUEST_TIMEOUT) {
            Ok(Response::Error { message }) => Err(ClientError::Server(message)),
            Ok(response) => Ok(response),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.sync_waiters
                    .lock()
                    .expect("sync waiter table lock poisoned")
                    .remove(&request_id);
                Err(ClientError::Timeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ClientError::Disconnected),
        }
    }

    pub fn ping(&self) -> bool {
        matches!(self.call(Request::Ping), Ok(Response::Pong))
    }

    pub fn server_info(&self) -> Result<String, ClientError> {
        match self.call(Request::GetServerInfo)? {
            Response::ServerInfo { info } => Ok(info),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Open a session. On success the token, player id, and the
    /// server-confirmed spawn position become this client's state.
    pub fn connect_player(
        &self,
        name: &str,
        spawn: PrecisePosition,
    ) -> Result<u64, ClientError> {
        let response = self.call(Request::ConnectPlayer {
            name: name.to_string(),
            spawn,
        })?;
        match response {
            Response::PlayerConnected {
                token,
                player_id,
                spawn,
            } => {
                *self.session_token.lock().expect("session token lock poisoned") = Some(token);
                {
                    let mut player = self.player.lock().expect("player state lock poisoned");
                    player.id = Some(player_id);
                    player.position = spawn;
                }
                info!("connected as player {player_id}");
                Ok(player_id)
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Keep the session alive. A failed refresh drops the local token, which
    /// is no longer believed valid.
    pub fn refresh_session(&self) -> bool {
        let Some(token) = self.session_token() else {
            return false;
        };
        match self.call(Request::RefreshSession { token }) {
            Ok(Response::Ack) => true,
            Ok(_) | Err(ClientError::Server(_)) => {
                self.clear_session();
                false
            }
            Err(e) => {
                warn!("refresh failed: {e}");
                false
            }
        }
    }

    pub fn update_player_position(&self, position: PrecisePosition) -> bool {
        let Some(token) = self.session_token() else {
            warn!("no session token for position update");
            return false;
        };
        match self.call(Request::UpdatePlayerPosition { token, position }) {
            Ok(Response::Ack) => {
                self.set_player_position(position);
                true
            }
            Err(ClientError::Server(message)) => {
                warn!("position update rejected: {message}");
                if message.contains("Invalid or expired session") {
                    self.clear_session();
                }
                false
            }
            Ok(_) => false,
            Err(e) => {
                warn!("position update failed: {e}");
                false
            }
        }
    }

    pub fn disconnect_player(&self) -> bool {
        let Some(token) = self.session_token() else {
            return true;
        };
        let result = self.call(Request::DisconnectPlayer { token });
        self.clear_session();
        matches!(result, Ok(Response::Ack))
    }

    // -- block operations ---------------------------------------------------

    pub fn place_block(&self, position: BlockPosition, block: Block) -> bool {
        let response = self.call(Request::PlaceBlock {
            position: Some(self.player_position()),
            block_pos: position,
            block: block.to_wire(),
        });
        match response {
            Ok(Response::Ack) => {
                self.patch_cached_block(position, block);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("place_block failed: {e}");
                false
            }
        }
    }

    pub fn break_block(&self, position: BlockPosition) -> bool {
        let response = self.call(Request::BreakBlock {
            position: Some(self.player_position()),
            block_pos: position,
        });
        match response {
            Ok(Response::Ack) => {
                self.patch_cached_block(position, Block::Empty);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("break_block failed: {e}");
                false
            }
        }
    }

    /// Keep the optimistic local view in step with a confirmed server write.
    fn patch_cached_block(&self, position: BlockPosition, block: Block) {
        let Ok(chunk_pos) = position.to_chunk() else {
            return;
        };
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        if let Some(entry) = cache.get_mut(&chunk_pos) {
            Arc::make_mut(entry).set(position.to_local(), block);
        }
    }

    pub fn get_block_at(&self, position: BlockPosition) -> Option<Block> {
        if let Ok(chunk_pos) = position.to_chunk() {
            let cache = self.cache.lock().expect("cache lock poisoned");
            if let Some(chunk) = cache.get(&chunk_pos) {
                return Some(chunk.get(position.to_local()));
            }
        }
        match self.call(Request::GetBlockAt {
            block_pos: position,
        }) {
            Ok(Response::BlockAt { block }) => Block::from_wire(block),
            Ok(_) => None,
            Err(e) => {
                warn!("get_block_at failed: {e}");
                None
            }
        }
    }

    /// Poll the server's dirty set around the current position. Returned
    /// chunks are dropped from the local cache so the next `request_chunk`
    /// refetches fresh contents.
    pub fn get_updated_chunks(&self, render_distance: i32) -> Vec<ChunkPosition> {
        let response = self.call(Request::GetUpdatedChunks {
            position: self.player_position(),
            render_distance,
        });
        match response {
            Ok(Response::UpdatedChunks { chunks }) => {
                for chunk in &chunks {
                    self.requested
                        .lock()
                        .expect("requested set lock poisoned")
                        .remove(chunk);
                    self.cache.lock().expect("cache lock poisoned").remove(chunk);
                }
                chunks
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!("get_updated_chunks failed: {e}");
                Vec::new()
            }
        }
    }

    // -- chunk streaming pipeline -------------------------------------------

    /// Cached buffer if present, otherwise kick an async fetch and return
    /// nothing. Never blocks on the network.
    pub fn request_chunk(&self, position: ChunkPosition) -> Option<Arc<ChunkBuffer>> {
        if let Some(chunk) = self
            .cache
            .lock()
            .expect("cache lock poisoned")
            .get(&position)
        {
            return Some(chunk.clone());
        }
        if !self.is_connected() {
            warn!("request_chunk while disconnected");
            return None;
        }

        {
            let mut requested = self.requested.lock().expect("requested set lock poisoned");
            if !requested.insert(position) {
                return None; // already in flight or queued
            }
        }

        let request_id = self.alloc_request_id();
        let has_slot = {
            let mut inflight = self.inflight.lock().expect("in-flight table lock poisoned");
            if inflight.len() < self.max_inflight {
                inflight.insert(
                    request_id,
                    InflightRequest {
                        position,
                        requested_at: Instant::now(),
                    },
                );
                true
            } else {
                false
            }
        };

        if has_slot {
            self.send_chunk_request(request_id, position);
        } else {
            self.backlog
                .lock()
                .expect("backlog lock poisoned")
                .push_back(position);
        }
        None
    }

    /// Warm the cache around a position: request every chunk in the cube of
    /// `radius` chunks. Fetches flow through the normal bounded pipeline, so
    /// a large radius simply fills the backlog.
    pub fn preload_chunks_around(&self, position: BlockPosition, radius: u32) {
        let Ok(center) = position.to_chunk() else {
            warn!("preload center {position:?} is out of range");
            return;
        };
        let r = i64::from(radius);
        for dx in -r..=r {
            for dy in -r..=r {
                for dz in -r..=r {
                    let (Some(x), Some(y), Some(z)) = (
                        center.x.checked_add(dx as i32),
                        center.y.checked_add(dy as i32),
                        center.z.checked_add(dz as i32),
                    ) else {
                        continue;
                    };
                    self.request_chunk(ChunkPosition::new(x, y, z));
                }
            }
        }
    }

    fn send_chunk_request(&self, request_id: u64, position: ChunkPosition) {
        let envelope = RequestEnvelope {
            request_id,
            request: Request::GetChunk {
                position: Some(self.player_position()),
                chunk: position,
            },
        };
        if self.writer_tx.send(envelope).is_err() {
            warn!("failed to send chunk request for {position:?}");
            self.inflight
                .lock()
                .expect("in-flight table lock poisoned")
                .remove(&request_id);
            self.requested
                .lock()
                .expect("requested set lock poisoned")
                .remove(&position);
        }
    }

    /// Drop in-flight entries older than the RPC deadline so a silent server
    /// cannot wedge the request window shut.
    fn expire_stale_requests(&self) {
        let stale: Vec<(u64, ChunkPosition)> = {
            let inflight = self.inflight.lock().expect("in-flight table lock poisoned");
            inflight
                .iter()
                .filter(|(_, entry)| entry.requested_at.elapsed() >= CHUNK_REQUEST_TIMEOUT)
                .map(|(&id, entry)| (id, entry.position))
                .collect()
        };
        for (request_id, position) in stale {
            warn!("chunk request for {position:?} timed out");
            self.inflight
                .lock()
                .expect("in-flight table lock poisoned")
                .remove(&request_id);
            self.requested
                .lock()
                .expect("requested set lock poisoned")
                .remove(&position);
        }
    }

    /// Drain ready completions (waiting at most ~10 ms for the first one),
    /// cache whatever decoded, and refill the in-flight window from the
    /// backlog.
    pub fn process_pending_requests(&self) {
        self.expire_stale_requests();

        let mut events: Vec<(u64, Response)> = Vec::new();
        {
            let completions = self.completions.lock().expect("completion queue lock poisoned");
            match completions.recv_timeout(DRAIN_FIRST_EVENT_TIMEOUT) {
                Ok(event) => {
                    events.push(event);
                    while let Ok(event) = completions.try_recv() {
                        events.push(event);
                    }
                }
                Err(_) => {
                    // No completions, but expiry may have freed slots.
                    self.drain_backlog();
                    return;
                }
            }
        }

        for (request_id, response) in events {
            let entry = self
                .inflight
                .lock()
                .expect("in-flight table lock poisoned")
                .remove(&request_id);
            let Some(entry) = entry else {
                debug!("completion for unknown request {request_id}");
                continue;
            };
            let position = entry.position;

            match response {
                Response::Chunk {
                    chunk,
                    data: Some(bytes),
                } => match decode_chunk(&bytes, chunk) {
                    Ok(buffer) => {
                        debug!("loaded chunk {chunk:?} ({} bytes)", bytes.len());
                        self.insert_cache(chunk, buffer);
                    }
                    Err(e) => {
                        warn!("failed to decode chunk {chunk:?}: {e}");
                    }
                },
                Response::Chunk { chunk, data: None } => {
                    // Not generated yet; dropping the requested entry below
                    // lets the caller retry.
                    debug!("chunk {chunk:?} not available yet");
                }
                Response::Error { message } => {
                    warn!("chunk request for {position:?} failed: {message}");
                }
                other => {
                    warn!("unexpected completion for {position:?}: {other:?}");
                }
            }

            self.requested
                .lock()
                .expect("requested set lock poisoned")
                .remove(&position);

            self.drain_backlog();
        }
    }

    fn drain_backlog(&self) {
        if !self.is_connected() {
            // Shutdown in progress; completions still dispatch but no new
            // requests go out.
            return;
        }
        loop {
            let next = {
                let inflight = self.inflight.lock().expect("in-flight table lock poisoned");
                if inflight.len() >= self.max_inflight {
                    return;
                }
                drop(inflight);
                self.backlog.lock().expect("backlog lock poisoned").pop_front()
            };
            let Some(position) = next else {
                return;
            };

            // Another path may have satisfied this chunk while it queued.
            if self
                .cache
                .lock()
                .expect("cache lock poisoned")
                .contains_key(&position)
            {
                self.requested
                    .lock()
                    .expect("requested set lock poisoned")
                    .remove(&position);
                continue;
            }

            let request_id = self.alloc_request_id();
            let claimed = {
                let mut inflight = self.inflight.lock().expect("in-flight table lock poisoned");
                if inflight.len() >= self.max_inflight {
                    false
                } else {
                    inflight.insert(
                        request_id,
                        InflightRequest {
                            position,
                            requested_at: Instant::now(),
                        },
                    );
                    true
                }
            };
            if !claimed {
                self.backlog
                    .lock()
                    .expect("backlog lock poisoned")
                    .push_front(position);
                return;
            }
            self.send_chunk_request(request_id, position);
        }
    }

    /// Insert and trim back to capacity. The trim removes whatever map
    /// iteration yields first; the contract is only that the cap holds after
    /// every completed insert.
    fn insert_cache(&self, position: ChunkPosition, buffer: ChunkBuffer) {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        cache.insert(position, Arc::new(buffer));
        if cache.len() > self.cache_cap {
            let excess = cache.len() - self.cache_cap;
            let victims: Vec<ChunkPosition> = cache.keys().take(excess).copied().collect();
            for victim in victims {
                cache.remove(&victim);
            }
        }
    }

    pub fn cached_chunk(&self, position: ChunkPosition) -> Option<Arc<ChunkBuffer>> {
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .get(&position)
            .cloned()
    }

    pub fn cache_size(&self) -> usize {
        self.cache.lock().expect("cache lock poisoned").len()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .expect("in-flight table lock poisoned")
            .len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().expect("backlog lock poisoned").len()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("cache lock poisoned").clear();
    }

    // -- teardown -----------------------------------------------------------

    /// Stop issuing requests, drain outstanding completions for up to the
    /// disconnect timeout, then clear every table and release the transport.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        let deadline = Instant::now() + DISCONNECT_DRAIN_TIMEOUT;
        while self.inflight_count() > 0 && Instant::now() < deadline {
            self.process_pending_requests();
        }
        let abandoned = self.inflight_count();
        if abandoned > 0 {
            warn!("disconnect abandoning {abandoned} pending request(s)");
        }

        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self
            .reader_handle
            .lock()
            .expect("reader handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }

        self.sync_waiters
            .lock()
            .expect("sync waiter table lock poisoned")
            .clear();
        self.inflight
            .lock()
            .expect("in-flight table lock poisoned")
            .clear();
        self.backlog.lock().expect("backlog lock poisoned").clear();
        self.requested
            .lock()
            .expect("requested set lock poisoned")
            .clear();
        self.cache.lock().expect("cache lock poisoned").clear();
        self.clear_session();
        self.player.lock().expect("player state lock poisoned").id = None;
        info!("client disconnected");
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
