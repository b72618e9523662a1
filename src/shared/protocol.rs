use crate::shared::spatial::{BlockPosition, ChunkPosition, PrecisePosition};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire contract
//
// Length-prefixed typed RPC over TCP: every message is a u32 little-endian
// payload length followed by the postcard encoding of an envelope. Requests
// carry a client-allocated `request_id` that the server echoes verbatim, so
// responses may arrive in any order and each completion is independent.
//
// Chunk payloads are SCO1 bytes (see `chunk_payload`) carried opaquely.
// ---------------------------------------------------------------------------

/// Hard ceiling on a single frame. A worst-case fully solid chunk payload is
/// ~83 MiB of SCO1 entries; anything past this is a protocol violation.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Sessions expire when no refresh or position update arrives within this
/// window.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of the server-side expired-session sweep.
pub const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Client-side bound on outstanding `GetChunk` calls; excess requests queue
/// in a FIFO backlog.
pub const MAX_INFLIGHT_REQUESTS: usize = 64;

/// Client chunk-cache capacity (entries, trimmed after insert).
pub const CLIENT_CACHE_CAP: usize = 100;

/// Deadline for a single RPC round trip.
pub const CHUNK_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `disconnect` waits for in-flight completions to drain.
pub const DISCONNECT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    GetServerInfo,
    ConnectPlayer {
        name: String,
        spawn: PrecisePosition,
    },
    RefreshSession {
        token: String,
    },
    UpdatePlayerPosition {
        token: String,
        position: PrecisePosition,
    },
    DisconnectPlayer {
        token: String,
    },
    GetChunk {
        position: Option<PrecisePosition>,
        chunk: ChunkPosition,
    },
    GetUpdatedChunks {
        position: PrecisePosition,
        render_distance: i32,
    },
    PlaceBlock {
        position: Option<PrecisePosition>,
        block_pos: BlockPosition,
        block: u32,
    },
    BreakBlock {
        position: Option<PrecisePosition>,
        block_pos: BlockPosition,
    },
    GetBlockAt {
        block_pos: BlockPosition,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Pong,
    ServerInfo {
        info: String,
    },
    PlayerConnected {
        token: String,
        player_id: u64,
        spawn: PrecisePosition,
    },
    /// Success acknowledgement for session and block mutations.
    Ack,
    /// `data: None` means the chunk is not resident. Absence, not an error.
    Chunk {
        chunk: ChunkPosition,
        data: Option<Vec<u8>>,
    },
    UpdatedChunks {
        chunks: Vec<ChunkPosition>,
    },
    BlockAt {
        block: u32,
    },
    /// Any recoverable handler failure; the message is specific enough for
    /// the client to react (e.g. clear an invalid session token).
    Error {
        message: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub request: Request,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub response: Response,
}

/// Write one length-prefixed postcard frame.
pub fn write_frame<T: Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    let encoded = postcard::to_stdvec(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if encoded.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("outgoing frame of {} bytes exceeds limit", encoded.len()),
        ));
    }
    writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
    writer.write_all(&encoded)?;
    writer.flush()
}

/// Read one frame. `Ok(None)` on a clean EOF at a frame boundary; any other
/// short read or malformed payload is an error.
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("incoming frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let value = postcard::from_bytes(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}
