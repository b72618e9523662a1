//! End-to-end scenarios over loopback TCP: one server per test on an
//! ephemeral port, driven by a real streaming client.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use voxelstream::client::{ClientConfig, StreamClient};
use voxelstream::server::{RuntimeConfig, Server, SledChunkStore, World, WorldConfig, WorldGeneratorKind};
use voxelstream::shared::spatial::{BlockPosition, ChunkPosition, LocalPosition, PrecisePosition};
use voxelstream::shared::voxel::{Block, ChunkBuffer, CHUNK_DEPTH, CHUNK_HEIGHT, CHUNK_WIDTH};

fn start_server(generator: WorldGeneratorKind, anchor_radius: u32, seed: u64) -> Server {
    Server::start(RuntimeConfig {
        bind: "127.0.0.1:0".to_string(),
        db_path: None,
        seed,
        anchor_radius,
        static_anchors: vec![BlockPosition::new(0, 0, 0)],
        generator,
    })
    .expect("server should start on an ephemeral port")
}

fn connect(server: &Server) -> StreamClient {
    StreamClient::connect(server.local_addr()).expect("client should connect")
}

/// Poll the async pipeline until the chunk lands in the cache or the
/// deadline passes.
fn fetch_chunk(
    client: &StreamClient,
    position: ChunkPosition,
    deadline: Duration,
) -> Option<Arc<ChunkBuffer>> {
    let end = Instant::now() + deadline;
    loop {
        if let Some(chunk) = client.request_chunk(position) {
            return Some(chunk);
        }
        client.process_pending_requests();
        if Instant::now() >= end {
            return None;
        }
    }
}

fn local(x: u32, y: u32, z: u32) -> LocalPosition {
    LocalPosition::new(x, y, z).unwrap()
}

#[test]
fn ping_and_server_info() {
    let server = start_server(WorldGeneratorKind::Empty, 0, 0);
    let client = connect(&server);

    assert!(client.ping());
    let info = client.server_info().unwrap();
    assert!(info.contains("voxelstream"), "unexpected info line: {info}");
}

#[test]
fn connect_move_and_fetch_terrain() {
    let server = start_server(WorldGeneratorKind::Terrain, 0, 42);
    let client = connect(&server);

    client
        .connect_player("P", PrecisePosition::new(0.0, 64.0, 0.0))
        .unwrap();
    assert!(client.has_session());
    assert!(client.update_player_position(PrecisePosition::new(16.0, 64.0, 0.0)));

    let chunk = fetch_chunk(&client, ChunkPosition::new(0, 0, 0), Duration::from_secs(30))
        .expect("terrain chunk should stream down");

    let mut bedrock_in_floor = false;
    let mut stone_below_surface = false;
    for x in 0..CHUNK_WIDTH {
        for z in 0..CHUNK_DEPTH {
            if chunk.get(local(x, 0, z)) == Block::Bedrock {
                bedrock_in_floor = true;
            }
            if chunk.get(local(x, 20, z)) == Block::Stone {
                stone_below_surface = true;
            }
        }
    }
    assert!(bedrock_in_floor, "y=0 plane should contain bedrock");
    assert!(stone_below_surface, "terrain should contain stone below the surface");
}

#[test]
fn place_block_then_read_it_back() {
    let server = start_server(WorldGeneratorKind::Flat, 0, 0);
    let client = connect(&server);
    client
        .connect_player("builder", PrecisePosition::new(0.0, 8.0, 0.0))
        .unwrap();

    let target = BlockPosition::new(5, 10, 5);
    assert!(client.place_block(target, Block::Wood));
    assert_eq!(client.get_block_at(target), Some(Block::Wood));

    assert!(client.break_block(target));
    assert_eq!(client.get_block_at(target), Some(Block::Empty));

    // Outside every anchor sphere the chunk is not resident.
    let far = BlockPosition::new(1_000_000, 0, 0);
    assert!(!client.place_block(far, Block::Stone));
}

#[test]
fn updated_chunks_window_is_chebyshev_and_draining() {
    let server = start_server(WorldGeneratorKind::Empty, 1, 0);
    let client = connect(&server);
    client
        .connect_player("watcher", PrecisePosition::new(0.0, 64.0, 0.0))
        .unwrap();

    // One edit in the origin chunk and one in each face neighbor.
    let edits = [
        BlockPosition::new(0, 0, 0),
        BlockPosition::new(i64::from(CHUNK_WIDTH), 0, 0),
        BlockPosition::new(-1, 0, 0),
        BlockPosition::new(0, i64::from(CHUNK_HEIGHT), 0),
        BlockPosition::new(0, -1, 0),
        BlockPosition::new(0, 0, i64::from(CHUNK_DEPTH)),
        BlockPosition::new(0, 0, -1),
    ];
    for edit in edits {
        assert!(client.place_block(edit, Block::Stone), "edit at {edit:?} should land");
    }

    // Render distance 0: only the player's own chunk drains.
    let near = client.get_updated_chunks(0);
    assert_eq!(near, vec![ChunkPosition::new(0, 0, 0)]);

    // The remaining six neighbors are still dirty and drain next.
    let mut rest = client.get_updated_chunks(1);
    rest.sort();
    let mut expected: Vec<ChunkPosition> = vec![
        ChunkPosition::new(1, 0, 0),
        ChunkPosition::new(-1, 0, 0),
        ChunkPosition::new(0, 1, 0),
        ChunkPosition::new(0, -1, 0),
        ChunkPosition::new(0, 0, 1),
        ChunkPosition::new(0, 0, -1),
    ];
    expected.sort();
    assert_eq!(rest, expected);

    // Drained entries do not reappear.
    assert!(client.get_updated_chunks(5).is_empty());
}

#[test]
fn inflight_cap_backlog_and_cache_cap() {
    let server = start_server(WorldGeneratorKind::Empty, 1, 0);
    let client = StreamClient::connect_with(
        server.local_addr(),
        ClientConfig {
            max_inflight: 4,
            cache_cap: 3,
        },
    )
    .unwrap();

    // 7 resident chunks (radius-1 sphere) plus a spread of absent ones.
    let mut targets: Vec<ChunkPosition> = vec![
        ChunkPosition::new(0, 0, 0),
        ChunkPosition::new(1, 0, 0),
        ChunkPosition::new(-1, 0, 0),
        ChunkPosition::new(0, 1, 0),
        ChunkPosition::new(0, -1, 0),
        ChunkPosition::new(0, 0, 1),
        ChunkPosition::new(0, 0, -1),
    ];
    for i in 2..35 {
        targets.push(ChunkPosition::new(i, i, i));
    }

    for target in &targets {
        let cached = client.request_chunk(*target);
        assert!(cached.is_none(), "nothing should be cached up front");
        assert!(
            client.inflight_count() <= 4,
            "in-flight cap exceeded: {}",
            client.inflight_count()
        );
    }
    assert_eq!(
        client.inflight_count() + client.backlog_len(),
        targets.len(),
        "every request is either in flight or backlogged"
    );
    assert!(client.backlog_len() >= targets.len() - 4);

    // Duplicate requests are deduplicated while pending.
    assert!(client.request_chunk(targets[10]).is_none());
    assert_eq!(client.inflight_count() + client.backlog_len(), targets.len());

    let deadline = Instant::now() + Duration::from_secs(30);
    while (client.inflight_count() > 0 || client.backlog_len() > 0) && Instant::now() < deadline {
        client.process_pending_requests();
        assert!(client.inflight_count() <= 4);
    }
    assert_eq!(client.inflight_count(), 0, "all requests should complete");
    assert_eq!(client.backlog_len(), 0);

    // Seven resident chunks produced payloads; the cache trimmed to its cap.
    assert_eq!(client.cache_size(), 3);

    // Absent chunks were released for retry, not wedged.
    assert!(client.request_chunk(ChunkPosition::new(30, 30, 30)).is_none());
    assert_eq!(client.inflight_count(), 1);
}

#[test]
fn preload_fills_the_cache_with_resident_chunks() {
    let server = start_server(WorldGeneratorKind::Empty, 1, 0);
    let client = connect(&server);
    client
        .connect_player("scout", PrecisePosition::new(0.0, 64.0, 0.0))
        .unwrap();

    // A radius-1 cube is 27 chunks; only the radius-1 sphere (7 chunks) is
    // resident server-side.
    client.preload_chunks_around(BlockPosition::new(0, 0, 0), 1);
    assert_eq!(client.inflight_count() + client.backlog_len(), 27);

    let deadline = Instant::now() + Duration::from_secs(30);
    while (client.inflight_count() > 0 || client.backlog_len() > 0) && Instant::now() < deadline {
        client.process_pending_requests();
    }
    assert_eq!(client.cache_size(), 7);
    assert!(client
        .cached_chunk(ChunkPosition::new(0, 0, 0))
        .is_some());
    assert!(client.cached_chunk(ChunkPosition::new(1, 1, 1)).is_none());
}

#[test]
fn session_expires_without_refresh() {
    let server = start_server(WorldGeneratorKind::Empty, 0, 0);
    let client = connect(&server);
    client
        .connect_player("sleeper", PrecisePosition::new(0.0, 64.0, 0.0))
        .unwrap();

    thread::sleep(Duration::from_secs(6));

    assert!(
        !client.update_player_position(PrecisePosition::new(1.0, 64.0, 0.0)),
        "position update must fail after the session timeout"
    );
    assert!(
        !client.has_session(),
        "the invalid-session error should clear the local token"
    );
}

#[test]
fn refresh_keeps_a_session_alive() {
    let server = start_server(WorldGeneratorKind::Empty, 0, 0);
    let client = connect(&server);
    client
        .connect_player("keeper", PrecisePosition::new(0.0, 64.0, 0.0))
        .unwrap();

    for _ in 0..3 {
        thread::sleep(Duration::from_secs(2));
        assert!(client.refresh_session(), "refresh within the timeout should succeed");
    }
    assert!(client.update_player_position(PrecisePosition::new(2.0, 64.0, 0.0)));
}

#[test]
fn disconnect_drains_and_clears_state() {
    let server = start_server(WorldGeneratorKind::Empty, 1, 0);
    let client = connect(&server);
    client
        .connect_player("leaver", PrecisePosition::new(0.0, 64.0, 0.0))
        .unwrap();

    for i in 0..10 {
        client.request_chunk(ChunkPosition::new(i, 0, 0));
    }
    client.disconnect();

    assert!(!client.is_connected());
    assert_eq!(client.inflight_count(), 0);
    assert_eq!(client.backlog_len(), 0);
    assert_eq!(client.cache_size(), 0);
    assert!(!client.has_session());
    assert!(!client.ping(), "RPCs after disconnect fail fast");
}

fn scratch_dir(name: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let dir = std::env::temp_dir().join(format!(
        "voxelstream-it-{name}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn eviction_persists_edits_across_worlds() {
    let dir = scratch_dir("evict");
    let target_chunk = ChunkPosition::new(5, 5, 5);
    let anchor = target_chunk.origin();
    let edit = BlockPosition::new(
        5 * i64::from(CHUNK_WIDTH),
        5 * i64::from(CHUNK_HEIGHT),
        5 * i64::from(CHUNK_DEPTH),
    );

    {
        let store = SledChunkStore::open(&dir).unwrap();
        let mut world = World::new(WorldConfig {
            anchor_radius: 0,
            static_anchors: vec![anchor],
            persistence: Some(Box::new(store)),
            ..Default::default()
        });
        world.ensure_chunks_loaded();
        assert!(world.set_block_if_loaded(edit, Block::Leaves));

        // Move the anchor far away: the chunk leaves residency and is saved.
        world.set_static_anchors(vec![BlockPosition::new(0, 0, 0)]);
        world.ensure_chunks_loaded();
        assert!(world.chunk_at(target_chunk).is_none());

        // Move back: the persisted copy is reloaded.
        world.set_static_anchors(vec![anchor]);
        world.ensure_chunks_loaded();
        assert_eq!(world.get_block_if_loaded(edit), Some(Block::Leaves));
    }

    // A brand-new world over the same database sees the edit.
    let store = SledChunkStore::open(&dir).unwrap();
    assert!(store.contains(target_chunk));
    let mut world = World::new(WorldConfig {
        anchor_radius: 0,
        static_anchors: vec![anchor],
        persistence: Some(Box::new(store)),
        ..Default::default()
    });
    world.ensure_chunks_loaded();
    assert_eq!(world.get_block_if_loaded(edit), Some(Block::Leaves));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn absent_chunks_are_retriable_not_cached() {
    let server = start_server(WorldGeneratorKind::Empty, 0, 0);
    let client = connect(&server);

    let absent = ChunkPosition::new(40, 0, 0);
    assert!(fetch_chunk(&client, absent, Duration::from_millis(400)).is_none());

    // Settle any reissue that raced the deadline.
    let end = Instant::now() + Duration::from_secs(5);
    while client.inflight_count() > 0 && Instant::now() < end {
        client.process_pending_requests();
    }
    assert_eq!(client.cache_size(), 0, "absence must not be cached");

    // The requested-set entry was released, so the chunk can be asked for
    // again once the server might have it.
    assert!(client.request_chunk(absent).is_none());
    assert_eq!(client.inflight_count(), 1);
}
