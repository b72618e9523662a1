//! Pre-generate a region of the world straight into the chunk database, so
//! a server starting over the same database serves stored chunks instead of
//! generating on demand.

use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use voxelstream::server::{ChunkGenerator, ChunkPersistence, SledChunkStore, WorldGeneratorKind};
use voxelstream::shared::spatial::ChunkPosition;

#[derive(Parser, Debug)]
#[command(name = "voxelstream-worldgen", about = "Offline chunk pre-generation")]
struct Args {
    /// Chunk database directory (created if absent).
    #[arg(long)]
    db_path: PathBuf,
    #[arg(long, default_value_t = 1337)]
    seed: u64,
    /// Half-edge of the generated cube, in chunks.
    #[arg(long, default_value_t = 1)]
    radius: i32,
    #[arg(long, value_enum, default_value_t = GeneratorArg::Terrain)]
    generator: GeneratorArg,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum GeneratorArg {
    Empty,
    Flat,
    Terrain,
}

impl GeneratorArg {
    fn to_runtime(self) -> WorldGeneratorKind {
        match self {
            GeneratorArg::Empty => WorldGeneratorKind::Empty,
            GeneratorArg::Flat => WorldGeneratorKind::Flat,
            GeneratorArg::Terrain => WorldGeneratorKind::Terrain,
        }
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let store = SledChunkStore::open(&args.db_path)
        .map_err(|e| std::io::Error::other(format!("chunk store: {e}")))?;
    let generator = args.generator.to_runtime().build();

    let start = Instant::now();
    let mut generated = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for x in -args.radius..=args.radius {
        for y in -args.radius..=args.radius {
            for z in -args.radius..=args.radius {
                let position = ChunkPosition::new(x, y, z);
                // Stored chunks are authoritative; never regenerate over
                // them.
                if store.contains(position) {
                    skipped += 1;
                    continue;
                }
                match generator.generate(position, args.seed) {
                    Some(chunk) => {
                        if store.save_chunk(&chunk) {
                            generated += 1;
                        } else {
                            failed += 1;
                        }
                    }
                    None => {
                        log::warn!("generation failed for {position:?}");
                        failed += 1;
                    }
                }
            }
        }
    }

    log::info!(
        "generated {generated} chunk(s), skipped {skipped} existing, {failed} failed in {:.2?}",
        start.elapsed()
    );
    println!(
        "{generated} generated, {skipped} skipped, {failed} failed, {} total stored",
        store.chunk_count()
    );
    Ok(())
}
