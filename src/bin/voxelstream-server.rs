use clap::Parser;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use voxelstream::server::{RuntimeConfig, Server, WorldGeneratorKind};
use voxelstream::shared::spatial::BlockPosition;

#[derive(Parser, Debug)]
#[command(name = "voxelstream-server", about = "Authoritative voxel world server")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:4000")]
    bind: String,
    /// Chunk database directory; omit to run without persistence.
    #[arg(long)]
    db_path: Option<PathBuf>,
    #[arg(long, default_value_t = 1337)]
    seed: u64,
    /// Load-anchor radius in chunks.
    #[arg(long, default_value_t = 1)]
    anchor_radius: u32,
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
    let config = RuntimeConfig {
        bind: args.bind,
        db_path: args.db_path,
        seed: args.seed,
        anchor_radius: args.anchor_radius,
        static_anchors: vec![BlockPosition::new(0, 0, 0)],
        generator: args.generator.to_runtime(),
    };
    let server = Server::start(config)?;
    log::info!("serving on {}", server.local_addr());
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
