//! spate - torrent-to-HLS streaming server binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use spate_core::{
    CliLogLevel, FfmpegTranscoder, FfprobeProber, HwAccel, MediaProber, MetadataCache,
    METADATA_CACHE_FILE, RqbitBackend, ScriptedBehavior, ScriptedTranscoder, SimulatedTorrent,
    SimulationBackend, SpateConfig, StaticProber, StreamContext, StreamRegistry, TorrentBackend,
    Transcoder, init_tracing,
};

#[derive(Parser)]
#[command(name = "spate")]
#[command(about = "Turn a magnet link into a live HLS stream while it downloads")]
struct Cli {
    /// HTTP listen port (overrides the PORT environment variable)
    #[arg(long)]
    port: Option<u16>,

    /// Root directory for torrent payloads and HLS output
    #[arg(long)]
    downloads_dir: Option<PathBuf>,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Use a simulated swarm and encoder instead of librqbit and ffmpeg
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    let mut config = SpateConfig::from_env();
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(dir) = cli.downloads_dir {
        config.server.downloads_dir = dir;
    }

    std::fs::create_dir_all(&config.server.downloads_dir).map_err(|error| {
        format!(
            "could not create downloads directory {}: {error}",
            config.server.downloads_dir.display()
        )
    })?;

    let downloads = config.server.downloads_dir.clone();
    let cache = Arc::new(MetadataCache::open(downloads.join(METADATA_CACHE_FILE)));
    // Drop entries nobody has streamed in a month
    cache.cleanup(std::time::Duration::from_secs(30 * 24 * 3600));

    let (backend, prober, transcoder, hw_accel): (
        Arc<dyn TorrentBackend>,
        Arc<dyn MediaProber>,
        Arc<dyn Transcoder>,
        Option<HwAccel>,
    ) = if cli.simulate {
        tracing::info!("simulation mode: scripted swarm and encoder");
        (
            Arc::new(SimulationBackend::new(
                downloads.clone(),
                SimulatedTorrent::quick_video("demo"),
            )),
            Arc::new(StaticProber::plain_1080p()),
            Arc::new(ScriptedTranscoder::new(ScriptedBehavior::quick())),
            Some(HwAccel::None),
        )
    } else {
        (
            Arc::new(RqbitBackend::new(&downloads).await?),
            Arc::new(FfprobeProber),
            Arc::new(FfmpegTranscoder),
            None,
        )
    };

    let port = config.server.port;
    let ctx = Arc::new(StreamContext {
        config,
        backend,
        prober,
        transcoder,
        cache,
        hw_accel,
    });
    let registry = Arc::new(StreamRegistry::new(ctx));

    spate_web::run_server(registry, port).await
}
