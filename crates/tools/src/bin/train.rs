//! Train a move-prediction network from a PGN archive.
//!
//! ```text
//! RUST_LOG=info cargo run --release -p tools --bin train -- \
//!     assets/lichess_2024-01.pgn.gz --max-games 100000 --workers 4
//! ```

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use prophet_core::{Network, model_io};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tools::trainer::{
    BOARD_WIDTH, CoordinateEncoder, MOVE_SPACE, PipelineOutcome, ProgressReporter, TrainerConfig,
    TrainingPipeline, TrainingReport,
};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train a move-prediction network from a PGN archive")]
struct Cli {
    /// PGN archive (plain or .gz, "-" for stdin). Defaults to the largest
    /// *.pgn* file under assets/.
    archive: Option<PathBuf>,

    /// Model file to resume from and to write the final weights to.
    #[arg(long, default_value = "model/prophet.model")]
    model: PathBuf,

    /// Directory for checkpoints, the epoch model and the run report.
    #[arg(long, default_value = "model")]
    out_dir: PathBuf,

    /// Samples per weight update.
    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// Samples buffered before a shuffle-and-train pass.
    #[arg(long, default_value_t = 500)]
    buffer_size: usize,

    /// Checkpoint every this many trained samples.
    #[arg(long, default_value_t = 50_000)]
    checkpoint_interval: u64,

    /// Stop after this many processed games.
    #[arg(long)]
    max_games: Option<u64>,

    /// Ingestion worker threads. 0 keeps ingestion single-threaded and the
    /// run reproducible for a fixed seed.
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Process memory ceiling in MB; crossing it forces a buffer flush.
    #[arg(long, default_value_t = 1024)]
    memory_limit_mb: u64,

    #[arg(long, default_value_t = 0.001)]
    learning_rate: f32,

    /// Layer widths, input first. The first width must match the encoder's
    /// board width, the last its move space.
    #[arg(long, value_delimiter = ',', default_value = "65,512,256,4096")]
    layers: Vec<usize>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Resume from --model instead of starting fresh.
    #[arg(long)]
    resume: bool,

    /// On resume, accept a model with different layer shapes and copy the
    /// overlapping weight region.
    #[arg(long)]
    allow_partial_load: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    ensure!(cli.layers.len() >= 2, "need at least an input and an output layer width");
    ensure!(
        cli.layers[0] == BOARD_WIDTH,
        "first layer width must be the board width ({BOARD_WIDTH})"
    );
    ensure!(
        *cli.layers.last().unwrap() == MOVE_SPACE,
        "last layer width must be the move space ({MOVE_SPACE})"
    );

    let archive = match cli.archive.clone() {
        Some(path) => path,
        None => largest_archive(Path::new("assets"))?,
    };
    log::info!("archive: {}", archive.display());

    let mut network = build_network(&cli)?;
    log::info!(
        "network {:?}, {} parameters, lr {}",
        network.layer_sizes(),
        network.param_count(),
        cli.learning_rate
    );

    let config = TrainerConfig {
        archive: archive.clone(),
        output_dir: cli.out_dir.clone(),
        batch_size: cli.batch_size,
        buffer_size: cli.buffer_size,
        checkpoint_interval: cli.checkpoint_interval,
        max_games: cli.max_games,
        workers: cli.workers,
        memory_limit_mb: cli.memory_limit_mb,
        seed: cli.seed,
        ..TrainerConfig::default()
    };
    let pipeline = TrainingPipeline::new(config, CoordinateEncoder::default());
    let stats = pipeline.stats();

    let started = Instant::now();
    let reporter = ProgressReporter::start(pipeline.stats());
    let outcome = pipeline.run(&mut network);
    reporter.finish();
    let outcome = outcome?;

    let elapsed = started.elapsed().as_secs_f64();
    let snap = stats.snapshot();
    log::info!(
        "{}: {} games, {} samples, {} batches in {elapsed:.1}s (filtered {} bullet, {} invalid)",
        match outcome {
            PipelineOutcome::Completed => "archive complete",
            PipelineOutcome::StoppedByLimit => "game limit reached",
        },
        snap.games,
        snap.samples,
        snap.batches,
        snap.bullet_filtered,
        snap.invalid_filtered,
    );

    let report = TrainingReport::new(&archive.display().to_string(), &snap, elapsed);
    if let Err(e) = report.write(cli.out_dir.join("report.json")) {
        log::warn!("report write failed: {e}");
    }

    // The one save that must not fail silently.
    if let Some(parent) = cli.model.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    model_io::save(&network, &cli.model)
        .with_context(|| format!("failed to save model to {}", cli.model.display()))?;
    log::info!("model saved: {}", cli.model.display());
    Ok(())
}

/// Fresh network, or the resumed one when `--resume` is set. A broken or
/// missing resume file falls back to fresh weights with a warning; a shape
/// mismatch is only tolerated under `--allow-partial-load`.
fn build_network(cli: &Cli) -> Result<Network> {
    if !cli.resume {
        return Ok(Network::new(&cli.layers, cli.learning_rate, cli.seed));
    }
    if cli.allow_partial_load {
        let mut network = Network::new(&cli.layers, cli.learning_rate, cli.seed);
        match model_io::load_into(&mut network, &cli.model, true) {
            Ok(()) => log::info!("resumed (partial) from {}", cli.model.display()),
            Err(e) => log::warn!("resume failed, training from scratch: {e}"),
        }
        return Ok(network);
    }
    match model_io::load(&cli.model, cli.learning_rate) {
        Ok(network) => {
            log::info!("resumed from {}", cli.model.display());
            Ok(network)
        }
        Err(e) => {
            log::warn!("resume failed, training from scratch: {e}");
            Ok(Network::new(&cli.layers, cli.learning_rate, cli.seed))
        }
    }
}

/// Largest *.pgn* (plain or .gz) under `dir`.
fn largest_archive(dir: &Path) -> Result<PathBuf> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("no archive given and {} is unreadable", dir.display()))?;
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if !name.to_string_lossy().contains(".pgn") {
            continue;
        }
        let len = entry.metadata()?.len();
        if best.as_ref().is_none_or(|(size, _)| len > *size) {
            best = Some((len, path));
        }
    }
    match best {
        Some((_, path)) => Ok(path),
        None => bail!("no .pgn archive found under {}", dir.display()),
    }
}
