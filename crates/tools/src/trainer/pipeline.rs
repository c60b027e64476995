//! Streaming training pipeline.
//!
//! Stage cycle per game block:
//! read lines → (blank line) close block → screen metadata → encode to
//! samples → buffer → (buffer full) shuffle + train → (interval reached)
//! checkpoint → loop, until the archive ends (`Completed`) or the game
//! limit trips (`StoppedByLimit`).
//!
//! The archive is consumed line by line and one game block at a time; the
//! only flow control is on the consumer side: when process memory crosses
//! the ceiling the partial buffer is flushed into training immediately and
//! the loop briefly pauses. Checkpoints are written only ever right after a
//! weight update, never mid-batch.

use crate::common::io::open_reader;
use crate::common::memory::MemoryMonitor;
use crate::trainer::encoder::GameEncoder;
use crate::trainer::pgn::{self, RawGame};
use crate::trainer::stats::PipelineStats;
use anyhow::{Context, Result};
use prophet_core::{Network, TrainingSample, model_io};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Capacity of the raw-game queue in the concurrent variant. A full queue
/// blocks the reader, which is the natural producer-side backpressure.
const GAME_QUEUE_CAP: usize = 5000;
/// Wall-clock cadence of the timer-based memory check.
const MEMORY_TIMER: Duration = Duration::from_secs(30);
/// Pause after a timer-triggered flush to let memory settle.
const MEMORY_PAUSE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub archive: PathBuf,
    /// Checkpoints, the timestamped epoch model and the run report land here.
    pub output_dir: PathBuf,
    /// Samples per weight update.
    pub batch_size: usize,
    /// Samples buffered before a shuffle-and-train pass.
    pub buffer_size: usize,
    /// Checkpoint every this many trained samples.
    pub checkpoint_interval: u64,
    /// Stop cleanly after this many processed games.
    pub max_games: Option<u64>,
    /// Ingestion worker threads; 0 selects the single-threaded
    /// (reproducible) pipeline.
    pub workers: usize,
    pub memory_limit_mb: u64,
    /// Fraction of total system memory that also counts as "over".
    pub memory_fraction: f64,
    /// Game cadence of the counter-based memory check.
    pub memory_check_games: u64,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            archive: PathBuf::from("assets/train_games.pgn"),
            output_dir: PathBuf::from("model"),
            batch_size: 128,
            buffer_size: 500,
            checkpoint_interval: 50_000,
            max_games: None,
            workers: 0,
            memory_limit_mb: 1024,
            memory_fraction: 0.8,
            memory_check_games: 1000,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The whole archive was consumed.
    Completed,
    /// The game limit tripped at a game boundary.
    StoppedByLimit,
}

pub struct TrainingPipeline<E: GameEncoder> {
    config: TrainerConfig,
    encoder: E,
    stats: Arc<PipelineStats>,
}

impl<E: GameEncoder> TrainingPipeline<E> {
    pub fn new(config: TrainerConfig, encoder: E) -> Self {
        Self { config, encoder, stats: Arc::new(PipelineStats::new()) }
    }

    /// Shared counters, for the progress reporter and for tests.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// One pass over the archive. Dispatches on `workers`.
    pub fn run(&self, network: &mut Network) -> Result<PipelineOutcome> {
        assert_eq!(
            self.encoder.board_width(),
            network.input_size(),
            "encoder board width does not match network input size"
        );
        assert_eq!(
            self.encoder.move_space(),
            network.output_size(),
            "encoder move space does not match network output size"
        );
        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("failed to create output dir {}", self.config.output_dir.display())
        })?;

        let outcome = if self.config.workers == 0 {
            self.run_single(network)
        } else {
            self.run_concurrent(network)
        }?;

        self.save_epoch_model(network);
        Ok(outcome)
    }

    /// Single-threaded ingestion: deterministic for a fixed seed and
    /// archive.
    fn run_single(&self, network: &mut Network) -> Result<PipelineOutcome> {
        let reader = open_reader(&self.config.archive)
            .with_context(|| format!("failed to open archive {}", self.config.archive.display()))?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut memory = MemoryMonitor::new(self.config.memory_limit_mb, self.config.memory_fraction);
        let mut buffer: Vec<TrainingSample> = Vec::with_capacity(self.config.buffer_size);
        let mut block = String::new();
        let mut block_has_moves = false;
        let mut blocks_seen: u64 = 0;
        let mut next_checkpoint = self.config.checkpoint_interval;
        let mut last_timer_check = Instant::now();

        for line in reader.lines() {
            // An unreadable archive is fatal to the run; everything
            // per-game below is a counted skip instead.
            let line = line.context("archive read failed")?;
            self.stats.add_bytes(line.len() as u64 + 1);

            if !line.trim().is_empty() {
                if !line.starts_with('[') {
                    block_has_moves = true;
                }
                block.push_str(&line);
                block.push('\n');
                continue;
            }

            // Blank line: a block with move text is a complete game; a
            // headers-only block keeps accumulating.
            if !block_has_moves {
                continue;
            }
            self.ingest_block(&block, &mut buffer);
            block.clear();
            block_has_moves = false;
            blocks_seen += 1;

            if let Some(limit) = self.config.max_games
                && self.stats.snapshot().games >= limit
            {
                self.train_buffer(network, &mut buffer, &mut rng, false);
                self.save_checkpoint(network);
                return Ok(PipelineOutcome::StoppedByLimit);
            }

            if blocks_seen % self.config.memory_check_games == 0
                && memory.over_limit()
                && !buffer.is_empty()
            {
                log::info!("memory ceiling reached, flushing {} buffered samples", buffer.len());
                self.train_buffer(network, &mut buffer, &mut rng, true);
            }

            if buffer.len() >= self.config.buffer_size {
                self.train_buffer(network, &mut buffer, &mut rng, false);
                self.checkpoint_if_due(network, &mut next_checkpoint);
            }

            if last_timer_check.elapsed() >= MEMORY_TIMER {
                last_timer_check = Instant::now();
                if memory.over_limit() {
                    if !buffer.is_empty() {
                        self.train_buffer(network, &mut buffer, &mut rng, true);
                    }
                    std::thread::sleep(MEMORY_PAUSE);
                }
            }
        }

        // Trailing game without a final blank line, then drain the buffer.
        if block_has_moves {
            self.ingest_block(&block, &mut buffer);
        }
        self.train_buffer(network, &mut buffer, &mut rng, false);
        self.checkpoint_if_due(network, &mut next_checkpoint);
        Ok(PipelineOutcome::Completed)
    }

    /// Reader/worker ingestion: one thread slices the archive into raw game
    /// blocks and pushes them onto a bounded queue, `workers` threads
    /// screen, encode and train. Throughput scales with cores, but batch
    /// composition is no longer deterministic; use the single-threaded
    /// mode when runs must be reproducible.
    fn run_concurrent(&self, network: &mut Network) -> Result<PipelineOutcome> {
        let reader = open_reader(&self.config.archive)
            .with_context(|| format!("failed to open archive {}", self.config.archive.display()))?;

        let (tx, rx) = crossbeam_channel::bounded::<String>(GAME_QUEUE_CAP);
        let stop = AtomicBool::new(false);
        let next_checkpoint = AtomicU64::new(self.config.checkpoint_interval);
        let network_m = Mutex::new(network);
        let buffer_m: Mutex<Vec<TrainingSample>> = Mutex::new(Vec::new());
        let memory_m = Mutex::new(MemoryMonitor::new(
            self.config.memory_limit_mb,
            self.config.memory_fraction,
        ));

        let read_result: Result<()> = std::thread::scope(|scope| {
            let reader_handle = scope.spawn(|| -> Result<()> {
                let mut block = String::new();
                let mut block_has_moves = false;
                for line in reader.lines() {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let line = line.context("archive read failed")?;
                    self.stats.add_bytes(line.len() as u64 + 1);
                    if !line.trim().is_empty() {
                        if !line.starts_with('[') {
                            block_has_moves = true;
                        }
                        block.push_str(&line);
                        block.push('\n');
                        continue;
                    }
                    if block_has_moves {
                        // A full queue blocks here until a worker catches
                        // up, which is the producer-side backpressure.
                        if tx.send(std::mem::take(&mut block)).is_err() {
                            break;
                        }
                        block_has_moves = false;
                    }
                }
                if block_has_moves {
                    let _ = tx.send(block);
                }
                // Dropping the sender disconnects the channel; every
                // worker's recv() unblocks once the queue drains.
                drop(tx);
                Ok(())
            });

            for w in 0..self.config.workers {
                let rx = rx.clone();
                let network_m = &network_m;
                let buffer_m = &buffer_m;
                let memory_m = &memory_m;
                let stop = &stop;
                let next_checkpoint = &next_checkpoint;
                let seed = self.config.seed.wrapping_add(1 + w as u64);
                scope.spawn(move || {
                    let mut rng = ChaCha8Rng::seed_from_u64(seed);
                    let mut games_handled: u64 = 0;
                    let mut last_timer_check = Instant::now();
                    while let Ok(block) = rx.recv() {
                        let mut samples = Vec::new();
                        self.ingest_block(&block, &mut samples);
                        games_handled += 1;

                        let ready = {
                            let mut buffer = buffer_m.lock().expect("buffer lock");
                            buffer.extend(samples);
                            if buffer.len() >= self.config.buffer_size {
                                Some(std::mem::take(&mut *buffer))
                            } else {
                                None
                            }
                        };
                        if let Some(mut batch) = ready {
                            let mut network = network_m.lock().expect("network lock");
                            self.train_buffer(&mut network, &mut batch, &mut rng, false);
                            self.checkpoint_if_due_atomic(&network, next_checkpoint);
                        }

                        if let Some(limit) = self.config.max_games
                            && self.stats.snapshot().games >= limit
                        {
                            // Halt ingestion; the queue still drains so no
                            // game is cut off mid-block.
                            stop.store(true, Ordering::Relaxed);
                        }

                        let timer_due = last_timer_check.elapsed() >= MEMORY_TIMER;
                        if (games_handled % self.config.memory_check_games == 0 || timer_due)
                            && let Ok(mut memory) = memory_m.try_lock()
                            && memory.over_limit()
                        {
                            let mut pending = {
                                let mut buffer = buffer_m.lock().expect("buffer lock");
                                std::mem::take(&mut *buffer)
                            };
                            if !pending.is_empty() {
                                let mut network = network_m.lock().expect("network lock");
                                self.train_buffer(&mut network, &mut pending, &mut rng, true);
                            }
                            if timer_due {
                                last_timer_check = Instant::now();
                                std::thread::sleep(MEMORY_PAUSE);
                            }
                        }
                    }
                });
            }
            drop(rx);

            reader_handle.join().expect("reader thread panicked")
        });
        read_result?;

        let stopped = stop.load(Ordering::Relaxed);
        let network = network_m.into_inner().expect("network lock poisoned");

        // Workers are done; drain whatever the last games buffered.
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut rest = buffer_m.into_inner().expect("buffer lock poisoned");
        self.train_buffer(network, &mut rest, &mut rng, false);
        if stopped {
            self.save_checkpoint(network);
            return Ok(PipelineOutcome::StoppedByLimit);
        }
        Ok(PipelineOutcome::Completed)
    }

    /// Screen one raw game block and append its samples to `out`. Every
    /// failure mode is a counted skip; nothing here can abort the run.
    fn ingest_block(&self, block: &str, out: &mut Vec<TrainingSample>) {
        let raw = RawGame::parse(block);
        match pgn::screen(&raw) {
            Ok(game) => {
                self.stats.count_game();
                out.extend(self.encoder.samples(&game));
            }
            Err(reason) => self.stats.count_filtered(reason),
        }
    }

    /// Shuffle the buffered samples and train them in `batch_size` slices.
    /// The buffer is cleared (and on a forced flush, shrunk) afterwards.
    fn train_buffer(
        &self,
        network: &mut Network,
        buffer: &mut Vec<TrainingSample>,
        rng: &mut ChaCha8Rng,
        forced: bool,
    ) {
        if buffer.is_empty() {
            return;
        }
        buffer.shuffle(rng);
        for chunk in buffer.chunks(self.config.batch_size) {
            let loss = network.train_batch(chunk);
            self.stats.count_batch(chunk.len(), loss);
            log::debug!("batch of {} trained, loss {loss:.4}", chunk.len());
        }
        buffer.clear();
        if forced {
            self.stats.count_forced_flush();
            buffer.shrink_to_fit();
        }
    }

    fn checkpoint_if_due(&self, network: &Network, next_checkpoint: &mut u64) {
        if self.stats.snapshot().samples >= *next_checkpoint {
            self.save_checkpoint(network);
            *next_checkpoint += self.config.checkpoint_interval;
        }
    }

    fn checkpoint_if_due_atomic(&self, network: &Network, next_checkpoint: &AtomicU64) {
        let samples = self.stats.snapshot().samples;
        let due = next_checkpoint
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (samples >= next).then_some(next + self.config.checkpoint_interval)
            })
            .is_ok();
        if due {
            self.save_checkpoint(network);
        }
    }

    /// Overwrite the well-known checkpoint file. Never fatal.
    fn save_checkpoint(&self, network: &Network) {
        let path = self.config.output_dir.join("checkpoint.model");
        match model_io::save(network, &path) {
            Ok(()) => {
                log::info!("checkpoint at {} samples: {}", self.stats.snapshot().samples, path.display())
            }
            Err(e) => log::warn!("checkpoint save failed, training continues: {e}"),
        }
    }

    /// Separate timestamped model written once per pass, never overwritten.
    fn save_epoch_model(&self, network: &Network) {
        let snap = self.stats.snapshot();
        let name = format!(
            "prophet-{}~{}.model",
            snap.samples,
            chrono::Local::now().format("%Y-%m-%d_%H%M%S")
        );
        let path = self.config.output_dir.join(name);
        match model_io::save(network, &path) {
            Ok(()) => log::info!("epoch model saved: {}", path.display()),
            Err(e) => log::warn!("epoch model save failed: {e}"),
        }
    }
}
