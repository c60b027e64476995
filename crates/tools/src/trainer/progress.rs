//! Low-frequency progress reporting on a dedicated thread.
//!
//! The reporter only reads the shared [`PipelineStats`] snapshot once a
//! second and repaints a spinner line; it can neither block nor be blocked
//! by the ingestion and training stages.

use crate::common::memory::MemoryMonitor;
use crate::trainer::stats::PipelineStats;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_secs(1);

pub struct ProgressReporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn start(stats: Arc<PipelineStats>) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} [{elapsed_precise}] {msg}")
                .expect("valid template"),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            let bar = bar.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let mut memory = MemoryMonitor::new(u64::MAX, 1.0);
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(TICK);
                    let snap = stats.snapshot();
                    let secs = started.elapsed().as_secs_f64().max(1.0);
                    bar.set_message(format!(
                        "{} samples in {} games | {:.1} samples/s | loss {:.4} | {} MB | filtered: {} bullet, {} invalid",
                        snap.samples,
                        snap.games,
                        snap.samples as f64 / secs,
                        snap.last_loss,
                        memory.used_mb(),
                        snap.bullet_filtered,
                        snap.invalid_filtered,
                    ));
                    bar.tick();
                }
            })
        };

        Self { stop, handle: Some(handle), bar }
    }

    /// Stop the reporter thread and clear the spinner line.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.bar.finish_and_clear();
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}
