//! Shared pipeline counters.
//!
//! Passed around as `Arc<PipelineStats>`: the reporter thread, the reader
//! and every worker see the same instance. Relaxed ordering is fine; these
//! are monotone counters read for observability, not for synchronization.

use crate::trainer::pgn::FilterReason;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Games handed to the encoder (screened successfully).
    pub games: AtomicU64,
    /// Samples folded into a trained batch.
    pub samples: AtomicU64,
    /// `train_batch` invocations.
    pub batches: AtomicU64,
    /// Games skipped for a disallowed time-control class.
    pub bullet_filtered: AtomicU64,
    /// Games skipped for missing/garbled metadata or moves.
    pub invalid_filtered: AtomicU64,
    /// Buffer flushes forced by memory pressure before the buffer was full.
    pub forced_flushes: AtomicU64,
    /// Archive bytes consumed so far.
    pub bytes_read: AtomicU64,
    /// Mean loss of the most recent batch, as f32 bits.
    last_loss_bits: AtomicU64,
}

/// Point-in-time copy for reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub games: u64,
    pub samples: u64,
    pub batches: u64,
    pub bullet_filtered: u64,
    pub invalid_filtered: u64,
    pub forced_flushes: u64,
    pub bytes_read: u64,
    pub last_loss: f32,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_game(&self) {
        self.games.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_filtered(&self, reason: FilterReason) {
        match reason {
            FilterReason::Bullet => self.bullet_filtered.fetch_add(1, Ordering::Relaxed),
            FilterReason::Invalid => self.invalid_filtered.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn count_batch(&self, samples: usize, loss: f32) {
        self.samples.fetch_add(samples as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.last_loss_bits.store(loss.to_bits() as u64, Ordering::Relaxed);
    }

    pub fn count_forced_flush(&self) {
        self.forced_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            games: self.games.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            bullet_filtered: self.bullet_filtered.load(Ordering::Relaxed),
            invalid_filtered: self.invalid_filtered.load(Ordering::Relaxed),
            forced_flushes: self.forced_flushes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            last_loss: f32::from_bits(self.last_loss_bits.load(Ordering::Relaxed) as u32),
        }
    }
}
