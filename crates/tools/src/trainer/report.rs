//! End-of-run summary written next to the trained model.

use crate::trainer::stats::StatsSnapshot;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Completion time, RFC 3339.
    pub timestamp: String,
    pub archive: String,
    pub games: u64,
    pub samples: u64,
    pub batches: u64,
    pub bullet_filtered: u64,
    pub invalid_filtered: u64,
    pub forced_flushes: u64,
    pub elapsed_secs: f64,
    pub final_loss: f32,
    pub cpu_model: String,
    pub cpu_cores: usize,
}

impl TrainingReport {
    pub fn new(archive: &str, snap: &StatsSnapshot, elapsed_secs: f64) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        let cpu_model =
            sys.cpus().first().map(|cpu| cpu.brand()).unwrap_or("Unknown").to_string();
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            archive: archive.to_string(),
            games: snap.games,
            samples: snap.samples,
            batches: snap.batches,
            bullet_filtered: snap.bullet_filtered,
            invalid_filtered: snap.invalid_filtered,
            forced_flushes: snap.forced_flushes,
            elapsed_secs,
            final_loss: snap.last_loss,
            cpu_model,
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Pretty-printed JSON; a write failure is the caller's warning, never
    /// a run failure.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
