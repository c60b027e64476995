//! Process memory monitoring for pipeline backpressure.

use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Minimum interval between two sysinfo refreshes. The pipeline polls from
/// its hot loop, so stale-by-a-quarter-second numbers are a fine trade.
const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Watches the resident set size of the current process.
///
/// `over_limit` trips on either an absolute ceiling in MB or a fraction of
/// total system memory, whichever is hit first.
pub struct MemoryMonitor {
    sys: System,
    pid: Option<Pid>,
    limit_mb: u64,
    max_fraction: f64,
    total_mb: u64,
    cached_mb: u64,
    last_refresh: Option<Instant>,
}

impl MemoryMonitor {
    pub fn new(limit_mb: u64, max_fraction: f64) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let total_mb = sys.total_memory() / (1024 * 1024);
        Self {
            sys,
            pid: sysinfo::get_current_pid().ok(),
            limit_mb,
            max_fraction,
            total_mb,
            cached_mb: 0,
            last_refresh: None,
        }
    }

    /// Resident set size of this process in MB (refresh throttled).
    pub fn used_mb(&mut self) -> u64 {
        let stale = match self.last_refresh {
            Some(t) => t.elapsed() >= REFRESH_INTERVAL,
            None => true,
        };
        if stale && let Some(pid) = self.pid {
            self.sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            self.cached_mb =
                self.sys.process(pid).map(|p| p.memory() / (1024 * 1024)).unwrap_or(0);
            self.last_refresh = Some(Instant::now());
        }
        self.cached_mb
    }

    pub fn over_limit(&mut self) -> bool {
        let used = self.used_mb();
        if used > self.limit_mb {
            return true;
        }
        self.total_mb > 0 && used as f64 > self.total_mb as f64 * self.max_fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ceiling_always_trips() {
        let mut mon = MemoryMonitor::new(0, 0.8);
        // A running test process occupies more than 0 MB.
        assert!(mon.over_limit());
    }

    #[test]
    fn huge_ceiling_never_trips() {
        let mut mon = MemoryMonitor::new(u64::MAX, 1.0);
        assert!(!mon.over_limit());
    }
}
