//! Periodic resident-memory sampling with a hard ceiling: if the process
//! crosses `memory_limit` the monitor logs at error level and terminates
//! the process. There's no graceful degradation path by design — an
//! unbounded trace backlog is worse than losing the traces that would have
//! followed, and a runaway tracer should not be allowed to take the host
//! process's memory budget down with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, System};
use tracing::error;

/// Default sampling period, independent of `monitor-interval`, which only
/// governs the lifecycle monitor. There is no separate env var for this, so
/// it is a fixed constant here.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

pub struct MemoryMonitor {
    limit_bytes: u64,
    interval: Duration,
    triggered: Arc<AtomicBool>,
}

impl MemoryMonitor {
    pub fn new(limit_bytes: u64, interval: Duration) -> Self {
        Self { limit_bytes, interval, triggered: Arc::new(AtomicBool::new(false)) }
    }

    /// Samples at `interval` until `stop` fires. Terminates the process the
    /// first time the ceiling is crossed (never returns in that case).
    pub async fn run(&self, stop: Arc<tokio::sync::Notify>) {
        let pid = Pid::from_u32(std::process::id());
        let mut sys = System::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.notified() => return,
            }
            sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            let Some(proc) = sys.process(pid) else { continue };
            let rss = proc.memory();
            if rss >= self.limit_bytes && !self.triggered.swap(true, Ordering::SeqCst) {
                error!(
                    rss_bytes = rss,
                    limit_bytes = self.limit_bytes,
                    "memory ceiling exceeded; lower max-depth or switch to a lighter param-store-mode to reduce \
                     retained snapshots, then restart; terminating process"
                );
                std::process::exit(1);
            }
        }
    }

    #[cfg(test)]
    pub fn has_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_untriggered() {
        let monitor = MemoryMonitor::new(1024, Duration::from_secs(1));
        assert!(!monitor.has_triggered());
    }
}
