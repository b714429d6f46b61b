use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared state between a task session and the workers of one run.
pub struct TaskControl {
    /// Cooperative stop signal, checked before every iteration.
    stop: CancellationToken,
    batches_started: AtomicU64,
    results_emitted: AtomicU64,
    started_at: Instant,
}

impl TaskControl {
    pub fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            batches_started: AtomicU64::new(0),
            results_emitted: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Set the stop flag. Returns false when it was already set.
    pub fn stop(&self) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        self.stop.cancel();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the stop flag is set.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub(crate) fn record_batch(&self) {
        self.batches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_result(&self) {
        self.results_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            batches: self.batches_started.load(Ordering::Relaxed),
            results: self.results_emitted.load(Ordering::Relaxed),
            elapsed: self.started_at.elapsed(),
            stopped: self.is_stopped(),
        }
    }
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

/// What a run did, reported once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: u64,
    pub results: u64,
    pub elapsed: Duration,
    pub stopped: bool,
}
