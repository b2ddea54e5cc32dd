use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe outcome counters for one model-backed operation.
#[derive(Default)]
pub struct RequestMetrics {
    completed: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl RequestMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request that produced output.
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request refused because of its input.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that failed inside the model pipeline.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of request counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Requests that returned text since startup.
    pub completed: u64,
    /// Requests rejected because of their input, such as an unsupported language.
    pub rejected: u64,
    /// Requests that failed during model loading or generation.
    pub failed: u64,
}
