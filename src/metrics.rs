use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing batch processing activity.
#[derive(Default)]
pub struct ProcessingMetrics {
    items_succeeded: AtomicU64,
    items_failed: AtomicU64,
    extraction_calls: AtomicU64,
    generation_calls: AtomicU64,
    checkpoint_writes: AtomicU64,
}

impl ProcessingMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the terminal outcome of a top-level item.
    pub fn record_item(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.items_succeeded
        } else {
            &self.items_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one call into the content extractor.
    pub fn record_extraction(&self) {
        self.extraction_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one call into a description generator.
    pub fn record_generation(&self) {
        self.generation_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful checkpoint write.
    pub fn record_checkpoint_write(&self) {
        self.checkpoint_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_succeeded: self.items_succeeded.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            extraction_calls: self.extraction_calls.load(Ordering::Relaxed),
            generation_calls: self.generation_calls.load(Ordering::Relaxed),
            checkpoint_writes: self.checkpoint_writes.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of processing counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    /// Top-level items that finished with a description since startup.
    pub items_succeeded: u64,
    /// Top-level items that finished with a failure since startup.
    pub items_failed: u64,
    /// Calls made into the content extractor, nested items included.
    pub extraction_calls: u64,
    /// Calls made into the description generators, nested items included.
    pub generation_calls: u64,
    /// Checkpoint files written.
    pub checkpoint_writes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_outcomes_and_calls() {
        let metrics = ProcessingMetrics::new();
        metrics.record_item(true);
        metrics.record_item(false);
        metrics.record_item(true);
        metrics.record_extraction();
        metrics.record_generation();
        metrics.record_generation();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.items_succeeded, 2);
        assert_eq!(snapshot.items_failed, 1);
        assert_eq!(snapshot.extraction_calls, 1);
        assert_eq!(snapshot.generation_calls, 2);
        assert_eq!(snapshot.checkpoint_writes, 0);
    }

    #[test]
    fn snapshot_is_consistent() {
        let metrics = ProcessingMetrics::new();
        assert_eq!(metrics.snapshot(), ProcessingMetrics::new().snapshot());
    }
}
