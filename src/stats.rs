use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// One item that failed during a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub error: String,
}

/// Counters for one batch run. Safe to share across threads.
pub struct BatchStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    failures: parking_lot::Mutex<Vec<ItemFailure>>,
    started: Instant,
}

impl Default for BatchStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchStats {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            failures: parking_lot::Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    pub fn record_success(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, item_id: &str, error: impl ToString) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.failures.lock().push(ItemFailure { item_id: item_id.to_string(), error: error.to_string() });
    }

    pub fn processed(&self) -> u64 { self.processed.load(Ordering::Relaxed) }
    pub fn succeeded(&self) -> u64 { self.succeeded.load(Ordering::Relaxed) }
    pub fn failed(&self) -> u64 { self.failed.load(Ordering::Relaxed) }

    pub fn failures(&self) -> Vec<ItemFailure> {
        self.failures.lock().clone()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn items_per_sec(&self) -> f64 {
        let elapsed = self.elapsed_secs();
        if elapsed > 0.0 {
            self.processed() as f64 / elapsed
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counts_and_failures() {
        let stats = BatchStats::new();
        stats.record_success();
        stats.record_failure("12", "vision request failed: timeout");
        stats.record_success();
        assert_eq!(stats.processed(), 3);
        assert_eq!(stats.succeeded(), 2);
        assert_eq!(stats.failed(), 1);
        assert_eq!(
            stats.failures(),
            vec![ItemFailure { item_id: "12".into(), error: "vision request failed: timeout".into() }]
        );
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(BatchStats::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        if i % 10 == 0 {
                            stats.record_failure(&format!("{}-{}", t, i), "boom");
                        } else {
                            stats.record_success();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.processed(), 200);
        assert_eq!(stats.failed(), 20);
        assert_eq!(stats.failures().len(), 20);
    }
}
