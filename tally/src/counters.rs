//! Shared tallies of produced and consumed messages
//!
//! One `Counters` value is created per harness run and shared by reference
//! (`Arc<Counters>`) between the producer, every consumer worker and the
//! progress monitor. Each field is an independent atomic; nothing derives an
//! invariant across two fields while the run is live, and the final values are
//! only read after every writer has been joined.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    /// Publishes acknowledged by the transport
    produced: AtomicU64,
    /// Deliveries handled by consumer workers
    consumed: AtomicU64,
    /// Publishes that failed (never counted as produced)
    publish_errors: AtomicU64,
    /// Soft duplicates reported by the coordination variant
    duplicates: AtomicU64,
    /// Receive-side errors observed by workers
    stream_errors: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub produced: u64,
    pub consumed: u64,
    pub publish_errors: u64,
    pub duplicates: u64,
    pub stream_errors: u64,
}

impl CounterSnapshot {
    /// Messages sent but not yet observed by a consumer
    pub fn backlog(&self) -> u64 {
        self.produced.saturating_sub(self.consumed)
    }
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_error(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Reads every counter. Only final once all producer and consumer tasks have joined.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            produced: self.produced.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = Counters::new();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_counters_are_independent() {
        let counters = Counters::new();
        counters.record_produced();
        counters.record_produced();
        counters.record_publish_error();
        counters.record_consumed();
        counters.record_duplicate();
        counters.record_stream_error();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.produced, 2);
        assert_eq!(snapshot.consumed, 1);
        assert_eq!(snapshot.publish_errors, 1);
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.stream_errors, 1);
        assert_eq!(snapshot.backlog(), 1);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let counters = Arc::new(Counters::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.record_consumed();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counters.consumed(), 8000);
    }

    #[test]
    fn test_backlog_saturates() {
        let snapshot = CounterSnapshot {
            produced: 3,
            consumed: 5,
            ..Default::default()
        };
        assert_eq!(snapshot.backlog(), 0);
    }
}
