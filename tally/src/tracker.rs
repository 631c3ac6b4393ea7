//! Per-partition offset range tracking
//!
//! The tracker derives a delivered-message count from offset continuity
//! instead of from an increment counter: for every partition it keeps the
//! lowest and highest offset any worker has seen, and the reconciled total is
//! the sum of `max - min + 1` over all partitions.
//!
//! The span check cannot see inside the range. A missing offset whose slot is
//! filled by a duplicate delivery reconciles cleanly. The opt-in gap ledger
//! (`OffsetTracker::with_gap_tracking`) keeps every seen offset per partition
//! to report duplicates and holes, at the cost of memory proportional to the
//! number of deliveries.

use crate::error::TrackerError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Observed offset bounds for one partition
///
/// `initialized` is explicit: a partition whose lowest real offset is 0 must
/// not be confused with one that has never been recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OffsetRange {
    min: i64,
    max: i64,
    initialized: bool,
}

impl OffsetRange {
    /// Widens the range to include `offset`; the range never shrinks
    pub fn observe(&mut self, offset: i64) {
        if !self.initialized {
            self.min = offset;
            self.max = offset;
            self.initialized = true;
            return;
        }
        self.min = self.min.min(offset);
        self.max = self.max.max(offset);
    }

    /// Number of distinct offsets covered by the range, `None` if never observed
    ///
    /// Saturates at `u64::MAX` for a range covering every `i64`.
    pub fn span(&self) -> Option<u64> {
        self.initialized
            .then(|| self.max.abs_diff(self.min).saturating_add(1))
    }

    pub fn min(&self) -> Option<i64> {
        self.initialized.then_some(self.min)
    }

    pub fn max(&self) -> Option<i64> {
        self.initialized.then_some(self.max)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[derive(Debug, Default)]
struct PartitionLedger {
    seen: BTreeSet<i64>,
    duplicates: u64,
}

/// Result of the strict per-offset audit for one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionAudit {
    pub partition: i32,
    /// Distinct offsets delivered
    pub distinct: u64,
    /// Deliveries of an offset that had already been seen
    pub duplicates: u64,
    /// Offsets inside `[min, max]` that were never delivered
    pub missing: u64,
}

/// Strict audit across every recorded partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GapAudit {
    pub partitions: Vec<PartitionAudit>,
}

impl GapAudit {
    pub fn total_duplicates(&self) -> u64 {
        self.partitions.iter().map(|p| p.duplicates).sum()
    }

    pub fn total_missing(&self) -> u64 {
        self.partitions.iter().map(|p| p.missing).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.total_duplicates() == 0 && self.total_missing() == 0
    }
}

/// Concurrent partition → offset range map shared by all consumer workers
///
/// Every `record` call is a single critical section, so a range is never read
/// or written half-updated.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    ranges: Mutex<BTreeMap<i32, OffsetRange>>,
    ledger: Option<Mutex<BTreeMap<i32, PartitionLedger>>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that additionally remembers every delivered offset
    pub fn with_gap_tracking() -> Self {
        Self {
            ranges: Mutex::new(BTreeMap::new()),
            ledger: Some(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn tracks_gaps(&self) -> bool {
        self.ledger.is_some()
    }

    pub fn record(&self, partition: i32, offset: i64) {
        self.ranges
            .lock()
            .entry(partition)
            .or_default()
            .observe(offset);

        if let Some(ledger) = &self.ledger {
            let mut ledger = ledger.lock();
            let entry = ledger.entry(partition).or_default();
            if !entry.seen.insert(offset) {
                entry.duplicates += 1;
            }
        }
    }

    /// Sum over partitions of `max - min + 1`
    ///
    /// Fails with `EmptyTracker` when nothing has been recorded, which is a
    /// different outcome from a reconciled total of zero.
    pub fn total_reconciled(&self) -> Result<u64, TrackerError> {
        let ranges = self.ranges.lock();
        if ranges.is_empty() {
            return Err(TrackerError::EmptyTracker);
        }
        Ok(ranges
            .values()
            .filter_map(OffsetRange::span)
            .fold(0, u64::saturating_add))
    }

    /// Copy of every partition's range, ordered by partition
    pub fn snapshot(&self) -> BTreeMap<i32, OffsetRange> {
        self.ranges.lock().clone()
    }

    /// Strict per-offset audit, `None` unless gap tracking is enabled
    pub fn gap_audit(&self) -> Option<GapAudit> {
        let ledger = self.ledger.as_ref()?.lock();
        let ranges = self.ranges.lock();
        let partitions = ledger
            .iter()
            .map(|(&partition, entry)| {
                let distinct = entry.seen.len() as u64;
                let span = ranges
                    .get(&partition)
                    .and_then(OffsetRange::span)
                    .unwrap_or(0);
                PartitionAudit {
                    partition,
                    distinct,
                    duplicates: entry.duplicates,
                    missing: span.saturating_sub(distinct),
                }
            })
            .collect();
        Some(GapAudit { partitions })
    }
}
