//! Final pass/fail verdict
//!
//! Three independent equalities between the produced count, the consumed count
//! and the offset-derived reconciled total. An empty tracker has no reconciled
//! total, and every comparison against it fails.

use crate::counters::CounterSnapshot;
use crate::error::TrackerError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub produced: u64,
    pub consumed: u64,
    /// `None` when no partition was ever recorded
    pub reconciled: Option<u64>,
    pub produced_matches_consumed: bool,
    pub produced_matches_reconciled: bool,
    pub consumed_matches_reconciled: bool,
}

impl Verdict {
    /// Compares the final counters against the tracker's reconciled total
    ///
    /// Must only be called after every consumer worker has exited.
    pub fn compute(counters: CounterSnapshot, reconciled: Result<u64, TrackerError>) -> Self {
        let reconciled = reconciled.ok();
        Self {
            produced: counters.produced,
            consumed: counters.consumed,
            reconciled,
            produced_matches_consumed: counters.produced == counters.consumed,
            produced_matches_reconciled: reconciled == Some(counters.produced),
            consumed_matches_reconciled: reconciled == Some(counters.consumed),
        }
    }

    pub fn passed(&self) -> bool {
        self.produced_matches_consumed
            && self.produced_matches_reconciled
            && self.consumed_matches_reconciled
    }

    /// Human-readable description of each failed comparison
    pub fn mismatches(&self) -> Vec<String> {
        let reconciled = self.reconciled_label();
        let mut mismatches = Vec::new();
        if !self.produced_matches_consumed {
            mismatches.push(format!(
                "produced ({}) != consumed ({})",
                self.produced, self.consumed
            ));
        }
        if !self.produced_matches_reconciled {
            mismatches.push(format!(
                "produced ({}) != reconciled ({})",
                self.produced, reconciled
            ));
        }
        if !self.consumed_matches_reconciled {
            mismatches.push(format!(
                "consumed ({}) != reconciled ({})",
                self.consumed, reconciled
            ));
        }
        mismatches
    }

    fn reconciled_label(&self) -> String {
        match self.reconciled {
            Some(total) => total.to_string(),
            None => "empty".to_string(),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} produced={} consumed={} reconciled={} produced==consumed:{} produced==reconciled:{} consumed==reconciled:{}",
            if self.passed() { "PASS" } else { "FAIL" },
            self.produced,
            self.consumed,
            self.reconciled_label(),
            self.produced_matches_consumed,
            self.produced_matches_reconciled,
            self.consumed_matches_reconciled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(produced: u64, consumed: u64) -> CounterSnapshot {
        CounterSnapshot {
            produced,
            consumed,
            ..Default::default()
        }
    }

    #[test]
    fn test_all_equal_passes() {
        let verdict = Verdict::compute(counters(10, 10), Ok(10));
        assert!(verdict.passed());
        assert!(verdict.mismatches().is_empty());
        assert_eq!(
            verdict.to_string(),
            "PASS produced=10 consumed=10 reconciled=10 produced==consumed:true produced==reconciled:true consumed==reconciled:true"
        );
    }

    #[test]
    fn test_each_comparison_is_independent() {
        let verdict = Verdict::compute(counters(4, 3), Ok(3));
        assert!(!verdict.passed());
        assert!(!verdict.produced_matches_consumed);
        assert!(!verdict.produced_matches_reconciled);
        assert!(verdict.consumed_matches_reconciled);
        assert_eq!(
            verdict.mismatches(),
            vec![
                "produced (4) != consumed (3)".to_string(),
                "produced (4) != reconciled (3)".to_string(),
            ]
        );
    }

    #[test]
    fn test_empty_tracker_never_matches() {
        let verdict = Verdict::compute(counters(0, 0), Err(TrackerError::EmptyTracker));
        assert_eq!(verdict.reconciled, None);
        assert!(verdict.produced_matches_consumed);
        assert!(!verdict.produced_matches_reconciled);
        assert!(!verdict.consumed_matches_reconciled);
        assert!(!verdict.passed());
        assert!(verdict.to_string().contains("reconciled=empty"));
    }
}
