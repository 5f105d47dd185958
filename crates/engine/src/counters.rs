//! Transaction counters
//!
//! One [`TransactionCounters`] instance is created per site and shared by
//! `Arc` with every partition executor. Counts use Relaxed ordering: they are
//! observational and approximate reads are acceptable while the site runs.
//! When disabled, every increment is a no-op.

use spectra_core::SpeculationType;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counted transaction events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Submitted to the site
    Received,
    /// Refused at admission
    Rejected,
    /// Started executing at its base partition
    Executed,
    /// Responded to the client with `OK`
    Completed,
    /// Ran at a single partition
    SinglePartition,
    /// Ran at more than one partition
    MultiPartition,
    /// Ran speculatively
    Speculative,
    /// Responded with an abort status
    Aborted,
    /// Restarted with a new id
    Restarted,
    /// Touched a partition it was not predicted to touch
    Mispredicted,
    /// Partitions released early through Early 2PC
    EarlyPrepare,
    /// Speculative runs rolled back because the holder aborted
    AbortSpeculative,
    /// System procedures
    Sysprocs,
}

impl Counter {
    /// Every counter
    pub const ALL: [Counter; 13] = [
        Counter::Received,
        Counter::Rejected,
        Counter::Executed,
        Counter::Completed,
        Counter::SinglePartition,
        Counter::MultiPartition,
        Counter::Speculative,
        Counter::Aborted,
        Counter::Restarted,
        Counter::Mispredicted,
        Counter::EarlyPrepare,
        Counter::AbortSpeculative,
        Counter::Sysprocs,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Lowercase name used in reports
    pub fn name(self) -> &'static str {
        match self {
            Counter::Received => "received",
            Counter::Rejected => "rejected",
            Counter::Executed => "executed",
            Counter::Completed => "completed",
            Counter::SinglePartition => "singlepartition",
            Counter::MultiPartition => "multipartition",
            Counter::Speculative => "speculative",
            Counter::Aborted => "aborted",
            Counter::Restarted => "restarted",
            Counter::Mispredicted => "mispredicted",
            Counter::EarlyPrepare => "early_prepare",
            Counter::AbortSpeculative => "abort_speculative",
            Counter::Sysprocs => "sysprocs",
        }
    }
}

/// Site-wide transaction counters
#[derive(Debug)]
pub struct TransactionCounters {
    enabled: bool,
    counts: [AtomicU64; Counter::ALL.len()],
    speculative_by_stall: [AtomicU64; SpeculationType::ALL.len()],
}

impl TransactionCounters {
    /// Create counters; increments are ignored unless `enabled`
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            speculative_by_stall: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Whether increments are recorded
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Count one event
    pub fn inc(&self, counter: Counter) {
        if self.enabled {
            self.counts[counter.index()].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one speculative run at `stall`
    pub fn record_speculative(&self, stall: SpeculationType) {
        if self.enabled {
            self.counts[Counter::Speculative.index()].fetch_add(1, Ordering::Relaxed);
            self.speculative_by_stall[stall.ordinal()].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current value of `counter`
    pub fn get(&self, counter: Counter) -> u64 {
        self.counts[counter.index()].load(Ordering::Relaxed)
    }

    /// Speculative runs recorded at `stall`
    pub fn speculative_at(&self, stall: SpeculationType) -> u64 {
        self.speculative_by_stall[stall.ordinal()].load(Ordering::Relaxed)
    }

    /// Zero every counter
    pub fn reset(&self) {
        for c in self.counts.iter().chain(self.speculative_by_stall.iter()) {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// Copy of every counter
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            counts: std::array::from_fn(|i| self.counts[i].load(Ordering::Relaxed)),
            speculative_by_stall: std::array::from_fn(|i| {
                self.speculative_by_stall[i].load(Ordering::Relaxed)
            }),
        }
    }
}

impl Default for TransactionCounters {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Point-in-time copy of [`TransactionCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    counts: [u64; Counter::ALL.len()],
    speculative_by_stall: [u64; SpeculationType::ALL.len()],
}

impl CountersSnapshot {
    /// Value of `counter`
    pub fn get(&self, counter: Counter) -> u64 {
        self.counts[counter.index()]
    }

    /// Speculative runs at `stall`
    pub fn speculative_at(&self, stall: SpeculationType) -> u64 {
        self.speculative_by_stall[stall.ordinal()]
    }

    /// Speculative runs at stall points other than `allowed`
    pub fn speculative_outside(&self, allowed: &[SpeculationType]) -> u64 {
        SpeculationType::ALL
            .iter()
            .filter(|s| !allowed.contains(s))
            .map(|s| self.speculative_at(*s))
            .sum()
    }
}

impl fmt::Display for CountersSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in Counter::ALL.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", c.name(), self.get(*c))?;
        }
        for s in SpeculationType::ALL {
            let n = self.speculative_at(s);
            if n > 0 {
                write!(f, ", speculative[{}]={}", s, n)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_and_get() {
        let counters = TransactionCounters::new(true);
        counters.inc(Counter::Received);
        counters.inc(Counter::Received);
        counters.inc(Counter::Completed);
        assert_eq!(counters.get(Counter::Received), 2);
        assert_eq!(counters.get(Counter::Completed), 1);
        assert_eq!(counters.get(Counter::Aborted), 0);
    }

    #[test]
    fn test_disabled_counts_nothing() {
        let counters = TransactionCounters::new(false);
        counters.inc(Counter::Received);
        counters.record_speculative(SpeculationType::Sp3Remote);
        assert_eq!(counters.snapshot(), TransactionCounters::new(true).snapshot());
    }

    #[test]
    fn test_speculative_breakdown() {
        let counters = TransactionCounters::new(true);
        counters.record_speculative(SpeculationType::Sp3Remote);
        counters.record_speculative(SpeculationType::Sp3Remote);
        counters.record_speculative(SpeculationType::Sp1Local);
        let snap = counters.snapshot();
        assert_eq!(snap.get(Counter::Speculative), 3);
        assert_eq!(snap.speculative_at(SpeculationType::Sp3Remote), 2);
        assert_eq!(snap.speculative_outside(&[SpeculationType::Sp3Remote]), 1);
        assert!(snap.to_string().contains("speculative[SP3_REMOTE]=2"));
    }

    #[test]
    fn test_reset() {
        let counters = TransactionCounters::new(true);
        counters.inc(Counter::Restarted);
        counters.record_speculative(SpeculationType::Sp3Remote);
        counters.reset();
        assert_eq!(counters.get(Counter::Restarted), 0);
        assert_eq!(counters.speculative_at(SpeculationType::Sp3Remote), 0);
    }
}
