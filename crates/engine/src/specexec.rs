//! Speculative execution scheduler
//!
//! While a partition is held by a distributed transaction, the executor asks
//! its scheduler for queued single-partition work it may run in the
//! meantime. The scheduler looks at the first `specexec_window` entries of
//! the lock queue and returns the first one the conflict checker clears,
//! removing it from the queue.
//!
//! Nothing is returned when speculation is disabled, when the current stall
//! point is in the ignore set, or when the holder has an abort pending.

use crate::config::SiteConfig;
use parking_lot::RwLock;
use spectra_concurrency::{ConflictChecker, PartitionLockQueue, Transaction};
use spectra_core::{PartitionId, SpectraResult, SpeculationType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Scheduler statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Calls to `next` that were allowed to look at the queue
    pub searches: u64,
    /// Candidates handed to the checker
    pub examined: u64,
    /// Candidates rejected by the checker
    pub conflicts: u64,
    /// Candidates selected
    pub matched: u64,
}

/// Per-partition speculative execution scheduler
pub struct SpecExecScheduler {
    partition: PartitionId,
    enabled: bool,
    ignored: Vec<SpeculationType>,
    window: usize,
    checker: RwLock<Arc<dyn ConflictChecker>>,
    searches: AtomicU64,
    examined: AtomicU64,
    conflicts: AtomicU64,
    matched: AtomicU64,
}

impl SpecExecScheduler {
    /// Scheduler for `partition` configured from `config`
    pub fn new(partition: PartitionId, config: &SiteConfig, checker: Arc<dyn ConflictChecker>) -> Self {
        Self {
            partition,
            enabled: config.specexec_enable,
            ignored: config.specexec_ignore_stallpoints.clone(),
            window: config.specexec_window,
            checker: RwLock::new(checker),
            searches: AtomicU64::new(0),
            examined: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            matched: AtomicU64::new(0),
        }
    }

    /// Partition served
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Replace the conflict checker
    ///
    /// Takes effect at the next scheduling decision.
    pub fn set_conflict_checker(&self, checker: Arc<dyn ConflictChecker>) {
        tracing::debug!(target: "spectra::specexec", partition = %self.partition, checker = checker.name(), "Conflict checker replaced");
        *self.checker.write() = checker;
    }

    /// Current conflict checker
    pub fn conflict_checker(&self) -> Arc<dyn ConflictChecker> {
        Arc::clone(&self.checker.read())
    }

    /// Whether speculation may happen at `stall`
    pub fn is_allowed_at(&self, stall: SpeculationType) -> bool {
        self.enabled && !self.ignored.contains(&stall)
    }

    /// Select and dequeue the next transaction to run speculatively
    ///
    /// A checker error is a broken safety contract and is returned as a
    /// fatal [`spectra_core::SpectraError::ConflictChecker`].
    pub fn next(
        &self,
        queue: &PartitionLockQueue,
        holder: &Transaction,
        stall: SpeculationType,
    ) -> SpectraResult<Option<Arc<Transaction>>> {
        if !self.is_allowed_at(stall) || holder.abort_requested() {
            return Ok(None);
        }
        self.searches.fetch_add(1, Ordering::Relaxed);
        let checker = self.conflict_checker();

        for candidate in queue.candidates(self.window) {
            if candidate.is_distributed() || candidate.base_partition() != self.partition {
                continue;
            }
            let eligible = if checker.should_ignore(&candidate) {
                true
            } else {
                self.examined.fetch_add(1, Ordering::Relaxed);
                checker
                    .can_execute(holder, &candidate, self.partition)
                    .map_err(|e| e.into_error(checker.name()))?
            };
            if !eligible {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            // an abort may have pulled it since the snapshot
            if let Some(txn) = queue.remove(candidate.id()) {
                self.matched.fetch_add(1, Ordering::Relaxed);
                trace!(
                    target: "spectra::specexec",
                    partition = %self.partition,
                    holder = %holder.id(),
                    txn_id = %txn.id(),
                    stall = %stall,
                    "Speculative candidate selected"
                );
                return Ok(Some(txn));
            }
        }
        Ok(None)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            searches: self.searches.load(Ordering::Relaxed),
            examined: self.examined.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for SpecExecScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecExecScheduler")
            .field("partition", &self.partition)
            .field("enabled", &self.enabled)
            .field("ignored", &self.ignored)
            .field("window", &self.window)
            .field("checker", &self.conflict_checker().name())
            .finish()
    }
}
