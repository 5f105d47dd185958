//! Per-partition admission queue
//!
//! Transactions wait here until their partition's executor is free. Entries
//! are ordered by transaction id, which is assigned in admission order, so
//! the queue is FIFO for fresh arrivals. A re-queued transaction keeps its
//! original id and therefore returns to its original relative position.
//!
//! The queue is the only partition structure shared across threads: the
//! site inserts into it, the owning executor polls it, and tests observe its
//! size. Every size change notifies both the executor (through the shared
//! [`Notifier`]) and anyone blocked in [`PartitionLockQueue::wait_for_size`].

use crate::notify::Notifier;
use crate::transaction::Transaction;
use parking_lot::{Condvar, Mutex};
use spectra_core::{PartitionId, RejectReason, SpectraError, TxnId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Admission refused by a lock queue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Transaction already queued at this partition
    #[error("{txn} already queued at {partition}")]
    Duplicate {
        /// Rejected transaction
        txn: TxnId,
        /// Queue's partition
        partition: PartitionId,
    },
    /// Queue at capacity
    #[error("{partition} queue full ({capacity} entries), rejected {txn}")]
    QueueFull {
        /// Rejected transaction
        txn: TxnId,
        /// Queue's partition
        partition: PartitionId,
        /// Configured capacity
        capacity: usize,
    },
    /// Queue closed for shutdown
    #[error("{partition} queue closed, rejected {txn}")]
    Closed {
        /// Rejected transaction
        txn: TxnId,
        /// Queue's partition
        partition: PartitionId,
    },
}

impl From<AdmissionError> for SpectraError {
    fn from(e: AdmissionError) -> Self {
        let (txn, partition, reason) = match e {
            AdmissionError::Duplicate { txn, partition } => (txn, partition, RejectReason::Duplicate),
            AdmissionError::QueueFull {
                txn,
                partition,
                capacity,
            } => (txn, partition, RejectReason::QueueFull { capacity }),
            AdmissionError::Closed { txn, partition } => (txn, partition, RejectReason::ShuttingDown),
        };
        SpectraError::Rejected {
            txn,
            partition,
            reason,
        }
    }
}

/// Lock queue statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries accepted (fresh and re-queued)
    pub enqueued: u64,
    /// Entries handed to the executor
    pub dequeued: u64,
    /// Entries removed before dequeue (aborts, speculative picks)
    pub removed: u64,
    /// Admissions refused
    pub rejected: u64,
    /// Largest size observed
    pub max_size: u64,
}

// Relaxed: purely observational
#[derive(Debug, Default)]
struct QueueProfile {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    removed: AtomicU64,
    rejected: AtomicU64,
    max_size: AtomicU64,
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: BTreeMap<TxnId, Arc<Transaction>>,
}

/// Admission queue of one partition
#[derive(Debug)]
pub struct PartitionLockQueue {
    partition: PartitionId,
    capacity: usize,
    inner: Mutex<QueueInner>,
    size_changed: Condvar,
    notifier: Arc<Notifier>,
    closed: AtomicBool,
    profiling: bool,
    profile: QueueProfile,
}

impl PartitionLockQueue {
    /// Create an empty queue
    pub fn new(partition: PartitionId, capacity: usize, profiling: bool) -> Self {
        Self {
            partition,
            capacity,
            inner: Mutex::new(QueueInner::default()),
            size_changed: Condvar::new(),
            notifier: Arc::new(Notifier::new()),
            closed: AtomicBool::new(false),
            profiling,
            profile: QueueProfile::default(),
        }
    }

    /// Partition this queue serves
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wakeup flag shared with the owning executor
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Check whether `txn` would be accepted right now
    pub fn check_admit(&self, txn: TxnId) -> Result<(), AdmissionError> {
        let inner = self.inner.lock();
        self.check_locked(&inner, txn, true)
    }

    fn check_locked(&self, inner: &QueueInner, txn: TxnId, enforce_capacity: bool) -> Result<(), AdmissionError> {
        let partition = self.partition;
        if self.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::Closed { txn, partition });
        }
        if inner.entries.contains_key(&txn) {
            return Err(AdmissionError::Duplicate { txn, partition });
        }
        if enforce_capacity && inner.entries.len() >= self.capacity {
            return Err(AdmissionError::QueueFull {
                txn,
                partition,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Add a transaction
    ///
    /// Rejected if it is already queued here, the queue is full, or the queue
    /// has been closed.
    pub fn enqueue(&self, txn: Arc<Transaction>) -> Result<(), AdmissionError> {
        self.insert(txn, true)
    }

    /// Put back a transaction displaced by a rollback
    ///
    /// Capacity is not enforced: the entry already held a slot.
    pub fn requeue(&self, txn: Arc<Transaction>) -> Result<(), AdmissionError> {
        self.insert(txn, false)
    }

    fn insert(&self, txn: Arc<Transaction>, enforce_capacity: bool) -> Result<(), AdmissionError> {
        let id = txn.id();
        let size = {
            let mut inner = self.inner.lock();
            if let Err(e) = self.check_locked(&inner, id, enforce_capacity) {
                if self.profiling {
                    self.profile.rejected.fetch_add(1, Ordering::Relaxed);
                }
                debug!(target: "spectra::queue", txn_id = %id, partition = %self.partition, error = %e, "Admission rejected");
                return Err(e);
            }
            inner.entries.insert(id, txn);
            inner.entries.len()
        };
        if self.profiling {
            self.profile.enqueued.fetch_add(1, Ordering::Relaxed);
            self.profile.max_size.fetch_max(size as u64, Ordering::Relaxed);
        }
        trace!(target: "spectra::queue", txn_id = %id, partition = %self.partition, size, "Enqueued");
        self.size_changed.notify_all();
        self.notifier.notify();
        Ok(())
    }

    /// Number of queued transactions
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether `txn` is queued here
    pub fn contains(&self, txn: TxnId) -> bool {
        self.inner.lock().entries.contains_key(&txn)
    }

    /// Next transaction in order, without removing it
    pub fn peek(&self) -> Option<Arc<Transaction>> {
        self.inner.lock().entries.values().next().cloned()
    }

    /// Remove and return the next transaction in order
    pub fn poll(&self) -> Option<Arc<Transaction>> {
        let txn = self.inner.lock().entries.pop_first().map(|(_, txn)| txn);
        if txn.is_some() {
            if self.profiling {
                self.profile.dequeued.fetch_add(1, Ordering::Relaxed);
            }
            self.size_changed.notify_all();
        }
        txn
    }

    /// Remove a specific transaction
    pub fn remove(&self, txn: TxnId) -> Option<Arc<Transaction>> {
        let removed = self.inner.lock().entries.remove(&txn);
        if removed.is_some() {
            if self.profiling {
                self.profile.removed.fetch_add(1, Ordering::Relaxed);
            }
            self.size_changed.notify_all();
        }
        removed
    }

    /// Up to `limit` transactions in queue order, without removing them
    pub fn candidates(&self, limit: usize) -> Vec<Arc<Transaction>> {
        self.inner
            .lock()
            .entries
            .values()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Block until the queue holds exactly `size` entries or `timeout` expires
    ///
    /// Returns whether the size was reached.
    pub fn wait_for_size(&self, size: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.entries.len() != size {
            if self.size_changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.entries.len() == size;
            }
        }
        true
    }

    /// Refuse further admissions and hand back everything still queued
    pub fn close(&self) -> Vec<Arc<Transaction>> {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = std::mem::take(&mut self.inner.lock().entries)
            .into_values()
            .collect();
        self.size_changed.notify_all();
        self.notifier.notify();
        drained
    }

    /// Whether the queue was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Statistics snapshot; all zero unless profiling is enabled
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.profile.enqueued.load(Ordering::Relaxed),
            dequeued: self.profile.dequeued.load(Ordering::Relaxed),
            removed: self.profile.removed.load(Ordering::Relaxed),
            rejected: self.profile.rejected.load(Ordering::Relaxed),
            max_size: self.profile.max_size.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionSpec;
    use spectra_core::ParameterSet;

    fn txn(id: u64) -> Arc<Transaction> {
        let spec = TransactionSpec::new("Proc", ParameterSet::default(), PartitionId::new(0));
        Arc::new(Transaction::new(TxnId::new(id), spec))
    }

    fn queue(capacity: usize) -> PartitionLockQueue {
        PartitionLockQueue::new(PartitionId::new(0), capacity, true)
    }

    #[test]
    fn test_poll_in_id_order() {
        let q = queue(10);
        q.enqueue(txn(3)).unwrap();
        q.enqueue(txn(1)).unwrap();
        q.enqueue(txn(2)).unwrap();
        assert_eq!(q.size(), 3);
        assert_eq!(q.peek().unwrap().id(), TxnId::new(1));
        let order: Vec<_> = std::iter::from_fn(|| q.poll()).map(|t| t.id().as_u64()).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let q = queue(10);
        let t = txn(1);
        q.enqueue(Arc::clone(&t)).unwrap();
        let err = q.enqueue(t).unwrap_err();
        assert!(matches!(err, AdmissionError::Duplicate { .. }));
        assert_eq!(q.size(), 1);
        assert_eq!(q.stats().rejected, 1);
    }

    #[test]
    fn test_capacity_backpressure() {
        let q = queue(2);
        q.enqueue(txn(1)).unwrap();
        q.enqueue(txn(2)).unwrap();
        let err = q.enqueue(txn(3)).unwrap_err();
        assert!(matches!(err, AdmissionError::QueueFull { capacity: 2, .. }));

        let spectra: SpectraError = err.into();
        assert!(matches!(
            spectra,
            SpectraError::Rejected {
                reason: RejectReason::QueueFull { capacity: 2 },
                ..
            }
        ));
    }

    #[test]
    fn test_requeue_bypasses_capacity_and_keeps_order() {
        let q = queue(1);
        let first = txn(1);
        q.enqueue(txn(2)).unwrap();
        q.requeue(Arc::clone(&first)).unwrap();
        assert_eq!(q.size(), 2);
        assert_eq!(q.poll().unwrap().id(), TxnId::new(1));
        assert!(q.requeue(txn(2)).is_err());
    }

    #[test]
    fn test_remove_and_candidates() {
        let q = queue(10);
        for id in 1..=5 {
            q.enqueue(txn(id)).unwrap();
        }
        assert!(q.remove(TxnId::new(2)).is_some());
        assert!(q.remove(TxnId::new(2)).is_none());
        let ids: Vec<_> = q.candidates(3).iter().map(|t| t.id().as_u64()).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert_eq!(q.size(), 4);
    }

    #[test]
    fn test_close_drains_and_rejects() {
        let q = queue(10);
        q.enqueue(txn(1)).unwrap();
        let drained = q.close();
        assert_eq!(drained.len(), 1);
        assert!(q.is_closed());
        assert!(matches!(q.enqueue(txn(2)), Err(AdmissionError::Closed { .. })));
    }

    #[test]
    fn test_wait_for_size() {
        let q = Arc::new(queue(10));
        assert!(q.wait_for_size(0, Duration::from_millis(1)));
        assert!(!q.wait_for_size(1, Duration::from_millis(5)));

        let producer = Arc::clone(&q);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.enqueue(txn(7)).unwrap();
        });
        assert!(q.wait_for_size(1, Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_enqueue_wakes_notifier() {
        let q = queue(10);
        q.enqueue(txn(1)).unwrap();
        assert!(q.notifier().wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_stats() {
        let q = queue(10);
        q.enqueue(txn(1)).unwrap();
        q.enqueue(txn(2)).unwrap();
        q.poll();
        q.remove(TxnId::new(2));
        let stats = q.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dequeued, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.max_size, 2);

        let quiet = PartitionLockQueue::new(PartitionId::new(1), 10, false);
        quiet.enqueue(txn(1)).unwrap();
        assert_eq!(quiet.stats(), QueueStats::default());
    }
}
