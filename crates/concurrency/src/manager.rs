//! Site-level transaction queue manager
//!
//! Owns one [`PartitionLockQueue`] per partition and routes admitted
//! transactions into them.
//!
//! ## Admission
//!
//! ```text
//! 1. take the admission lock
//! 2. validate the predicted partitions against the site's range
//! 3. allocate the next transaction id
//! 4. check every target queue (closed / full)
//! 5. insert into every target queue
//! ```
//!
//! Because ids are allocated and inserted under one lock, every queue sees
//! distributed transactions in the same id order. Each partition always
//! grants its lock to the lowest queued id, so lock acquisition cannot form
//! a cycle.

use crate::lock_queue::{AdmissionError, PartitionLockQueue};
use crate::transaction::{Transaction, TransactionSpec};
use parking_lot::Mutex;
use spectra_core::{PartitionId, SpectraError, SpectraResult, TxnId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Owns the lock queues of every partition at a site
#[derive(Debug)]
pub struct TransactionQueueManager {
    queues: Vec<Arc<PartitionLockQueue>>,
    /// Next transaction id
    ///
    /// Only advanced under `admission`, so id order equals insertion order.
    next_txn_id: AtomicU64,
    admission: Mutex<()>,
}

impl TransactionQueueManager {
    /// Create queues for partitions `0..num_partitions`
    pub fn new(num_partitions: u32, queue_capacity: usize, profiling: bool) -> Self {
        let queues = (0..num_partitions)
            .map(|p| Arc::new(PartitionLockQueue::new(PartitionId::new(p), queue_capacity, profiling)))
            .collect();
        Self {
            queues,
            next_txn_id: AtomicU64::new(1),
            admission: Mutex::new(()),
        }
    }

    /// Number of partitions served
    pub fn num_partitions(&self) -> u32 {
        self.queues.len() as u32
    }

    /// Lock queue of `partition`
    pub fn lock_queue(&self, partition: PartitionId) -> Option<&Arc<PartitionLockQueue>> {
        self.queues.get(partition.index())
    }

    fn queue_or_err(&self, partition: PartitionId) -> SpectraResult<&Arc<PartitionLockQueue>> {
        self.lock_queue(partition).ok_or(SpectraError::InvalidPartition {
            partition,
            count: self.num_partitions(),
        })
    }

    /// Id the next admitted transaction will receive
    pub fn peek_next_txn_id(&self) -> TxnId {
        TxnId::new(self.next_txn_id.load(Ordering::SeqCst))
    }

    /// Admit a transaction into every predicted partition's queue
    ///
    /// Either every queue accepts it or none does.
    pub fn admit(&self, spec: TransactionSpec) -> SpectraResult<Arc<Transaction>> {
        let _admission = self.admission.lock();

        let mut targets = Vec::with_capacity(spec.partitions.len() + 1);
        for partition in spec.partitions.iter() {
            targets.push(self.queue_or_err(partition)?);
        }
        if !spec.partitions.contains(spec.base_partition) {
            targets.push(self.queue_or_err(spec.base_partition)?);
        }

        let id = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        for queue in &targets {
            queue.check_admit(id)?;
        }

        let txn = Arc::new(Transaction::new(id, spec));
        for (i, queue) in targets.iter().enumerate() {
            if let Err(e) = queue.enqueue(Arc::clone(&txn)) {
                // only reachable if a queue closed since the check
                for undo in &targets[..i] {
                    undo.remove(id);
                }
                return Err(e.into());
            }
        }
        debug!(
            target: "spectra::queue",
            txn_id = %id,
            procedure = txn.procedure(),
            partitions = %txn.predicted_partitions(),
            "Admitted"
        );
        Ok(txn)
    }

    /// Roll `txn` back to a fresh queued state under its original id
    ///
    /// Counts one restart and puts it back into every predicted partition's
    /// queue, bypassing capacity.
    pub fn requeue(&self, txn: &Arc<Transaction>) -> Result<(), AdmissionError> {
        txn.reset_for_restart();
        for partition in txn.predicted_partitions().iter() {
            if let Some(queue) = self.lock_queue(partition) {
                queue.requeue(Arc::clone(txn))?;
            }
        }
        debug!(
            target: "spectra::queue",
            txn_id = %txn.id(),
            restarts = txn.restart_counter(),
            "Re-queued"
        );
        Ok(())
    }

    /// Remove `txn` from every queue it waits in; returns how many held it
    pub fn remove_everywhere(&self, txn: TxnId) -> usize {
        self.queues
            .iter()
            .filter(|q| q.remove(txn).is_some())
            .count()
    }

    /// Find a queued transaction by id
    pub fn find_queued(&self, txn: TxnId) -> Option<Arc<Transaction>> {
        self.queues.iter().find_map(|q| {
            q.candidates(usize::MAX)
                .into_iter()
                .find(|t| t.id() == txn)
        })
    }

    /// Total entries across all queues
    pub fn total_queued(&self) -> usize {
        self.queues.iter().map(|q| q.size()).sum()
    }

    /// Close every queue and return each still-queued transaction once
    pub fn close_all(&self) -> Vec<Arc<Transaction>> {
        let _admission = self.admission.lock();
        let mut drained = BTreeMap::new();
        for queue in &self.queues {
            for txn in queue.close() {
                drained.entry(txn.id()).or_insert(txn);
            }
        }
        drained.into_values().collect()
    }
}
