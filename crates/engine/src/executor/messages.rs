//! Messages exchanged between partition executors

use crate::procedure::WorkUnit;
use spectra_concurrency::Transaction;
use spectra_core::{PartitionId, TxnId, Value};
use std::fmt;
use std::sync::Arc;

/// Result of a remote work unit: values, or the error text
pub type WorkOutcome = Result<Vec<Value>, String>;

/// Inbound message of a partition executor
pub enum ExecutorMessage {
    /// A remote partition granted its lock to `txn_id`
    LockGranted {
        /// Transaction
        txn_id: TxnId,
        /// Granting partition
        partition: PartitionId,
    },
    /// Execute a work unit for the distributed transaction holding this partition
    Work {
        /// Transaction
        txn: Arc<Transaction>,
        /// Request sequence number, echoed in the result
        seq: u64,
        /// What to run
        unit: WorkUnit,
    },
    /// Result of a previously sent work unit
    WorkResult {
        /// Transaction
        txn_id: TxnId,
        /// Partition that ran it
        partition: PartitionId,
        /// Request sequence number
        seq: u64,
        /// Outcome
        outcome: WorkOutcome,
    },
    /// Prepare to commit; `early` when sent by Early 2PC
    Prepare {
        /// Transaction
        txn: Arc<Transaction>,
        /// Sent before the transaction finished
        early: bool,
    },
    /// A remote partition prepared
    PrepareAck {
        /// Transaction
        txn_id: TxnId,
        /// Prepared partition
        partition: PartitionId,
    },
    /// Final decision
    Finish {
        /// Transaction
        txn: Arc<Transaction>,
        /// Commit or roll back
        commit: bool,
    },
    /// An abort was requested for `txn_id`
    Abort {
        /// Transaction
        txn_id: TxnId,
    },
}

impl ExecutorMessage {
    /// Transaction the message concerns
    pub fn txn_id(&self) -> TxnId {
        match self {
            ExecutorMessage::LockGranted { txn_id, .. }
            | ExecutorMessage::WorkResult { txn_id, .. }
            | ExecutorMessage::PrepareAck { txn_id, .. }
            | ExecutorMessage::Abort { txn_id } => *txn_id,
            ExecutorMessage::Work { txn, .. }
            | ExecutorMessage::Prepare { txn, .. }
            | ExecutorMessage::Finish { txn, .. } => txn.id(),
        }
    }

    /// Short message name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorMessage::LockGranted { .. } => "LockGranted",
            ExecutorMessage::Work { .. } => "Work",
            ExecutorMessage::WorkResult { .. } => "WorkResult",
            ExecutorMessage::Prepare { .. } => "Prepare",
            ExecutorMessage::PrepareAck { .. } => "PrepareAck",
            ExecutorMessage::Finish { .. } => "Finish",
            ExecutorMessage::Abort { .. } => "Abort",
        }
    }
}

impl fmt::Debug for ExecutorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.txn_id())
    }
}
