//! Transaction admission and conflict checking
//!
//! This crate holds the structures shared between partition executors:
//! - Transaction: shared state of an admitted transaction (transaction)
//! - ResponseHandle: one-shot client response slot (response)
//! - ConflictChecker: safety oracle for speculative execution (conflict)
//! - PartitionLockQueue: per-partition admission queue (lock_queue)
//! - TransactionQueueManager: site-wide queue routing and id allocation (manager)
//! - Notifier: worker wakeup flag (notify)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod lock_queue;
pub mod manager;
pub mod notify;
pub mod response;
pub mod transaction;

pub use conflict::{
    AllowAll, CheckerKind, ConflictCheckError, ConflictChecker, CustomChecker, ReadWriteSetOverlap,
};
pub use lock_queue::{AdmissionError, PartitionLockQueue, QueueStats};
pub use manager::TransactionQueueManager;
pub use notify::Notifier;
pub use response::{ClientResponse, ResponseDebug, ResponseHandle};
pub use transaction::{TraceEntry, Transaction, TransactionSpec, TxnFlags};
