//! Error types for the partition execution engine
//!
//! This module defines the error hierarchy used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors fall into four groups:
//! - admission errors, returned synchronously to the submitter
//! - fatal safety violations, which stop the partition worker that saw them
//! - liveness faults (remote timeouts), handed to the coordinator
//! - transaction aborts, which are expected and map onto a client [`Status`]

use crate::status::Status;
use crate::types::{PartitionId, TxnId};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for engine operations
pub type SpectraResult<T> = std::result::Result<T, SpectraError>;

/// Why a lock queue refused a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The transaction is already queued at this partition
    Duplicate,
    /// The queue is at capacity
    QueueFull {
        /// Configured capacity
        capacity: usize,
    },
    /// The site is shutting down
    ShuttingDown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Duplicate => write!(f, "already queued"),
            RejectReason::QueueFull { capacity } => write!(f, "queue full ({} entries)", capacity),
            RejectReason::ShuttingDown => write!(f, "site shutting down"),
        }
    }
}

/// Error types for the engine
#[derive(Debug, Error)]
pub enum SpectraError {
    /// Admission refused by a partition lock queue
    #[error("transaction {txn} rejected at {partition}: {reason}")]
    Rejected {
        /// Rejected transaction
        txn: TxnId,
        /// Partition whose queue refused it
        partition: PartitionId,
        /// Why
        reason: RejectReason,
    },

    /// No handler registered under this procedure name
    #[error("unknown procedure '{0}'")]
    UnknownProcedure(String),

    /// Partition id outside the site's partition range
    #[error("invalid partition {partition} (site has {count} partitions)")]
    InvalidPartition {
        /// Offending partition
        partition: PartitionId,
        /// Partitions served by the site
        count: u32,
    },

    /// A remote partition did not answer within the bounded wait
    #[error("{partition} did not respond for transaction {txn} within {waited_ms}ms")]
    RemoteTimeout {
        /// Waiting transaction
        txn: TxnId,
        /// Silent partition
        partition: PartitionId,
        /// How long we waited
        waited_ms: u64,
    },

    /// The transaction touched a partition outside its predicted or live set
    #[error("transaction {txn} mispredicted: {partition} is not available to it")]
    Mispredict {
        /// Mispredicted transaction
        txn: TxnId,
        /// Partition it tried to touch
        partition: PartitionId,
    },

    /// The transaction was aborted; carries the client-visible status
    #[error("transaction {txn} aborted ({status}): {reason}")]
    Aborted {
        /// Aborted transaction
        txn: TxnId,
        /// Client-visible status
        status: Status,
        /// Human-readable reason
        reason: String,
    },

    /// A conflict-safety invariant was broken; fatal to the partition worker
    #[error("safety invariant violated at {partition}: {detail}")]
    InvariantViolation {
        /// Partition that detected the violation
        partition: PartitionId,
        /// What went wrong
        detail: String,
    },

    /// The conflict checker failed its contract; fatal to the partition worker
    #[error("conflict checker '{checker}' failed at {partition}: {detail}")]
    ConflictChecker {
        /// Checker name
        checker: String,
        /// Partition being scheduled
        partition: PartitionId,
        /// What went wrong
        detail: String,
    },

    /// The partition worker is not running (stopped or failed)
    #[error("executor for {0} is not running")]
    ExecutorStopped(PartitionId),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid operation or state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// I/O error (config or model files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SpectraError {
    /// Build an `Aborted` error
    pub fn aborted(txn: TxnId, status: Status, reason: impl Into<String>) -> Self {
        SpectraError::Aborted {
            txn,
            status,
            reason: reason.into(),
        }
    }

    /// Build an `InvariantViolation`
    pub fn invariant(partition: PartitionId, detail: impl Into<String>) -> Self {
        SpectraError::InvariantViolation {
            partition,
            detail: detail.into(),
        }
    }

    /// Whether this error must stop the partition worker that observed it
    ///
    /// Masking these risks silent isolation violations.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SpectraError::InvariantViolation { .. } | SpectraError::ConflictChecker { .. }
        )
    }

    /// Client-visible status for a transaction that failed with this error
    pub fn status(&self) -> Status {
        match self {
            SpectraError::Rejected { .. } => Status::AbortReject,
            SpectraError::Mispredict { .. } => Status::AbortMispredict,
            SpectraError::Aborted { status, .. } => *status,
            SpectraError::ExecutorStopped(_) => Status::AbortReject,
            _ => Status::AbortUnexpected,
        }
    }
}

impl From<serde_json::Error> for SpectraError {
    fn from(e: serde_json::Error) -> Self {
        SpectraError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: u32) -> PartitionId {
        PartitionId::new(n)
    }

    #[test]
    fn test_error_display_rejected() {
        let err = SpectraError::Rejected {
            txn: TxnId::new(7),
            partition: p(1),
            reason: RejectReason::QueueFull { capacity: 4 },
        };
        let msg = err.to_string();
        assert!(msg.contains("#7"));
        assert!(msg.contains("P1"));
        assert!(msg.contains("queue full"));
        assert_eq!(err.status(), Status::AbortReject);
    }

    #[test]
    fn test_error_display_remote_timeout() {
        let err = SpectraError::RemoteTimeout {
            txn: TxnId::new(3),
            partition: p(2),
            waited_ms: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("1000ms"));
        assert!(!err.is_fatal());
        assert_eq!(err.status(), Status::AbortUnexpected);
    }

    #[test]
    fn test_safety_errors_are_fatal() {
        assert!(SpectraError::invariant(p(0), "work after prepare").is_fatal());
        let err = SpectraError::ConflictChecker {
            checker: "read_write_set".to_string(),
            partition: p(0),
            detail: "candidate is distributed".to_string(),
        };
        assert!(err.is_fatal());
        assert!(!SpectraError::UnknownProcedure("x".into()).is_fatal());
    }

    #[test]
    fn test_aborted_carries_status() {
        let err = SpectraError::aborted(TxnId::new(1), Status::AbortUser, "insufficient funds");
        assert_eq!(err.status(), Status::AbortUser);
        assert!(err.to_string().contains("insufficient funds"));

        let err = SpectraError::Mispredict {
            txn: TxnId::new(1),
            partition: p(3),
        };
        assert_eq!(err.status(), Status::AbortMispredict);
        assert_eq!(SpectraError::ExecutorStopped(p(0)).status(), Status::AbortReject);
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: SpectraError = io_err.into();
        assert!(matches!(err, SpectraError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let result: Result<Vec<u32>, SpectraError> =
            serde_json::from_str::<Vec<u32>>("not json").map_err(Into::into);
        assert!(matches!(result, Err(SpectraError::Serialization(_))));
    }
}
