//! Conflict checking for speculative execution
//!
//! While a partition is held by a distributed transaction, the speculative
//! scheduler asks a [`ConflictChecker`] whether a queued single-partition
//! candidate may run in the meantime.
//!
//! # Checkers
//!
//! - [`AllowAll`]: every candidate is safe (tests, conflict-free workloads)
//! - [`ReadWriteSetOverlap`]: compares read/write sets at the partition
//! - [`CustomChecker`]: caller-supplied decision function
//!
//! # Conflict rules (`ReadWriteSetOverlap`)
//!
//! The holder's set at the partition is what it has observed so far, plus
//! what it declared if it may still run work there. A candidate conflicts if
//!
//! - the holder writes a key the candidate reads or writes, or
//! - the holder may still run at the partition and reads a key the
//!   candidate writes.
//!
//! A candidate without a declared set is never considered safe.

use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use spectra_core::{PartitionAccess, PartitionId, SpectraError, TxnId};
use std::sync::Arc;
use thiserror::Error;

/// Contract violation reported by a checker
///
/// Always fatal to the partition worker that receives it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictCheckError {
    /// Candidate is not a single-partition transaction at this partition
    #[error("candidate {candidate} is not single-partition at {partition}")]
    CandidateNotLocal {
        /// Offending candidate
        candidate: TxnId,
        /// Partition being scheduled
        partition: PartitionId,
    },
    /// The holding transaction does not include this partition
    #[error("holder {holder} does not include {partition}")]
    PartitionNotHeld {
        /// Holding distributed transaction
        holder: TxnId,
        /// Partition being scheduled
        partition: PartitionId,
    },
    /// Any other failure inside a checker
    #[error("{detail}")]
    Failed {
        /// Partition being scheduled
        partition: PartitionId,
        /// What went wrong
        detail: String,
    },
}

impl ConflictCheckError {
    /// Partition the failed check was made for
    pub fn partition(&self) -> PartitionId {
        match self {
            ConflictCheckError::CandidateNotLocal { partition, .. }
            | ConflictCheckError::PartitionNotHeld { partition, .. }
            | ConflictCheckError::Failed { partition, .. } => *partition,
        }
    }

    /// Convert into the engine error, naming the checker that failed
    pub fn into_error(self, checker: &str) -> SpectraError {
        SpectraError::ConflictChecker {
            checker: checker.to_string(),
            partition: self.partition(),
            detail: self.to_string(),
        }
    }
}

/// Safety oracle for speculative execution
///
/// Implementations must be cheap and free of side effects; they are called
/// on the partition worker for every candidate inspected.
pub trait ConflictChecker: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Whether `txn` is outside the scope of conflict analysis
    ///
    /// Ignored transactions are always eligible for speculation.
    fn should_ignore(&self, txn: &Transaction) -> bool;

    /// Whether `candidate` may run at `partition` while `holder` owns it
    fn can_execute(
        &self,
        holder: &Transaction,
        candidate: &Transaction,
        partition: PartitionId,
    ) -> Result<bool, ConflictCheckError>;
}

/// Checker that allows every candidate
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConflictChecker for AllowAll {
    fn name(&self) -> &str {
        "allow_all"
    }

    fn should_ignore(&self, _txn: &Transaction) -> bool {
        false
    }

    fn can_execute(
        &self,
        _holder: &Transaction,
        _candidate: &Transaction,
        _partition: PartitionId,
    ) -> Result<bool, ConflictCheckError> {
        Ok(true)
    }
}

/// Checker comparing the holder's and candidate's read/write sets
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadWriteSetOverlap;

impl ReadWriteSetOverlap {
    fn holder_access(holder: &Transaction, partition: PartitionId) -> Option<(PartitionAccess, bool)> {
        let finished_here = holder.is_done_at(partition) || holder.is_prepared_at(partition);
        let mut access = holder.observed_at(partition).unwrap_or_default();
        if !finished_here {
            // still running here: whatever it declared may yet be touched
            let declared = holder.declared_access()?;
            if let Some(at) = declared.at(partition) {
                access.merge(at);
            }
        }
        Some((access, finished_here))
    }
}

impl ConflictChecker for ReadWriteSetOverlap {
    fn name(&self) -> &str {
        "read_write_set"
    }

    fn should_ignore(&self, txn: &Transaction) -> bool {
        txn.is_system() && txn.is_read_only()
    }

    fn can_execute(
        &self,
        holder: &Transaction,
        candidate: &Transaction,
        partition: PartitionId,
    ) -> Result<bool, ConflictCheckError> {
        if !candidate.is_single_partition() || candidate.base_partition() != partition {
            return Err(ConflictCheckError::CandidateNotLocal {
                candidate: candidate.id(),
                partition,
            });
        }
        if !holder.predicted_partitions().contains(partition) {
            return Err(ConflictCheckError::PartitionNotHeld {
                holder: holder.id(),
                partition,
            });
        }

        let cand = match candidate.declared_access() {
            Some(declared) => declared.at(partition).cloned().unwrap_or_default(),
            None => return Ok(false),
        };
        let (held, finished_here) = match Self::holder_access(holder, partition) {
            Some(access) => access,
            None => return Ok(false),
        };

        if held.writes_intersect(&cand) {
            return Ok(false);
        }
        if !finished_here && held.reads_intersect_writes_of(&cand) {
            return Ok(false);
        }
        Ok(true)
    }
}

type DecideFn =
    dyn Fn(&Transaction, &Transaction, PartitionId) -> Result<bool, ConflictCheckError> + Send + Sync;
type IgnoreFn = dyn Fn(&Transaction) -> bool + Send + Sync;

/// Checker built from closures
pub struct CustomChecker {
    name: String,
    decide: Box<DecideFn>,
    ignore: Option<Box<IgnoreFn>>,
}

impl CustomChecker {
    /// Create a checker from a decision function
    pub fn new<F>(name: impl Into<String>, decide: F) -> Self
    where
        F: Fn(&Transaction, &Transaction, PartitionId) -> Result<bool, ConflictCheckError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            decide: Box::new(decide),
            ignore: None,
        }
    }

    /// Add a predicate selecting transactions that bypass the check
    pub fn with_ignore<F>(mut self, ignore: F) -> Self
    where
        F: Fn(&Transaction) -> bool + Send + Sync + 'static,
    {
        self.ignore = Some(Box::new(ignore));
        self
    }
}

impl ConflictChecker for CustomChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_ignore(&self, txn: &Transaction) -> bool {
        self.ignore.as_ref().map_or(false, |f| f(txn))
    }

    fn can_execute(
        &self,
        holder: &Transaction,
        candidate: &Transaction,
        partition: PartitionId,
    ) -> Result<bool, ConflictCheckError> {
        (self.decide)(holder, candidate, partition)
    }
}

impl std::fmt::Debug for CustomChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomChecker")
            .field("name", &self.name)
            .finish()
    }
}

/// Checker selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckerKind {
    /// [`AllowAll`]
    AllowAll,
    /// [`ReadWriteSetOverlap`]
    #[default]
    ReadWriteSet,
}

impl CheckerKind {
    /// Instantiate the checker
    pub fn build(self) -> Arc<dyn ConflictChecker> {
        match self {
            CheckerKind::AllowAll => Arc::new(AllowAll),
            CheckerKind::ReadWriteSet => Arc::new(ReadWriteSetOverlap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransactionSpec, TxnFlags};
    use spectra_core::{AccessSet, ParameterSet, PartitionSet};

    fn p(n: u32) -> PartitionId {
        PartitionId::new(n)
    }

    fn holder(declared: Option<AccessSet>) -> Transaction {
        let mut spec = TransactionSpec::new("Transfer", ParameterSet::default(), p(0))
            .partitions(PartitionSet::all(2));
        spec.declared = declared;
        Transaction::new(TxnId::new(1), spec)
    }

    fn candidate(id: u64, declared: Option<AccessSet>) -> Transaction {
        let mut spec = TransactionSpec::new("Lookup", ParameterSet::default(), p(1));
        spec.declared = declared;
        Transaction::new(TxnId::new(id), spec)
    }

    #[test]
    fn test_allow_all() {
        let h = holder(None);
        let c = candidate(2, None);
        assert_eq!(AllowAll.can_execute(&h, &c, p(1)), Ok(true));
        assert!(!AllowAll.should_ignore(&c));
    }

    #[test]
    fn test_disjoint_sets_are_safe() {
        let h = holder(Some(AccessSet::new().write(p(1), "a").read(p(1), "b")));
        let c = candidate(2, Some(AccessSet::new().read(p(1), "c").write(p(1), "d")));
        assert_eq!(ReadWriteSetOverlap.can_execute(&h, &c, p(1)), Ok(true));
    }

    #[test]
    fn test_candidate_reading_holder_write_conflicts() {
        let h = holder(Some(AccessSet::new().write(p(1), "a")));
        let c = candidate(2, Some(AccessSet::new().read(p(1), "a")));
        assert_eq!(ReadWriteSetOverlap.can_execute(&h, &c, p(1)), Ok(false));
    }

    #[test]
    fn test_candidate_writing_holder_read_depends_on_done() {
        let h = holder(Some(AccessSet::new().read(p(1), "a")));
        let c = candidate(2, Some(AccessSet::new().write(p(1), "a")));
        assert_eq!(ReadWriteSetOverlap.can_execute(&h, &c, p(1)), Ok(false));

        // once the holder is done here its reads are final
        h.record_read(p(1), "a");
        h.mark_done(p(1));
        assert_eq!(ReadWriteSetOverlap.can_execute(&h, &c, p(1)), Ok(true));
    }

    #[test]
    fn test_done_holder_uses_observed_writes() {
        let h = holder(None);
        h.record_write(p(1), "a");
        h.mark_done(p(1));
        let c = candidate(2, Some(AccessSet::new().read(p(1), "a")));
        assert_eq!(ReadWriteSetOverlap.can_execute(&h, &c, p(1)), Ok(false));

        let other = candidate(3, Some(AccessSet::new().read(p(1), "z")));
        assert_eq!(ReadWriteSetOverlap.can_execute(&h, &other, p(1)), Ok(true));
    }

    #[test]
    fn test_unknown_sets_are_unsafe() {
        let c = candidate(2, Some(AccessSet::new().read(p(1), "a")));
        assert_eq!(ReadWriteSetOverlap.can_execute(&holder(None), &c, p(1)), Ok(false));

        let h = holder(Some(AccessSet::new()));
        assert_eq!(ReadWriteSetOverlap.can_execute(&h, &candidate(3, None), p(1)), Ok(false));
    }

    #[test]
    fn test_contract_violations() {
        let h = holder(Some(AccessSet::new()));
        let distributed = {
            let spec = TransactionSpec::new("Transfer", ParameterSet::default(), p(1))
                .partitions(PartitionSet::all(2))
                .declared(AccessSet::new());
            Transaction::new(TxnId::new(4), spec)
        };
        let err = ReadWriteSetOverlap
            .can_execute(&h, &distributed, p(1))
            .unwrap_err();
        assert!(matches!(err, ConflictCheckError::CandidateNotLocal { .. }));

        let elsewhere = {
            let spec = TransactionSpec::new("Lookup", ParameterSet::default(), p(5))
                .declared(AccessSet::new());
            Transaction::new(TxnId::new(5), spec)
        };
        let err = ReadWriteSetOverlap.can_execute(&h, &elsewhere, p(5)).unwrap_err();
        assert!(matches!(err, ConflictCheckError::PartitionNotHeld { .. }));
        assert!(err.into_error("read_write_set").is_fatal());
    }

    #[test]
    fn test_system_read_only_is_ignored() {
        let mut spec = TransactionSpec::new("@Stats", ParameterSet::default(), p(1));
        spec.flags = TxnFlags {
            system: true,
            read_only: true,
            client_debug: false,
        };
        let probe = Transaction::new(TxnId::new(9), spec);
        assert!(ReadWriteSetOverlap.should_ignore(&probe));
        assert!(!ReadWriteSetOverlap.should_ignore(&candidate(2, None)));
    }

    #[test]
    fn test_custom_checker() {
        let checker = CustomChecker::new("even_only", |_, c, _| Ok(c.id().as_u64() % 2 == 0))
            .with_ignore(|t| t.procedure() == "Ping");
        let h = holder(None);
        assert_eq!(checker.can_execute(&h, &candidate(2, None), p(1)), Ok(true));
        assert_eq!(checker.can_execute(&h, &candidate(3, None), p(1)), Ok(false));
        assert_eq!(checker.name(), "even_only");
    }

    #[test]
    fn test_checker_kind_serde() {
        let kind: CheckerKind = serde_json::from_str("\"allow_all\"").unwrap();
        assert_eq!(kind, CheckerKind::AllowAll);
        assert_eq!(CheckerKind::default().build().name(), "read_write_set");
    }
}
