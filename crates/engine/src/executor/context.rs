//! Handle through which a running procedure reaches partitions

use super::PartitionExecutor;
use crate::counters::Counter;
use crate::procedure::{ProcedureResult, WorkUnit};
use spectra_concurrency::Transaction;
use spectra_core::{ParameterSet, PartitionId, SpectraError, Status, TxnId, Value};
use std::sync::Arc;
use tracing::debug;

/// Execution context handed to [`crate::ProcedureHandler::run`]
///
/// Work units run synchronously: a local unit is applied to the base
/// partition's store, a remote one is shipped to the owning executor and the
/// call blocks until its result arrives. Touching a partition outside the
/// transaction's predicted set, or one it was already declared done with,
/// fails with [`SpectraError::Mispredict`].
pub struct ExecutionContext<'a> {
    exec: &'a mut PartitionExecutor,
    txn: Arc<Transaction>,
    speculative: bool,
}

impl<'a> ExecutionContext<'a> {
    pub(super) fn new(exec: &'a mut PartitionExecutor, txn: Arc<Transaction>, speculative: bool) -> Self {
        Self {
            exec,
            txn,
            speculative,
        }
    }

    /// Id of the running transaction
    pub fn txn_id(&self) -> TxnId {
        self.txn.id()
    }

    /// Procedure name
    pub fn procedure(&self) -> &str {
        self.txn.procedure()
    }

    /// Invocation parameters
    pub fn params(&self) -> &ParameterSet {
        self.txn.params()
    }

    /// Parameter `index`
    pub fn param(&self, index: usize) -> Option<&Value> {
        self.txn.params().get(index)
    }

    /// Partition the handler runs at
    pub fn base_partition(&self) -> PartitionId {
        self.txn.base_partition()
    }

    /// Partitions served by the site
    pub fn num_partitions(&self) -> u32 {
        self.exec.site.config.partitions
    }

    /// Partition owning `value`
    pub fn partition_for(&self, value: &Value) -> PartitionId {
        value.partition(self.num_partitions())
    }

    /// Whether this run is speculative
    pub fn is_speculative(&self) -> bool {
        self.speculative
    }

    /// Restarts before this incarnation
    pub fn restart_counter(&self) -> u32 {
        self.txn.restart_counter()
    }

    /// Run `unit` at the base partition
    pub fn execute_local(&mut self, unit: WorkUnit) -> ProcedureResult {
        let base = self.base_partition();
        self.execute(base, unit)
    }

    /// Run `unit` at `partition`
    pub fn execute(&mut self, partition: PartitionId, unit: WorkUnit) -> ProcedureResult {
        let txn = Arc::clone(&self.txn);
        let count = self.num_partitions();
        if partition.as_u32() >= count {
            return Err(SpectraError::InvalidPartition { partition, count }.into());
        }
        if txn.abort_requested() {
            return Err(SpectraError::aborted(txn.id(), Status::AbortGraceful, "abort requested").into());
        }
        if !txn.predicted_partitions().contains(partition) || txn.is_done_at(partition) {
            self.exec.site.counters.inc(Counter::Mispredicted);
            debug!(
                target: "spectra::exec",
                txn_id = %txn.id(),
                partition = %partition,
                statement = %unit.statement,
                "Mispredicted partition"
            );
            return Err(SpectraError::Mispredict {
                txn: txn.id(),
                partition,
            }
            .into());
        }

        txn.push_trace(unit.statement.clone(), partition);
        let values = if partition == self.exec.partition() {
            self.exec.apply_unit(&txn, &unit)?
        } else {
            self.exec.execute_remote(&txn, partition, unit)?
        };
        if !self.speculative {
            self.exec.update_done_partitions(&txn);
        }
        Ok(values)
    }
}

impl std::fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("txn", &self.txn.id())
            .field("partition", &self.exec.partition())
            .field("speculative", &self.speculative)
            .finish()
    }
}
