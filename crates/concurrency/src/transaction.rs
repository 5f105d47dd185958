//! Shared transaction state
//!
//! A [`Transaction`] is created at admission and shared through `Arc` by
//! every partition executor it touches, the lock queues it waits in and the
//! site. Immutable admission data lives in plain fields; everything the
//! protocol mutates sits behind one mutex.
//!
//! ## Lifecycle
//!
//! ```text
//! admit ──► queued at every predicted partition
//!        ──► lock granted per partition (granted set grows)
//!        ──► executes work units (trace + observed access grow)
//!        ──► partitions released early (done set grows, monotonic)
//!        ──► prepared per partition (prepared set grows, at most once each)
//!        ──► finished: committed or aborted everywhere
//! ```
//!
//! `reset_for_restart` is the only operation that shrinks the protocol sets.

use crate::response::{ClientResponse, ResponseDebug, ResponseHandle};
use parking_lot::Mutex;
use spectra_core::{
    AccessSet, ParameterSet, PartitionAccess, PartitionId, PartitionSet, SpeculationType, Status,
    TxnId, Value,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Admission-time flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnFlags {
    /// Issued by the system rather than a client procedure
    pub system: bool,
    /// Declared read-only
    pub read_only: bool,
    /// Attach debug details to the client response
    pub client_debug: bool,
}

/// One executed (or dispatched) unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Statement label of the work unit
    pub statement: String,
    /// Partition it ran at
    pub partition: PartitionId,
}

/// Everything needed to create a [`Transaction`] except its id
#[derive(Debug, Clone)]
pub struct TransactionSpec {
    /// Procedure name
    pub procedure: String,
    /// Procedure parameters
    pub params: ParameterSet,
    /// Partition the procedure runs at
    pub base_partition: PartitionId,
    /// Partitions the transaction is predicted to touch (includes the base)
    pub partitions: PartitionSet,
    /// Declared read/write set, if known
    pub declared: Option<AccessSet>,
    /// Admission flags
    pub flags: TxnFlags,
    /// Restarts so far, speculative re-queues included
    pub restart_counter: u32,
    /// Re-queues after a speculative holder aborted
    pub requeues: u32,
    /// Whether Early 2PC may be applied to this incarnation
    pub early_prepare: bool,
    /// Where the client waits for the outcome
    pub responder: ResponseHandle,
}

impl TransactionSpec {
    /// Spec for a procedure call at `base_partition`, predicted single-partition
    pub fn new(procedure: impl Into<String>, params: ParameterSet, base_partition: PartitionId) -> Self {
        Self {
            procedure: procedure.into(),
            params,
            base_partition,
            partitions: PartitionSet::single(base_partition),
            declared: None,
            flags: TxnFlags::default(),
            restart_counter: 0,
            requeues: 0,
            early_prepare: true,
            responder: ResponseHandle::new(),
        }
    }

    /// Replace the predicted partition set; the base is always included
    pub fn partitions(mut self, partitions: PartitionSet) -> Self {
        let mut partitions = partitions;
        partitions.insert(self.base_partition);
        self.partitions = partitions;
        self
    }

    /// Attach a declared read/write set
    pub fn declared(mut self, declared: AccessSet) -> Self {
        self.declared = Some(declared);
        self
    }

    /// Set admission flags
    pub fn flags(mut self, flags: TxnFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[derive(Debug, Default)]
struct TxnState {
    done: PartitionSet,
    granted: PartitionSet,
    prepared: PartitionSet,
    touched: PartitionSet,
    observed: AccessSet,
    trace: Vec<TraceEntry>,
    in_flight: BTreeMap<PartitionId, usize>,
    speculation: Option<SpeculationType>,
}

/// A distributed or single-partition transaction
pub struct Transaction {
    id: TxnId,
    procedure: String,
    params: ParameterSet,
    base_partition: PartitionId,
    partitions: PartitionSet,
    declared: Option<AccessSet>,
    flags: TxnFlags,
    early_prepare: bool,
    responder: ResponseHandle,
    restart_counter: AtomicU32,
    requeues: AtomicU32,
    abort_requested: AtomicBool,
    state: Mutex<TxnState>,
}

impl Transaction {
    /// Create a transaction from its admission spec
    pub fn new(id: TxnId, spec: TransactionSpec) -> Self {
        let mut partitions = spec.partitions;
        partitions.insert(spec.base_partition);
        Self {
            id,
            procedure: spec.procedure,
            params: spec.params,
            base_partition: spec.base_partition,
            partitions,
            declared: spec.declared,
            flags: spec.flags,
            early_prepare: spec.early_prepare,
            responder: spec.responder,
            restart_counter: AtomicU32::new(spec.restart_counter),
            requeues: AtomicU32::new(spec.requeues),
            abort_requested: AtomicBool::new(false),
            state: Mutex::new(TxnState::default()),
        }
    }

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Procedure name
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Procedure parameters
    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    /// Partition the procedure runs at
    pub fn base_partition(&self) -> PartitionId {
        self.base_partition
    }

    /// Predicted partitions, base included
    pub fn predicted_partitions(&self) -> &PartitionSet {
        &self.partitions
    }

    /// Declared read/write set
    pub fn declared_access(&self) -> Option<&AccessSet> {
        self.declared.as_ref()
    }

    /// Admission flags
    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    /// Whether the system issued this transaction
    pub fn is_system(&self) -> bool {
        self.flags.system
    }

    /// Whether the transaction was declared read-only
    pub fn is_read_only(&self) -> bool {
        self.flags.read_only
    }

    /// Whether Early 2PC may be applied
    pub fn early_prepare_enabled(&self) -> bool {
        self.early_prepare
    }

    /// Response slot of the client
    pub fn responder(&self) -> &ResponseHandle {
        &self.responder
    }

    /// Predicted to run at its base partition only
    pub fn is_single_partition(&self) -> bool {
        self.partitions.len() == 1
    }

    /// Predicted to span more than one partition
    pub fn is_distributed(&self) -> bool {
        !self.is_single_partition()
    }

    /// Restarts so far, speculative re-queues included
    pub fn restart_counter(&self) -> u32 {
        self.restart_counter.load(Ordering::Acquire)
    }

    /// Re-queues caused by an aborted speculative holder
    pub fn requeue_count(&self) -> u32 {
        self.requeues.load(Ordering::Acquire)
    }

    /// Restarts caused by this transaction's own failures
    ///
    /// This is the count bounded by the site's restart limit.
    pub fn own_restarts(&self) -> u32 {
        self.restart_counter().saturating_sub(self.requeue_count())
    }

    /// Spec for the next incarnation after a restart
    ///
    /// The new incarnation gets a fresh id from the queue manager and shares
    /// the client's response slot.
    pub fn restart_spec(&self, partitions: PartitionSet, early_prepare: bool) -> TransactionSpec {
        TransactionSpec {
            procedure: self.procedure.clone(),
            params: self.params.clone(),
            base_partition: self.base_partition,
            partitions,
            declared: self.declared.clone(),
            flags: self.flags,
            restart_counter: self.restart_counter() + 1,
            requeues: self.requeue_count(),
            early_prepare,
            responder: self.responder.clone(),
        }
    }

    /// Clear all protocol state and count one re-queue
    ///
    /// Used when a speculative transaction is rolled back and re-queued under
    /// its original id. A pending client abort survives the reset.
    pub fn reset_for_restart(&self) {
        let mut state = self.state.lock();
        *state = TxnState::default();
        self.requeues.fetch_add(1, Ordering::AcqRel);
        self.restart_counter.fetch_add(1, Ordering::AcqRel);
    }

    // ========================================================================
    // Done partitions (Early 2PC)
    // ========================================================================

    /// Partitions this transaction has been declared done with
    pub fn done_partitions(&self) -> PartitionSet {
        self.state.lock().done.clone()
    }

    /// Whether `partition` has been declared done
    pub fn is_done_at(&self, partition: PartitionId) -> bool {
        self.state.lock().done.contains(partition)
    }

    /// Declare `partition` done. Returns `false` if it already was.
    pub fn mark_done(&self, partition: PartitionId) -> bool {
        self.state.lock().done.insert(partition)
    }

    // ========================================================================
    // Lock grants
    // ========================================================================

    /// Record that `partition` granted its lock. Returns `false` on repeats.
    pub fn grant_lock(&self, partition: PartitionId) -> bool {
        self.state.lock().granted.insert(partition)
    }

    /// Partitions that granted their lock
    pub fn granted_partitions(&self) -> PartitionSet {
        self.state.lock().granted.clone()
    }

    /// Whether `partition` granted its lock
    pub fn is_granted_at(&self, partition: PartitionId) -> bool {
        self.state.lock().granted.contains(partition)
    }

    /// Whether every predicted partition granted its lock
    pub fn all_locks_granted(&self) -> bool {
        self.partitions.is_subset(&self.state.lock().granted)
    }

    // ========================================================================
    // Prepare acknowledgments
    // ========================================================================

    /// Record the prepare of `partition`. Returns `false` if it already prepared.
    ///
    /// Callers send the acknowledgment only on `true`, which bounds
    /// acknowledgments to one per (transaction, partition).
    pub fn mark_prepared(&self, partition: PartitionId) -> bool {
        self.state.lock().prepared.insert(partition)
    }

    /// Whether `partition` prepared
    pub fn is_prepared_at(&self, partition: PartitionId) -> bool {
        self.state.lock().prepared.contains(partition)
    }

    /// Partitions that prepared
    pub fn prepared_partitions(&self) -> PartitionSet {
        self.state.lock().prepared.clone()
    }

    // ========================================================================
    // Outstanding requests
    // ========================================================================

    /// Count a request dispatched to `partition`
    pub fn begin_request(&self, partition: PartitionId) {
        *self.state.lock().in_flight.entry(partition).or_insert(0) += 1;
    }

    /// Count a response received from `partition`
    pub fn finish_request(&self, partition: PartitionId) {
        let mut state = self.state.lock();
        if let Some(count) = state.in_flight.get_mut(&partition) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.in_flight.remove(&partition);
            }
        }
    }

    /// Requests to `partition` still awaiting a response
    pub fn in_flight(&self, partition: PartitionId) -> usize {
        self.state.lock().in_flight.get(&partition).copied().unwrap_or(0)
    }

    // ========================================================================
    // Execution trace and observed access
    // ========================================================================

    /// Append one work unit to the execution trace
    pub fn push_trace(&self, statement: impl Into<String>, partition: PartitionId) {
        let mut state = self.state.lock();
        state.touched.insert(partition);
        state.trace.push(TraceEntry {
            statement: statement.into(),
            partition,
        });
    }

    /// Work units dispatched so far
    pub fn trace_len(&self) -> usize {
        self.state.lock().trace.len()
    }

    /// Copy of the execution trace
    pub fn trace(&self) -> Vec<TraceEntry> {
        self.state.lock().trace.clone()
    }

    /// Partitions where work was dispatched
    pub fn touched_partitions(&self) -> PartitionSet {
        self.state.lock().touched.clone()
    }

    /// Record a key read at `partition`
    pub fn record_read(&self, partition: PartitionId, key: &str) {
        self.state.lock().observed.record_read(partition, key);
    }

    /// Record a key write at `partition`
    pub fn record_write(&self, partition: PartitionId, key: &str) {
        self.state.lock().observed.record_write(partition, key);
    }

    /// Observed access at `partition`
    pub fn observed_at(&self, partition: PartitionId) -> Option<PartitionAccess> {
        self.state.lock().observed.at(partition).cloned()
    }

    /// Copy of the observed access set
    pub fn observed_access(&self) -> AccessSet {
        self.state.lock().observed.clone()
    }

    // ========================================================================
    // Speculation and abort
    // ========================================================================

    /// Mark the stall point this transaction runs speculatively under
    pub fn set_speculation(&self, speculation: Option<SpeculationType>) {
        self.state.lock().speculation = speculation;
    }

    /// Stall point this transaction ran speculatively under
    pub fn speculation(&self) -> Option<SpeculationType> {
        self.state.lock().speculation
    }

    /// Whether this transaction ran speculatively
    pub fn is_speculative(&self) -> bool {
        self.speculation().is_some()
    }

    /// Ask the transaction to abort. Returns `false` if already requested.
    pub fn request_abort(&self) -> bool {
        !self.abort_requested.swap(true, Ordering::AcqRel)
    }

    /// Whether an abort was requested
    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    // ========================================================================
    // Responses
    // ========================================================================

    /// Build the client response for this incarnation
    pub fn build_response(
        &self,
        status: Status,
        results: Vec<Value>,
        status_message: Option<String>,
        with_debug: bool,
    ) -> ClientResponse {
        let state = self.state.lock();
        let debug = if with_debug || self.flags.client_debug {
            Some(ResponseDebug {
                predicted_partitions: self.partitions.clone(),
                touched_partitions: state.touched.clone(),
                done_partitions: state.done.clone(),
                speculation: state.speculation,
            })
        } else {
            None
        };
        ClientResponse {
            txn_id: self.id,
            status,
            results,
            status_message,
            single_partition: self.is_single_partition(),
            speculative: state.speculation.is_some(),
            restart_counter: self.restart_counter(),
            base_partition: self.base_partition,
            debug,
        }
    }

    /// Deliver a response to the client. Returns `false` if one was already sent.
    pub fn respond(&self, response: ClientResponse) -> bool {
        self.responder.complete(response)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("procedure", &self.procedure)
            .field("base_partition", &self.base_partition)
            .field("partitions", &self.partitions)
            .field("restart_counter", &self.restart_counter())
            .finish()
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.procedure, self.id)
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}
