//! Read-only introspection of a running partition executor
//!
//! Operators and tests observe executors through [`ExecutorDebug`]. The
//! `wait_for_*` methods block on the executor's status condition variable
//! with a bounded timeout instead of polling.

use super::ExecutorShared;
use crate::specexec::SpecExecScheduler;
use crate::store::PartitionStore;
use parking_lot::MutexGuard;
use spectra_concurrency::Transaction;
use spectra_core::{PartitionId, SpeculationType, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of a partition executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorState {
    /// Nothing holds the partition
    Idle,
    /// Running a transaction's work exclusively
    RunningExclusive,
    /// Held by a distributed transaction and waiting on another partition
    BlockedRemote,
    /// Running queued work speculatively while blocked
    Speculating,
    /// Rolling back exclusive and speculative work
    Aborting,
    /// Stopped after a fatal error
    Failed,
}

impl ExecutorState {
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorState::Idle => "IDLE",
            ExecutorState::RunningExclusive => "RUNNING_EXCLUSIVE",
            ExecutorState::BlockedRemote => "BLOCKED_REMOTE",
            ExecutorState::Speculating => "SPECULATING",
            ExecutorState::Aborting => "ABORTING",
            ExecutorState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Observable status, guarded by the executor's status mutex
#[derive(Debug)]
pub(crate) struct ExecutorStatus {
    pub(crate) state: ExecutorState,
    pub(crate) stall: SpeculationType,
    pub(crate) current_dtxn: Option<Arc<Transaction>>,
    pub(crate) current_procedure: Option<String>,
    pub(crate) speculative_finished: u64,
    pub(crate) since: Instant,
}

impl ExecutorStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: ExecutorState::Idle,
            stall: SpeculationType::Idle,
            current_dtxn: None,
            current_procedure: None,
            speculative_finished: 0,
            since: Instant::now(),
        }
    }
}

/// Executor profile snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileSnapshot {
    /// Time spent idle (profiling only)
    pub idle: Duration,
    /// Time spent running exclusive work (profiling only)
    pub exclusive: Duration,
    /// Time spent blocked on remote partitions (profiling only)
    pub blocked: Duration,
    /// Time spent speculating (profiling only)
    pub speculating: Duration,
    /// Times the executor entered `BlockedRemote`
    pub blocked_remote_entries: u64,
    /// Transactions run speculatively
    pub speculative_runs: u64,
    /// Work units applied to the partition store
    pub work_units: u64,
}

/// Per-executor timers and event counts
///
/// Event counts are always kept; state timers only when profiling is on.
#[derive(Debug)]
pub(crate) struct ExecutorProfile {
    enabled: bool,
    state_ns: [AtomicU64; 6],
    pub(crate) blocked_remote_entries: AtomicU64,
    pub(crate) speculative_runs: AtomicU64,
    pub(crate) work_units: AtomicU64,
}

impl ExecutorProfile {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state_ns: std::array::from_fn(|_| AtomicU64::new(0)),
            blocked_remote_entries: AtomicU64::new(0),
            speculative_runs: AtomicU64::new(0),
            work_units: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_state(&self, state: ExecutorState, elapsed: Duration) {
        if self.enabled {
            self.state_ns[state.index()].fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> ProfileSnapshot {
        let ns = |s: ExecutorState| Duration::from_nanos(self.state_ns[s.index()].load(Ordering::Relaxed));
        ProfileSnapshot {
            idle: ns(ExecutorState::Idle),
            exclusive: ns(ExecutorState::RunningExclusive),
            blocked: ns(ExecutorState::BlockedRemote),
            speculating: ns(ExecutorState::Speculating),
            blocked_remote_entries: self.blocked_remote_entries.load(Ordering::Relaxed),
            speculative_runs: self.speculative_runs.load(Ordering::Relaxed),
            work_units: self.work_units.load(Ordering::Relaxed),
        }
    }
}

/// Debug handle of one partition executor
#[derive(Clone)]
pub struct ExecutorDebug {
    shared: Arc<ExecutorShared>,
}

impl ExecutorDebug {
    pub(crate) fn new(shared: Arc<ExecutorShared>) -> Self {
        Self { shared }
    }

    /// Partition served
    pub fn partition(&self) -> PartitionId {
        self.shared.partition
    }

    /// Distributed transaction currently holding the partition
    pub fn current_dtxn(&self) -> Option<Arc<Transaction>> {
        self.shared.status.lock().current_dtxn.clone()
    }

    /// Wait until some distributed transaction holds the partition
    pub fn wait_for_current_dtxn(&self, timeout: Duration) -> Option<Arc<Transaction>> {
        self.wait_until(timeout, |s| s.current_dtxn.is_some())
            .current_dtxn
            .clone()
    }

    /// Name of the procedure whose handler is running here
    pub fn current_procedure(&self) -> Option<String> {
        self.shared.status.lock().current_procedure.clone()
    }

    /// Wait until the handler of `procedure` is running here
    pub fn wait_for_procedure(&self, procedure: &str, timeout: Duration) -> bool {
        let status = self.wait_until(timeout, |s| s.current_procedure.as_deref() == Some(procedure));
        status.current_procedure.as_deref() == Some(procedure)
    }

    /// Current executor state
    pub fn state(&self) -> ExecutorState {
        self.shared.status.lock().state
    }

    /// Wait until the executor reaches `state`
    pub fn wait_for_state(&self, state: ExecutorState, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.state == state).state == state
    }

    /// Stall point the partition is parked at
    pub fn stall_point(&self) -> SpeculationType {
        self.shared.status.lock().stall
    }

    /// Wait until the partition is parked at `stall`
    pub fn wait_for_stall_point(&self, stall: SpeculationType, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.stall == stall).stall == stall
    }

    /// Wait until `count` speculative runs have returned from their handlers
    pub fn wait_for_speculative_runs(&self, count: u64, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.speculative_finished >= count)
            .speculative_finished
            >= count
    }

    /// Entries in the partition's lock queue
    pub fn lock_queue_size(&self) -> usize {
        self.shared.queue.size()
    }

    /// Speculative scheduler, e.g. to swap its conflict checker
    pub fn spec_scheduler(&self) -> &SpecExecScheduler {
        &self.shared.scheduler
    }

    /// Timers and event counts
    pub fn profile(&self) -> ProfileSnapshot {
        self.shared.profile.snapshot()
    }

    /// Times the executor entered `BlockedRemote`
    pub fn blocked_remote_entries(&self) -> u64 {
        self.shared.profile.blocked_remote_entries.load(Ordering::Relaxed)
    }

    /// Value of `key` in the partition store, committed or not
    pub fn read_key(&self, key: &str) -> Option<Value> {
        self.shared.store.lock().get(key).cloned()
    }

    /// Run `f` against the partition store
    pub fn with_store<R>(&self, f: impl FnOnce(&PartitionStore) -> R) -> R {
        f(&self.shared.store.lock())
    }

    /// Fatal error that stopped the executor, if any
    pub fn failure(&self) -> Option<String> {
        self.shared.fatal.lock().as_ref().map(|e| e.to_string())
    }

    fn wait_until<F>(&self, timeout: Duration, mut done: F) -> MutexGuard<'_, ExecutorStatus>
    where
        F: FnMut(&ExecutorStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while !done(&status) {
            if self
                .shared
                .status_changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }
        status
    }
}

impl fmt::Debug for ExecutorDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.shared.status.lock();
        f.debug_struct("ExecutorDebug")
            .field("partition", &self.shared.partition)
            .field("state", &status.state)
            .field("stall", &status.stall)
            .field("current_dtxn", &status.current_dtxn.as_ref().map(|t| t.id()))
            .field("current_procedure", &status.current_procedure)
            .finish()
    }
}
