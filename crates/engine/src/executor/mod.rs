//! Partition executors
//!
//! One worker thread per partition owns that partition's store and drains
//! its lock queue in transaction-id order. A distributed transaction holds
//! every partition it predicted until the commit or abort decision. While it
//! is blocked, the worker may run queued single-partition transactions
//! speculatively and buffers their responses until the holder finishes.
//!
//! Workers only talk through [`ExecutorMessage`]s placed in each other's
//! inboxes. Every send also signals the receiver's lock-queue notifier, so a
//! worker sleeps on a single primitive.

mod context;
mod debug;
mod messages;

pub use context::ExecutionContext;
pub use debug::{ExecutorDebug, ExecutorState, ProfileSnapshot};
pub use messages::{ExecutorMessage, WorkOutcome};

use crate::counters::Counter;
use crate::procedure::{ProcedureError, ProcedureResult, WorkUnit};
use crate::site::SiteRuntime;
use crate::specexec::SpecExecScheduler;
use crate::store::PartitionStore;
use debug::{ExecutorProfile, ExecutorStatus};
use parking_lot::{Condvar, Mutex};
use spectra_concurrency::{PartitionLockQueue, Transaction};
use spectra_core::{PartitionId, SpectraError, SpectraResult, SpeculationType, Status, TxnId, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, trace};

// ============================================================================
// Shared executor state
// ============================================================================

/// State of one executor visible to other threads
pub(crate) struct ExecutorShared {
    pub(crate) partition: PartitionId,
    pub(crate) queue: Arc<PartitionLockQueue>,
    pub(crate) scheduler: SpecExecScheduler,
    pub(crate) store: Mutex<PartitionStore>,
    pub(crate) status: Mutex<ExecutorStatus>,
    pub(crate) status_changed: Condvar,
    pub(crate) profile: ExecutorProfile,
    pub(crate) fatal: Mutex<Option<SpectraError>>,
    inbox: Mutex<VecDeque<ExecutorMessage>>,
    stop: AtomicBool,
}

impl ExecutorShared {
    pub(crate) fn new(
        queue: Arc<PartitionLockQueue>,
        scheduler: SpecExecScheduler,
        store: PartitionStore,
        profiling: bool,
    ) -> Self {
        Self {
            partition: queue.partition(),
            queue,
            scheduler,
            store: Mutex::new(store),
            status: Mutex::new(ExecutorStatus::new()),
            status_changed: Condvar::new(),
            profile: ExecutorProfile::new(profiling),
            fatal: Mutex::new(None),
            inbox: Mutex::new(VecDeque::new()),
            stop: AtomicBool::new(false),
        }
    }

    /// Deliver `msg` and wake the worker
    pub(crate) fn send(&self, msg: ExecutorMessage) {
        trace!(target: "spectra::exec", partition = %self.partition, msg = ?msg, "Message queued");
        self.inbox.lock().push_back(msg);
        self.queue.notifier().notify();
    }

    fn pop_message(&self) -> Option<ExecutorMessage> {
        self.inbox.lock().pop_front()
    }

    fn has_messages(&self) -> bool {
        !self.inbox.lock().is_empty()
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.queue.notifier().notify();
    }

    fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn update_status(&self, f: impl FnOnce(&mut ExecutorStatus)) {
        let mut status = self.status.lock();
        let before = status.state;
        f(&mut status);
        if status.state != before {
            let now = Instant::now();
            self.profile.record_state(before, now.duration_since(status.since));
            status.since = now;
            if status.state == ExecutorState::BlockedRemote {
                self.profile
                    .blocked_remote_entries
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(status);
        self.status_changed.notify_all();
    }

    fn set_state(&self, state: ExecutorState, stall: SpeculationType) {
        self.update_status(|s| {
            s.state = state;
            s.stall = stall;
        });
    }

    /// Keep the first fatal error; later ones are consequences of it
    fn record_fatal(&self, err: SpectraError) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            error!(target: "spectra::exec", partition = %self.partition, error = %err, "Executor failed");
            *slot = Some(err);
        }
    }

    fn has_failed(&self) -> bool {
        self.fatal.lock().is_some()
    }

    pub(crate) fn take_fatal(&self) -> Option<SpectraError> {
        self.fatal.lock().take()
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Base,
    Remote,
}

/// Distributed transaction holding this partition
struct Held {
    txn: Arc<Transaction>,
    role: Role,
    since: Instant,
}

/// Speculatively executed transaction awaiting its holder's outcome
struct SpeculativeRun {
    txn: Arc<Transaction>,
    outcome: Result<Vec<Value>, SpectraError>,
}

/// Whether a failed transaction may run again under a new id
pub(crate) fn is_restartable(err: &SpectraError) -> bool {
    matches!(
        err,
        SpectraError::Mispredict { .. } | SpectraError::RemoteTimeout { .. }
    )
}

fn into_engine_error(txn: &Transaction, err: ProcedureError) -> SpectraError {
    match err {
        ProcedureError::UserAbort(reason) => SpectraError::aborted(txn.id(), Status::AbortUser, reason),
        ProcedureError::Engine(e) => e,
    }
}

/// Start the worker thread of `shared`
pub(crate) fn spawn(shared: Arc<ExecutorShared>, site: Arc<SiteRuntime>) -> SpectraResult<JoinHandle<()>> {
    let name = format!("spectra-p{}", shared.partition.as_u32());
    let worker = PartitionExecutor {
        shared,
        site,
        held: None,
        speculative: Vec::new(),
        stash: VecDeque::new(),
        next_seq: 0,
    };
    let handle = std::thread::Builder::new().name(name).spawn(move || worker.run())?;
    Ok(handle)
}

/// Worker loop of one partition
pub(crate) struct PartitionExecutor {
    shared: Arc<ExecutorShared>,
    site: Arc<SiteRuntime>,
    held: Option<Held>,
    speculative: Vec<SpeculativeRun>,
    /// Messages pulled while blocked, handled once the wait ends
    stash: VecDeque<ExecutorMessage>,
    next_seq: u64,
}

impl PartitionExecutor {
    fn partition(&self) -> PartitionId {
        self.shared.partition
    }

    fn holds(&self, txn_id: TxnId, role: Role) -> bool {
        self.held
            .as_ref()
            .is_some_and(|h| h.txn.id() == txn_id && h.role == role)
    }

    fn run(mut self) {
        let partition = self.partition();
        info!(target: "spectra::exec", partition = %partition, "Executor started");
        if let Err(e) = self.run_loop() {
            self.shared.record_fatal(e);
            self.shared.update_status(|s| s.state = ExecutorState::Failed);
        }
        self.drain_on_exit();
        info!(target: "spectra::exec", partition = %partition, "Executor stopped");
    }

    fn run_loop(&mut self) -> SpectraResult<()> {
        let poll = self.site.config.poll_interval();
        while !self.shared.is_stopping() {
            self.process_messages()?;
            self.check_failed()?;
            if self.held.is_none() {
                if let Some(txn) = self.shared.queue.poll() {
                    self.start(txn)?;
                    continue;
                }
            } else {
                self.while_held()?;
            }
            if !self.shared.has_messages() {
                self.shared.queue.notifier().wait(poll);
            }
        }
        Ok(())
    }

    fn check_failed(&self) -> SpectraResult<()> {
        if self.shared.has_failed() {
            return Err(SpectraError::ExecutorStopped(self.partition()));
        }
        Ok(())
    }

    fn process_messages(&mut self) -> SpectraResult<()> {
        let stashed = std::mem::take(&mut self.stash);
        for msg in stashed {
            self.handle_message(msg)?;
        }
        while let Some(msg) = self.shared.pop_message() {
            self.handle_message(msg)?;
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: ExecutorMessage) -> SpectraResult<()> {
        trace!(target: "spectra::exec", partition = %self.partition(), msg = ?msg, "Handling message");
        match msg {
            ExecutorMessage::LockGranted { txn_id, .. } => {
                if self.holds(txn_id, Role::Base) {
                    self.try_start_base()?;
                }
            }
            ExecutorMessage::Work { txn, seq, unit } => self.handle_work(txn, seq, unit)?,
            ExecutorMessage::Prepare { txn, early } => self.handle_prepare(&txn, early),
            ExecutorMessage::Finish { txn, commit } => self.handle_finish(&txn, commit),
            ExecutorMessage::Abort { txn_id } => self.handle_abort_request(txn_id),
            // replies outside a wait belong to a finished incarnation
            ExecutorMessage::WorkResult { .. } | ExecutorMessage::PrepareAck { .. } => {}
        }
        Ok(())
    }

    // ========================================================================
    // Dequeue
    // ========================================================================

    fn start(&mut self, txn: Arc<Transaction>) -> SpectraResult<()> {
        if txn.is_single_partition() {
            return self.run_single(txn);
        }
        let partition = self.partition();
        txn.grant_lock(partition);
        let (role, stall) = if txn.base_partition() == partition {
            (Role::Base, SpeculationType::Sp1Local)
        } else {
            (Role::Remote, SpeculationType::Sp2RemoteBefore)
        };
        debug!(
            target: "spectra::exec",
            partition = %partition,
            txn_id = %txn.id(),
            role = ?role,
            "Lock granted"
        );
        self.held = Some(Held {
            txn: Arc::clone(&txn),
            role,
            since: Instant::now(),
        });
        self.shared.update_status(|s| {
            s.state = ExecutorState::BlockedRemote;
            s.stall = stall;
            s.current_dtxn = Some(Arc::clone(&txn));
        });
        match role {
            Role::Base => self.try_start_base(),
            Role::Remote => {
                self.site.send(
                    txn.base_partition(),
                    ExecutorMessage::LockGranted {
                        txn_id: txn.id(),
                        partition,
                    },
                );
                Ok(())
            }
        }
    }

    fn run_single(&mut self, txn: Arc<Transaction>) -> SpectraResult<()> {
        if txn.abort_requested() {
            self.site
                .respond(&txn, Status::AbortGraceful, Vec::new(), Some("abort requested".to_string()));
            return Ok(());
        }
        self.site.counters.inc(Counter::Executed);
        self.site.counters.inc(Counter::SinglePartition);
        self.shared.update_status(|s| {
            s.state = ExecutorState::RunningExclusive;
            s.current_procedure = Some(txn.procedure().to_string());
        });
        let outcome = self.invoke(&txn, false);
        self.shared.update_status(|s| {
            s.state = ExecutorState::Idle;
            s.current_procedure = None;
        });
        match outcome {
            Ok(results) => {
                self.shared.store.lock().commit(txn.id());
                self.site.respond(&txn, Status::Ok, results, None);
            }
            Err(e) => {
                self.shared.store.lock().rollback(txn.id());
                let err = into_engine_error(&txn, e);
                self.site.abort_or_restart(&txn, &err);
            }
        }
        self.check_failed()
    }

    fn invoke(&mut self, txn: &Arc<Transaction>, speculative: bool) -> ProcedureResult {
        let handler = self
            .site
            .procedure(txn.procedure())
            .ok_or_else(|| SpectraError::UnknownProcedure(txn.procedure().to_string()))?;
        let mut ctx = ExecutionContext::new(self, Arc::clone(txn), speculative);
        handler.run(&mut ctx)
    }

    // ========================================================================
    // Base partition
    // ========================================================================

    fn try_start_base(&mut self) -> SpectraResult<()> {
        let Some(txn) = self
            .held
            .as_ref()
            .filter(|h| h.role == Role::Base)
            .map(|h| Arc::clone(&h.txn))
        else {
            return Ok(());
        };
        if txn.abort_requested() {
            self.abort_dtxn(&txn, SpectraError::aborted(txn.id(), Status::AbortGraceful, "abort requested"));
            return Ok(());
        }
        if txn.all_locks_granted() {
            return self.run_base(txn);
        }
        Ok(())
    }

    fn run_base(&mut self, txn: Arc<Transaction>) -> SpectraResult<()> {
        self.site.counters.inc(Counter::Executed);
        self.site.counters.inc(Counter::MultiPartition);
        self.shared.update_status(|s| {
            s.state = ExecutorState::RunningExclusive;
            s.stall = SpeculationType::Sp1Local;
            s.current_procedure = Some(txn.procedure().to_string());
        });
        debug!(
            target: "spectra::exec",
            partition = %self.partition(),
            txn_id = %txn.id(),
            partitions = %txn.predicted_partitions(),
            "Running distributed transaction"
        );
        let outcome = self.invoke(&txn, false);
        self.shared.update_status(|s| s.current_procedure = None);
        self.check_failed()?;
        match outcome {
            Ok(_) if txn.abort_requested() => {
                self.abort_dtxn(&txn, SpectraError::aborted(txn.id(), Status::AbortGraceful, "abort requested"));
                Ok(())
            }
            Ok(results) => self.commit_dtxn(&txn, results),
            Err(e) => {
                self.abort_dtxn(&txn, into_engine_error(&txn, e));
                Ok(())
            }
        }
    }

    fn remotes(&self, txn: &Transaction) -> Vec<PartitionId> {
        let partition = self.partition();
        txn.predicted_partitions()
            .iter()
            .filter(|p| *p != partition)
            .collect()
    }

    fn commit_dtxn(&mut self, txn: &Arc<Transaction>, results: Vec<Value>) -> SpectraResult<()> {
        let remotes = self.remotes(txn);
        self.shared
            .set_state(ExecutorState::BlockedRemote, SpeculationType::Sp3Local);
        for &p in &remotes {
            // early-prepared partitions already got theirs
            if !txn.is_done_at(p) {
                self.site.send(
                    p,
                    ExecutorMessage::Prepare {
                        txn: Arc::clone(txn),
                        early: false,
                    },
                );
            }
        }
        match self.wait_for_prepared(txn, &remotes) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.abort_dtxn(txn, e);
                return Ok(());
            }
        }

        self.shared.store.lock().commit(txn.id());
        self.site.respond(txn, Status::Ok, results, None);
        for &p in &remotes {
            self.site.send(
                p,
                ExecutorMessage::Finish {
                    txn: Arc::clone(txn),
                    commit: true,
                },
            );
        }
        debug!(
            target: "spectra::2pc",
            partition = %self.partition(),
            txn_id = %txn.id(),
            early = %txn.done_partitions(),
            "Committed distributed transaction"
        );
        self.release_speculative(true);
        self.release_hold();
        Ok(())
    }

    /// Roll back a distributed transaction everywhere and answer or restart it
    fn abort_dtxn(&mut self, txn: &Arc<Transaction>, err: SpectraError) {
        self.shared.update_status(|s| s.state = ExecutorState::Aborting);
        let unqueued = self.site.queues.remove_everywhere(txn.id());
        for p in self.remotes(txn) {
            self.site.send(
                p,
                ExecutorMessage::Finish {
                    txn: Arc::clone(txn),
                    commit: false,
                },
            );
        }
        self.release_speculative(false);
        let reverted = self.shared.store.lock().rollback(txn.id());
        debug!(
            target: "spectra::2pc",
            partition = %self.partition(),
            txn_id = %txn.id(),
            status = %err.status(),
            unqueued,
            reverted,
            error = %err,
            "Aborted distributed transaction"
        );
        self.release_hold();
        self.site.abort_or_restart(txn, &err);
    }

    fn release_hold(&mut self) {
        self.held = None;
        self.shared.update_status(|s| {
            s.state = ExecutorState::Idle;
            s.stall = SpeculationType::Idle;
            s.current_dtxn = None;
            s.current_procedure = None;
        });
    }

    /// Run a work unit at a remote partition and wait for its result
    fn execute_remote(
        &mut self,
        txn: &Arc<Transaction>,
        partition: PartitionId,
        unit: WorkUnit,
    ) -> SpectraResult<Vec<Value>> {
        self.next_seq += 1;
        let seq = self.next_seq;
        txn.begin_request(partition);
        self.site.send(
            partition,
            ExecutorMessage::Work {
                txn: Arc::clone(txn),
                seq,
                unit,
            },
        );
        self.shared
            .set_state(ExecutorState::BlockedRemote, SpeculationType::Sp1Local);
        let outcome = self.wait_for_work(txn, partition, seq);
        txn.finish_request(partition);
        self.shared
            .set_state(ExecutorState::RunningExclusive, SpeculationType::Sp1Local);
        outcome?.map_err(|detail| SpectraError::InvalidOperation(format!("at {}: {}", partition, detail)))
    }

    /// Early 2PC: prepare every partition the estimator says `txn` is done with
    fn update_done_partitions(&self, txn: &Arc<Transaction>) {
        if !txn.early_prepare_enabled() {
            return;
        }
        let base = txn.base_partition();
        for partition in txn.predicted_partitions().iter() {
            if partition == base
                || !txn.is_granted_at(partition)
                || txn.is_done_at(partition)
                || txn.in_flight(partition) > 0
            {
                continue;
            }
            if !self.site.estimator.is_done_at_partition(txn, partition) {
                continue;
            }
            if txn.mark_done(partition) {
                self.site.counters.inc(Counter::EarlyPrepare);
                self.site.send(
                    partition,
                    ExecutorMessage::Prepare {
                        txn: Arc::clone(txn),
                        early: true,
                    },
                );
                debug!(
                    target: "spectra::2pc",
                    txn_id = %txn.id(),
                    partition = %partition,
                    trace_len = txn.trace_len(),
                    "Early prepare"
                );
            }
        }
    }

    // ========================================================================
    // Blocked waits
    // ========================================================================

    /// Pull messages while blocked; returns the result of request `seq` if it arrived
    fn drain_while_blocked(&mut self, txn_id: TxnId, seq: Option<u64>) -> Option<WorkOutcome> {
        while let Some(msg) = self.shared.pop_message() {
            match msg {
                ExecutorMessage::WorkResult {
                    txn_id: id,
                    seq: s,
                    outcome,
                    ..
                } if id == txn_id && Some(s) == seq => return Some(outcome),
                ExecutorMessage::WorkResult { .. } | ExecutorMessage::PrepareAck { .. } => {}
                other => self.stash.push_back(other),
            }
        }
        None
    }

    /// One round of a blocked wait: check stop, abort and deadline, then
    /// speculate at `stall` and sleep until woken
    fn blocked_round(
        &mut self,
        txn: &Arc<Transaction>,
        stall: SpeculationType,
        waiting_on: PartitionId,
        started: Instant,
    ) -> SpectraResult<()> {
        let partition = self.partition();
        if self.shared.is_stopping() || self.shared.has_failed() {
            return Err(SpectraError::ExecutorStopped(partition));
        }
        if txn.abort_requested() {
            return Err(SpectraError::aborted(txn.id(), Status::AbortGraceful, "abort requested"));
        }
        let timeout = self.site.config.remote_wait_timeout();
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(SpectraError::RemoteTimeout {
                txn: txn.id(),
                partition: waiting_on,
                waited_ms: waited.as_millis() as u64,
            });
        }
        if let Err(e) = self.speculate(stall) {
            self.shared.record_fatal(e);
            return Err(SpectraError::ExecutorStopped(partition));
        }
        if !self.shared.has_messages() {
            let nap = (timeout - waited).min(self.site.config.poll_interval());
            self.shared.queue.notifier().wait(nap);
        }
        Ok(())
    }

    fn wait_for_work(&mut self, txn: &Arc<Transaction>, partition: PartitionId, seq: u64) -> SpectraResult<WorkOutcome> {
        let started = Instant::now();
        loop {
            if let Some(outcome) = self.drain_while_blocked(txn.id(), Some(seq)) {
                return Ok(outcome);
            }
            self.blocked_round(txn, SpeculationType::Sp1Local, partition, started)?;
        }
    }

    fn wait_for_prepared(&mut self, txn: &Arc<Transaction>, remotes: &[PartitionId]) -> SpectraResult<()> {
        let started = Instant::now();
        loop {
            self.drain_while_blocked(txn.id(), None);
            match remotes.iter().find(|p| !txn.is_prepared_at(**p)) {
                None => return Ok(()),
                Some(&waiting_on) => self.blocked_round(txn, SpeculationType::Sp3Local, waiting_on, started)?,
            }
        }
    }

    fn while_held(&mut self) -> SpectraResult<()> {
        let Some((txn, role, since)) = self
            .held
            .as_ref()
            .map(|h| (Arc::clone(&h.txn), h.role, h.since))
        else {
            return Ok(());
        };
        if role == Role::Base {
            let waited = since.elapsed();
            if waited >= self.site.config.remote_wait_timeout() {
                let missing = txn
                    .predicted_partitions()
                    .iter()
                    .find(|p| !txn.is_granted_at(*p))
                    .unwrap_or(self.partition());
                let err = SpectraError::RemoteTimeout {
                    txn: txn.id(),
                    partition: missing,
                    waited_ms: waited.as_millis() as u64,
                };
                self.abort_dtxn(&txn, err);
                return Ok(());
            }
        }
        let stall = self.shared.status.lock().stall;
        self.speculate(stall)
    }

    // ========================================================================
    // Remote partition
    // ========================================================================

    fn handle_work(&mut self, txn: Arc<Transaction>, seq: u64, unit: WorkUnit) -> SpectraResult<()> {
        let partition = self.partition();
        if !self.holds(txn.id(), Role::Remote) {
            return Err(SpectraError::invariant(
                partition,
                format!("work for {} which does not hold the partition", txn),
            ));
        }
        if txn.is_prepared_at(partition) {
            return Err(SpectraError::invariant(
                partition,
                format!("work for {} after it prepared", txn),
            ));
        }
        self.shared
            .set_state(ExecutorState::RunningExclusive, SpeculationType::Sp2RemoteAfter);
        let outcome = self.apply_unit(&txn, &unit).map_err(|e| e.to_string());
        self.shared
            .set_state(ExecutorState::BlockedRemote, SpeculationType::Sp2RemoteAfter);
        self.site.send(
            txn.base_partition(),
            ExecutorMessage::WorkResult {
                txn_id: txn.id(),
                partition,
                seq,
                outcome,
            },
        );
        Ok(())
    }

    fn handle_prepare(&mut self, txn: &Arc<Transaction>, early: bool) {
        let partition = self.partition();
        if !self.holds(txn.id(), Role::Remote) {
            trace!(target: "spectra::2pc", partition = %partition, txn_id = %txn.id(), "Prepare for a transaction not holding the partition");
            return;
        }
        if txn.mark_prepared(partition) {
            self.shared
                .set_state(ExecutorState::BlockedRemote, SpeculationType::Sp3Remote);
            self.site.send(
                txn.base_partition(),
                ExecutorMessage::PrepareAck {
                    txn_id: txn.id(),
                    partition,
                },
            );
            debug!(target: "spectra::2pc", partition = %partition, txn_id = %txn.id(), early, "Prepared");
        }
    }

    fn handle_finish(&mut self, txn: &Arc<Transaction>, commit: bool) {
        if !self.holds(txn.id(), Role::Remote) {
            return;
        }
        if commit {
            self.shared.store.lock().commit(txn.id());
            self.release_speculative(true);
        } else {
            self.shared.update_status(|s| s.state = ExecutorState::Aborting);
            self.release_speculative(false);
            self.shared.store.lock().rollback(txn.id());
        }
        debug!(target: "spectra::2pc", partition = %self.partition(), txn_id = %txn.id(), commit, "Finished");
        self.release_hold();
    }

    fn handle_abort_request(&mut self, txn_id: TxnId) {
        if self.holds(txn_id, Role::Base) {
            if let Some(txn) = self.held.as_ref().map(|h| Arc::clone(&h.txn)) {
                self.abort_dtxn(&txn, SpectraError::aborted(txn_id, Status::AbortGraceful, "abort requested"));
            }
            return;
        }
        if let Some(txn) = self.shared.queue.remove(txn_id) {
            self.site.queues.remove_everywhere(txn_id);
            self.site.finish_elsewhere(&txn, self.partition());
            self.site
                .respond(&txn, Status::AbortGraceful, Vec::new(), Some("abort requested".to_string()));
        }
    }

    /// Apply `unit` to the local store on behalf of `txn`
    fn apply_unit(&mut self, txn: &Transaction, unit: &WorkUnit) -> SpectraResult<Vec<Value>> {
        let partition = self.partition();
        let applied = self.shared.store.lock().apply(txn.id(), unit)?;
        for key in &applied.access.reads {
            txn.record_read(partition, key);
        }
        for key in &applied.access.writes {
            txn.record_write(partition, key);
        }
        self.shared.profile.work_units.fetch_add(1, Ordering::Relaxed);
        Ok(applied.results)
    }

    // ========================================================================
    // Speculation
    // ========================================================================

    fn speculate(&mut self, stall: SpeculationType) -> SpectraResult<()> {
        let Some(holder) = self.held.as_ref().map(|h| Arc::clone(&h.txn)) else {
            return Ok(());
        };
        while !self.shared.has_messages() && !self.shared.is_stopping() {
            let Some(txn) = self
                .shared
                .scheduler
                .next(&self.shared.queue, &holder, stall)?
            else {
                break;
            };
            self.run_speculative(txn, stall);
        }
        Ok(())
    }

    fn run_speculative(&mut self, txn: Arc<Transaction>, stall: SpeculationType) {
        let (prev_state, prev_procedure) = {
            let status = self.shared.status.lock();
            (status.state, status.current_procedure.clone())
        };
        txn.set_speculation(Some(stall));
        self.site.counters.inc(Counter::Executed);
        self.site.counters.inc(Counter::SinglePartition);
        self.site.counters.record_speculative(stall);
        self.shared
            .profile
            .speculative_runs
            .fetch_add(1, Ordering::Relaxed);
        self.shared.update_status(|s| {
            s.state = ExecutorState::Speculating;
            s.current_procedure = Some(txn.procedure().to_string());
        });

        let outcome = self.invoke(&txn, true);

        self.shared.update_status(|s| {
            s.state = prev_state;
            s.current_procedure = prev_procedure;
            s.speculative_finished += 1;
        });
        trace!(
            target: "spectra::specexec",
            partition = %self.partition(),
            txn_id = %txn.id(),
            stall = %stall,
            ok = outcome.is_ok(),
            "Speculative run finished"
        );
        match outcome {
            Ok(results) => self.speculative.push(SpeculativeRun {
                txn,
                outcome: Ok(results),
            }),
            Err(e) => {
                self.shared.store.lock().rollback(txn.id());
                let err = into_engine_error(&txn, e);
                if is_restartable(&err) {
                    txn.set_speculation(None);
                    self.site.abort_or_restart(&txn, &err);
                } else {
                    self.speculative.push(SpeculativeRun { txn, outcome: Err(err) });
                }
            }
        }
    }

    /// Settle buffered speculative runs after the holder's decision
    ///
    /// On commit they are committed and answered in execution order, up to
    /// the first run whose client asked for an abort. Every run not
    /// committed has its writes undone newest first. Runs with a pending
    /// client abort are answered `AbortGraceful`; the rest are re-queued
    /// under their original ids.
    fn release_speculative(&mut self, commit: bool) {
        if self.speculative.is_empty() {
            return;
        }
        let mut runs = std::mem::take(&mut self.speculative);
        let count = runs.len();
        let keep = if commit {
            runs.iter()
                .position(|run| run.txn.abort_requested())
                .unwrap_or(count)
        } else {
            0
        };
        let undone = runs.split_off(keep);
        {
            let mut store = self.shared.store.lock();
            for run in undone.iter().rev() {
                store.rollback(run.txn.id());
            }
        }
        for run in runs {
            match run.outcome {
                Ok(results) => {
                    self.shared.store.lock().commit(run.txn.id());
                    self.site.respond(&run.txn, Status::Ok, results, None);
                }
                Err(err) => self.site.abort_or_restart(&run.txn, &err),
            }
        }
        let undone_count = undone.len();
        for run in undone {
            if run.txn.abort_requested() {
                self.site
                    .respond(&run.txn, Status::AbortGraceful, Vec::new(), Some("abort requested".to_string()));
                continue;
            }
            self.site.counters.inc(Counter::AbortSpeculative);
            if let Err(e) = self.site.queues.requeue(&run.txn) {
                self.site
                    .respond(&run.txn, Status::AbortReject, Vec::new(), Some(e.to_string()));
            }
        }
        debug!(
            target: "spectra::specexec",
            partition = %self.partition(),
            count,
            undone = undone_count,
            commit,
            "Released speculative transactions"
        );
    }

    // ========================================================================
    // Exit
    // ========================================================================

    /// Answer everything this worker still owns once it stops
    fn drain_on_exit(&mut self) {
        let partition = self.partition();
        let reason = format!("executor for {} stopped", partition);
        self.stash.clear();

        let runs = std::mem::take(&mut self.speculative);
        {
            let mut store = self.shared.store.lock();
            for run in runs.iter().rev() {
                store.rollback(run.txn.id());
            }
        }
        for run in &runs {
            self.site
                .respond(&run.txn, Status::AbortReject, Vec::new(), Some(reason.clone()));
        }

        if let Some(held) = self.held.take() {
            self.shared.store.lock().rollback(held.txn.id());
            if held.role == Role::Base {
                self.site.queues.remove_everywhere(held.txn.id());
                self.site.finish_elsewhere(&held.txn, partition);
                self.site
                    .respond(&held.txn, Status::AbortReject, Vec::new(), Some(reason.clone()));
            }
        }

        for txn in self.shared.queue.close() {
            if txn.is_distributed() {
                self.site.queues.remove_everywhere(txn.id());
                self.site.finish_elsewhere(&txn, partition);
            }
            self.site
                .respond(&txn, Status::AbortReject, Vec::new(), Some(reason.clone()));
        }

        self.shared.update_status(|s| {
            if s.state != ExecutorState::Failed {
                s.state = ExecutorState::Idle;
            }
            s.stall = SpeculationType::Idle;
            s.current_dtxn = None;
            s.current_procedure = None;
        });
    }
}
