//! Site: the set of partitions served by one process
//!
//! A [`Site`] owns one lock queue and one executor thread per partition,
//! the registered procedures, the path estimator and the transaction
//! counters. Clients call [`Site::submit`] and wait on the returned
//! [`ResponseHandle`].
//!
//! # Example
//!
//! ```ignore
//! use spectra_engine::{FnProcedure, Invocation, Site, SiteConfig, Value, WorkUnit};
//!
//! let site = Site::builder(SiteConfig::default())
//!     .procedure(FnProcedure::new("Deposit", |ctx| {
//!         let account = ctx.param(0).cloned().unwrap_or(Value::Null);
//!         ctx.execute_local(WorkUnit::new("Deposit").add(format!("bal:{}", account), 10i64))
//!     }).into_handler())
//!     .start()?;
//!
//! let handle = site.submit(Invocation::new("Deposit", vec![7i64.into()]))?;
//! let response = handle.wait(Duration::from_secs(1));
//! ```

use crate::config::SiteConfig;
use crate::counters::{Counter, TransactionCounters};
use crate::estimator::{ModelEstimator, NullEstimator, PathEstimator};
use crate::executor::{self, ExecutorDebug, ExecutorMessage, ExecutorShared};
use crate::procedure::ProcedureHandler;
use crate::specexec::SpecExecScheduler;
use crate::store::PartitionStore;
use dashmap::DashMap;
use parking_lot::Mutex;
use spectra_concurrency::{
    ConflictChecker, ResponseHandle, Transaction, TransactionQueueManager, TransactionSpec, TxnFlags,
};
use spectra_core::{
    AccessSet, ParameterSet, PartitionId, PartitionSet, SpectraError, SpectraResult, Status, TxnId, Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// Invocation
// ============================================================================

/// A client's request to run a procedure
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    /// Procedure name
    pub procedure: String,
    /// Parameters
    pub params: ParameterSet,
    /// Base partition; derived from the partitioning parameter when absent
    pub base_partition: Option<PartitionId>,
    /// Partitions the transaction may touch; predicted when absent
    pub partitions: Option<PartitionSet>,
    /// Attach execution details to the response
    pub client_debug: bool,
}

impl Invocation {
    /// Invoke `procedure` with `params`
    pub fn new(procedure: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            procedure: procedure.into(),
            params: ParameterSet::new(params),
            ..Self::default()
        }
    }

    /// Run at `partition`
    pub fn base_partition(mut self, partition: PartitionId) -> Self {
        self.base_partition = Some(partition);
        self
    }

    /// Declare the partitions the transaction may touch
    pub fn partitions(mut self, partitions: PartitionSet) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Ask for execution details in the response
    pub fn debug(mut self) -> Self {
        self.client_debug = true;
        self
    }
}

// ============================================================================
// Runtime shared with executors
// ============================================================================

/// Site state shared by every executor thread
pub(crate) struct SiteRuntime {
    pub(crate) config: SiteConfig,
    pub(crate) queues: TransactionQueueManager,
    pub(crate) counters: Arc<TransactionCounters>,
    pub(crate) estimator: Arc<dyn PathEstimator>,
    procedures: HashMap<String, Arc<dyn ProcedureHandler>>,
    executors: Vec<Arc<ExecutorShared>>,
    /// Transactions admitted and not yet answered
    active: DashMap<TxnId, Arc<Transaction>>,
}

impl SiteRuntime {
    pub(crate) fn procedure(&self, name: &str) -> Option<Arc<dyn ProcedureHandler>> {
        self.procedures.get(name).cloned()
    }

    /// Deliver `msg` to the executor of `partition`
    pub(crate) fn send(&self, partition: PartitionId, msg: ExecutorMessage) {
        match self.executors.get(partition.index()) {
            Some(exec) => exec.send(msg),
            None => warn!(target: "spectra::site", partition = %partition, msg = ?msg, "Message for unknown partition dropped"),
        }
    }

    /// Send an abort decision to every predicted partition except `from`
    pub(crate) fn finish_elsewhere(&self, txn: &Arc<Transaction>, from: PartitionId) {
        for partition in txn.predicted_partitions().iter().filter(|p| *p != from) {
            self.send(
                partition,
                ExecutorMessage::Finish {
                    txn: Arc::clone(txn),
                    commit: false,
                },
            );
        }
    }

    fn track(&self, txn: &Arc<Transaction>) {
        self.active.insert(txn.id(), Arc::clone(txn));
        // the executor may have answered before the insert
        if txn.responder().is_complete() {
            self.active.remove(&txn.id());
        }
    }

    /// Answer the client of `txn`
    pub(crate) fn respond(&self, txn: &Transaction, status: Status, results: Vec<Value>, message: Option<String>) {
        let response = txn.build_response(status, results, message, self.config.txn_client_debug);
        if status.is_ok() {
            self.counters.inc(Counter::Completed);
        } else {
            self.counters.inc(Counter::Aborted);
        }
        // a woken client must not see its transaction as active
        self.active.remove(&txn.id());
        if !txn.respond(response) {
            debug!(target: "spectra::site", txn_id = %txn.id(), status = %status, "Response already sent");
        }
        // inserted by a concurrent `track` after the first remove
        self.active.remove(&txn.id());
    }

    /// Restart `txn` under a new id when `err` allows it, otherwise answer with its status
    ///
    /// The new incarnation predicts every partition the old one was predicted
    /// to touch, touched, or mispredicted, and has Early 2PC disabled.
    pub(crate) fn abort_or_restart(&self, txn: &Arc<Transaction>, err: &SpectraError) {
        if !executor::is_restartable(err) || txn.own_restarts() >= self.config.txn_restart_limit {
            self.respond(txn, err.status(), Vec::new(), Some(err.to_string()));
            return;
        }

        let mut partitions = txn
            .predicted_partitions()
            .union(&txn.touched_partitions());
        if let SpectraError::Mispredict { partition, .. } = err {
            partitions.insert(*partition);
        }
        match self.queues.admit(txn.restart_spec(partitions, false)) {
            Ok(next) => {
                self.counters.inc(Counter::Restarted);
                self.active.remove(&txn.id());
                self.track(&next);
                debug!(
                    target: "spectra::site",
                    txn_id = %txn.id(),
                    next_id = %next.id(),
                    restarts = next.restart_counter(),
                    partitions = %next.predicted_partitions(),
                    error = %err,
                    "Restarted transaction"
                );
            }
            Err(e) => {
                warn!(target: "spectra::site", txn_id = %txn.id(), error = %e, "Restart rejected");
                self.respond(txn, Status::AbortReject, Vec::new(), Some(e.to_string()));
            }
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for a [`Site`]
pub struct SiteBuilder {
    config: SiteConfig,
    procedures: Vec<Arc<dyn ProcedureHandler>>,
    estimator: Option<Arc<dyn PathEstimator>>,
    checkers: HashMap<PartitionId, Arc<dyn ConflictChecker>>,
    preload: Vec<(PartitionId, String, Value)>,
}

impl SiteBuilder {
    /// Register a procedure
    pub fn procedure(mut self, handler: Arc<dyn ProcedureHandler>) -> Self {
        self.procedures.push(handler);
        self
    }

    /// Use `estimator` instead of the configured one
    pub fn estimator(mut self, estimator: Arc<dyn PathEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Install `checker` at `partition` instead of the configured kind
    pub fn conflict_checker(mut self, partition: PartitionId, checker: Arc<dyn ConflictChecker>) -> Self {
        self.checkers.insert(partition, checker);
        self
    }

    /// Initial data for `partition`
    pub fn preload(mut self, partition: PartitionId, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.preload.push((partition, key.into(), value.into()));
        self
    }

    fn resolve_estimator(&mut self) -> Arc<dyn PathEstimator> {
        if let Some(estimator) = self.estimator.take() {
            return estimator;
        }
        let config = &self.config;
        match (&config.markov_path, config.markov_enable) {
            (Some(path), true) => {
                match ModelEstimator::from_file(path, config.markov_confidence, config.partitions) {
                    Ok(estimator) => Arc::new(estimator),
                    Err(e) => {
                        warn!(
                            target: "spectra::site",
                            path = %path.display(),
                            error = %e,
                            "Path model unavailable, Early 2PC disabled"
                        );
                        Arc::new(NullEstimator)
                    }
                }
            }
            _ => Arc::new(NullEstimator),
        }
    }

    /// Validate the configuration and start one executor per partition
    pub fn start(mut self) -> SpectraResult<Site> {
        self.config.validate()?;
        let n = self.config.partitions;

        let mut procedures = HashMap::new();
        for handler in std::mem::take(&mut self.procedures) {
            let name = handler.name().to_string();
            if procedures.insert(name.clone(), handler).is_some() {
                return Err(SpectraError::InvalidConfig(format!(
                    "procedure '{}' registered twice",
                    name
                )));
            }
        }
        for (partition, _, _) in &self.preload {
            if partition.as_u32() >= n {
                return Err(SpectraError::InvalidPartition {
                    partition: *partition,
                    count: n,
                });
            }
        }

        let estimator = self.resolve_estimator();
        let queues = TransactionQueueManager::new(n, self.config.queue_capacity, self.config.queue_profiling);
        let mut stores: Vec<PartitionStore> = (0..n).map(|p| PartitionStore::new(PartitionId::new(p))).collect();
        for (partition, key, value) in self.preload.drain(..) {
            stores[partition.index()].load(key, value);
        }

        let mut executors = Vec::with_capacity(n as usize);
        for (p, store) in (0..n).zip(stores) {
            let partition = PartitionId::new(p);
            let queue = queues
                .lock_queue(partition)
                .cloned()
                .ok_or(SpectraError::InvalidPartition { partition, count: n })?;
            let checker = self
                .checkers
                .remove(&partition)
                .unwrap_or_else(|| self.config.specexec_checker.build());
            let scheduler = SpecExecScheduler::new(partition, &self.config, checker);
            executors.push(Arc::new(ExecutorShared::new(
                queue,
                scheduler,
                store,
                self.config.exec_profiling,
            )));
        }

        let runtime = Arc::new(SiteRuntime {
            counters: Arc::new(TransactionCounters::new(self.config.txn_counters)),
            config: self.config,
            queues,
            estimator,
            procedures,
            executors,
            active: DashMap::new(),
        });

        let mut workers = Vec::with_capacity(n as usize);
        for shared in &runtime.executors {
            match executor::spawn(Arc::clone(shared), Arc::clone(&runtime)) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    for exec in &runtime.executors {
                        exec.request_stop();
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            target: "spectra::site",
            partitions = n,
            procedures = runtime.procedures.len(),
            estimator = runtime.estimator.name(),
            specexec = runtime.config.specexec_enable,
            "Site started"
        );
        Ok(Site {
            runtime,
            workers: Mutex::new(workers),
            shut_down: AtomicBool::new(false),
        })
    }
}

// ============================================================================
// Site
// ============================================================================

/// A running set of partitions
pub struct Site {
    runtime: Arc<SiteRuntime>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Site {
    /// Start configuring a site
    pub fn builder(config: SiteConfig) -> SiteBuilder {
        SiteBuilder {
            config,
            procedures: Vec::new(),
            estimator: None,
            checkers: HashMap::new(),
            preload: Vec::new(),
        }
    }

    /// Configuration the site runs with
    pub fn config(&self) -> &SiteConfig {
        &self.runtime.config
    }

    /// Number of partitions
    pub fn num_partitions(&self) -> u32 {
        self.runtime.config.partitions
    }

    /// Admit a transaction
    ///
    /// The base partition is the invocation's hint, or the partition of the
    /// procedure's partitioning parameter. The partition set is the
    /// invocation's, else the estimator's prediction, else the base alone
    /// when `exec_force_singlepartitioned` is set, else every partition.
    ///
    /// Admission errors are returned here; everything after admission is
    /// reported through the handle.
    pub fn submit(&self, invocation: Invocation) -> SpectraResult<ResponseHandle> {
        let rt = &self.runtime;
        rt.counters.inc(Counter::Received);
        match self.admit(invocation) {
            Ok(txn) => {
                rt.track(&txn);
                Ok(txn.responder().clone())
            }
            Err(e) => {
                rt.counters.inc(Counter::Rejected);
                debug!(target: "spectra::site", error = %e, "Invocation rejected");
                Err(e)
            }
        }
    }

    fn admit(&self, invocation: Invocation) -> SpectraResult<Arc<Transaction>> {
        let rt = &self.runtime;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SpectraError::InvalidOperation("site is shut down".to_string()));
        }
        let handler = rt
            .procedure(&invocation.procedure)
            .ok_or_else(|| SpectraError::UnknownProcedure(invocation.procedure.clone()))?;
        let n = rt.config.partitions;
        let params = invocation.params;

        let base = match invocation.base_partition {
            Some(p) => p,
            None => params
                .get(handler.partition_param())
                .map(|v| v.partition(n))
                .unwrap_or(PartitionId::new(0)),
        };
        if base.as_u32() >= n {
            return Err(SpectraError::InvalidPartition {
                partition: base,
                count: n,
            });
        }

        let partitions = match invocation.partitions {
            Some(set) => set,
            None => match rt
                .estimator
                .predict_partitions(&invocation.procedure, &params, base, n)
            {
                Some(set) => set,
                None if rt.config.exec_force_singlepartitioned => PartitionSet::single(base),
                None => PartitionSet::all(n),
            },
        };

        let declared: Option<AccessSet> = handler.declared_access(&params, n);
        let flags = TxnFlags {
            system: handler.is_system(),
            read_only: handler.is_read_only(),
            client_debug: invocation.client_debug,
        };
        if flags.system {
            rt.counters.inc(Counter::Sysprocs);
        }

        let mut spec = TransactionSpec::new(invocation.procedure, params, base)
            .partitions(partitions)
            .flags(flags);
        if let Some(declared) = declared {
            spec = spec.declared(declared);
        }
        rt.queues.admit(spec)
    }

    /// Request an abort of a transaction that has not answered yet
    ///
    /// Returns `false` if the transaction is unknown, already answered, or
    /// already being aborted. The client sees `AbortGraceful`.
    pub fn abort(&self, txn_id: TxnId) -> bool {
        let rt = &self.runtime;
        let Some(txn) = rt.active.get(&txn_id).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        if !txn.request_abort() {
            return false;
        }
        rt.send(txn.base_partition(), ExecutorMessage::Abort { txn_id });
        debug!(target: "spectra::site", txn_id = %txn_id, base = %txn.base_partition(), "Abort requested");
        true
    }

    /// Debug handle of the executor at `partition`
    pub fn executor(&self, partition: PartitionId) -> Option<ExecutorDebug> {
        self.runtime
            .executors
            .get(partition.index())
            .map(|shared| ExecutorDebug::new(Arc::clone(shared)))
    }

    /// Lock queues
    pub fn queue_manager(&self) -> &TransactionQueueManager {
        &self.runtime.queues
    }

    /// Transaction counters
    pub fn counters(&self) -> &TransactionCounters {
        &self.runtime.counters
    }

    /// Transactions admitted and not yet answered
    pub fn active_transactions(&self) -> usize {
        self.runtime.active.len()
    }

    /// Stop every executor and reject what is still queued
    ///
    /// Returns the first fatal error an executor stopped on. Later calls
    /// return `Ok(())`.
    pub fn shutdown(&self) -> SpectraResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let rt = &self.runtime;
        for exec in &rt.executors {
            exec.request_stop();
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!(target: "spectra::site", "Executor thread panicked");
            }
        }
        let drained = rt.queues.close_all();
        for txn in &drained {
            rt.respond(txn, Status::AbortReject, Vec::new(), Some("site shutting down".to_string()));
        }
        info!(target: "spectra::site", rejected = drained.len(), "Site stopped");

        match rt.executors.iter().find_map(|e| e.take_fatal()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Site {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(target: "spectra::site", error = %e, "Executor failure at shutdown");
        }
    }
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("partitions", &self.runtime.config.partitions)
            .field("procedures", &self.runtime.procedures.len())
            .field("estimator", &self.runtime.estimator.name())
            .field("active", &self.runtime.active.len())
            .finish()
    }
}
