//! Partition execution engine
//!
//! This crate runs transactions against a partitioned in-memory store:
//! - Site: partitions, procedures and client admission (site)
//! - Partition executors: per-partition worker threads (executor)
//! - Speculative execution scheduler (specexec)
//! - Path estimation for Early 2PC (estimator)
//! - Procedure handler contract and work units (procedure)
//! - Per-partition key/value store with undo (store)
//! - Configuration and transaction counters (config, counters)
//!
//! Admission, lock queues and conflict checking live in
//! `spectra-concurrency`; identifiers, values and errors in `spectra-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod counters;
pub mod estimator;
pub mod executor;
pub mod procedure;
pub mod site;
pub mod specexec;
pub mod store;

pub use config::{SiteConfig, CONFIG_FILE_NAME};
pub use counters::{Counter, CountersSnapshot, TransactionCounters};
pub use estimator::{
    ModelEstimator, NullEstimator, PathEstimator, PathModel, ProcedureModel, StatementModel, StatementTarget,
};
pub use executor::{ExecutionContext, ExecutorDebug, ExecutorMessage, ExecutorState, ProfileSnapshot, WorkOutcome};
pub use procedure::{FnProcedure, Operation, ProcedureError, ProcedureHandler, ProcedureResult, WorkUnit};
pub use site::{Invocation, Site, SiteBuilder};
pub use specexec::{SchedulerStats, SpecExecScheduler};
pub use store::{Applied, PartitionStore};

pub use spectra_concurrency::{ClientResponse, ResponseHandle};
pub use spectra_core::{
    AccessSet, ParameterSet, PartitionId, PartitionSet, SpectraError, SpectraResult, SpeculationType, Status,
    TxnId, Value,
};
