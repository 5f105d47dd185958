//! Spectra - partition executor for partitioned OLTP
//!
//! A site owns one single-threaded executor per partition. Transactions are
//! admitted into per-partition lock queues in timestamp order; distributed
//! transactions hold every partition they touch, and a partition released
//! early by the path estimator runs queued single-partition work
//! speculatively until the holder commits or aborts.
//!
//! # Quick Start
//!
//! ```ignore
//! use spectradb::{FnProcedure, Invocation, Site, SiteConfig, Value, WorkUnit};
//!
//! let deposit = FnProcedure::new("Deposit", |ctx| {
//!     let amount = ctx.param(1).cloned().unwrap_or(Value::Int(0));
//!     ctx.execute_local(WorkUnit::new("Deposit").add("balance", amount))
//! });
//! let site = Site::builder(SiteConfig::default())
//!     .procedure(deposit.into_handler())
//!     .start()?;
//!
//! let response = site
//!     .submit(Invocation::new("Deposit", vec![0i64.into(), 5i64.into()]))?
//!     .wait(std::time::Duration::from_secs(1));
//! site.shutdown()?;
//! ```
//!
//! # Architecture
//!
//! - `spectra-core`: identifiers, values, statuses and the error type
//! - `spectra-concurrency`: transactions, lock queues, conflict checkers
//! - `spectra-engine`: executors, speculation scheduler, path estimator, site

pub use spectra_engine::*;

/// Lock queues and conflict checking
pub mod concurrency {
    pub use spectra_concurrency::*;
}
