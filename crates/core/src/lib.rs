//! Core types for the partition execution engine
//!
//! This crate defines the foundational types used throughout the system:
//! - TxnId / PartitionId / PartitionSet: identifiers (types)
//! - Value / ParameterSet: procedure parameters and partition data (value)
//! - Status: client-visible transaction outcomes (status)
//! - SpeculationType: stall points of the two-phase protocol (speculation)
//! - AccessSet: per-partition read/write sets (access)
//! - SpectraError: error hierarchy (error)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod error;
pub mod speculation;
pub mod status;
pub mod types;
pub mod value;

pub use access::{AccessSet, PartitionAccess};
pub use error::{RejectReason, SpectraError, SpectraResult};
pub use speculation::{SpeculationType, UnknownSpeculationType};
pub use status::Status;
pub use types::{PartitionId, PartitionSet, TxnId};
pub use value::{ParameterSet, Value};
