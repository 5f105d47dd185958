//! Procedure handler contract
//!
//! A procedure is business logic registered with the site under a name. Its
//! handler runs once per transaction at the base partition and issues
//! [`WorkUnit`]s to partitions through the [`ExecutionContext`].

use crate::executor::ExecutionContext;
use spectra_core::{AccessSet, ParameterSet, SpectraError, Status, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// One operation on a partition's key/value store
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Read a key; yields its value or `Null`
    Get {
        /// Key
        key: String,
    },
    /// Overwrite a key; yields `Null`
    Put {
        /// Key
        key: String,
        /// New value
        value: Value,
    },
    /// Add to a numeric key (missing keys count as zero); yields the new value
    Add {
        /// Key
        key: String,
        /// Amount added
        delta: Value,
    },
    /// Remove a key; yields the removed value or `Null`
    Delete {
        /// Key
        key: String,
    },
}

impl Operation {
    /// Key the operation touches
    pub fn key(&self) -> &str {
        match self {
            Operation::Get { key }
            | Operation::Put { key, .. }
            | Operation::Add { key, .. }
            | Operation::Delete { key } => key,
        }
    }

    /// Whether the operation reads the key
    pub fn reads(&self) -> bool {
        matches!(self, Operation::Get { .. } | Operation::Add { .. })
    }

    /// Whether the operation writes the key
    pub fn writes(&self) -> bool {
        !matches!(self, Operation::Get { .. })
    }
}

/// A labelled batch of operations executed at one partition
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    /// Statement label, matched against path models
    pub statement: String,
    /// Operations in execution order
    pub ops: Vec<Operation>,
}

impl WorkUnit {
    /// Empty unit labelled `statement`
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            ops: Vec::new(),
        }
    }

    /// Append a `Get`
    pub fn get(mut self, key: impl Into<String>) -> Self {
        self.ops.push(Operation::Get { key: key.into() });
        self
    }

    /// Append a `Put`
    pub fn put(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(Operation::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Append an `Add`
    pub fn add(mut self, key: impl Into<String>, delta: impl Into<Value>) -> Self {
        self.ops.push(Operation::Add {
            key: key.into(),
            delta: delta.into(),
        });
        self
    }

    /// Append a `Delete`
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(Operation::Delete { key: key.into() });
        self
    }
}

/// Why a handler stopped
#[derive(Debug, Error)]
pub enum ProcedureError {
    /// The handler chose to abort
    #[error("user abort: {0}")]
    UserAbort(String),
    /// The engine refused or failed an operation
    #[error(transparent)]
    Engine(#[from] SpectraError),
}

impl ProcedureError {
    /// Build a user abort
    pub fn user_abort(reason: impl Into<String>) -> Self {
        ProcedureError::UserAbort(reason.into())
    }

    /// Client-visible status
    pub fn status(&self) -> Status {
        match self {
            ProcedureError::UserAbort(_) => Status::AbortUser,
            ProcedureError::Engine(e) => e.status(),
        }
    }
}

/// Result of running a handler
pub type ProcedureResult = Result<Vec<Value>, ProcedureError>;

/// Business logic of a stored procedure
pub trait ProcedureHandler: Send + Sync {
    /// Name clients invoke it by
    fn name(&self) -> &str;

    /// Run the procedure for one transaction
    fn run(&self, ctx: &mut ExecutionContext<'_>) -> ProcedureResult;

    /// Keys the procedure may read and write for these parameters
    fn declared_access(&self, _params: &ParameterSet, _num_partitions: u32) -> Option<AccessSet> {
        None
    }

    /// Index of the parameter that selects the base partition
    fn partition_param(&self) -> usize {
        0
    }

    /// Whether this is a system procedure
    fn is_system(&self) -> bool {
        false
    }

    /// Whether the procedure never writes
    fn is_read_only(&self) -> bool {
        false
    }
}

type RunFn = dyn Fn(&mut ExecutionContext<'_>) -> ProcedureResult + Send + Sync;
type DeclareFn = dyn Fn(&ParameterSet, u32) -> Option<AccessSet> + Send + Sync;

/// Procedure built from closures
pub struct FnProcedure {
    name: String,
    run: Box<RunFn>,
    declare: Option<Box<DeclareFn>>,
    system: bool,
    read_only: bool,
}

impl FnProcedure {
    /// Procedure named `name` running `run`
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut ExecutionContext<'_>) -> ProcedureResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
            declare: None,
            system: false,
            read_only: false,
        }
    }

    /// Declare the read/write set from the parameters
    pub fn with_declared<F>(mut self, declare: F) -> Self
    where
        F: Fn(&ParameterSet, u32) -> Option<AccessSet> + Send + Sync + 'static,
    {
        self.declare = Some(Box::new(declare));
        self
    }

    /// Mark as a system procedure
    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    /// Mark as read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Wrap for registration
    pub fn into_handler(self) -> Arc<dyn ProcedureHandler> {
        Arc::new(self)
    }
}

impl ProcedureHandler for FnProcedure {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut ExecutionContext<'_>) -> ProcedureResult {
        (self.run)(ctx)
    }

    fn declared_access(&self, params: &ParameterSet, num_partitions: u32) -> Option<AccessSet> {
        self.declare.as_ref().and_then(|f| f(params, num_partitions))
    }

    fn is_system(&self) -> bool {
        self.system
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl fmt::Debug for FnProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcedure")
            .field("name", &self.name)
            .field("system", &self.system)
            .field("read_only", &self.read_only)
            .finish()
    }
}
