//! Partition key/value store with per-transaction undo
//!
//! Every mutation appends the key's previous value to the owning
//! transaction's undo log. `commit` forgets the log; `rollback` replays it in
//! reverse. Uncommitted writes are visible to later transactions, which is
//! what speculative execution relies on: a speculative transaction that read
//! them is rolled back with its holder.

use crate::procedure::{Operation, WorkUnit};
use rustc_hash::FxHashMap;
use spectra_core::{PartitionAccess, PartitionId, SpectraError, SpectraResult, TxnId, Value};

/// Outcome of applying one work unit
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// One value per operation
    pub results: Vec<Value>,
    /// Keys read and written
    pub access: PartitionAccess,
}

/// Data of one partition
#[derive(Debug)]
pub struct PartitionStore {
    partition: PartitionId,
    data: FxHashMap<String, Value>,
    undo: FxHashMap<TxnId, Vec<(String, Option<Value>)>>,
}

impl PartitionStore {
    /// Empty store for `partition`
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            data: FxHashMap::default(),
            undo: FxHashMap::default(),
        }
    }

    /// Current value of `key`, committed or not
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Write outside any transaction (initial data)
    pub fn load(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether `txn` has uncommitted changes here
    pub fn has_pending(&self, txn: TxnId) -> bool {
        self.undo.contains_key(&txn)
    }

    fn record_undo(&mut self, txn: TxnId, key: &str) {
        let prev = self.data.get(key).cloned();
        self.undo
            .entry(txn)
            .or_default()
            .push((key.to_string(), prev));
    }

    /// Apply `unit` on behalf of `txn`
    ///
    /// Operations before a failing one stay applied and are undone by the
    /// transaction's rollback.
    pub fn apply(&mut self, txn: TxnId, unit: &WorkUnit) -> SpectraResult<Applied> {
        let mut results = Vec::with_capacity(unit.ops.len());
        let mut access = PartitionAccess::default();
        for op in &unit.ops {
            let key = op.key();
            if op.reads() {
                access.reads.insert(key.to_string());
            }
            if op.writes() {
                access.writes.insert(key.to_string());
            }
            let out = match op {
                Operation::Get { .. } => self.data.get(key).cloned().unwrap_or(Value::Null),
                Operation::Put { value, .. } => {
                    self.record_undo(txn, key);
                    self.data.insert(key.to_string(), value.clone());
                    Value::Null
                }
                Operation::Add { delta, .. } => {
                    let current = self.data.get(key).cloned().unwrap_or(Value::Null);
                    let next = current.checked_add(delta).ok_or_else(|| {
                        SpectraError::InvalidOperation(format!(
                            "{}: cannot add {} to {} at key '{}'",
                            unit.statement,
                            delta.type_name(),
                            current.type_name(),
                            key
                        ))
                    })?;
                    self.record_undo(txn, key);
                    self.data.insert(key.to_string(), next.clone());
                    next
                }
                Operation::Delete { .. } => {
                    self.record_undo(txn, key);
                    self.data.remove(key).unwrap_or(Value::Null)
                }
            };
            results.push(out);
        }
        Ok(Applied { results, access })
    }

    /// Make `txn`'s changes permanent
    pub fn commit(&mut self, txn: TxnId) {
        self.undo.remove(&txn);
    }

    /// Undo `txn`'s changes; returns how many writes were reverted
    pub fn rollback(&mut self, txn: TxnId) -> usize {
        let Some(log) = self.undo.remove(&txn) else {
            return 0;
        };
        let reverted = log.len();
        for (key, prev) in log.into_iter().rev() {
            match prev {
                Some(v) => self.data.insert(key, v),
                None => self.data.remove(&key),
            };
        }
        tracing::trace!(target: "spectra::exec", txn_id = %txn, partition = %self.partition, reverted, "Rolled back");
        reverted
    }
}
