//! Read/write sets
//!
//! An [`AccessSet`] records, per partition, which keys a transaction reads
//! and writes. A transaction carries two of them: the set it *declared* at
//! admission (what it may touch) and the set it has *observed* while running
//! (what it did touch). Conflict checkers compare these between the
//! transaction holding a partition and a speculative candidate.

use crate::types::PartitionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Keys read and written at one partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAccess {
    /// Keys read
    #[serde(default)]
    pub reads: BTreeSet<String>,
    /// Keys written
    #[serde(default)]
    pub writes: BTreeSet<String>,
}

impl PartitionAccess {
    /// Whether nothing was read or written
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Whether any key written here is read or written by `other`
    pub fn writes_intersect(&self, other: &PartitionAccess) -> bool {
        self.writes
            .iter()
            .any(|k| other.reads.contains(k) || other.writes.contains(k))
    }

    /// Whether any key read here is written by `other`
    pub fn reads_intersect_writes_of(&self, other: &PartitionAccess) -> bool {
        self.reads.iter().any(|k| other.writes.contains(k))
    }

    /// Add every key of `other` to this access
    pub fn merge(&mut self, other: &PartitionAccess) {
        self.reads.extend(other.reads.iter().cloned());
        self.writes.extend(other.writes.iter().cloned());
    }
}

/// Per-partition read/write sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSet {
    partitions: BTreeMap<PartitionId, PartitionAccess>,
}

impl AccessSet {
    /// Empty access set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read of `key` at `partition`
    pub fn record_read(&mut self, partition: PartitionId, key: impl Into<String>) {
        self.partitions
            .entry(partition)
            .or_default()
            .reads
            .insert(key.into());
    }

    /// Record a write of `key` at `partition`
    pub fn record_write(&mut self, partition: PartitionId, key: impl Into<String>) {
        self.partitions
            .entry(partition)
            .or_default()
            .writes
            .insert(key.into());
    }

    /// Builder-style read declaration
    pub fn read(mut self, partition: PartitionId, key: impl Into<String>) -> Self {
        self.record_read(partition, key);
        self
    }

    /// Builder-style write declaration
    pub fn write(mut self, partition: PartitionId, key: impl Into<String>) -> Self {
        self.record_write(partition, key);
        self
    }

    /// Access at one partition, if anything was recorded there
    pub fn at(&self, partition: PartitionId) -> Option<&PartitionAccess> {
        self.partitions.get(&partition)
    }

    /// Partitions with at least one recorded access
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.partitions.keys().copied()
    }

    /// Whether nothing was recorded anywhere
    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(PartitionAccess::is_empty)
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.partitions.clear();
    }
}
