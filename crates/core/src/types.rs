//! Core identifier types
//!
//! This module defines the foundational identifiers:
//! - TxnId: Site-unique, monotonically assigned transaction identifier
//! - PartitionId: Identifier of one data partition served by one executor
//! - PartitionSet: Ordered set of partitions a transaction touches

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Unique identifier for a transaction
///
/// Ids are allocated by the site's queue manager in admission order, so
/// comparing two ids compares their arrival order. Lock queues rely on this
/// to order entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(u64);

impl TxnId {
    /// Wrap a raw id
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for TxnId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier of a data partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Wrap a raw partition number
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw partition number
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Partition number as an index into per-partition vectors
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Ordered set of partitions
///
/// Iteration order is ascending partition id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionSet(BTreeSet<PartitionId>);

impl PartitionSet {
    /// Empty set
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Set containing a single partition
    pub fn single(partition: PartitionId) -> Self {
        let mut set = BTreeSet::new();
        set.insert(partition);
        Self(set)
    }

    /// Every partition `0..count`
    pub fn all(count: u32) -> Self {
        Self((0..count).map(PartitionId::new).collect())
    }

    /// Add a partition. Returns `true` if it was not already present.
    pub fn insert(&mut self, partition: PartitionId) -> bool {
        self.0.insert(partition)
    }

    /// Remove a partition. Returns `true` if it was present.
    pub fn remove(&mut self, partition: PartitionId) -> bool {
        self.0.remove(&partition)
    }

    /// Membership test
    pub fn contains(&self, partition: PartitionId) -> bool {
        self.0.contains(&partition)
    }

    /// Number of partitions in the set
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The only member of a one-element set
    ///
    /// Returns `None` for empty sets and sets with more than one member.
    pub fn get(&self) -> Option<PartitionId> {
        if self.0.len() == 1 {
            self.0.iter().next().copied()
        } else {
            None
        }
    }

    /// Iterate members in ascending order
    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.0.iter().copied()
    }

    /// Union of two sets
    pub fn union(&self, other: &PartitionSet) -> PartitionSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Whether every member of `self` is in `other`
    pub fn is_subset(&self, other: &PartitionSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Remove every member
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl fmt::Display for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p.as_u32())?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<PartitionId> for PartitionSet {
    fn from_iter<I: IntoIterator<Item = PartitionId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PartitionSet {
    type Item = &'a PartitionId;
    type IntoIter = std::collections::btree_set::Iter<'a, PartitionId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
