//! Stall points of the two-phase protocol
//!
//! A partition that is held by a distributed transaction is always parked at
//! one of these points. Speculative execution is only allowed at stall points
//! that are not in the configured ignore set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why a partition is currently blocked inside the distributed-transaction protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeculationType {
    /// No distributed transaction holds the partition
    Idle,
    /// Base partition: waiting for lock grants or remote work results
    Sp1Local,
    /// Remote partition: lock granted, no work received yet
    Sp2RemoteBefore,
    /// Remote partition: work executed, more may arrive
    Sp2RemoteAfter,
    /// Base partition: procedure finished, waiting for prepare acknowledgments
    Sp3Local,
    /// Remote partition: prepared, waiting for the commit/abort decision
    Sp3Remote,
}

impl SpeculationType {
    /// Every stall point, in protocol order
    pub const ALL: [SpeculationType; 6] = [
        SpeculationType::Idle,
        SpeculationType::Sp1Local,
        SpeculationType::Sp2RemoteBefore,
        SpeculationType::Sp2RemoteAfter,
        SpeculationType::Sp3Local,
        SpeculationType::Sp3Remote,
    ];

    /// Position in [`SpeculationType::ALL`], used to index counter arrays
    pub const fn ordinal(&self) -> usize {
        match self {
            SpeculationType::Idle => 0,
            SpeculationType::Sp1Local => 1,
            SpeculationType::Sp2RemoteBefore => 2,
            SpeculationType::Sp2RemoteAfter => 3,
            SpeculationType::Sp3Local => 4,
            SpeculationType::Sp3Remote => 5,
        }
    }

    /// Configuration name (`SP3_REMOTE`, ...)
    pub const fn name(&self) -> &'static str {
        match self {
            SpeculationType::Idle => "IDLE",
            SpeculationType::Sp1Local => "SP1_LOCAL",
            SpeculationType::Sp2RemoteBefore => "SP2_REMOTE_BEFORE",
            SpeculationType::Sp2RemoteAfter => "SP2_REMOTE_AFTER",
            SpeculationType::Sp3Local => "SP3_LOCAL",
            SpeculationType::Sp3Remote => "SP3_REMOTE",
        }
    }

    /// Whether this stall point is observed at the transaction's base partition
    pub const fn is_local(&self) -> bool {
        matches!(self, SpeculationType::Sp1Local | SpeculationType::Sp3Local)
    }

    /// Whether this stall point is observed at a remote partition
    pub const fn is_remote(&self) -> bool {
        matches!(
            self,
            SpeculationType::Sp2RemoteBefore
                | SpeculationType::Sp2RemoteAfter
                | SpeculationType::Sp3Remote
        )
    }

    /// Default ignore set: everything except [`SpeculationType::Sp3Remote`]
    pub fn default_ignored() -> Vec<SpeculationType> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| *s != SpeculationType::Sp3Remote)
            .collect()
    }

    /// Parse a comma-separated list such as `"SP1_LOCAL,SP2_REMOTE_BEFORE"`
    ///
    /// Empty items are skipped.
    pub fn parse_list(list: &str) -> Result<Vec<SpeculationType>, UnknownSpeculationType> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(SpeculationType::from_str)
            .collect()
    }
}

impl fmt::Display for SpeculationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown stall point name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown speculation type '{0}'")]
pub struct UnknownSpeculationType(pub String);

impl FromStr for SpeculationType {
    type Err = UnknownSpeculationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SpeculationType::ALL
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownSpeculationType(s.to_string()))
    }
}
