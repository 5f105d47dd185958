//! Transaction outcome codes reported to clients

use serde::{Deserialize, Serialize};
use std::fmt;

/// Final status of a transaction as seen by its client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Committed successfully
    Ok,
    /// The procedure aborted itself
    AbortUser,
    /// Aborted on request of the site or the client
    AbortGraceful,
    /// Aborted by an engine fault (e.g. remote partition timed out)
    AbortUnexpected,
    /// Rejected at admission or during shutdown
    AbortReject,
    /// Aborted and restarted; only visible when restarts are exhausted
    AbortRestart,
    /// Touched a partition it was not predicted to touch
    AbortMispredict,
    /// Rolled back because the transaction it speculated past aborted
    AbortSpeculative,
}

impl Status {
    /// Whether this status means the transaction committed
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Whether the site may transparently restart a transaction with this status
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            Status::AbortRestart | Status::AbortMispredict | Status::AbortSpeculative
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::AbortUser => "ABORT_USER",
            Status::AbortGraceful => "ABORT_GRACEFUL",
            Status::AbortUnexpected => "ABORT_UNEXPECTED",
            Status::AbortReject => "ABORT_REJECT",
            Status::AbortRestart => "ABORT_RESTART",
            Status::AbortMispredict => "ABORT_MISPREDICT",
            Status::AbortSpeculative => "ABORT_SPECULATIVE",
        };
        write!(f, "{}", name)
    }
}
