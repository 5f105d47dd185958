//! Client responses and the one-shot slot a submitter waits on

use parking_lot::{Condvar, Mutex};
use spectra_core::{PartitionId, PartitionSet, SpeculationType, Status, TxnId, Value};
use std::sync::Arc;
use std::time::Duration;

/// Extra execution details attached when client debugging is enabled
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDebug {
    /// Partitions predicted at admission
    pub predicted_partitions: PartitionSet,
    /// Partitions the transaction actually executed work at
    pub touched_partitions: PartitionSet,
    /// Partitions released early through Early 2PC
    pub done_partitions: PartitionSet,
    /// Stall point under which the transaction ran speculatively, if it did
    pub speculation: Option<SpeculationType>,
}

/// Final outcome of a transaction as delivered to its client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientResponse {
    /// Id of the incarnation that produced this response
    pub txn_id: TxnId,
    /// Outcome
    pub status: Status,
    /// Procedure results (empty unless `status` is `Ok`)
    pub results: Vec<Value>,
    /// Abort reason, if any
    pub status_message: Option<String>,
    /// Whether the transaction ran at a single partition
    pub single_partition: bool,
    /// Whether the transaction ran speculatively
    pub speculative: bool,
    /// How many times the site restarted the transaction
    pub restart_counter: u32,
    /// Partition where the procedure ran
    pub base_partition: PartitionId,
    /// Execution details when client debugging is enabled
    pub debug: Option<ResponseDebug>,
}

impl ClientResponse {
    /// Whether debug details are attached
    pub fn has_debug(&self) -> bool {
        self.debug.is_some()
    }
}

struct ResponseSlot {
    response: Mutex<Option<ClientResponse>>,
    ready: Condvar,
}

/// Handle to a transaction's eventual [`ClientResponse`]
///
/// Cloning shares the slot. The first call to `complete` wins; later calls
/// are ignored so a response is delivered at most once.
#[derive(Clone)]
pub struct ResponseHandle {
    slot: Arc<ResponseSlot>,
}

impl ResponseHandle {
    /// Fresh, empty handle
    pub fn new() -> Self {
        Self {
            slot: Arc::new(ResponseSlot {
                response: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Deliver the response. Returns `false` if one was already delivered.
    pub fn complete(&self, response: ClientResponse) -> bool {
        let mut slot = self.slot.response.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(response);
        self.slot.ready.notify_all();
        true
    }

    /// Whether a response has been delivered
    pub fn is_complete(&self) -> bool {
        self.slot.response.lock().is_some()
    }

    /// The response, if already delivered
    pub fn try_get(&self) -> Option<ClientResponse> {
        self.slot.response.lock().clone()
    }

    /// Block until the response arrives or `timeout` expires
    pub fn wait(&self, timeout: Duration) -> Option<ClientResponse> {
        let mut slot = self.slot.response.lock();
        if slot.is_none() {
            let deadline = std::time::Instant::now() + timeout;
            while slot.is_none() {
                if self.slot.ready.wait_until(&mut slot, deadline).timed_out() {
                    break;
                }
            }
        }
        slot.clone()
    }
}

impl Default for ResponseHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: Status) -> ClientResponse {
        ClientResponse {
            txn_id: TxnId::new(1),
            status,
            results: vec![Value::Int(1)],
            status_message: None,
            single_partition: true,
            speculative: false,
            restart_counter: 0,
            base_partition: PartitionId::new(0),
            debug: None,
        }
    }

    #[test]
    fn test_first_completion_wins() {
        let handle = ResponseHandle::new();
        assert!(!handle.is_complete());
        assert!(handle.complete(response(Status::Ok)));
        assert!(!handle.complete(response(Status::AbortUser)));
        assert_eq!(handle.try_get().unwrap().status, Status::Ok);
    }

    #[test]
    fn test_wait_times_out_without_response() {
        let handle = ResponseHandle::new();
        assert!(handle.wait(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_wait_wakes_on_completion_from_other_thread() {
        let handle = ResponseHandle::new();
        let remote = handle.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.complete(response(Status::Ok));
        });
        let got = handle.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(got.status, Status::Ok);
        worker.join().unwrap();
    }
}
