//! Wakeup flag shared between a partition worker and its producers
//!
//! Producers (lock queue inserts, inbound messages) call [`Notifier::notify`];
//! the worker parks in [`Notifier::wait`] with a bounded timeout so it
//! re-checks its state periodically even if a wakeup is lost.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Sticky wakeup flag backed by a condition variable
#[derive(Debug, Default)]
pub struct Notifier {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Notifier {
    /// Create a notifier with no pending wakeup
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake the waiter
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_all();
    }

    /// Wait for a wakeup or until `timeout` elapses
    ///
    /// Returns `true` if a wakeup was consumed. The flag is cleared either way.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pending_notification_is_consumed() {
        let n = Notifier::new();
        n.notify();
        assert!(n.wait(Duration::from_millis(1)));
        assert!(!n.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_wakes_from_other_thread() {
        let n = Arc::new(Notifier::new());
        let producer = Arc::clone(&n);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.notify();
        });
        assert!(n.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
