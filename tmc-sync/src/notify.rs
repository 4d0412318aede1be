use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Single-bit "service request occurred" cell shared between a notification
/// source and the waiting context.
///
/// The source only ever calls [`NotifyCell::fire`]. It must not touch the
/// transport, since it may run in a signal listener or another thread.
/// The waiting context observes and clears the bit.
///
/// Notifications are edge triggered: an edge delivered before the cell was
/// reset for the current operation is lost, and a stale edge may wake a waiter
/// spuriously. Waiters therefore always re-check the status byte.
#[derive(Debug, Default)]
pub struct NotifyCell {
    fired: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl NotifyCell {
    pub fn new() -> NotifyCell {
        NotifyCell::default()
    }

    /// Records a notification and wakes the waiter.
    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_all();
    }

    /// Whether a notification is pending, without clearing it.
    pub fn is_set(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Clears and returns the pending notification.
    pub fn take(&self) -> bool {
        self.fired.swap(false, Ordering::AcqRel)
    }

    pub fn reset(&self) {
        self.fired.store(false, Ordering::Release);
    }

    /// Sleeps until a notification arrives or `timeout` elapses.
    /// Returns whether a notification was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .wake
            .wait_timeout_while(guard, timeout, |_| !self.fired.load(Ordering::Acquire))
            .unwrap_or_else(PoisonError::into_inner);
        self.take()
    }
}
