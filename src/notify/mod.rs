//! Wakeup plumbing between a log writer and its readers
//!
//! Every reader owns a [`NotifyDevice`]: a single-slot wake signal plus an
//! "invalidated" flag. The writer pulses all registered devices after each
//! append without ever blocking; a pulse that finds the slot already full is
//! dropped, which is harmless because readers always re-check the published
//! size after waking.
//!
//! A [`CancelSignal`] is the client-side counterpart: when the consumer's
//! connection goes away it fires, and every device watching it is kicked
//! so blocked waits return promptly.

pub mod control;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Result of a blocking wait on a [`NotifyDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The log grew
    Notified,
    /// The log was deleted
    Invalidated,
    /// Nothing happened within the timeout
    Timeout,
    /// The cancellation signal fired
    Cancelled,
}

/// Per-reader wake signal
#[derive(Debug, Default)]
pub struct NotifyDevice {
    pending: Mutex<bool>,
    cond: Condvar,
    invalidated: AtomicBool,
}

impl NotifyDevice {
    /// Create a device with an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the slot if it is empty. Never blocks.
    ///
    /// Returns false when a pulse was already pending.
    pub fn notify(&self) -> bool {
        let mut pending = self.pending.lock();
        if *pending {
            return false;
        }
        *pending = true;
        self.cond.notify_all();
        true
    }

    /// Mark the owning log as gone and wake the reader
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_all();
    }

    /// Whether the owning log was deleted
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Wake a waiter without filling the slot
    fn kick(&self) {
        let _pending = self.pending.lock();
        self.cond.notify_all();
    }

    /// Block until a pulse, invalidation, cancellation or the timeout
    pub fn wait(&self, timeout: Duration, cancel: &CancelSignal) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        let mut timed_out = false;
        loop {
            // checked under the lock, so a kick cannot slip in between
            // the check and the wait
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if self.is_invalidated() {
                *pending = false;
                return WaitOutcome::Invalidated;
            }
            if *pending {
                *pending = false;
                return WaitOutcome::Notified;
            }
            if timed_out {
                return WaitOutcome::Timeout;
            }
            timed_out = self.cond.wait_until(&mut pending, deadline).timed_out();
        }
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    watchers: Mutex<Vec<Weak<NotifyDevice>>>,
}

/// Cooperative stop signal for a reader session
///
/// Cloning shares the same signal.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

impl CancelSignal {
    /// Create a signal that has not fired
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal and wake every watching device
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let watchers = self.inner.watchers.lock();
        for device in watchers.iter().filter_map(Weak::upgrade) {
            device.kick();
        }
    }

    /// Whether the signal fired
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Make `device` wake up when the signal fires
    pub fn watch(&self, device: &Arc<NotifyDevice>) {
        let mut watchers = self.inner.watchers.lock();
        watchers.retain(|w| w.strong_count() > 0);
        let target = Arc::as_ptr(device);
        if !watchers.iter().any(|w| w.as_ptr() == target) {
            watchers.push(Arc::downgrade(device));
        }
    }
}
