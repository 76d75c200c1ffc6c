//! Fsync policies for segment writers
//!
//! One [`Fsyncer`] is shared by every writer of a broker. Writers announce
//! the files they append to and report each write; the policy decides when
//! the data reaches stable storage:
//!
//! - `None`: never, the page cache is trusted
//! - `Every`: `sync_data` right after each write, inside the writer call
//! - `Debounced`: files touched since the last flush are synced together
//!   once per interval, and a background flusher catches writers that went
//!   idle before their window elapsed

use crate::config::SyncPolicy;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handle of a file tracked by an [`Fsyncer`]
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SyncToken(u64);

#[derive(Debug)]
struct TrackedFile {
    file: File,
    dirty: bool,
    last_sync: Instant,
}

#[derive(Debug)]
struct FsyncState {
    files: Mutex<HashMap<u64, TrackedFile>>,
    interval: Duration,
    next_flush: Mutex<Instant>,
    running: AtomicBool,
    wakeup: (Mutex<bool>, Condvar),
}

impl FsyncState {
    /// Sync every dirty file whose last sync is at least `min_age` old.
    /// Failures are logged and handed back with the id of their file.
    fn flush_dirty(&self, min_age: Duration) -> (usize, Vec<(u64, io::Error)>) {
        let mut files = self.files.lock();
        let mut synced = 0;
        let mut failed = Vec::new();
        let stale = files
            .iter_mut()
            .filter(|(_, t)| t.dirty && t.last_sync.elapsed() >= min_age);
        for (id, tracked) in stale {
            match tracked.file.sync_data() {
                Ok(()) => {
                    tracked.dirty = false;
                    tracked.last_sync = Instant::now();
                    synced += 1;
                }
                Err(e) => {
                    warn!(file = id, error = %e, "fsync failed");
                    failed.push((*id, e));
                }
            }
        }
        (synced, failed)
    }
}

fn first_error((synced, failed): (usize, Vec<(u64, io::Error)>)) -> io::Result<usize> {
    match failed.into_iter().next() {
        Some((_, e)) => Err(e),
        None => Ok(synced),
    }
}

/// Applies a [`SyncPolicy`] to the files of all writers
#[derive(Debug)]
pub struct Fsyncer {
    policy: SyncPolicy,
    state: Arc<FsyncState>,
    next_id: AtomicU64,
    daemon: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Fsyncer {
    /// Create an fsyncer, starting the background flusher for the
    /// debounced policy
    pub fn new(policy: SyncPolicy) -> io::Result<Arc<Self>> {
        let interval = match policy {
            SyncPolicy::Debounced { interval_ms } => Duration::from_millis(interval_ms.max(1)),
            _ => Duration::ZERO,
        };
        let state = Arc::new(FsyncState {
            files: Mutex::new(HashMap::new()),
            interval,
            next_flush: Mutex::new(Instant::now() + interval),
            running: AtomicBool::new(true),
            wakeup: (Mutex::new(false), Condvar::new()),
        });

        let daemon = match policy {
            SyncPolicy::Debounced { .. } => {
                let state = state.clone();
                Some(
                    thread::Builder::new()
                        .name("segmq-fsync".to_string())
                        .spawn(move || run_flusher(state, interval))?,
                )
            }
            _ => None,
        };

        Ok(Arc::new(Self {
            policy,
            state,
            next_id: AtomicU64::new(1),
            daemon: Mutex::new(daemon),
        }))
    }

    /// Policy in effect
    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// Start tracking a freshly opened segment file
    pub fn track(&self, file: &File) -> io::Result<SyncToken> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let SyncPolicy::Debounced { .. } = self.policy {
            let tracked = TrackedFile {
                file: file.try_clone()?,
                dirty: false,
                last_sync: Instant::now(),
            };
            self.state.files.lock().insert(id, tracked);
        }
        Ok(SyncToken(id))
    }

    /// Report a completed write to `file`
    pub fn after_write(&self, token: &SyncToken, file: &File) -> io::Result<()> {
        match self.policy {
            SyncPolicy::None => Ok(()),
            SyncPolicy::Every => file.sync_data(),
            SyncPolicy::Debounced { .. } => {
                if let Some(tracked) = self.state.files.lock().get_mut(&token.0) {
                    tracked.dirty = true;
                }
                let due = Instant::now() >= *self.state.next_flush.lock();
                if !due {
                    return Ok(());
                }
                // other files' failures are logged by the flush, not charged to this write
                let (_, failed) = self.state.flush_dirty(Duration::ZERO);
                *self.state.next_flush.lock() = Instant::now() + self.state.interval;
                match failed.into_iter().find(|(id, _)| *id == token.0) {
                    Some((_, e)) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    /// Stop tracking a file that is being closed, syncing it if it has
    /// unsynced writes
    pub fn retire(&self, token: SyncToken) -> io::Result<()> {
        let tracked = self.state.files.lock().remove(&token.0);
        match tracked {
            Some(tracked) if tracked.dirty => tracked.file.sync_data(),
            _ => Ok(()),
        }
    }

    /// Drop the bookkeeping of a file whose log was deleted, without
    /// syncing it
    pub fn forget(&self, token: SyncToken) {
        if self.state.files.lock().remove(&token.0).is_some() {
            debug!(file = token.0, "fsync tracking dropped");
        }
    }

    /// Sync every dirty tracked file now
    pub fn flush_all(&self) -> io::Result<usize> {
        first_error(self.state.flush_dirty(Duration::ZERO))
    }

    /// Number of tracked files
    pub fn tracked_files(&self) -> usize {
        self.state.files.lock().len()
    }

    /// Flush and stop the background flusher
    pub fn shutdown(&self) -> io::Result<()> {
        if let Some(handle) = self.daemon.lock().take() {
            self.state.running.store(false, Ordering::SeqCst);
            {
                let (lock, cvar) = &self.state.wakeup;
                *lock.lock() = true;
                cvar.notify_one();
            }
            let _ = handle.join();
        }
        first_error(self.state.flush_dirty(Duration::ZERO)).map(|_| ())
    }
}

impl Drop for Fsyncer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "final fsync failed");
        }
    }
}

fn run_flusher(state: Arc<FsyncState>, interval: Duration) {
    while state.running.load(Ordering::SeqCst) {
        {
            let (lock, cvar) = &state.wakeup;
            let mut stop = lock.lock();
            if !*stop {
                cvar.wait_for(&mut stop, interval);
            }
        }
        if !state.running.load(Ordering::SeqCst) {
            break;
        }
        // writers flush themselves while busy, this only covers files
        // that stayed dirty for a whole interval
        let (synced, failed) = state.flush_dirty(interval);
        if synced > 0 || !failed.is_empty() {
            debug!(synced, failed = failed.len(), "background fsync");
        }
    }
}
