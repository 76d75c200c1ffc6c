//! Published log position and reader registry
//!
//! [`LogFileControl`] is the single source of truth for how far a log has
//! been written. The writer publishes `(segment_id, size)` after each
//! complete append; readers snapshot it through a [`PositionGetter`] and
//! never read past it.
//!
//! The position and the registry of reader devices live behind separate
//! locks: registering or unregistering a reader never contends with the
//! writer publishing a new size.

use crate::disk;
use crate::error::{Error, Result};
use crate::notify::NotifyDevice;
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A position in a segmented log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    /// Segment file id
    pub segment_id: i64,
    /// Byte offset inside the segment
    pub offset: i64,
}

impl Position {
    /// Create a new position
    pub fn new(segment_id: i64, offset: i64) -> Self {
        Self { segment_id, offset }
    }

    /// First byte of a segment
    pub fn segment_start(segment_id: i64) -> Self {
        Self { segment_id, offset: 0 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.segment_id, self.offset)
    }
}

#[derive(Debug, Default)]
struct Notifier {
    waiters: HashMap<String, Arc<NotifyDevice>>,
    pulses: u64,
}

/// Log position authority for one log
#[derive(Debug)]
pub struct LogFileControl {
    subject: String,
    position: CachePadded<RwLock<Position>>,
    notifier: Mutex<Notifier>,
    invalid: AtomicBool,
    log_sample: u64,
}

impl LogFileControl {
    /// Create an authority publishing `position`
    pub fn new(subject: impl Into<String>, position: Position, log_sample: u64) -> Arc<Self> {
        Arc::new(Self {
            subject: subject.into(),
            position: CachePadded::new(RwLock::new(position)),
            notifier: Mutex::new(Notifier::default()),
            invalid: AtomicBool::new(false),
            log_sample,
        })
    }

    /// Create an authority for the log stored in `dir`
    ///
    /// A reopened log always continues in a fresh segment after the
    /// highest existing one.
    pub fn open(subject: impl Into<String>, dir: &Path, log_sample: u64) -> Result<Arc<Self>> {
        let next_id = disk::next_segment_id(dir)?;
        Ok(Self::new(subject, Position::segment_start(next_id), log_sample))
    }

    /// Name of the log, used in log lines
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish the writer's new position. Only the writer calls this.
    pub fn set(&self, position: Position) {
        let mut current = self.position.write();
        debug_assert!(position >= *current, "published position went backwards");
        *current = position;
    }

    /// Snapshot of the published position
    pub fn get(&self) -> Position {
        *self.position.read()
    }

    /// Attach a reader device under a unique name
    pub fn register(self: &Arc<Self>, name: &str, device: Arc<NotifyDevice>) -> Result<PositionGetter> {
        let mut notifier = self.notifier.lock();
        // checked under the registry lock so invalidate cannot miss this device
        if self.is_invalid() {
            return Err(Error::LogInvalidated);
        }
        if notifier.waiters.contains_key(name) {
            return Err(Error::DuplicateConsumer(name.to_string()));
        }
        notifier.waiters.insert(name.to_string(), device);
        debug!(subject = %self.subject, consumer = name, "reader registered");
        Ok(PositionGetter {
            control: Arc::clone(self),
        })
    }

    /// Detach a reader. Unknown names are ignored.
    pub fn unregister(&self, name: &str) {
        if self.notifier.lock().waiters.remove(name).is_some() {
            debug!(subject = %self.subject, consumer = name, "reader unregistered");
        }
    }

    /// Number of attached readers
    pub fn reader_count(&self) -> usize {
        self.notifier.lock().waiters.len()
    }

    /// Pulse every registered reader without blocking
    pub fn notify_growth(&self) {
        let mut notifier = self.notifier.lock();
        notifier.pulses += 1;
        let sampled = self.log_sample > 0 && notifier.pulses % self.log_sample == 0;
        for (name, device) in notifier.waiters.iter() {
            if device.notify() && sampled {
                debug!(subject = %self.subject, consumer = %name, count = notifier.pulses, "writer notified reader");
            }
        }
    }

    /// Mark the log deleted and wake every reader for good
    pub fn invalidate(&self) {
        let notifier = self.notifier.lock();
        self.invalid.store(true, Ordering::Release);
        info!(subject = %self.subject, readers = notifier.waiters.len(), "log invalidated");
        for device in notifier.waiters.values() {
            device.invalidate();
        }
    }

    /// Whether [`invalidate`](Self::invalidate) was called
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }
}

/// Read-only view of the published position handed to a reader
#[derive(Debug, Clone)]
pub struct PositionGetter {
    control: Arc<LogFileControl>,
}

impl PositionGetter {
    /// Snapshot of the published position
    pub fn get(&self) -> Position {
        self.control.get()
    }
}
