//! Segment writer
//!
//! The single writer of a log. Each call to [`SegmentWriter::write`]
//! encodes one record, appends it to the active segment and only then
//! publishes the new size to readers. Segments rotate once a write pushes
//! them to the configured soft maximum; the next segment file is created
//! lazily by the following write.
//!
//! An after-write callback may veto a record. The writer then truncates the
//! segment back to its previous size before returning the callback's error,
//! so a segment never holds a record whose dependent side effect failed.

use crate::config::LogConfig;
use crate::disk::fsync::{Fsyncer, SyncToken};
use crate::disk::segment_path;
use crate::error::Result;
use crate::notify::control::{LogFileControl, Position};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Serializes one record into the output buffer
pub type EncodeFn<T> = Box<dyn Fn(&T, &mut Vec<u8>) -> Result<()> + Send + Sync>;

struct ActiveSegment {
    id: i64,
    file: File,
    token: SyncToken,
}

/// Appends records of type `T` to a segmented log
pub struct SegmentWriter<T> {
    dir: PathBuf,
    max_segment_size: u64,
    control: Arc<LogFileControl>,
    syncer: Arc<Fsyncer>,
    encode: EncodeFn<T>,
    active: Option<ActiveSegment>,
    buf: Vec<u8>,
    last_write: Option<Instant>,
}

impl<T> SegmentWriter<T> {
    /// Create a writer publishing through `control`
    pub fn new(
        dir: impl Into<PathBuf>,
        control: Arc<LogFileControl>,
        max_segment_size: u64,
        syncer: Arc<Fsyncer>,
        encode: EncodeFn<T>,
    ) -> Self {
        Self {
            dir: dir.into(),
            max_segment_size,
            control,
            syncer,
            encode,
            active: None,
            buf: Vec::with_capacity(4096),
            last_write: None,
        }
    }

    /// Open the log stored in `dir`, creating the directory if needed.
    /// Writing resumes in a fresh segment after the existing ones.
    pub fn open(
        subject: &str,
        dir: impl Into<PathBuf>,
        config: &LogConfig,
        syncer: Arc<Fsyncer>,
        encode: EncodeFn<T>,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let control = LogFileControl::open(subject, &dir, config.log_sample)?;
        info!(subject, dir = %dir.display(), position = %control.get(), "segment writer opened");
        Ok(Self::new(dir, control, config.max_segment_size, syncer, encode))
    }

    /// Directory of the log
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Position authority readers register with
    pub fn control(&self) -> &Arc<LogFileControl> {
        &self.control
    }

    /// Published position
    pub fn position(&self) -> Position {
        self.control.get()
    }

    /// Time since the last published write
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_write.map(|t| t.elapsed())
    }

    /// Append one record. Returns the number of bytes written, 0 when the
    /// encoder produced nothing.
    pub fn write(&mut self, record: &T) -> Result<u64> {
        self.write_inner(record, None::<fn(Position) -> Result<()>>)
    }

    /// Append one record and run `after_write` with the position the
    /// record starts at, before the record is published. If the callback
    /// fails the record is removed again and the error returned.
    pub fn write_with<F>(&mut self, record: &T, after_write: F) -> Result<u64>
    where
        F: FnOnce(Position) -> Result<()>,
    {
        self.write_inner(record, Some(after_write))
    }

    fn write_inner<F>(&mut self, record: &T, after_write: Option<F>) -> Result<u64>
    where
        F: FnOnce(Position) -> Result<()>,
    {
        let position = self.control.get();
        let mut segment = match self.active.take() {
            Some(segment) => segment,
            None => self.open_segment(position.segment_id)?,
        };
        debug_assert_eq!(segment.id, position.segment_id);

        self.buf.clear();
        if let Err(e) = (self.encode)(record, &mut self.buf) {
            self.active = Some(segment);
            return Err(e);
        }
        if self.buf.is_empty() {
            self.active = Some(segment);
            return Ok(0);
        }
        let written = self.buf.len() as u64;
        let start = position.offset as u64;

        let appended = segment
            .file
            .write_all(&self.buf)
            .and_then(|_| self.syncer.after_write(&segment.token, &segment.file));
        if let Err(e) = appended {
            warn!(subject = self.control.subject(), position = %position, error = %e, "append failed, rolling back");
            rollback(&mut segment.file, start, self.control.subject());
            self.active = Some(segment);
            return Err(e.into());
        }

        if let Some(after_write) = after_write {
            if let Err(e) = after_write(position) {
                warn!(subject = self.control.subject(), position = %position, error = %e, "after-write callback failed, rolling back");
                rollback(&mut segment.file, start, self.control.subject());
                self.active = Some(segment);
                return Err(e);
            }
        }

        self.last_write = Some(Instant::now());
        let size = start + written;
        if size >= self.max_segment_size {
            let ActiveSegment { id, file, token } = segment;
            drop(file);
            self.control.set(Position::segment_start(id + 1));
            debug!(subject = self.control.subject(), segment_id = id, size, "segment rotated");
            if let Err(e) = self.syncer.retire(token) {
                warn!(subject = self.control.subject(), segment_id = id, error = %e, "fsync of rotated segment failed");
            }
        } else {
            self.control.set(Position::new(segment.id, size as i64));
            self.active = Some(segment);
        }
        self.control.notify_growth();
        Ok(written)
    }

    fn open_segment(&self, id: i64) -> Result<ActiveSegment> {
        let path = segment_path(&self.dir, id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let token = self.syncer.track(&file)?;
        debug!(subject = self.control.subject(), segment_id = id, "segment created");
        Ok(ActiveSegment { id, file, token })
    }

    /// Sync and release the active segment
    pub fn close(&mut self) -> Result<()> {
        if let Some(segment) = self.active.take() {
            segment.file.sync_all()?;
            self.syncer.retire(segment.token)?;
        }
        Ok(())
    }

    /// Release the active segment without syncing it, for a log that is
    /// being deleted
    pub fn abandon(&mut self) {
        if let Some(segment) = self.active.take() {
            self.syncer.forget(segment.token);
        }
    }
}

impl<T> Drop for SegmentWriter<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(subject = self.control.subject(), error = %e, "closing segment writer failed");
        }
    }
}

/// Cut the segment back to `offset`. A segment that cannot be restored no
/// longer matches the side effects recorded elsewhere, so the process stops.
fn rollback(file: &mut File, offset: u64, subject: &str) {
    let restored = file
        .seek(SeekFrom::Start(offset))
        .and_then(|pos| file.set_len(pos));
    if let Err(e) = restored {
        error!(subject, offset, error = %e, "segment rollback failed, aborting");
        std::process::abort();
    }
}
