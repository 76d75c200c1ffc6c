//! Blocking block reader over a segmented log
//!
//! Each consumer owns one [`SegmentBlockReader`]: a private cursor, its own
//! file handle and a [`NotifyDevice`] registered with the log's
//! [`LogFileControl`]. A call to [`read`](SegmentBlockReader::read) walks
//! through these stages:
//!
//! 1. wait for the cursor's segment file to exist
//! 2. wait for the published size to move past the cursor
//! 3. map the newly visible bytes and decode up to `max_batch` whole records
//! 4. at the end of a segment that will never grow again, move on to the
//!    next one and point the last returned record at it
//!
//! Waiting ends on new data, deletion of the log, cancellation by the
//! client, or the keep-alive timeout, whichever comes first.

use crate::config::LogConfig;
use crate::disk::segment_path;
use crate::disk::window::ReadContext;
use crate::error::{Error, Result};
use crate::frame::step::{CommandStep, PayloadStep};
use crate::frame::{MessageParser, RecordKind};
use crate::notify::control::{LogFileControl, Position, PositionGetter};
use crate::notify::{CancelSignal, NotifyDevice, WaitOutcome};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settings of one reader
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Consumer name, unique within the log
    pub whoami: String,
    /// Maximum records per read call
    pub max_batch: usize,
    /// Rotation threshold of the writer
    pub max_segment_size: u64,
    /// Keep-alive timeout of a blocked read
    pub wait_timeout: Duration,
    /// Size of one mmap window
    pub mmap_window: u64,
    /// Log every N-th successful wait, 0 disables
    pub log_sample: u64,
}

impl ReaderOptions {
    /// Options for consumer `whoami` taken from the log configuration
    pub fn from_config(whoami: impl Into<String>, config: &LogConfig) -> Self {
        Self {
            whoami: whoami.into(),
            max_batch: config.read_batch_size,
            max_segment_size: config.max_segment_size,
            wait_timeout: config.wait_timeout(),
            mmap_window: config.mmap_window,
            log_sample: config.log_sample,
        }
    }

    /// Override the batch size
    pub fn with_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }
}

/// Private cursor of a reader
#[derive(Debug)]
struct Cursor {
    segment_id: i64,
    offset: i64,
    file: Option<File>,
    /// bytes of the segment the reader may consume
    file_size: u64,
    /// the segment will never grow again
    fixed: bool,
    max_segment_size: u64,
}

impl Cursor {
    fn is_eof(&self) -> bool {
        self.file.is_some()
            && self.offset as u64 == self.file_size
            && (self.fixed || self.file_size >= self.max_segment_size)
    }

    fn advance(&mut self) {
        self.file = None;
        self.fixed = false;
        self.file_size = 0;
        self.offset = 0;
        self.segment_id += 1;
    }

    fn position(&self) -> Position {
        Position::new(self.segment_id, self.offset)
    }
}

enum OpenOutcome {
    Opened,
    Skipped,
    Missing,
}

/// Per-consumer blocking reader
pub struct SegmentBlockReader<P: MessageParser> {
    dir: PathBuf,
    control: Arc<LogFileControl>,
    getter: PositionGetter,
    device: Arc<NotifyDevice>,
    options: ReaderOptions,
    parser: P,
    cursor: Cursor,
    registered: bool,
    wait_count: u64,
}

impl<P: MessageParser> SegmentBlockReader<P> {
    /// Attach a reader to the log in `dir`
    ///
    /// `start` receives the published position and returns where the
    /// consumer wants to begin. Positions that do not exist in the log are
    /// rejected; the end of an older segment is moved to the start of the
    /// next one.
    pub fn open<F>(
        control: Arc<LogFileControl>,
        dir: impl Into<PathBuf>,
        options: ReaderOptions,
        parser: P,
        start: F,
    ) -> Result<Self>
    where
        F: FnOnce(Position) -> Result<Position>,
    {
        let device = Arc::new(NotifyDevice::new());
        let getter = control.register(&options.whoami, device.clone())?;
        let max_segment_size = options.max_segment_size;
        // from here on dropping the reader unregisters it
        let mut reader = Self {
            dir: dir.into(),
            control,
            getter,
            device,
            options,
            parser,
            cursor: Cursor {
                segment_id: 0,
                offset: 0,
                file: None,
                file_size: 0,
                fixed: false,
                max_segment_size,
            },
            registered: true,
            wait_count: 0,
        };
        let published = reader.getter.get();
        let start = start(published)?;
        reader.seek_start(published, start)?;
        debug!(
            subject = reader.control.subject(),
            consumer = %reader.options.whoami,
            position = %reader.cursor.position(),
            "reader attached"
        );
        Ok(reader)
    }

    fn seek_start(&mut self, published: Position, start: Position) -> Result<()> {
        let invalid = |reason| Error::InvalidPosition {
            segment_id: start.segment_id,
            offset: start.offset,
            reason,
        };
        if start.segment_id < 0 || start.offset < 0 {
            return Err(invalid("negative position"));
        }
        if start > published {
            return Err(invalid("ahead of the writer"));
        }
        let size = match fs::metadata(segment_path(&self.dir, start.segment_id)) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let mut start = start;
        match size {
            None if start.offset > 0 => return Err(invalid("segment does not exist")),
            Some(size) if start.segment_id < published.segment_id && start.offset as u64 == size => {
                start = Position::segment_start(start.segment_id + 1);
            }
            Some(size) if start.offset as u64 > size => return Err(invalid("offset beyond segment end")),
            _ => {}
        }

        self.cursor.segment_id = start.segment_id;
        self.cursor.offset = start.offset;
        self.open_segment()?;
        if self.cursor.file.is_some() && self.cursor.offset as u64 > self.cursor.file_size {
            return Err(invalid("offset beyond published size"));
        }
        Ok(())
    }

    /// Consumer name
    pub fn whoami(&self) -> &str {
        &self.options.whoami
    }

    /// Position the next read starts from
    pub fn position(&self) -> Position {
        self.cursor.position()
    }

    /// Directory of the log
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Block until records are available and return up to `max_batch` of
    /// them.
    ///
    /// Errors `WaitTimeout` when nothing arrived within the keep-alive
    /// timeout, `Cancelled` when `cancel` fired and `LogInvalidated` once
    /// the log was deleted.
    pub fn read(&mut self, cancel: &CancelSignal) -> Result<Vec<P::Message>> {
        if !self.registered {
            return Err(Error::Cancelled);
        }
        cancel.watch(&self.device);
        if self.device.is_invalidated() {
            return Err(Error::LogInvalidated);
        }
        loop {
            self.wait_file(cancel)?;
            if self.wait_position(cancel)? {
                return self.read_core(cancel);
            }
        }
    }

    fn wait_file(&mut self, cancel: &CancelSignal) -> Result<()> {
        loop {
            if self.cursor.file.is_none() {
                match self.open_segment()? {
                    OpenOutcome::Opened => {}
                    OpenOutcome::Skipped => continue,
                    OpenOutcome::Missing => {
                        self.wait(cancel, "file")?;
                        continue;
                    }
                }
            }
            // an empty segment that was already rotated past
            if self.cursor.is_eof() {
                self.cursor.advance();
                continue;
            }
            return Ok(());
        }
    }

    /// Returns false when the segment turned out to be finished and the
    /// cursor moved on
    fn wait_position(&mut self, cancel: &CancelSignal) -> Result<bool> {
        loop {
            if (self.cursor.offset as u64) < self.cursor.file_size {
                return Ok(true);
            }
            if self.cursor.is_eof() {
                self.cursor.advance();
                return Ok(false);
            }
            self.wait(cancel, "position")?;
            self.refresh_size()?;
        }
    }

    fn open_segment(&mut self) -> Result<OpenOutcome> {
        let id = self.cursor.segment_id;
        let file = match File::open(segment_path(&self.dir, id)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let published = self.getter.get();
                if published.segment_id > id && self.cursor.offset == 0 {
                    warn!(
                        subject = self.control.subject(),
                        consumer = %self.options.whoami,
                        segment_id = id,
                        "segment removed, skipping to the next one"
                    );
                    self.cursor.advance();
                    return Ok(OpenOutcome::Skipped);
                }
                return Ok(OpenOutcome::Missing);
            }
            Err(e) => return Err(e.into()),
        };
        self.cursor.file = Some(file);
        self.refresh_size()?;
        Ok(OpenOutcome::Opened)
    }

    /// Re-read how far the cursor's segment may be consumed
    fn refresh_size(&mut self) -> Result<()> {
        let Some(file) = self.cursor.file.as_ref() else {
            return Ok(());
        };
        let published = self.getter.get();
        let id = self.cursor.segment_id;
        if published.segment_id > id {
            // rotated: the writer finished this file before publishing a newer id
            self.cursor.file_size = file.metadata()?.len();
            self.cursor.fixed = true;
        } else if published.segment_id == id {
            self.cursor.file_size = published.offset as u64;
            self.cursor.fixed = self.cursor.file_size >= self.cursor.max_segment_size;
        } else {
            return Err(Error::SegmentRegression {
                reader: id,
                writer: published.segment_id,
            });
        }
        Ok(())
    }

    fn wait(&mut self, cancel: &CancelSignal, stage: &'static str) -> Result<()> {
        let subject = self.control.subject();
        let consumer = self.options.whoami.as_str();
        let position = self.cursor.position();
        match self.device.wait(self.options.wait_timeout, cancel) {
            WaitOutcome::Notified => {
                self.wait_count += 1;
                if self.options.log_sample > 0 && self.wait_count % self.options.log_sample == 0 {
                    debug!(subject, consumer, stage, position = %position, count = self.wait_count, "reader woke up");
                }
                Ok(())
            }
            WaitOutcome::Timeout => {
                debug!(subject, consumer, stage, position = %position, "reader wait timed out");
                Err(Error::WaitTimeout)
            }
            WaitOutcome::Cancelled => {
                info!(subject, consumer, stage, position = %position, "reader cancelled by client");
                Err(Error::Cancelled)
            }
            WaitOutcome::Invalidated => {
                info!(subject, consumer, stage, position = %position, "log deleted while reader waited");
                Err(Error::LogInvalidated)
            }
        }
    }

    fn read_core(&mut self, cancel: &CancelSignal) -> Result<Vec<P::Message>> {
        let segment_id = self.cursor.segment_id;
        let limit = self.cursor.file_size;
        let Some(file) = self.cursor.file.as_ref() else {
            return Ok(Vec::new());
        };

        let mut ctx = ReadContext::new(file, self.cursor.offset as u64, self.options.mmap_window);
        let mut messages = Vec::new();
        let mut command = CommandStep::default();
        let mut payload = PayloadStep::default();
        let mut line: Option<P::Line> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.device.is_invalidated() {
                return Err(Error::LogInvalidated);
            }

            if line.is_some() && payload.is_complete() {
                if let Some(parsed) = line.take() {
                    let next = Position::new(segment_id, ctx.pos() as i64);
                    let message = self.parser.to_message(parsed, command.line(), payload.take(), next);
                    messages.push(message);
                    self.cursor.offset = next.offset;
                    command.reset();
                }
                if messages.len() >= self.options.max_batch {
                    break;
                }
                continue;
            }

            if ctx.pos() >= limit {
                break;
            }
            ctx.next(limit)?;

            if line.is_none() {
                let record_start = self.cursor.offset;
                let (n, done) = command
                    .accept(ctx.data())
                    .map_err(|reason| Error::framing(segment_id, record_start, reason))?;
                ctx.consume(n);
                if done {
                    let parsed = self.parser.parse_command(command.line()).map_err(|e| match e {
                        Error::CommandLine(reason) => Error::framing(segment_id, record_start, reason),
                        other => other,
                    })?;
                    let left = limit.saturating_sub(record_start as u64 + command.framed_len() as u64);
                    if parsed.payload_size() as u64 > left {
                        return Err(Error::framing(
                            segment_id,
                            record_start,
                            format!(
                                "record {} declares {} payload bytes past published size {}",
                                parsed.record_id(),
                                parsed.payload_size(),
                                limit
                            ),
                        ));
                    }
                    payload.start(parsed.payload_size());
                    line = Some(parsed);
                }
            } else {
                let (n, _) = payload.accept(ctx.data());
                ctx.consume(n);
            }
        }
        // release the mapping and the file borrow before moving the cursor
        drop(ctx);

        if command.in_progress() || payload.in_progress() {
            return Err(Error::framing(
                segment_id,
                self.cursor.offset,
                format!("record cut at published size {}", limit),
            ));
        }

        if self.cursor.is_eof() {
            debug!(
                subject = self.control.subject(),
                consumer = %self.options.whoami,
                segment_id,
                "segment fully read"
            );
            self.cursor.advance();
            if let Some(last) = messages.last_mut() {
                self.parser
                    .change_message_pos(last, Position::segment_start(self.cursor.segment_id));
            }
        }
        if self.device.is_invalidated() {
            return Err(Error::LogInvalidated);
        }
        Ok(messages)
    }

    /// Release the file handle and detach from the log. Idempotent.
    pub fn close(&mut self) {
        if self.registered {
            self.control.unregister(&self.options.whoami);
            self.registered = false;
        }
        self.cursor.file = None;
    }
}

impl<P: MessageParser> Drop for SegmentBlockReader<P> {
    fn drop(&mut self) {
        self.close();
    }
}
