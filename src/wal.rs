//! Write-ahead writer
//!
//! Couples a binlog writer with the side effect a command has once it is
//! logged, typically storing a published message in its topic. The side
//! effect runs as the after-write callback, so when it fails the binlog
//! record is rolled back and the command leaves no trace.

use crate::disk::writer::SegmentWriter;
use crate::error::Result;
use crate::notify::control::Position;
use tracing::info;

/// Runs after a record reached the log and before it is published
pub type CompleteFn<T> = Box<dyn FnMut(&T, Position) -> Result<()> + Send>;

/// Segment writer with a completion handler
pub struct WalWriter<T> {
    writer: SegmentWriter<T>,
    complete: CompleteFn<T>,
}

impl<T> WalWriter<T> {
    /// Wrap `writer`, running `complete` for every record written
    pub fn new(writer: SegmentWriter<T>, complete: CompleteFn<T>) -> Self {
        Self { writer, complete }
    }

    /// Append `record` and apply its side effect
    pub fn write(&mut self, record: &T) -> Result<u64> {
        let complete = &mut self.complete;
        let subject = self.writer.control().subject().to_string();
        self.writer.write_with(record, |position| {
            complete(record, position).map_err(|e| {
                info!(subject = %subject, position = %position, error = %e, "completion handler failed, rolling back");
                e
            })
        })
    }

    /// Underlying segment writer
    pub fn writer(&self) -> &SegmentWriter<T> {
        &self.writer
    }

    /// Published position of the log
    pub fn position(&self) -> Position {
        self.writer.position()
    }

    /// Sync and release the active segment
    pub fn close(&mut self) -> Result<()> {
        self.writer.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncPolicy;
    use crate::disk::fsync::Fsyncer;
    use crate::error::Error;
    use crate::notify::control::LogFileControl;
    use crate::test_support::{plain_encoder, sized, PlainRecord};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_completion_failure_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let control = LogFileControl::open("binlog", dir.path(), 0).unwrap();
        let syncer = Fsyncer::new(SyncPolicy::None).unwrap();
        let writer = SegmentWriter::new(dir.path(), control, 1 << 20, syncer, plain_encoder());

        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        let mut wal = WalWriter::new(
            writer,
            Box::new(move |record: &PlainRecord, position| {
                if record.id == 2 {
                    return Err(Error::Callback("topic deleted".into()));
                }
                sink.lock().push((record.id, position));
                Ok(())
            }),
        );

        wal.write(&sized(1, 50)).unwrap();
        assert!(wal.write(&sized(2, 50)).is_err());
        wal.write(&sized(3, 50)).unwrap();

        assert_eq!(
            *applied.lock(),
            vec![(1, Position::new(0, 0)), (3, Position::new(0, 50))]
        );
        assert_eq!(wal.position(), Position::new(0, 100));
        wal.close().unwrap();
    }
}
