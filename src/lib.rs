//! segmq - Segmented append-only logs for a message broker
//!
//! # Overview
//!
//! segmq is the storage engine behind the broker's write-ahead binlog and
//! behind every topic's data log. A log is a directory of numbered segment
//! files (`0.log`, `1.log`, ...) with:
//!
//! 1. A single [`SegmentWriter`] that appends framed records, rotates
//!    segments at a size threshold and can roll a record back when a
//!    dependent side effect fails
//! 2. A [`LogFileControl`] that owns the published `(segment, size)` position
//!    and wakes registered readers whenever the log grows
//! 3. Any number of [`SegmentBlockReader`]s, each with a private cursor, that
//!    block until new records are visible and read them through mmap windows
//!
//! # Key Features
//!
//! - Readers never see a partially written record
//! - Coalesced per-reader wakeups that never block the writer
//! - Cooperative cancellation on client disconnect or topic deletion
//! - Pluggable fsync policy shared by all writers
//! - Startup repair of torn segment tails
//!
//! # Usage
//!
//! The engine is generic over the record layout: a writer takes an encode
//! function, a reader takes a [`MessageParser`]. The [`record`] module holds
//! the binlog and topic layouts the broker uses, [`TopicStore`] manages the
//! topic logs and [`WalWriter`] chains a binlog write to its side effect.

#![deny(missing_docs)]

pub mod config;
pub mod disk;
pub mod error;
pub mod frame;
pub mod notify;
pub mod record;
pub mod store;
pub mod wal;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{LogConfig, SyncPolicy};
pub use disk::fsync::Fsyncer;
pub use disk::reader::{ReaderOptions, SegmentBlockReader};
pub use disk::writer::{EncodeFn, SegmentWriter};
pub use error::{Error, Result};
pub use frame::{MessageParser, RecordKind};
pub use notify::control::{LogFileControl, Position, PositionGetter};
pub use notify::{CancelSignal, NotifyDevice, WaitOutcome};
pub use store::TopicStore;
pub use wal::WalWriter;

/// Re-exported record types used in the API
pub mod types {
    pub use crate::record::binlog::{BinlogCommand, BinlogEntry, BinlogRecord, RawRecord};
    pub use crate::record::topic::{TopicMessage, TopicRecord};
    pub use crate::record::{CommandKind, IdAllocator};
}
