//! Error types for the log engine
//!
//! All fallible operations return [`Result<T>`]. Errors fall into a few
//! families that callers treat differently:
//!
//! - `WaitTimeout`: not a failure, the caller sends a keep-alive and retries
//! - `Cancelled`: the client went away, nothing to report
//! - `LogInvalidated`: the topic was deleted, the subscription is over
//! - `Framing` / `CommandLine`: on-disk corruption or a writer bug, the
//!   reader session must end
//! - `Io`: propagated as is, the caller decides whether to retry

use std::io;
use thiserror::Error;

/// Result type for log engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the log engine
#[derive(Debug, Error)]
pub enum Error {
    /// An IO error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No new data arrived within the keep-alive timeout
    #[error("wait timeout")]
    WaitTimeout,

    /// The cancellation signal fired while waiting or reading
    #[error("peer closed")]
    Cancelled,

    /// The log was deleted while a reader was attached
    #[error("log writer closed, topic deleted")]
    LogInvalidated,

    /// A record could not be framed at the given position
    #[error("framing error at {segment_id}.{offset}: {reason}")]
    Framing {
        /// Segment holding the broken record
        segment_id: i64,
        /// Offset of the record start
        offset: i64,
        /// What went wrong
        reason: String,
    },

    /// A command line could not be parsed
    #[error("malformed command line: {0}")]
    CommandLine(String),

    /// A consumer with the same name is already attached to the log
    #[error("consumer {0} already registered")]
    DuplicateConsumer(String),

    /// A requested start position does not exist in the log
    #[error("invalid position {segment_id}.{offset}: {reason}")]
    InvalidPosition {
        /// Requested segment id
        segment_id: i64,
        /// Requested offset
        offset: i64,
        /// Why it was rejected
        reason: &'static str,
    },

    /// The writer's segment id went backwards relative to a reader
    #[error("segment id decreased: reader at {reader}, writer at {writer}")]
    SegmentRegression {
        /// Segment the reader is positioned on
        reader: i64,
        /// Segment the writer published
        writer: i64,
    },

    /// The after-write callback refused the record
    #[error("after-write callback failed: {0}")]
    Callback(String),

    /// The configuration is not usable
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A batch payload is malformed
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// The topic does not exist
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    /// The topic already exists
    #[error("topic already exists: {0}")]
    TopicExists(String),
}

impl Error {
    pub(crate) fn framing(segment_id: i64, offset: i64, reason: impl Into<String>) -> Self {
        Error::Framing {
            segment_id,
            offset,
            reason: reason.into(),
        }
    }

    /// True for the keep-alive signal
    pub fn is_wait_timeout(&self) -> bool {
        matches!(self, Error::WaitTimeout)
    }

    /// True when the reader session is over without a fault
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Cancelled | Error::LogInvalidated)
    }

    /// True when the log content itself is broken
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Framing { .. } | Error::CommandLine(_))
    }
}
