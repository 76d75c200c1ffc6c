//! Binlog records
//!
//! The binlog is the write-ahead log of the broker: every state changing
//! command is appended here first and replicated to slaves as raw blocks.
//!
//! ```text
//! write_ts_ms \t kind \t event_id \t topic \t payload_len \n  payload
//! ```
//!
//! Publish and delay-apply payloads carry one trailing newline, counted in
//! `payload_len`, so that a binlog stays readable with line tools.

use crate::config::LogConfig;
use crate::disk::fsync::Fsyncer;
use crate::disk::recover;
use crate::disk::writer::{EncodeFn, SegmentWriter};
use crate::error::{Error, Result};
use crate::frame::{
    check_text_field, encode_record, parse_field, split_fields, CommandLineBuilder, MessageParser, RecordKind,
    LEN_PREFIX_SIZE,
};
use crate::notify::control::Position;
use crate::record::{now_millis, CommandKind, IdAllocator};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Command to append to the binlog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogRecord {
    /// Command kind
    pub kind: CommandKind,
    /// Event id, allocated by the binlog owner
    pub event_id: i64,
    /// Topic the command applies to
    pub topic: String,
    /// Command body, may be empty for DDL
    pub payload: Vec<u8>,
}

impl BinlogRecord {
    /// New record of `kind` for `topic`
    pub fn new(kind: CommandKind, event_id: i64, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            event_id,
            topic: topic.into(),
            payload,
        }
    }
}

fn has_trailing_newline(kind: CommandKind) -> bool {
    matches!(kind, CommandKind::Pub | CommandKind::DelayApply)
}

/// Encode a binlog record into `out`
pub fn encode_binlog(record: &BinlogRecord, out: &mut Vec<u8>) -> Result<()> {
    check_text_field(&record.topic)?;
    let newline = has_trailing_newline(record.kind);
    let payload_len = record.payload.len() + usize::from(newline);
    let line = CommandLineBuilder::new()
        .field(now_millis())
        .field(record.kind.code())
        .field(record.event_id)
        .field(&record.topic)
        .field(payload_len)
        .finish();
    encode_record(out, &line, &record.payload)?;
    if newline {
        out.push(b'\n');
    }
    Ok(())
}

/// Encoder for a binlog [`SegmentWriter`]
pub fn binlog_encoder() -> EncodeFn<BinlogRecord> {
    Box::new(encode_binlog)
}

/// Decoded binlog command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogCommand {
    /// Write time in milliseconds
    pub timestamp: i64,
    /// Command kind
    pub kind: CommandKind,
    /// Event id
    pub event_id: i64,
    /// Topic name
    pub topic: String,
    /// Payload bytes including a trailing newline when present
    pub payload_len: usize,
}

impl RecordKind for BinlogCommand {
    fn payload_size(&self) -> usize {
        self.payload_len
    }

    fn record_id(&self) -> i64 {
        self.event_id
    }

    fn kind(&self) -> CommandKind {
        self.kind
    }
}

fn parse_binlog_command(line: &[u8]) -> Result<BinlogCommand> {
    let fields = split_fields(line)?;
    if fields.len() < 5 {
        return Err(Error::CommandLine(format!(
            "binlog line has {} fields, want 5",
            fields.len()
        )));
    }
    let code: i64 = parse_field(&fields, 1, "kind")?;
    let kind = CommandKind::from_code(code)
        .ok_or_else(|| Error::CommandLine(format!("unknown command kind {}", code)))?;
    Ok(BinlogCommand {
        timestamp: parse_field(&fields, 0, "timestamp")?,
        kind,
        event_id: parse_field(&fields, 2, "event_id")?,
        topic: fields[3].to_string(),
        payload_len: parse_field(&fields, 4, "payload_len")?,
    })
}

/// Binlog record handed to command appliers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogEntry {
    /// Command line
    pub command: BinlogCommand,
    /// Payload without its trailing newline
    pub payload: Vec<u8>,
    /// Position right after the record
    pub next: Position,
}

/// Parser yielding decoded [`BinlogEntry`] records
#[derive(Debug, Default)]
pub struct BinlogParser;

impl MessageParser for BinlogParser {
    type Line = BinlogCommand;
    type Message = BinlogEntry;

    fn parse_command(&mut self, line: &[u8]) -> Result<BinlogCommand> {
        parse_binlog_command(line)
    }

    fn to_message(&mut self, line: BinlogCommand, _raw_line: &[u8], mut payload: Vec<u8>, next: Position) -> BinlogEntry {
        if has_trailing_newline(line.kind) && payload.last() == Some(&b'\n') {
            payload.pop();
        }
        BinlogEntry {
            command: line,
            payload,
            next,
        }
    }

    fn change_message_pos(&self, message: &mut BinlogEntry, next: Position) {
        message.next = next;
    }
}

/// Framed binlog record exactly as stored, for replication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Length prefix, command line and payload
    pub bytes: Vec<u8>,
    /// Decoded command line
    pub command: BinlogCommand,
    /// Position right after the record
    pub next: Position,
}

/// Parser yielding [`RawRecord`] blocks
#[derive(Debug, Default)]
pub struct RawRecordParser;

impl MessageParser for RawRecordParser {
    type Line = BinlogCommand;
    type Message = RawRecord;

    fn parse_command(&mut self, line: &[u8]) -> Result<BinlogCommand> {
        parse_binlog_command(line)
    }

    fn to_message(&mut self, line: BinlogCommand, raw_line: &[u8], payload: Vec<u8>, next: Position) -> RawRecord {
        let mut bytes = Vec::with_capacity(LEN_PREFIX_SIZE + raw_line.len() + payload.len());
        bytes.extend_from_slice(&(raw_line.len() as u32).to_le_bytes());
        bytes.extend_from_slice(raw_line);
        bytes.extend_from_slice(&payload);
        RawRecord {
            bytes,
            command: line,
            next,
        }
    }

    fn change_message_pos(&self, message: &mut RawRecord, next: Position) {
        message.next = next;
    }
}

/// Open the binlog in `dir` after repairing a crashed tail, returning the
/// writer and an id allocator that continues after the last stored event
pub fn open_binlog(
    dir: impl Into<PathBuf>,
    config: &LogConfig,
    syncer: Arc<Fsyncer>,
) -> Result<(SegmentWriter<BinlogRecord>, IdAllocator)> {
    let dir = dir.into();
    fs::create_dir_all(&dir)?;
    recover::drop_trailing_empty(&dir)?;
    recover::truncate_torn_tail(&dir, &mut BinlogParser)?;
    let last = recover::read_last_record(&dir, &mut BinlogParser)?;
    let ids = IdAllocator::after(last.as_ref().map(|entry| entry.command.event_id));
    info!(dir = %dir.display(), next_event_id = ids.peek(), "binlog recovered");

    let writer = SegmentWriter::open("binlog", dir, config, syncer, binlog_encoder())?;
    Ok((writer, ids))
}
