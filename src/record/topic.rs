//! Topic data-log records
//!
//! Every logical message gets its own record in the topic's log. The line
//! remembers where the message came from in the binlog, so a consumer
//! checkpoint can be traced back to the command that produced it.
//!
//! ```text
//! write_ts \t event_id \t save_ts \t payload_len \t index_of_batch \t src_segment \t src_offset \n
//! content \n
//! ```

use crate::disk::writer::EncodeFn;
use crate::error::{Error, Result};
use crate::frame::{encode_record, parse_field, split_fields, CommandLineBuilder, MessageParser, RecordKind};
use crate::notify::control::Position;
use crate::record::{now_millis, CommandKind};

/// One message to store in a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    /// Event id of the binlog command that carried the message
    pub event_id: i64,
    /// Message bytes
    pub content: Vec<u8>,
    /// Binlog position of that command
    pub src: Position,
}

/// Messages stored together by one save call
#[derive(Debug, Clone)]
pub struct TopicBatch {
    /// Time the batch was accepted
    pub save_ts: i64,
    /// Messages in publish order
    pub messages: Vec<TopicMessage>,
}

impl TopicBatch {
    /// Batch saved now
    pub fn now(messages: Vec<TopicMessage>) -> Self {
        Self {
            save_ts: now_millis(),
            messages,
        }
    }
}

/// Encode all messages of a batch, one record each
pub fn encode_topic_batch(batch: &TopicBatch, out: &mut Vec<u8>) -> Result<()> {
    let write_ts = now_millis();
    for (index, message) in batch.messages.iter().enumerate() {
        let line = CommandLineBuilder::new()
            .field(write_ts)
            .field(message.event_id)
            .field(batch.save_ts)
            .field(message.content.len() + 1)
            .field(index)
            .field(message.src.segment_id)
            .field(message.src.offset)
            .finish();
        encode_record(out, &line, &message.content)?;
        out.push(b'\n');
    }
    Ok(())
}

/// Encoder for a topic [`SegmentWriter`](crate::disk::writer::SegmentWriter)
pub fn topic_encoder() -> EncodeFn<TopicBatch> {
    Box::new(encode_topic_batch)
}

/// Decoded topic command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicCommand {
    /// Write time in milliseconds
    pub timestamp: i64,
    /// Event id
    pub event_id: i64,
    /// Time the batch was accepted
    pub save_ts: i64,
    /// Content length plus its newline
    pub payload_len: usize,
    /// Index of the message in its batch
    pub index_of_batch: usize,
    /// Binlog position the message came from
    pub src: Position,
}

impl RecordKind for TopicCommand {
    fn payload_size(&self) -> usize {
        self.payload_len
    }

    fn record_id(&self) -> i64 {
        self.event_id
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Pub
    }
}

/// Message handed to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRecord {
    /// Write time in milliseconds
    pub timestamp: i64,
    /// Event id
    pub event_id: i64,
    /// Index in the producer's batch
    pub index_of_batch: usize,
    /// Message bytes
    pub content: Vec<u8>,
    /// Binlog position the message came from
    pub src: Position,
    /// Where to resume after this message
    pub next: Position,
}

/// Parser for topic logs
#[derive(Debug, Default)]
pub struct TopicParser;

impl MessageParser for TopicParser {
    type Line = TopicCommand;
    type Message = TopicRecord;

    fn parse_command(&mut self, line: &[u8]) -> Result<TopicCommand> {
        let fields = split_fields(line)?;
        if fields.len() < 7 {
            return Err(Error::CommandLine(format!("topic line has {} fields, want 7", fields.len())));
        }
        let payload_len: usize = parse_field(&fields, 3, "payload_len")?;
        if payload_len == 0 {
            return Err(Error::CommandLine("topic record without content terminator".into()));
        }
        Ok(TopicCommand {
            timestamp: parse_field(&fields, 0, "timestamp")?,
            event_id: parse_field(&fields, 1, "event_id")?,
            save_ts: parse_field(&fields, 2, "save_ts")?,
            payload_len,
            index_of_batch: parse_field(&fields, 4, "index_of_batch")?,
            src: Position::new(
                parse_field(&fields, 5, "src_segment")?,
                parse_field(&fields, 6, "src_offset")?,
            ),
        })
    }

    fn to_message(&mut self, line: TopicCommand, _raw_line: &[u8], mut payload: Vec<u8>, next: Position) -> TopicRecord {
        if payload.last() == Some(&b'\n') {
            payload.pop();
        }
        TopicRecord {
            timestamp: line.timestamp,
            event_id: line.event_id,
            index_of_batch: line.index_of_batch,
            content: payload,
            src: line.src,
            next,
        }
    }

    fn change_message_pos(&self, message: &mut TopicRecord, next: Position) {
        message.next = next;
    }
}
