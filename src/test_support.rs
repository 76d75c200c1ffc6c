//! Minimal record layout used by the engine's own tests

use crate::disk::writer::EncodeFn;
use crate::error::Result;
use crate::frame::{encode_record, parse_field, split_fields, MessageParser, RecordKind, LEN_PREFIX_SIZE};
use crate::notify::control::Position;
use crate::record::CommandKind;

/// Record with line `id\tlen\n`
#[derive(Debug, Clone)]
pub struct PlainRecord {
    pub id: i64,
    pub payload: Vec<u8>,
    /// encoder emits nothing
    pub skip: bool,
}

fn plain_line(id: i64, len: usize) -> Vec<u8> {
    format!("{}\t{}\n", id, len).into_bytes()
}

pub fn plain_encoder() -> EncodeFn<PlainRecord> {
    Box::new(|record: &PlainRecord, out: &mut Vec<u8>| {
        if record.skip {
            return Ok(());
        }
        encode_record(out, &plain_line(record.id, record.payload.len()), &record.payload)?;
        Ok(())
    })
}

/// Record whose framed size is exactly `total` bytes
pub fn sized(id: i64, total: usize) -> PlainRecord {
    let mut len = total.saturating_sub(LEN_PREFIX_SIZE + plain_line(id, 0).len());
    while len > 0 && LEN_PREFIX_SIZE + plain_line(id, len).len() + len > total {
        len -= 1;
    }
    assert_eq!(LEN_PREFIX_SIZE + plain_line(id, len).len() + len, total, "cannot size record {}", id);
    PlainRecord {
        id,
        payload: vec![id as u8; len],
        skip: false,
    }
}

#[derive(Debug)]
pub struct PlainLine {
    id: i64,
    size: usize,
}

impl RecordKind for PlainLine {
    fn payload_size(&self) -> usize {
        self.size
    }

    fn record_id(&self) -> i64 {
        self.id
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Pub
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainMessage {
    pub id: i64,
    pub payload: Vec<u8>,
    pub next: Position,
}

pub struct PlainParser;

impl MessageParser for PlainParser {
    type Line = PlainLine;
    type Message = PlainMessage;

    fn parse_command(&mut self, line: &[u8]) -> Result<PlainLine> {
        let fields = split_fields(line)?;
        Ok(PlainLine {
            id: parse_field(&fields, 0, "id")?,
            size: parse_field(&fields, 1, "size")?,
        })
    }

    fn to_message(&mut self, line: PlainLine, _raw_line: &[u8], payload: Vec<u8>, next: Position) -> PlainMessage {
        PlainMessage {
            id: line.id,
            payload,
            next,
        }
    }

    fn change_message_pos(&self, message: &mut PlainMessage, next: Position) {
        message.next = next;
    }
}
