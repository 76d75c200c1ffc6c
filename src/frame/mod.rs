//! Record framing
//!
//! Every record in a segment is laid out as
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬──────────────────┐
//! │ line length  │ command line                 │ payload          │
//! │ (u32 LE)     │ tab separated fields + '\n'  │ (declared bytes) │
//! └──────────────┴──────────────────────────────┴──────────────────┘
//! ```
//!
//! The codec only knows the length prefix. What the fields mean, and in
//! particular how long the payload is, is decided by a [`MessageParser`]
//! supplied by the owner of the log.

pub mod batch;
pub(crate) mod step;

use crate::error::{Error, Result};
use crate::notify::control::Position;
use crate::record::CommandKind;
use std::fmt::Display;
use std::str::FromStr;

/// Size of the command line length prefix
pub const LEN_PREFIX_SIZE: usize = 4;

/// Longest command line accepted by the decoder, newline included
pub const MAX_COMMAND_LINE_SIZE: usize = 64 * 1024;

/// Capabilities the engine needs from a decoded command line
pub trait RecordKind {
    /// Number of payload bytes following the command line
    fn payload_size(&self) -> usize;
    /// Application level id of the record
    fn record_id(&self) -> i64;
    /// Command the record carries
    fn kind(&self) -> CommandKind;
}

/// Plugin turning framed bytes into consumer records
///
/// The block reader drives one parser per cursor. It never builds
/// application records itself.
pub trait MessageParser {
    /// Decoded command line
    type Line: RecordKind;
    /// Record handed to the consumer
    type Message;

    /// Parse a command line. `line` excludes the length prefix and still
    /// carries its trailing newline.
    fn parse_command(&mut self, line: &[u8]) -> Result<Self::Line>;

    /// Build the consumer record. `next` is the position right after the
    /// record, i.e. where a consumer resumes.
    fn to_message(&mut self, line: Self::Line, raw_line: &[u8], payload: Vec<u8>, next: Position) -> Self::Message;

    /// Rewrite the resume position of an already built record
    fn change_message_pos(&self, message: &mut Self::Message, next: Position);
}

/// Builder for tab separated command lines
#[derive(Debug, Default)]
pub struct CommandLineBuilder {
    buf: Vec<u8>,
}

impl CommandLineBuilder {
    /// Start an empty command line
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    /// Append one field
    pub fn field(mut self, value: impl Display) -> Self {
        if !self.buf.is_empty() {
            self.buf.push(b'\t');
        }
        self.buf.extend_from_slice(value.to_string().as_bytes());
        self
    }

    /// Terminate the line with a newline and return it
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(b'\n');
        self.buf
    }
}

/// Reject text that would break the field layout
pub fn check_text_field(value: &str) -> Result<()> {
    if value.is_empty() || value.contains(['\t', '\n']) {
        return Err(Error::CommandLine(format!("invalid text field {:?}", value)));
    }
    Ok(())
}

/// Total framed size of a record
pub fn encoded_len(command_line_len: usize, payload_len: usize) -> usize {
    LEN_PREFIX_SIZE + command_line_len + payload_len
}

/// Append one framed record to `out`, returning the number of bytes added
pub fn encode_record(out: &mut Vec<u8>, command_line: &[u8], payload: &[u8]) -> Result<usize> {
    if command_line.last() != Some(&b'\n') {
        return Err(Error::CommandLine("command line must end with a newline".into()));
    }
    if command_line.len() > MAX_COMMAND_LINE_SIZE {
        return Err(Error::CommandLine(format!(
            "command line of {} bytes exceeds {}",
            command_line.len(),
            MAX_COMMAND_LINE_SIZE
        )));
    }
    out.reserve(encoded_len(command_line.len(), payload.len()));
    out.extend_from_slice(&(command_line.len() as u32).to_le_bytes());
    out.extend_from_slice(command_line);
    out.extend_from_slice(payload);
    Ok(encoded_len(command_line.len(), payload.len()))
}

/// Read the command line length out of a prefix, validating its bounds
pub(crate) fn read_line_len(prefix: [u8; LEN_PREFIX_SIZE]) -> std::result::Result<usize, String> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len == 0 {
        return Err("empty command line".into());
    }
    if len > MAX_COMMAND_LINE_SIZE {
        return Err(format!("command line length {} exceeds {}", len, MAX_COMMAND_LINE_SIZE));
    }
    Ok(len)
}

/// One record decoded from a contiguous buffer
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Command line including its newline
    pub command_line: &'a [u8],
    /// Payload bytes
    pub payload: &'a [u8],
    /// Bytes the record occupies in the buffer
    pub len: usize,
}

/// Decode the record at the start of `buf`
///
/// `payload_size` extracts the declared payload length from the command
/// line. Returns `None` when `buf` does not yet hold the whole record.
pub fn decode_record<'a, F>(buf: &'a [u8], payload_size: F) -> Result<Option<Frame<'a>>>
where
    F: FnOnce(&[u8]) -> Result<usize>,
{
    if buf.len() < LEN_PREFIX_SIZE {
        return Ok(None);
    }
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    prefix.copy_from_slice(&buf[..LEN_PREFIX_SIZE]);
    let line_len = read_line_len(prefix).map_err(Error::CommandLine)?;
    let line_end = LEN_PREFIX_SIZE + line_len;
    if buf.len() < line_end {
        return Ok(None);
    }
    let command_line = &buf[LEN_PREFIX_SIZE..line_end];
    let payload_len = payload_size(command_line)?;
    let end = line_end + payload_len;
    if buf.len() < end {
        return Ok(None);
    }
    Ok(Some(Frame {
        command_line,
        payload: &buf[line_end..end],
        len: end,
    }))
}

/// Split a command line into its fields, dropping the trailing newline
pub fn split_fields(line: &[u8]) -> Result<Vec<&str>> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let text = std::str::from_utf8(line)
        .map_err(|e| Error::CommandLine(format!("command line is not utf-8: {}", e)))?;
    Ok(text.split('\t').collect())
}

/// Parse field `index`, naming it in the error
pub fn parse_field<T: FromStr>(fields: &[&str], index: usize, name: &str) -> Result<T> {
    let raw = fields
        .get(index)
        .ok_or_else(|| Error::CommandLine(format!("missing field {}", name)))?;
    raw.parse()
        .map_err(|_| Error::CommandLine(format!("field {} has invalid value {:?}", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_field_size(line: &[u8]) -> Result<usize> {
        let fields = split_fields(line)?;
        parse_field(&fields, fields.len() - 1, "size")
    }

    #[test]
    fn test_round_trip() {
        let line = CommandLineBuilder::new().field(1700000000000u64).field("orders").field(5).finish();
        assert_eq!(line, b"1700000000000\torders\t5\n");

        let mut buf = Vec::new();
        let n = encode_record(&mut buf, &line, b"hello").unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(&buf[..4], &(line.len() as u32).to_le_bytes());

        let frame = decode_record(&buf, last_field_size).unwrap().unwrap();
        assert_eq!(frame.command_line, &line[..]);
        assert_eq!(frame.payload, b"hello");
        assert_eq!(frame.len, buf.len());
    }

    #[test]
    fn test_round_trip_various_payloads() {
        for payload in [&b""[..], b"x", b"\t\n\0binary\xff", &[7u8; 3000][..]] {
            let line = CommandLineBuilder::new().field("k").field(payload.len()).finish();
            let mut buf = Vec::new();
            encode_record(&mut buf, &line, payload).unwrap();
            let frame = decode_record(&buf, last_field_size).unwrap().unwrap();
            assert_eq!(frame.payload, payload);
            assert_eq!(frame.command_line, &line[..]);
        }
    }

    #[test]
    fn test_decode_needs_more() {
        let line = CommandLineBuilder::new().field(4).finish();
        let mut buf = Vec::new();
        encode_record(&mut buf, &line, b"abcd").unwrap();

        for cut in [0, 3, 5, buf.len() - 1] {
            assert!(decode_record(&buf[..cut], last_field_size).unwrap().is_none());
        }
    }

    #[test]
    fn test_decode_two_records_back_to_back() {
        let mut buf = Vec::new();
        encode_record(&mut buf, b"1\n", b"a").unwrap();
        encode_record(&mut buf, b"2\n", b"bb").unwrap();

        let first = decode_record(&buf, last_field_size).unwrap().unwrap();
        assert_eq!(first.payload, b"a");
        let second = decode_record(&buf[first.len..], last_field_size).unwrap().unwrap();
        assert_eq!(second.payload, b"bb");
        assert_eq!(first.len + second.len, buf.len());
    }

    #[test]
    fn test_decode_rejects_bad_prefix() {
        let buf = [0u8, 0, 0, 0, b'\n'];
        assert!(decode_record(&buf, last_field_size).is_err());

        let huge = ((MAX_COMMAND_LINE_SIZE + 1) as u32).to_le_bytes();
        assert!(decode_record(&huge, last_field_size).is_err());
    }

    #[test]
    fn test_encode_rejects_unterminated_line() {
        let mut buf = Vec::new();
        assert!(encode_record(&mut buf, b"no newline", b"").is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_field_helpers() {
        let fields = split_fields(b"12\tname\tx\n").unwrap();
        assert_eq!(fields, vec!["12", "name", "x"]);
        assert_eq!(parse_field::<i64>(&fields, 0, "ts").unwrap(), 12);
        assert!(parse_field::<i64>(&fields, 2, "size").is_err());
        assert!(parse_field::<i64>(&fields, 5, "missing").is_err());

        assert!(check_text_field("orders").is_ok());
        assert!(check_text_field("bad\tname").is_err());
        assert!(check_text_field("").is_err());
    }
}
