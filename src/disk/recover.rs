//! Startup repair of a log directory
//!
//! A crash can leave the newest segment with a record whose bytes only
//! partially reached the disk, or leave freshly created segments empty.
//! Writers call into this module before reopening a log so that every
//! byte a reader can see belongs to a whole record.

use crate::disk::{list_segments, segment_path};
use crate::error::{Error, Result};
use crate::frame::{read_line_len, MessageParser, RecordKind, LEN_PREFIX_SIZE};
use crate::notify::control::Position;
use crate::record::CommandKind;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

/// Result of scanning one segment from its start
struct Scan<M> {
    records: usize,
    /// end of the last whole record
    end: u64,
    last: Option<M>,
    last_id: Option<i64>,
    last_kind: Option<CommandKind>,
    torn: bool,
}

/// Read into `buf` until it is full or the file ends
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

fn scan_segment<P: MessageParser>(dir: &Path, segment_id: i64, parser: &mut P) -> Result<Scan<P::Message>> {
    let file = File::open(segment_path(dir, segment_id))?;
    let size = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut scan = Scan {
        records: 0,
        end: 0,
        last: None,
        last_id: None,
        last_kind: None,
        torn: false,
    };

    loop {
        let mut prefix = [0u8; LEN_PREFIX_SIZE];
        let n = fill(&mut reader, &mut prefix)?;
        if n == 0 {
            return Ok(scan);
        }
        if n < LEN_PREFIX_SIZE {
            scan.torn = true;
            return Ok(scan);
        }
        let start = scan.end as i64;
        let line_len = read_line_len(prefix).map_err(|reason| Error::framing(segment_id, start, reason))?;

        let mut line = vec![0u8; line_len];
        if fill(&mut reader, &mut line)? < line_len {
            scan.torn = true;
            return Ok(scan);
        }
        let parsed = parser.parse_command(&line).map_err(|e| match e {
            Error::CommandLine(reason) => Error::framing(segment_id, start, reason),
            other => other,
        })?;

        // declared payload runs past the end of the file
        let left = size.saturating_sub(scan.end + (LEN_PREFIX_SIZE + line_len) as u64);
        if parsed.payload_size() as u64 > left {
            scan.torn = true;
            return Ok(scan);
        }
        let mut payload = vec![0u8; parsed.payload_size()];
        if fill(&mut reader, &mut payload)? < payload.len() {
            scan.torn = true;
            return Ok(scan);
        }

        scan.end += (LEN_PREFIX_SIZE + line_len + payload.len()) as u64;
        scan.records += 1;
        scan.last_id = Some(parsed.record_id());
        scan.last_kind = Some(parsed.kind());
        let next = Position::new(segment_id, scan.end as i64);
        scan.last = Some(parser.to_message(parsed, &line, payload, next));
    }
}

/// Remove empty segments at the end of the log, returning how many went
pub fn drop_trailing_empty(dir: &Path) -> Result<usize> {
    let segments = list_segments(dir)?;
    let mut dropped = 0;
    for entry in segments.iter().rev() {
        if entry.size > 0 {
            break;
        }
        fs::remove_file(segment_path(dir, entry.id))?;
        dropped += 1;
    }
    if dropped > 0 {
        info!(dir = %dir.display(), dropped, "removed empty trailing segments");
    }
    Ok(dropped)
}

/// Last whole record of the log, looking backwards through the segments
/// until one holds a record
pub fn read_last_record<P: MessageParser>(dir: &Path, parser: &mut P) -> Result<Option<P::Message>> {
    for entry in list_segments(dir)?.iter().rev() {
        if entry.size == 0 {
            continue;
        }
        let scan = scan_segment(dir, entry.id, parser)?;
        if scan.last.is_some() {
            debug!(
                dir = %dir.display(),
                segment = entry.id,
                last_id = ?scan.last_id,
                last_kind = ?scan.last_kind,
                "found last record"
            );
            return Ok(scan.last);
        }
    }
    Ok(None)
}

/// Cut a partially written record off the newest segment, returning the
/// number of bytes removed
pub fn truncate_torn_tail<P: MessageParser>(dir: &Path, parser: &mut P) -> Result<u64> {
    let Some(entry) = list_segments(dir)?.pop() else {
        return Ok(0);
    };
    let scan = scan_segment(dir, entry.id, parser)?;
    if !scan.torn {
        return Ok(0);
    }
    let path = segment_path(dir, entry.id);
    let file = OpenOptions::new().write(true).open(&path)?;
    let size = file.metadata()?.len();
    file.set_len(scan.end)?;
    file.sync_all()?;
    let removed = size - scan.end;
    warn!(
        path = %path.display(),
        records = scan.records,
        last_id = ?scan.last_id,
        last_kind = ?scan.last_kind,
        kept = scan.end,
        removed,
        "truncated torn record at segment tail"
    );
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_record;
    use crate::test_support::PlainParser;
    use std::io::Write;
    use tempfile::tempdir;

    fn record(id: i64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let line = format!("{}\t{}\n", id, payload.len());
        encode_record(&mut out, line.as_bytes(), payload).unwrap();
        out
    }

    #[test]
    fn test_drop_trailing_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("0.log"), record(1, b"a")).unwrap();
        fs::write(dir.path().join("1.log"), b"").unwrap();
        fs::write(dir.path().join("2.log"), b"").unwrap();

        assert_eq!(drop_trailing_empty(dir.path()).unwrap(), 2);
        assert!(dir.path().join("0.log").exists());
        assert!(!dir.path().join("1.log").exists());
        assert_eq!(drop_trailing_empty(dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_last_record_skips_empty_segments() {
        let dir = tempdir().unwrap();
        let mut bytes = record(1, b"one");
        bytes.extend(record(2, b"two"));
        fs::write(dir.path().join("3.log"), &bytes).unwrap();
        fs::write(dir.path().join("4.log"), b"").unwrap();

        let last = read_last_record(dir.path(), &mut PlainParser).unwrap().unwrap();
        assert_eq!(last.id, 2);
        assert_eq!(last.payload, b"two");
        assert_eq!(last.next, Position::new(3, bytes.len() as i64));

        let empty = tempdir().unwrap();
        assert!(read_last_record(empty.path(), &mut PlainParser).unwrap().is_none());
    }

    #[test]
    fn test_truncate_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        let whole = record(1, b"kept");
        let torn = record(2, b"lost in the crash");
        let mut file = File::create(&path).unwrap();
        file.write_all(&whole).unwrap();
        file.write_all(&torn[..torn.len() - 5]).unwrap();
        drop(file);

        let removed = truncate_torn_tail(dir.path(), &mut PlainParser).unwrap();
        assert_eq!(removed, (torn.len() - 5) as u64);
        assert_eq!(fs::read(&path).unwrap(), whole);
        assert_eq!(truncate_torn_tail(dir.path(), &mut PlainParser).unwrap(), 0);
    }

    #[test]
    fn test_oversized_payload_length_is_torn() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        let whole = record(1, b"kept");
        let mut bytes = whole.clone();
        encode_record(&mut bytes, b"2\t1000000000000\n", b"").unwrap();
        bytes.extend_from_slice(&[7u8; 8]);
        fs::write(&path, &bytes).unwrap();

        let last = read_last_record(dir.path(), &mut PlainParser).unwrap().unwrap();
        assert_eq!(last.id, 1);
        let removed = truncate_torn_tail(dir.path(), &mut PlainParser).unwrap();
        assert_eq!(removed, (bytes.len() - whole.len()) as u64);
        assert_eq!(fs::read(&path).unwrap(), whole);
    }

    #[test]
    fn test_garbage_is_not_silently_truncated() {
        let dir = tempdir().unwrap();
        let mut bytes = record(1, b"ok");
        bytes.extend_from_slice(&[0, 0, 0, 0, 1, 2, 3]);
        fs::write(dir.path().join("0.log"), &bytes).unwrap();

        let err = truncate_torn_tail(dir.path(), &mut PlainParser).unwrap_err();
        assert!(err.is_corruption());
    }
}
