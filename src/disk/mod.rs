//! Segment files on disk
//!
//! A log is a directory of append-only segment files named by a
//! monotonically increasing id:
//!
//! ```text
//! <dir>/0.log  <dir>/1.log  <dir>/2.log ...
//! ```
//!
//! No index file is kept. The next id to write and the oldest id still
//! inside the retention window are both recomputed from a directory
//! listing, which is all a restart needs.
//!
//! Submodules:
//!
//! - `writer`: appends framed records and rotates segments
//! - `fsync`: durability policies for the writer
//! - `window`: mmap read windows
//! - `reader`: blocking per-consumer block reader
//! - `recover`: restart helpers for torn tails and empty segments

pub mod fsync;
pub mod reader;
pub mod recover;
pub(crate) mod window;
pub mod writer;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Extension of segment files
pub const SEGMENT_EXT: &str = "log";

/// File name of segment `id`
pub fn segment_file_name(id: i64) -> String {
    format!("{}.{}", id, SEGMENT_EXT)
}

/// Path of segment `id` inside `dir`
pub fn segment_path(dir: &Path, id: i64) -> PathBuf {
    dir.join(segment_file_name(id))
}

/// Segment id encoded in a file name, if it is a segment file
pub fn parse_segment_id(name: &str) -> Option<i64> {
    let (stem, ext) = name.split_once('.')?;
    if ext != SEGMENT_EXT || stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// A segment file found in a log directory
#[derive(Debug, Clone)]
pub struct SegmentEntry {
    /// Segment id
    pub id: i64,
    /// File size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
}

/// List the segment files of `dir`, sorted by id
pub fn list_segments(dir: &Path) -> io::Result<Vec<SegmentEntry>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(parse_segment_id) else {
            debug!(file = ?name, "not a segment file");
            continue;
        };
        let meta = entry.metadata()?;
        segments.push(SegmentEntry {
            id,
            size: meta.len(),
            modified: meta.modified()?,
        });
    }
    segments.sort_by_key(|s| s.id);
    Ok(segments)
}

/// Id the writer should use next: one past the highest existing segment
pub fn next_segment_id(dir: &Path) -> io::Result<i64> {
    Ok(list_segments(dir)?.last().map_or(0, |s| s.id + 1))
}

/// Oldest segment id still inside the retention window
///
/// When every segment has expired, readers start after the last one,
/// unless it is the only segment and still open for appends.
pub fn first_segment_id(dir: &Path, retention: Duration, max_segment_size: u64) -> io::Result<i64> {
    first_segment_id_at(dir, retention, max_segment_size, SystemTime::now())
}

pub(crate) fn first_segment_id_at(
    dir: &Path,
    retention: Duration,
    max_segment_size: u64,
    now: SystemTime,
) -> io::Result<i64> {
    let segments = list_segments(dir)?;
    let Some(last) = segments.last() else {
        return Ok(0);
    };
    let live = segments.iter().find(|s| {
        now.duration_since(s.modified)
            .map_or(true, |age| age < retention)
    });
    match live {
        Some(segment) => Ok(segment.id),
        None if segments.len() == 1 && last.size < max_segment_size => Ok(last.id),
        None => Ok(last.id + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    const DAY: Duration = Duration::from_secs(86400);

    #[test]
    fn test_names() {
        assert_eq!(segment_file_name(12), "12.log");
        assert_eq!(parse_segment_id("12.log"), Some(12));
        assert_eq!(parse_segment_id("0.log"), Some(0));
        assert_eq!(parse_segment_id("12.dat"), None);
        assert_eq!(parse_segment_id("-1.log"), None);
        assert_eq!(parse_segment_id("a.log"), None);
        assert_eq!(parse_segment_id("1.log.bak"), None);
        assert_eq!(parse_segment_id(".log"), None);
    }

    #[test]
    fn test_next_segment_id() {
        let dir = tempdir().unwrap();
        assert_eq!(next_segment_id(dir.path()).unwrap(), 0);

        File::create(dir.path().join("3.log")).unwrap();
        File::create(dir.path().join("10.log")).unwrap();
        File::create(dir.path().join("99.tmp")).unwrap();
        fs::create_dir(dir.path().join("200.log")).unwrap();
        assert_eq!(next_segment_id(dir.path()).unwrap(), 11);

        let ids: Vec<i64> = list_segments(dir.path()).unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 10]);
    }

    #[test]
    fn test_first_segment_id_live() {
        let dir = tempdir().unwrap();
        assert_eq!(first_segment_id(dir.path(), DAY, 100).unwrap(), 0);

        fs::write(dir.path().join("2.log"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("3.log"), vec![0u8; 10]).unwrap();
        assert_eq!(first_segment_id(dir.path(), DAY, 100).unwrap(), 2);
    }

    #[test]
    fn test_first_segment_id_all_expired() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("5.log"), vec![0u8; 10]).unwrap();
        let later = SystemTime::now() + 30 * DAY;

        // single segment still open for appends
        assert_eq!(first_segment_id_at(dir.path(), DAY, 100, later).unwrap(), 5);
        // single segment already full
        assert_eq!(first_segment_id_at(dir.path(), DAY, 10, later).unwrap(), 6);

        fs::write(dir.path().join("6.log"), vec![0u8; 10]).unwrap();
        assert_eq!(first_segment_id_at(dir.path(), DAY, 100, later).unwrap(), 7);
    }
}
