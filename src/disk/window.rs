//! Memory-mapped read windows over a growing segment
//!
//! A reader never maps a whole segment. It maps one aligned window at a
//! time, and only up to the published size, so every mapped byte has been
//! fully written before the mapping exists.

use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io;

pub(crate) struct ReadContext<'f> {
    file: &'f File,
    window: u64,
    /// absolute offset of the next unconsumed byte
    pos: u64,
    mmap: Option<Mmap>,
    /// absolute offset of the first mapped byte
    mapped_start: u64,
}

impl<'f> ReadContext<'f> {
    pub fn new(file: &'f File, pos: u64, window: u64) -> Self {
        Self {
            file,
            window,
            pos,
            mmap: None,
            mapped_start: 0,
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Unconsumed bytes of the current window
    pub fn data(&self) -> &[u8] {
        match &self.mmap {
            Some(map) => {
                let consumed = (self.pos - self.mapped_start) as usize;
                &map[consumed.min(map.len())..]
            }
            None => &[],
        }
    }

    pub fn consume(&mut self, n: usize) {
        self.pos += n as u64;
    }

    /// Make sure the current window has unconsumed bytes, mapping the next
    /// window if needed. `limit` is the published size of the segment.
    pub fn next(&mut self, limit: u64) -> io::Result<()> {
        if !self.data().is_empty() {
            return Ok(());
        }
        if self.pos >= limit {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read window at {} past published size {}", self.pos, limit),
            ));
        }
        let start = (self.pos / self.window) * self.window;
        let len = self.window.min(limit - start);
        // drop the old mapping before creating the next one
        self.mmap = None;
        // SAFETY: segments are append-only and the mapping stops at the
        // published size, which the writer never truncates below.
        let map = unsafe {
            MmapOptions::new()
                .offset(start)
                .len(len as usize)
                .map(self.file)?
        };
        self.mmap = Some(map);
        self.mapped_start = start;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_walks_windows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        let mut file = File::create(&path).unwrap();
        let bytes: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&bytes).unwrap();
        drop(file);

        let file = File::open(&path).unwrap();
        let window = 64 * 1024;
        let mut ctx = ReadContext::new(&file, 100, window);
        let mut seen = Vec::new();
        while ctx.pos() < bytes.len() as u64 {
            ctx.next(bytes.len() as u64).unwrap();
            let chunk = ctx.data().len().min(10_000);
            seen.extend_from_slice(&ctx.data()[..chunk]);
            ctx.consume(chunk);
        }
        assert_eq!(seen, &bytes[100..]);
        assert!(ctx.next(bytes.len() as u64).is_err());
    }

    #[test]
    fn test_stops_at_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        std::fs::write(&path, vec![7u8; 1000]).unwrap();

        let file = File::open(&path).unwrap();
        let mut ctx = ReadContext::new(&file, 10, 64 * 1024);
        ctx.next(500).unwrap();
        assert_eq!(ctx.data().len(), 490);
    }
}
