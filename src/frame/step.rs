//! Incremental record decoding over read windows
//!
//! A record may straddle the boundary between two mmap windows. The two
//! steps below accumulate bytes across calls: first the length prefixed
//! command line, then the declared payload.

use crate::frame::{read_line_len, LEN_PREFIX_SIZE};

/// Accumulates a length prefixed command line
#[derive(Debug, Default)]
pub(crate) struct CommandStep {
    prefix: [u8; LEN_PREFIX_SIZE],
    line: Vec<u8>,
    filled: usize,
    line_len: usize,
    short_windows: u32,
}

impl CommandStep {
    /// Feed the bytes left in the current window.
    ///
    /// Returns how many bytes were consumed and whether the line is now
    /// complete. A window that ends before the line is complete is accepted
    /// once; a second one means the position does not start a record.
    pub fn accept(&mut self, data: &[u8]) -> Result<(usize, bool), String> {
        let mut consumed = 0;

        if self.filled < LEN_PREFIX_SIZE {
            let n = (LEN_PREFIX_SIZE - self.filled).min(data.len());
            self.prefix[self.filled..self.filled + n].copy_from_slice(&data[..n]);
            self.filled += n;
            consumed += n;
            if self.filled == LEN_PREFIX_SIZE {
                self.line_len = read_line_len(self.prefix)?;
                self.line.reserve(self.line_len);
            }
        }

        if self.filled >= LEN_PREFIX_SIZE {
            let want = LEN_PREFIX_SIZE + self.line_len - self.filled;
            let n = want.min(data.len() - consumed);
            self.line.extend_from_slice(&data[consumed..consumed + n]);
            self.filled += n;
            consumed += n;
            if self.is_complete() {
                return Ok((consumed, true));
            }
        }

        if self.short_windows > 0 {
            return Err("no command line, invalid position".into());
        }
        self.short_windows += 1;
        Ok((consumed, false))
    }

    fn is_complete(&self) -> bool {
        self.filled > LEN_PREFIX_SIZE && self.filled == LEN_PREFIX_SIZE + self.line_len
    }

    /// The command line, newline included
    pub fn line(&self) -> &[u8] {
        &self.line
    }

    /// Bytes taken by the prefix and the line
    pub fn framed_len(&self) -> usize {
        LEN_PREFIX_SIZE + self.line_len
    }

    /// True once any byte of a record has been consumed
    pub fn in_progress(&self) -> bool {
        self.filled > 0
    }

    pub fn reset(&mut self) {
        self.line.clear();
        self.filled = 0;
        self.line_len = 0;
        self.short_windows = 0;
    }
}

/// Accumulates a payload of known size
#[derive(Debug, Default)]
pub(crate) struct PayloadStep {
    payload: Vec<u8>,
    size: usize,
    active: bool,
}

impl PayloadStep {
    pub fn start(&mut self, size: usize) {
        self.payload = Vec::with_capacity(size);
        self.size = size;
        self.active = true;
    }

    /// Feed window bytes, returning consumed bytes and completion
    pub fn accept(&mut self, data: &[u8]) -> (usize, bool) {
        let n = (self.size - self.payload.len()).min(data.len());
        self.payload.extend_from_slice(&data[..n]);
        (n, self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.active && self.payload.len() == self.size
    }

    pub fn in_progress(&self) -> bool {
        self.active
    }

    /// Hand out the payload and reset
    pub fn take(&mut self) -> Vec<u8> {
        self.active = false;
        self.size = 0;
        std::mem::take(&mut self.payload)
    }
}
