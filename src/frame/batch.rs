//! Logical sub-messages packed into one record payload
//!
//! Producers send many small messages in one request. They travel as a
//! single payload where every message is a `u32` little-endian length
//! followed by its bytes.

use crate::error::{Error, Result};

const BATCH_PREFIX_SIZE: usize = 4;

/// Pack messages into one batch payload
pub fn pack<T: AsRef<[u8]>>(messages: &[T]) -> Result<Vec<u8>> {
    let total: usize = messages
        .iter()
        .map(|m| BATCH_PREFIX_SIZE + m.as_ref().len())
        .sum();
    let mut out = Vec::with_capacity(total);
    for message in messages {
        let message = message.as_ref();
        if message.is_empty() {
            return Err(Error::InvalidBatch("empty message".into()));
        }
        let len = u32::try_from(message.len())
            .map_err(|_| Error::InvalidBatch(format!("message of {} bytes", message.len())))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(message);
    }
    Ok(out)
}

/// Split a batch payload into its messages, borrowing from `payload`
pub fn split(payload: &[u8]) -> Result<Vec<&[u8]>> {
    if payload.is_empty() {
        return Err(Error::InvalidBatch("empty payload".into()));
    }
    let mut messages = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        if rest.len() < BATCH_PREFIX_SIZE {
            return Err(Error::InvalidBatch(format!("{} trailing bytes", rest.len())));
        }
        let mut prefix = [0u8; BATCH_PREFIX_SIZE];
        prefix.copy_from_slice(&rest[..BATCH_PREFIX_SIZE]);
        let len = u32::from_le_bytes(prefix) as usize;
        if len == 0 {
            return Err(Error::InvalidBatch("zero length message".into()));
        }
        let end = BATCH_PREFIX_SIZE + len;
        if rest.len() < end {
            return Err(Error::InvalidBatch(format!(
                "message declares {} bytes, {} left",
                len,
                rest.len() - BATCH_PREFIX_SIZE
            )));
        }
        messages.push(&rest[BATCH_PREFIX_SIZE..end]);
        rest = &rest[end..];
    }
    Ok(messages)
}
