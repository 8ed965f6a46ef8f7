//! Length-prefixed record framing over synchronous file handles.
//!
//! Journal files and journal replay use the same frame shape as the wire:
//! a 32-bit big-endian length followed by that many payload bytes. The
//! reader enforces [`MESSAGE_SIZE_MAX`](super::MESSAGE_SIZE_MAX) and
//! distinguishes premature EOF from I/O failure so callers can report
//! truncation separately from device errors.

use std::io::{Read, Write};

use crate::errors::{AppError, Result};
use crate::protocol::MESSAGE_SIZE_MAX;

/// Write one framed record: 32-bit big-endian length, then the payload.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if `payload` exceeds
/// [`MESSAGE_SIZE_MAX`], or [`AppError::Io`] if either part of the write
/// does not complete.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= MESSAGE_SIZE_MAX)
        .ok_or_else(|| {
            AppError::Protocol(format!(
                "record too large to frame: {} > {MESSAGE_SIZE_MAX}",
                payload.len()
            ))
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// Framed-record reader with a reusable scratch buffer.
///
/// The buffer grows to the next power of two whenever a record exceeds the
/// current capacity and is reused across reads, so replaying a journal
/// allocates at most a handful of times.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one framed record, returning its payload bytes.
    ///
    /// # Errors
    ///
    /// - [`AppError::Eof`] if the stream ends before a complete frame.
    /// - [`AppError::Protocol`] if the length prefix exceeds
    ///   [`MESSAGE_SIZE_MAX`].
    /// - [`AppError::Io`] on any other read failure.
    pub fn read_frame<R: Read>(&mut self, reader: &mut R) -> Result<&[u8]> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let msg_len = u32::from_be_bytes(len_buf);
        if msg_len > MESSAGE_SIZE_MAX {
            return Err(AppError::Protocol(format!(
                "client message too large: {msg_len} > {MESSAGE_SIZE_MAX}"
            )));
        }

        let msg_len = msg_len as usize;
        if msg_len > self.buf.len() {
            self.buf = vec![0u8; msg_len.next_power_of_two()];
        }
        reader.read_exact(&mut self.buf[..msg_len])?;
        Ok(&self.buf[..msg_len])
    }
}
