//! Newline-delimited JSON framing.
//!
//! # Line Format
//!
//! Each message is a single JSON object followed by `\n`. A trailing `\r` is
//! tolerated and blank lines are ignored.
//!
//! # Decoding
//!
//! [`LineDecoder`] is the per-connection inbound parse buffer: bytes are
//! pushed as they arrive from the socket and complete lines are pulled out.
//! A line that grows past [`MAX_LINE_BYTES`] is reported once and discarded
//! up to its terminating newline, so the connection stays usable.

use bytes::{Buf, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::messages::WireMessage;

/// Maximum size of a single line (16 MB).
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Initial capacity of a decoder's buffer.
const INITIAL_CAPACITY: usize = 8 * 1024;

/// Serializes a message into one newline-terminated line.
pub fn encode_line(message: &WireMessage) -> Result<Vec<u8>> {
    let mut out =
        serde_json::to_vec(message).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    out.push(b'\n');
    Ok(out)
}

/// Parses one line (without its newline) into a message.
pub fn decode_message(line: &str) -> Result<WireMessage> {
    serde_json::from_str(line).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Incremental splitter of a byte stream into lines.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to contain no newline.
    scanned: usize,
    max_line: usize,
    /// Dropping the remainder of an oversized line.
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    /// Creates a decoder with the default line limit.
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }

    /// Creates a decoder with a custom line limit.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            scanned: 0,
            max_line,
            discarding: false,
        }
    }

    /// Appends freshly read bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pulls the next complete line, if any.
    ///
    /// Returns `None` when more data is needed.
    pub fn next_line(&mut self) -> Option<Result<String>> {
        loop {
            let newline = self.buffer[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.scanned + offset);

            let Some(pos) = newline else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.max_line {
                    let size = self.buffer.len();
                    self.buffer.clear();
                    self.scanned = 0;
                    if !self.discarding {
                        self.discarding = true;
                        return Some(Err(ProtocolError::LineTooLong {
                            size,
                            max: self.max_line,
                        }));
                    }
                }
                return None;
            };

            let line = self.buffer.split_to(pos + 1);
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            match self.finish_line(&line[..pos]) {
                Some(result) => return Some(result),
                None => continue,
            }
        }
    }

    /// Returns a final unterminated line once the peer has closed the stream.
    pub fn take_remaining(&mut self) -> Option<Result<String>> {
        if self.buffer.is_empty() || self.discarding {
            self.buffer.clear();
            self.discarding = false;
            return None;
        }
        let remaining = self.buffer.split();
        self.scanned = 0;
        self.finish_line(remaining.chunk())
    }

    fn finish_line(&self, bytes: &[u8]) -> Option<Result<String>> {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        if bytes.len() > self.max_line {
            return Some(Err(ProtocolError::LineTooLong {
                size: bytes.len(),
                max: self.max_line,
            }));
        }
        match std::str::from_utf8(bytes) {
            Ok(text) if text.trim().is_empty() => None,
            Ok(text) => Some(Ok(text.to_string())),
            Err(e) => Some(Err(ProtocolError::Deserialization(format!(
                "line is not valid UTF-8: {}",
                e
            )))),
        }
    }
}
