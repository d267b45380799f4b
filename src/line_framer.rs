//! Reconstruction of lines from a subprocess's raw output stream.
//!
//! Console programs that draw progress indicators return to the start of
//! the current line with a carriage return and overwrite what was there.
//! A plain line reader cannot tell that apart from a real line break, so
//! the framer works on the raw bytes and tags every line with whether it
//! starts a new line or overwrites the previously emitted one.

use std::io::{ErrorKind, Read};

const DEFAULT_CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedLine {
    pub text: String,
    /// False when this line replaces the previously emitted line.
    pub is_new_line: bool,
}

impl FramedLine {
    pub fn new(text: impl Into<String>, is_new_line: bool) -> Self {
        FramedLine {
            text: text.into(),
            is_new_line,
        }
    }
}

/// Splits a byte stream on `\n`, `\r` and `\r\n` terminators.
///
/// Bytes are buffered across reads, so the reader may hand out arbitrarily
/// small chunks. A complete line already in the buffer is always returned
/// before the underlying reader is consulted again.
pub struct LineFramer<R> {
    reader: R,
    buffer: Vec<u8>,
    chunk_size: usize,
    eof: bool,
}

impl<R: Read> LineFramer<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        LineFramer {
            reader,
            buffer: Vec::new(),
            chunk_size: chunk_size.max(1),
            eof: false,
        }
    }

    /// Attempts to cut one line off the front of the buffer.
    ///
    /// The buffer always starts with the terminator of the previous line (or
    /// nothing, for the very first line), which decides whether the next line
    /// is new or an overwrite.
    fn take_line(&mut self) -> Option<FramedLine> {
        let buf = &self.buffer;
        if buf.is_empty() {
            return None;
        }

        let start_len = match buf.as_slice() {
            [b'\r', b'\n', ..] => 2,
            [b'\r'] if !self.eof => return None,
            [b'\r' | b'\n', ..] => 1,
            _ => 0,
        };
        let is_new_line = start_len != 1 || buf[0] == b'\n';

        let body = &buf[start_len..];
        let body_len = body
            .iter()
            .position(|&b| b == b'\r' || b == b'\n')
            .unwrap_or(body.len());
        let terminated = body_len < body.len();

        if !terminated && !self.eof {
            return None;
        }
        if !terminated && body_len == 0 {
            self.buffer.clear();
            return None;
        }

        let text = String::from_utf8_lossy(&body[..body_len]).into_owned();
        if terminated {
            self.buffer.drain(..start_len + body_len);
        } else {
            self.buffer.clear();
        }

        Some(FramedLine { text, is_new_line })
    }

    fn fill(&mut self) -> std::io::Result<()> {
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Iterator for LineFramer<R> {
    type Item = std::io::Result<FramedLine>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.take_line() {
                return Some(Ok(line));
            }
            if self.eof {
                return None;
            }
            if let Err(e) = self.fill() {
                self.eof = true;
                return Some(Err(e));
            }
        }
    }
}
