//! End-of-message detection for DATA
//!
//! The framer recognises `CR LF . CR LF`, removes dot-stuffing and keeps the
//! CRLF that ends the last body line. It accepts input one byte at a time
//! ([`MessageFramer::push_byte`]) or in chunks of any size
//! ([`MessageFramer::push`]); state carries over between calls.

use thiserror::Error;

const PATTERN: [u8; 5] = *b"\r\n.\r\n";

/// Number of pattern bytes assumed matched when a message starts
const SEED: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramerError {
    #[error("connection closed before end of message")]
    PrematureEof,
}

/// A complete DATA payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    pub body: Vec<u8>,
    /// Body exceeded the size limit; bytes past the limit were discarded
    pub oversized: bool,
}

#[derive(Debug)]
pub struct MessageFramer {
    matched: usize,
    /// Leading pattern bytes that were seeded, not read
    virtual_prefix: usize,
    body: Vec<u8>,
    total: usize,
    limit: Option<usize>,
    complete: bool,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    pub fn new() -> Self {
        Self {
            matched: SEED,
            virtual_prefix: SEED,
            body: Vec::new(),
            total: 0,
            limit: None,
            complete: false,
        }
    }

    /// Framer that stops buffering after `limit` body bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Feed one byte. Returns `true` once the terminator has been seen.
    pub fn push_byte(&mut self, b: u8) -> bool {
        if self.complete {
            return true;
        }

        if b == PATTERN[self.matched] {
            self.matched += 1;
            if self.matched == PATTERN.len() {
                self.emit(b'\r');
                self.emit(b'\n');
                self.complete = true;
            }
            return self.complete;
        }

        self.flush_partial();
        if b == PATTERN[0] {
            self.matched = 1;
        } else {
            self.emit(b);
        }
        false
    }

    /// Feed a chunk. Returns the number of bytes consumed, which is less
    /// than `chunk.len()` only when the terminator ends inside the chunk.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        for (i, &b) in chunk.iter().enumerate() {
            if self.push_byte(b) {
                return i + 1;
            }
        }
        chunk.len()
    }

    /// Finished message, or `PrematureEof` if the terminator never arrived
    pub fn finish(self) -> Result<FramedMessage, FramerError> {
        if !self.complete {
            return Err(FramerError::PrematureEof);
        }
        let oversized = self.limit.is_some_and(|l| self.total > l);
        Ok(FramedMessage {
            body: self.body,
            oversized,
        })
    }

    fn flush_partial(&mut self) {
        let matched = self.matched;
        for i in self.virtual_prefix.min(matched)..matched {
            // CRLF "." broken by anything else: a stuffed dot
            if matched == 3 && i == 2 {
                continue;
            }
            self.emit(PATTERN[i]);
        }
        self.matched = 0;
        self.virtual_prefix = 0;
    }

    fn emit(&mut self, b: u8) {
        self.total += 1;
        match self.limit {
            Some(limit) if self.total > limit => {}
            _ => self.body.push(b),
        }
    }
}

/// Apply dot-stuffing to `body` and append the terminator
pub fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    let mut line_start = true;
    for &b in body {
        if line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        line_start = b == b'\n';
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}
