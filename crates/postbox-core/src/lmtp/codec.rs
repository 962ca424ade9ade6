//! Frame codec for the event-driven listener
//!
//! In line mode the decoder yields one command line per frame. After
//! [`LmtpCodec::start_data`] it pushes buffered bytes through a
//! [`MessageFramer`] and yields the whole DATA payload as one frame, then
//! drops back to line mode. Bytes after the terminator stay in the buffer
//! for the next command, so pipelined input survives the switch.

use crate::lmtp::framer::{FramedMessage, FramerError, MessageFramer};
use bytes::{Buf, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// Command line without its terminator
    Line(String),
    Message(FramedMessage),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("command line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error(transparent)]
    Framer(#[from] FramerError),
}

#[derive(Debug)]
enum Mode {
    Line,
    Data(MessageFramer),
}

#[derive(Debug)]
pub struct LmtpCodec {
    mode: Mode,
    max_line_length: usize,
    /// Offset already searched for a line feed
    next_index: usize,
}

impl LmtpCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            mode: Mode::Line,
            max_line_length,
            next_index: 0,
        }
    }

    /// Treat the following bytes as a DATA payload
    pub fn start_data(&mut self, limit: usize) {
        self.mode = Mode::Data(MessageFramer::with_limit(limit));
        self.next_index = 0;
    }

    pub fn in_data(&self) -> bool {
        matches!(self.mode, Mode::Data(_))
    }
}

impl Decoder for LmtpCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match &mut self.mode {
            Mode::Line => {
                let found = buf[self.next_index..].iter().position(|&b| b == b'\n');
                match found {
                    // Limit covers every byte before LF, CR included
                    Some(offset) if self.next_index + offset > self.max_line_length => {
                        Err(CodecError::LineTooLong(self.max_line_length))
                    }
                    Some(offset) => {
                        let end = self.next_index + offset;
                        self.next_index = 0;
                        let mut line = buf.split_to(end + 1);
                        line.truncate(end);
                        if line.last() == Some(&b'\r') {
                            line.truncate(end - 1);
                        }
                        Ok(Some(Frame::Line(String::from_utf8_lossy(&line).into_owned())))
                    }
                    None if buf.len() > self.max_line_length => {
                        Err(CodecError::LineTooLong(self.max_line_length))
                    }
                    None => {
                        self.next_index = buf.len();
                        Ok(None)
                    }
                }
            }
            Mode::Data(framer) => {
                let consumed = framer.push(&buf[..]);
                buf.advance(consumed);
                if !framer.is_complete() {
                    return Ok(None);
                }
                let Mode::Data(framer) = std::mem::replace(&mut self.mode, Mode::Line) else {
                    return Ok(None);
                };
                Ok(Some(Frame::Message(framer.finish()?)))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if self.in_data() {
            buf.clear();
            self.mode = Mode::Line;
            return Err(FramerError::PrematureEof.into());
        }
        // Unterminated trailing command is dropped
        buf.clear();
        self.next_index = 0;
        Ok(None)
    }
}

impl Encoder<String> for LmtpCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Feed `chunks` in order, switching to DATA after a `DATA` line
    fn drive(chunks: &[&[u8]]) -> Vec<Frame> {
        let mut codec = LmtpCodec::new(1024);
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                if frame == Frame::Line("DATA".to_string()) {
                    codec.start_data(1024);
                }
                frames.push(frame);
            }
        }
        frames
    }

    fn line(s: &str) -> Frame {
        Frame::Line(s.to_string())
    }

    #[test]
    fn test_pipelined_commands_and_data() {
        let input: &[u8] = b"LHLO x\r\nMAIL FROM:<a@x>\r\nDATA\r\nhi\r\n..dot\r\n.\r\nQUIT\n";
        let expected = vec![
            line("LHLO x"),
            line("MAIL FROM:<a@x>"),
            line("DATA"),
            Frame::Message(FramedMessage {
                body: b"hi\r\n.dot\r\n".to_vec(),
                oversized: false,
            }),
            line("QUIT"),
        ];
        assert_eq!(drive(&[input]), expected);

        for split in 0..=input.len() {
            let frames = drive(&[&input[..split], &input[split..]]);
            assert_eq!(frames, expected, "split at {}", split);
        }

        let bytewise: Vec<&[u8]> = input.chunks(1).collect();
        assert_eq!(drive(&bytewise), expected);
    }

    #[test]
    fn test_line_too_long() {
        let mut codec = LmtpCodec::new(8);
        let mut buf = BytesMut::from(&b"NOOP NOOP NOOP"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::LineTooLong(8))
        ));
    }

    #[test]
    fn test_complete_long_line_rejected() {
        let mut codec = LmtpCodec::new(8);
        let mut buf = BytesMut::from(&b"NOOP NOOP NOOP\r\nQUIT\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::LineTooLong(8))
        ));

        // Eight bytes before LF is the longest accepted line
        let mut codec = LmtpCodec::new(8);
        let mut buf = BytesMut::from(&b"NOOP 12\r\nNOOP 123\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("NOOP 12")));
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::LineTooLong(8))
        ));
    }

    #[test]
    fn test_eof_inside_data() {
        let mut codec = LmtpCodec::new(1024);
        codec.start_data(1024);
        let mut buf = BytesMut::from(&b"partial body\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(CodecError::Framer(FramerError::PrematureEof))
        ));
    }

    #[test]
    fn test_eof_drops_partial_line() {
        let mut codec = LmtpCodec::new(1024);
        let mut buf = BytesMut::from(&b"NOOP\r\nQUI"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(line("NOOP")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode() {
        let mut codec = LmtpCodec::new(1024);
        let mut dst = BytesMut::new();
        codec.encode("250 OK\r\n".to_string(), &mut dst).unwrap();
        assert_eq!(&dst[..], b"250 OK\r\n");
    }
}
