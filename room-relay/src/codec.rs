//! Newline framing shared by both wire protocols.
//!
//! The same codec instance owns the read buffer from the first byte of a
//! connection to the last, so records that arrive while negotiation is still
//! running are never lost: they stay buffered until the session loop asks for
//! them.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// One decoded unit of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete record with its delimiter (and any trailing `\r`) removed.
    Line(String),
    /// A record longer than the configured limit was dropped.
    Oversized { discarded: usize },
}

#[derive(Debug)]
pub struct LineCodec {
    max_length: usize,
    /// Offset already scanned for a delimiter, so partial reads are not rescanned.
    next_index: usize,
    /// Discarding an oversized record until its delimiter shows up.
    skipping: bool,
    discarded: usize,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            skipping: false,
            discarded: 0,
        }
    }

    fn find_delimiter(&self, src: &BytesMut) -> Option<usize> {
        src[self.next_index..]
            .iter()
            .position(|byte| *byte == b'\n')
            .map(|offset| self.next_index + offset)
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            if self.skipping {
                match self.find_delimiter(src) {
                    Some(pos) => {
                        src.advance(pos + 1);
                        let discarded = self.discarded + pos + 1;
                        self.skipping = false;
                        self.discarded = 0;
                        self.next_index = 0;
                        warn!(bytes = discarded, "dropped oversized record");
                        return Ok(Some(Frame::Oversized { discarded }));
                    }
                    None => {
                        self.discarded += src.len();
                        src.clear();
                        self.next_index = 0;
                        return Ok(None);
                    }
                }
            }

            let Some(pos) = self.find_delimiter(src) else {
                if src.len() > self.max_length {
                    self.skipping = true;
                    continue;
                }
                self.next_index = src.len();
                return Ok(None);
            };

            self.next_index = 0;
            if pos > self.max_length {
                src.advance(pos + 1);
                warn!(bytes = pos + 1, "dropped oversized record");
                return Ok(Some(Frame::Oversized { discarded: pos + 1 }));
            }

            let raw = src.split_to(pos + 1);
            let body = &raw[..pos];
            let body = body.strip_suffix(b"\r").unwrap_or(body);
            let line = String::from_utf8_lossy(body).into_owned();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(Frame::Line(line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // A trailing record without its delimiter is incomplete; drop it.
                src.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(line.len() + 1);
        // One queued item is exactly one record on the wire.
        if line.contains(is_line_break) {
            dst.put_slice(line.replace(is_line_break, " ").as_bytes());
        } else {
            dst.put_slice(line.as_bytes());
        }
        dst.put_u8(b'\n');
        Ok(())
    }
}

fn is_line_break(c: char) -> bool {
    c == '\n' || c == '\r'
}
