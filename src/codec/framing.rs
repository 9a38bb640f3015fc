//! Stream framing for the connection-oriented transports.
//!
//! Datagrams carry exactly one message each and need no framing. Over TCP the
//! animation link is newline-delimited text and the robot link wraps every
//! packet in a 4-byte big-endian length prefix.

use std::io;

use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::robot::MAX_PACKET_LEN;

/// One unit produced by a stream decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameItem {
    /// A complete message, terminator removed
    Frame(Bytes),
    /// An over-long line was dropped up to and including its terminator
    Discarded { len: usize },
}

/// Newline-delimited framing that tolerates split reads.
///
/// Bytes are buffered until `\n` arrives; a trailing `\r` and NUL padding are
/// stripped. A line longer than `max_length` is skipped up to its terminator and
/// reported as [`FrameItem::Discarded`] so the stream stays usable.
#[derive(Debug, Clone)]
pub struct LineFraming {
    max_length: usize,
    next_index: usize,
    discarding: bool,
    discarded: usize,
}

impl LineFraming {
    pub fn new(max_length: usize) -> Self {
        Self { max_length, next_index: 0, discarding: false, discarded: 0 }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

fn trim_line(line: Bytes) -> Bytes {
    let start = line.iter().position(|b| *b != 0).unwrap_or(line.len());
    let end = line.iter().rposition(|b| *b != 0 && *b != b'\r').map_or(start, |idx| idx + 1);
    if start >= end { Bytes::new() } else { line.slice(start..end) }
}

impl Decoder for LineFraming {
    type Item = FrameItem;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.discarding {
                match src.iter().position(|b| *b == b'\n') {
                    Some(idx) => {
                        src.advance(idx + 1);
                        let len = self.discarded + idx + 1;
                        self.discarding = false;
                        self.discarded = 0;
                        return Ok(Some(FrameItem::Discarded { len }));
                    }
                    None => {
                        self.discarded += src.len();
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            let read_to = src.len().min(self.max_length + 1);
            match src[self.next_index..read_to].iter().position(|b| *b == b'\n') {
                Some(offset) => {
                    let idx = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = src.split_to(idx + 1);
                    line.truncate(idx);
                    return Ok(Some(FrameItem::Frame(trim_line(line.freeze()))));
                }
                None if src.len() > self.max_length => {
                    self.discarding = true;
                    self.next_index = 0;
                }
                None => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if self.discarding {
            let len = self.discarded + src.len();
            src.clear();
            self.discarding = false;
            self.discarded = 0;
            return Ok(Some(FrameItem::Discarded { len }));
        }
        if src.is_empty() {
            return Ok(None);
        }
        self.next_index = 0;
        let line = src.split().freeze();
        Ok(Some(FrameItem::Frame(trim_line(line))))
    }
}

impl Encoder<Bytes> for LineFraming {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.extend_from_slice(&item);
        if !item.ends_with(b"\n") {
            dst.extend_from_slice(b"\n");
        }
        Ok(())
    }
}

/// Framing used by a [`StreamTransport`](crate::transports::StreamTransport).
#[derive(Debug)]
pub enum WireFraming {
    /// Newline-delimited text
    Lines(LineFraming),
    /// u32 big-endian length prefix
    LengthPrefixed(LengthDelimitedCodec),
}

impl WireFraming {
    /// Text lines of at most `max_length` bytes.
    pub fn lines(max_length: usize) -> Self {
        WireFraming::Lines(LineFraming::new(max_length))
    }

    /// Length-prefixed binary packets.
    pub fn length_prefixed() -> Self {
        WireFraming::LengthPrefixed(
            LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_PACKET_LEN)
                .new_codec(),
        )
    }
}

impl Decoder for WireFraming {
    type Item = FrameItem;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            WireFraming::Lines(lines) => lines.decode(src),
            WireFraming::LengthPrefixed(codec) => {
                Ok(codec.decode(src)?.map(|frame| FrameItem::Frame(frame.freeze())))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            WireFraming::Lines(lines) => lines.decode_eof(src),
            WireFraming::LengthPrefixed(codec) => {
                Ok(codec.decode_eof(src)?.map(|frame| FrameItem::Frame(frame.freeze())))
            }
        }
    }
}

impl Encoder<Bytes> for WireFraming {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            WireFraming::Lines(lines) => lines.encode(item, dst),
            WireFraming::LengthPrefixed(codec) => codec.encode(item, dst),
        }
    }
}
