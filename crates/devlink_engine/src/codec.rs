//! Newline-delimited JSON framing.
//!
//! One [`Envelope`] per frame, each frame terminated by a single `\n`.
//! The caller owns a per-connection [`BytesMut`], appends every read to it
//! and calls [`FrameDecoder::decode`] until it returns `Ok(None)`, keeping
//! whatever is left for the next read. The decoder remembers how far it has
//! already looked for a delimiter, so a frame arriving in many small reads
//! is scanned once.

use bytes::{Buf, BytesMut};

use crate::error::DecodeError;
use crate::message::Envelope;

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Longest prefix of an offending frame quoted in a [`DecodeError`].
const SNIPPET_LEN: usize = 64;

/// Encode an envelope as one frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(envelope)?;
    bytes.push(DELIMITER);
    Ok(bytes)
}

/// Incremental decoder for one connection's read buffer.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_len: usize,
    /// Bytes at the front of the buffer already known to hold no delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            scanned: 0,
        }
    }

    /// Try to take one envelope off the front of `buf`.
    ///
    /// - `Ok(Some(_))`: a frame was decoded and removed from `buf`.
    /// - `Ok(None)`: no complete frame yet; `buf` is left untouched.
    /// - `Err(_)`: a complete frame was removed from `buf` but did not decode.
    ///   The next call continues with the following frame.
    ///
    /// An undelimited prefix longer than the frame limit yields
    /// [`DecodeError::FrameTooLong`] without consuming anything.
    ///
    /// Between calls `buf` may only grow at the back.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, DecodeError> {
        loop {
            let from = self.scanned.min(buf.len());
            let Some(offset) = buf[from..].iter().position(|b| *b == DELIMITER) else {
                self.scanned = buf.len();
                if buf.len() > self.max_frame_len {
                    return Err(DecodeError::FrameTooLong {
                        len: buf.len(),
                        max: self.max_frame_len,
                    });
                }
                return Ok(None);
            };
            let pos = from + offset;
            self.scanned = 0;

            if pos > self.max_frame_len {
                buf.advance(pos + 1);
                return Err(DecodeError::FrameTooLong {
                    len: pos,
                    max: self.max_frame_len,
                });
            }

            let frame = buf.split_to(pos + 1);
            let line = trim_frame(&frame[..pos]);
            if line.is_empty() {
                continue;
            }

            return parse_frame(line).map(Some);
        }
    }
}

fn trim_frame(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

fn parse_frame(line: &[u8]) -> Result<Envelope, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_slice(line).map_err(|source| DecodeError::Malformed {
            snippet: snippet(line),
            source,
        })?;

    let has_type = value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .is_some_and(|t| t.is_string());
    if !has_type {
        return Err(DecodeError::NotAnEnvelope {
            snippet: snippet(line),
        });
    }

    serde_json::from_value(value).map_err(|source| DecodeError::Malformed {
        snippet: snippet(line),
        source,
    })
}

fn snippet(line: &[u8]) -> String {
    let cut = line.len().min(SNIPPET_LEN);
    String::from_utf8_lossy(&line[..cut]).into_owned()
}
