//! Length-prefixed frame codec for the debugger stream.
//!
//! Frames are an HTTP-like envelope: header lines `Name:Value` separated by
//! `\r\n`, a blank line, then exactly `Content-Length` bytes of UTF-8 JSON.
//! Only `Content-Length` is interpreted; unknown headers (the Node connect
//! banner sends `Type`, `V8-Version`, `Embedding-Host`) are ignored. A frame
//! with `Content-Length: 0` is a keep-alive and produces no item.

use crate::ProtocolMessage;
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Malformed header block: non-UTF-8 bytes, a line without a `:`
    /// separator, a missing or non-integer `Content-Length`. The stream is
    /// desynchronized and must be torn down.
    #[error("bad frame header: {0}")]
    BadHeader(String),
    #[error("bad frame body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    ReadingHeaders,
    ReadingBody(usize),
}

/// Codec for `Content-Length:<N>\r\n\r\n<JSON>` frames.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::ReadingHeaders,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the header block and extract `Content-Length`.
fn content_length(block: &str) -> Result<usize, FrameError> {
    let mut length = None;
    for line in block.split("\r\n").filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(FrameError::BadHeader(format!("no separator in {line:?}")));
        };
        if name.trim() == "Content-Length" {
            let parsed = value
                .trim()
                .parse::<usize>()
                .map_err(|_| FrameError::BadHeader(format!("bad Content-Length {value:?}")))?;
            length = Some(parsed);
        }
    }
    length.ok_or_else(|| FrameError::BadHeader("missing Content-Length".to_owned()))
}

impl Decoder for FrameCodec {
    type Item = ProtocolMessage;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ProtocolMessage>, FrameError> {
        loop {
            match self.state {
                DecodeState::ReadingHeaders => {
                    let Some(pos) = src
                        .windows(HEADER_TERMINATOR.len())
                        .position(|w| w == HEADER_TERMINATOR)
                    else {
                        return Ok(None);
                    };
                    let header_bytes = src.split_to(pos + HEADER_TERMINATOR.len());
                    let block = std::str::from_utf8(&header_bytes[..pos])
                        .map_err(|e| FrameError::BadHeader(e.to_string()))?;
                    let len = content_length(block)?;
                    if len > 0 {
                        self.state = DecodeState::ReadingBody(len);
                    }
                    // len == 0: keep-alive, keep scanning for the next header block
                }
                DecodeState::ReadingBody(len) => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(len);
                    self.state = DecodeState::ReadingHeaders;
                    return Ok(Some(serde_json::from_slice(&body)?));
                }
            }
        }
    }
}

impl Encoder<ProtocolMessage> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, msg: ProtocolMessage, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = serde_json::to_vec(&msg)?;
        let header = format!("Content-Length:{}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}
