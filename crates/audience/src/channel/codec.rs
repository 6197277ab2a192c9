//! Framed codec for the runtime channel.
//!
//! Uses LinesCodec for `\n` framing + the protocol classifier for decoding.
//! Works over any AsyncRead/AsyncWrite (domain sockets, named pipes, in-memory duplex).

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{Message, ProtocolError};

/// Upper bound for a single line. Window lists and posted messages stay far below this.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Codec that frames one JSON message per line.
pub struct LineCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    fn map_error(&self, error: LinesCodecError) -> CodecError {
        match error {
            LinesCodecError::MaxLineLengthExceeded => CodecError::LineTooLong {
                max: self.max_length,
            },
            LinesCodecError::Io(e) => CodecError::Io(e),
        }
    }

    fn classify(line: String) -> Result<Option<Message>, CodecError> {
        tracing::trace!(line_len = line.len(), "Decoding line");
        Ok(Some(Message::decode(&line)?))
    }
}

impl Decoder for LineCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src).map_err(|e| self.map_error(e))? {
                // Blank lines carry nothing; skip them like the runtime does.
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Self::classify(line),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode_eof(src).map_err(|e| self.map_error(e))? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Self::classify(line),
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Message> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item
            .encode()
            .map_err(|e| CodecError::Protocol(ProtocolError::Json(e)))?;
        if line.len() > self.max_length {
            return Err(CodecError::LineTooLong {
                max: self.max_length,
            });
        }
        tracing::trace!(line_len = line.len(), "Encoding line");
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}
