//! NDJSON line codec
//!
//! Wraps [`LinesCodec`] with a maximum line length so an unterminated or
//! oversized frame from a misbehaving peer cannot grow the read buffer
//! without bound.

use crate::error::RpcError;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Default maximum accepted line length: 1 MiB
pub const DEFAULT_MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited framing for JSON-RPC messages.
///
/// Decoding errors come in two flavours: an overlong line is reported as
/// [`RpcError::Serialization`] and the codec resynchronises on the next
/// newline, while an I/O failure is reported as [`RpcError::Transport`] and
/// ends the stream.
#[derive(Debug)]
pub struct NdjsonCodec {
    lines: LinesCodec,
    max_line_bytes: usize,
}

impl NdjsonCodec {
    /// Create a codec with the default line limit
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    fn map_error(&self, err: LinesCodecError) -> RpcError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => RpcError::serialization(format!(
                "line too long: exceeded {} bytes",
                self.max_line_bytes
            )),
            LinesCodecError::Io(io) => RpcError::from(io),
        }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = String;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, RpcError> {
        self.lines.decode(src).map_err(|e| self.map_error(e))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, RpcError> {
        self.lines.decode_eof(src).map_err(|e| self.map_error(e))
    }
}

impl Encoder<String> for NdjsonCodec {
    type Error = RpcError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), RpcError> {
        // The line limit only applies on the decode side.
        self.lines.encode(item, dst).map_err(|e| self.map_error(e))
    }
}
