//! Sticky binary encoder/decoder primitives
//!
//! Integers are 8-byte big-endian; variable-length fields carry a u64 length
//! prefix. The decoder is "sticky": once an operation fails, every later
//! operation is a no-op returning a default value and the first error is
//! preserved, so callers decode a whole frame and check once at the end.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("truncated input: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unexpected trailing data: {0} bytes left after frame")]
    TrailingData(usize),

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("length field overflows usize: {0}")]
    LengthOverflow(u64),

    #[error("error code out of range: {0}")]
    InvalidErrorCode(u64),
}

/// Binary frame encoder
///
/// Writing into memory cannot fail, so `finish` is infallible; the sticky
/// error discipline lives on the [`Decoder`] side.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    /// Length-prefixed raw bytes; zero length encodes as a bare zero prefix
    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_u64(v.len() as u64);
        self.buf.put_slice(v);
        self
    }

    /// Length-prefixed UTF-8 text
    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    /// Raw bytes with no length prefix (frame tails whose length is implicit)
    pub fn put_raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Sticky binary decoder over one frame's bytes
#[derive(Debug)]
pub struct Decoder {
    buf: Bytes,
    err: Option<CodecError>,
}

impl Decoder {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, err: None }
    }

    /// First error recorded, if any
    pub fn error(&self) -> Option<&CodecError> {
        self.err.as_ref()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub(crate) fn fail(&mut self, err: CodecError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    fn take(&mut self, n: usize) -> Option<Bytes> {
        if self.err.is_some() {
            return None;
        }
        if self.buf.remaining() < n {
            let needed = n - self.buf.remaining();
            self.fail(CodecError::Truncated { needed });
            return None;
        }
        Some(self.buf.split_to(n))
    }

    pub fn get_u8(&mut self) -> u8 {
        match self.take(1) {
            Some(b) => b[0],
            None => 0,
        }
    }

    pub fn get_u64(&mut self) -> u64 {
        match self.take(8) {
            Some(mut b) => b.get_u64(),
            None => 0,
        }
    }

    pub fn get_bytes(&mut self) -> Bytes {
        let len = self.get_u64();
        let len = match usize::try_from(len) {
            Ok(len) => len,
            Err(_) => {
                self.fail(CodecError::LengthOverflow(len));
                return Bytes::new();
            }
        };
        self.take(len).unwrap_or_default()
    }

    pub fn get_str(&mut self) -> String {
        let raw = self.get_bytes();
        match String::from_utf8(raw.to_vec()) {
            Ok(s) => s,
            Err(_) => {
                self.fail(CodecError::InvalidUtf8);
                String::new()
            }
        }
    }

    /// Drain whatever is left of the input as raw bytes
    pub fn take_rest(&mut self) -> Bytes {
        if self.err.is_some() {
            return Bytes::new();
        }
        self.buf.split_to(self.buf.remaining())
    }

    /// Finish decoding: surfaces the sticky error, or fails if any byte of the
    /// frame was left unconsumed. Catches frame-shape mismatches between peers.
    pub fn end(self) -> Result<(), CodecError> {
        if let Some(err) = self.err {
            return Err(err);
        }
        if self.buf.has_remaining() {
            return Err(CodecError::TrailingData(self.buf.remaining()));
        }
        Ok(())
    }
}
