//! # Frame Codec
//!
//! Wire format of one frame:
//!
//! ```text
//! [u32 little-endian length][length bytes of encoded message]
//! ```
//!
//! One frame per message, no delimiter, no batching. The codec owns only
//! the length prefix; the bytes inside are produced by a [`MessageEncoder`].
//! With a [`BufferPool`] the frame is built in a pooled buffer and the
//! output is byte-for-byte the same as without one.

mod buffer_pool;
mod encoder;
mod serializer;

pub use buffer_pool::{BufferPool, BufferPoolStats, PooledBuffer};
pub use encoder::{encoder_for, BincodeMessageEncoder, JsonMessageEncoder, MessageEncoder};
pub use serializer::{
    JsonSerializer, Serializer, SerializerRegistry, SerializerSettings, JSON_CONTENT_TYPE,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::Deref;
use std::sync::Arc;

use crate::domain::{FramingError, Message};

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest frame body accepted by default (100 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Largest body a 4-byte prefix can describe.
const MAX_PREFIX_LEN: usize = u32::MAX as usize;

/// An encoded frame, either owned or still on loan from the pool.
#[derive(Debug)]
pub enum EncodedFrame {
    Owned(Bytes),
    Pooled(PooledBuffer),
}

impl Deref for EncodedFrame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => &bytes[..],
            Self::Pooled(buf) => &buf[..],
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    encoder: Arc<dyn MessageEncoder>,
    pool: Option<Arc<BufferPool>>,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(encoder: Arc<dyn MessageEncoder>) -> Self {
        Self {
            encoder,
            pool: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Option<Arc<BufferPool>>) -> Self {
        self.pool = pool;
        self
    }

    /// Largest accepted frame body. Capped at what the 4-byte prefix can
    /// express.
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len.min(MAX_PREFIX_LEN);
        self
    }

    pub fn encoder(&self) -> &Arc<dyn MessageEncoder> {
        &self.encoder
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encode one message into a length-prefixed frame.
    pub fn encode(&self, message: &Message) -> Result<EncodedFrame, FramingError> {
        match &self.pool {
            Some(pool) => {
                // dropping the pooled buffer on error returns it to the pool
                let mut buf = pool.acquire(LENGTH_PREFIX_LEN + message.body().len());
                self.encode_into(message, &mut buf)?;
                Ok(EncodedFrame::Pooled(buf))
            }
            None => {
                let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + message.body().len());
                self.encode_into(message, &mut buf)?;
                Ok(EncodedFrame::Owned(buf.freeze()))
            }
        }
    }

    fn encode_into(&self, message: &Message, buf: &mut BytesMut) -> Result<(), FramingError> {
        let start = buf.len();
        buf.put_u32_le(0);
        self.encoder.write_message(message, buf)?;

        let length = buf.len() - start - LENGTH_PREFIX_LEN;
        let prefix = u32::try_from(length)
            .ok()
            .filter(|_| length <= self.max_frame_len)
            .ok_or(FramingError::FrameTooLarge {
                length,
                max: self.max_frame_len,
            })?;
        buf[start..start + LENGTH_PREFIX_LEN].copy_from_slice(&prefix.to_le_bytes());
        Ok(())
    }

    /// Decode exactly one frame.
    ///
    /// Fails with [`FramingError::Incomplete`] when `frame` holds fewer bytes
    /// than the prefix declares; the caller buffers more and retries.
    pub fn decode(&self, frame: &[u8]) -> Result<Message, FramingError> {
        let length = self.declared_length(frame)?;
        let available = frame.len() - LENGTH_PREFIX_LEN;
        if available < length {
            return Err(FramingError::Incomplete {
                expected: length,
                available,
            });
        }
        if available > length {
            return Err(FramingError::TrailingBytes {
                extra: available - length,
            });
        }
        self.encoder.read_message(&frame[LENGTH_PREFIX_LEN..])
    }

    /// Split the next complete frame off the front of a stream buffer.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered.
    pub fn split_frame(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        let length = match self.declared_length(buf) {
            Ok(length) => length,
            Err(FramingError::Incomplete { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if buf.len() < LENGTH_PREFIX_LEN + length {
            buf.reserve(LENGTH_PREFIX_LEN + length - buf.len());
            return Ok(None);
        }
        Ok(Some(buf.split_to(LENGTH_PREFIX_LEN + length).freeze()))
    }

    /// Decode every complete frame at the front of `buf`, leaving any
    /// partial frame in place.
    pub fn decode_buffered(&self, buf: &mut BytesMut) -> Result<Vec<Message>, FramingError> {
        let mut messages = Vec::new();
        while let Some(frame) = self.split_frame(buf)? {
            messages.push(self.decode(&frame)?);
        }
        Ok(messages)
    }

    fn declared_length(&self, frame: &[u8]) -> Result<usize, FramingError> {
        if frame.len() < LENGTH_PREFIX_LEN {
            return Err(FramingError::Incomplete {
                expected: LENGTH_PREFIX_LEN,
                available: frame.len(),
            });
        }
        let length = (&frame[..LENGTH_PREFIX_LEN]).get_u32_le() as usize;
        if length > self.max_frame_len {
            return Err(FramingError::FrameTooLarge {
                length,
                max: self.max_frame_len,
            });
        }
        Ok(length)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Arc::new(JsonMessageEncoder))
    }
}
