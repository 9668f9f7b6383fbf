//! Envelope encoders: a whole [`Message`] to bytes and back.

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::sync::Arc;

use crate::domain::{EncoderKind, FramingError, Message};

/// Converts a message envelope to the bytes carried inside one frame.
pub trait MessageEncoder: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Append the encoded message to `out`.
    fn write_message(&self, message: &Message, out: &mut BytesMut) -> Result<(), FramingError>;

    fn read_message(&self, bytes: &[u8]) -> Result<Message, FramingError>;
}

/// Human-readable JSON envelope. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageEncoder;

impl MessageEncoder for JsonMessageEncoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn write_message(&self, message: &Message, out: &mut BytesMut) -> Result<(), FramingError> {
        serde_json::to_writer(out.writer(), message)
            .map_err(|e| FramingError::Malformed(e.to_string()))
    }

    fn read_message(&self, bytes: &[u8]) -> Result<Message, FramingError> {
        serde_json::from_slice(bytes).map_err(|e| FramingError::Malformed(e.to_string()))
    }
}

/// Compact binary envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeMessageEncoder;

impl MessageEncoder for BincodeMessageEncoder {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn write_message(&self, message: &Message, out: &mut BytesMut) -> Result<(), FramingError> {
        bincode::serialize_into(out.writer(), message)
            .map_err(|e| FramingError::Malformed(e.to_string()))
    }

    fn read_message(&self, bytes: &[u8]) -> Result<Message, FramingError> {
        bincode::deserialize(bytes).map_err(|e| FramingError::Malformed(e.to_string()))
    }
}

pub fn encoder_for(kind: EncoderKind) -> Arc<dyn MessageEncoder> {
    match kind {
        EncoderKind::Json => Arc::new(JsonMessageEncoder),
        EncoderKind::Bincode => Arc::new(BincodeMessageEncoder),
    }
}
