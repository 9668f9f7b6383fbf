//! Error taxonomy for the bus.
//!
//! Every fallible operation returns [`BusError`]; the narrower enums are the
//! errors of one layer and convert into it with `?`.

use std::time::Duration;
use thiserror::Error;

use crate::channel::ChannelState;
use crate::domain::CorrelationId;

/// Malformed or truncated wire frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Fewer bytes than the length prefix declares. Buffer more and retry.
    #[error("incomplete frame: expected {expected} bytes, {available} available")]
    Incomplete { expected: usize, available: usize },

    /// Bytes left over after the declared length.
    #[error("frame carries {extra} trailing bytes after the declared length")]
    TrailingBytes { extra: usize },

    #[error("frame length {length} exceeds the maximum of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    /// The envelope encoder rejected the bytes.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Connection-level failure reported by a transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection to {address} refused: {reason}")]
    ConnectionRefused { address: String, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("i/o failure: {0}")]
    Io(String),

    #[error("queue {0} does not exist")]
    QueueNotFound(String),

    /// A byte-stream reader could not delimit the next frame.
    #[error("corrupt stream: {0}")]
    CorruptStream(FramingError),

    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Failure raised by a subscriber callback.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    /// A failure the handler itself marks as worth retrying.
    #[error("transient handler failure: {0}")]
    Transient(String),

    #[error("could not deserialize message body: {0}")]
    Deserialization(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }
}

/// Body serializer failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{content_type} serialization failed: {reason}")]
pub struct SerializationError {
    pub content_type: String,
    pub reason: String,
}

/// Invalid configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("concurrency level must be at least 1 (got {0})")]
    InvalidConcurrencyLevel(usize),

    #[error("durable queue name cannot be empty")]
    EmptyQueueName,

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("failed to read configuration: {0}")]
    Io(String),
}

/// Top-level error of every bus operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Operation illegal in the channel's current state.
    #[error("cannot {operation} a channel in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ChannelState,
    },

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Open or close deadline exceeded.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("no reply for request {correlation_id} within {timeout:?}")]
    RpcTimeout {
        correlation_id: CorrelationId,
        timeout: Duration,
    },

    /// The pending request was dropped without a reply or a timeout, e.g.
    /// because the RPC publisher was closed while the caller waited.
    #[error("request {correlation_id} abandoned before completion")]
    RpcAborted { correlation_id: CorrelationId },

    /// The responder's handler failed and sent an error reply.
    #[error("remote handler for {action} failed: {message}")]
    RemoteHandler { action: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The channel was aborted while the operation was in progress.
    #[error("channel {channel} was aborted")]
    Aborted { channel: String },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("a handler for action {0} is already registered")]
    AlreadySubscribed(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("blocking {operation} called from within an async runtime")]
    BlockingInAsyncContext { operation: &'static str },

    #[error("no tokio runtime available")]
    NoRuntime,
}

impl BusError {
    /// True for errors that only mean "the channel is shutting down".
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::InvalidState { .. } | Self::Aborted { .. })
    }

    /// True for errors that fault and abort the owning channel.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Framing(_))
    }
}
