//! # Driven Ports (Outbound SPI)
//!
//! What the bus requires from its surroundings: a transport that moves
//! frames, a sink for dispatcher failures, an optional message trace and
//! an optional exception filter.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::domain::{BusError, CorrelationId, HandlerError, Message, TransportError};

// ============================================================================
// TRANSPORT
// ============================================================================

/// Delivery model of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Exchanges and queues with acknowledgements.
    Broker,
    /// Raw byte stream; frames are delimited by the length prefix.
    Stream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Broker => write!(f, "broker"),
            TransportKind::Stream => write!(f, "stream"),
        }
    }
}

/// Queue a subscriber consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    /// Exchange the queue is bound to. `""` is the default exchange, which
    /// routes by queue name and needs no binding.
    pub exchange: String,
    /// Queue name; `None` asks the transport to generate one.
    pub queue_name: Option<String>,
    /// Queue survives its consumers.
    pub durable: bool,
    /// Queue is deleted when its last consumer goes away.
    pub auto_delete: bool,
    /// Topic pattern binding the queue to the exchange.
    pub routing_key: String,
    /// Bind the queue to `exchange` with `routing_key`.
    pub create_bindings: bool,
    pub consumer_tag: String,
}

impl InputBinding {
    /// Exclusive auto-delete queue with a generated name.
    pub fn temporary(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue_name: None,
            durable: false,
            auto_delete: true,
            routing_key: routing_key.into(),
            create_bindings: true,
            consumer_tag: String::new(),
        }
    }
}

/// One frame taken from an input link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub frame: Bytes,
    /// Acknowledgement handle, unique per link.
    pub tag: u64,
    /// The frame was delivered before and requeued.
    pub redelivered: bool,
}

/// Connection factory for one transport.
///
/// Implementations must be `Send + Sync`; one transport is shared by every
/// channel of a bus, possibly by several buses.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether input links honour `ack`/`nack`.
    fn supports_acknowledgement(&self) -> bool;

    /// Open a link that publishes frames to `exchange`.
    async fn connect_output(&self, exchange: &str) -> Result<Arc<dyn OutputLink>, TransportError>;

    /// Declare (if needed) and start consuming from a queue.
    async fn connect_input(
        &self,
        binding: &InputBinding,
    ) -> Result<Arc<dyn InputLink>, TransportError>;

    /// Release everything the transport holds.
    async fn dispose(&self);
}

/// Behaviour common to both link directions.
#[async_trait]
pub trait Link: Send + Sync {
    /// Graceful shutdown.
    async fn close(&self) -> Result<(), TransportError>;

    /// Immediate shutdown. Must not block and must tolerate repeats.
    fn abort(&self);
}

#[async_trait]
pub trait OutputLink: Link {
    /// Write one frame. The transport must not interleave two frames.
    async fn send_frame(&self, routing_key: &str, frame: &[u8]) -> Result<(), TransportError>;
}

#[async_trait]
pub trait InputLink: Link {
    /// Name of the consumed queue.
    fn queue_name(&self) -> &str;

    /// Wait for the next frame. `Ok(None)` means the link was closed.
    async fn receive_frame(&self) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&self, _tag: u64) -> Result<(), TransportError> {
        Ok(())
    }

    /// Reject a delivery, optionally returning it to the queue. Links
    /// without a queue can only drop it.
    async fn nack(&self, _tag: u64, requeue: bool) -> Result<(), TransportError> {
        if requeue {
            return Err(TransportError::Unsupported("requeue"));
        }
        Ok(())
    }
}

// ============================================================================
// ERROR SUBSCRIBER
// ============================================================================

/// Where in the dispatch pipeline an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    Receive,
    Decode,
    Handle,
    Reply,
    Acknowledge,
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorStage::Receive => "receive",
            ErrorStage::Decode => "decode",
            ErrorStage::Handle => "handle",
            ErrorStage::Reply => "reply",
            ErrorStage::Acknowledge => "acknowledge",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub consumer_tag: String,
    pub stage: ErrorStage,
    pub action: Option<String>,
    pub correlation_id: Option<CorrelationId>,
}

impl ErrorContext {
    pub fn new(consumer_tag: impl Into<String>, stage: ErrorStage) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            stage,
            action: None,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn for_message(mut self, message: &Message) -> Self {
        self.action = Some(message.action().to_string());
        self.correlation_id = message.correlation_id();
        self
    }
}

/// Sink for failures the dispatcher cannot return to a caller.
///
/// Called from worker tasks; implementations must not panic.
pub trait ErrorSubscriber: Send + Sync {
    fn on_error(&self, error: &BusError, context: &ErrorContext);
}

// ============================================================================
// TRACE
// ============================================================================

/// Observer of every message entering or leaving the bus.
pub trait MessageTrace: Send + Sync {
    fn message_arrived(&self, consumer_tag: &str, message: &Message);

    fn message_sent(&self, message: &Message);
}

// ============================================================================
// EXCEPTION FILTER
// ============================================================================

/// Classifies handler failures in transactional mode.
pub trait ExceptionFilter: Send + Sync {
    /// `true` requeues the message, `false` drops it.
    fn is_retryable(&self, error: &HandlerError) -> bool;
}

impl<F> ExceptionFilter for F
where
    F: Fn(&HandlerError) -> bool + Send + Sync,
{
    fn is_retryable(&self, error: &HandlerError) -> bool {
        self(error)
    }
}
