//! Domain layer: message envelope, identifiers, configuration, filtering
//! and errors. No I/O happens here.

pub mod config;
pub mod correlation;
pub mod errors;
pub mod filter;
pub mod message;

pub use config::{
    BufferPoolConfig, BusConfig, DurableQueue, EncoderKind, PublisherConfig, RpcPublisherConfig,
    SubscriberConfig, TransportConfig,
};
pub use correlation::{BusId, CorrelationId};
pub use errors::{
    BusError, ConfigError, FramingError, HandlerError, SerializationError, TransportError,
};
pub use filter::{topic_matches, FilterDecision, MessageFilter, RoutingPredicate};
pub use message::{headers, Message};
