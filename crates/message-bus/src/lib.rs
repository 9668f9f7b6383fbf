//! # Message Bus
//!
//! Transport-agnostic publish/subscribe with request/reply, transactional
//! delivery and bounded subscriber concurrency.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         MessageBus                           │
//! │   Publisher        Subscriber (Dispatcher)    RpcPublisher   │
//! │       │              ▲        │ replies          │    ▲      │
//! │       ▼              │        ▼                  ▼    │      │
//! │  OutputChannel   InputChannel  OutputChannel   Pending table │
//! │       │              ▲                                       │
//! │  ┌────┴──────────────┴─────┐                                 │
//! │  │ FrameCodec + BufferPool │   [u32 LE length][message]      │
//! │  └────┬──────────────┬─────┘                                 │
//! └───────┼──────────────┼───────────────────────────────────────┘
//!         ▼              │
//!     Transport: InMemoryBroker (exchanges, queues, acks)
//!                TcpTransport   (length-prefixed byte stream)
//! ```
//!
//! - **domain**: message envelope, ids, configuration, filter, errors
//! - **codec**: frame codec, envelope encoders, body serializers, buffer pool
//! - **channel**: channel state machine, output and input channels
//! - **ports**: handler, transport, error-subscriber and trace traits
//! - **adapters**: transports and sinks
//! - **service**: publisher, dispatcher, RPC correlator, bus facade
//!
//! ## Usage
//!
//! ```rust,ignore
//! use message_bus::{BusConfig, HandlerError, MessageBus, PublisherConfig, SubscriberConfig};
//!
//! let bus = MessageBus::new(BusConfig::default())?;
//! let subscriber = bus.create_subscriber(SubscriberConfig::new())?;
//! subscriber.subscribe("Ping", |n: u32| async move { Ok::<_, HandlerError>(n + 1) })?;
//! subscriber.start(bus.config().open_timeout).await?;
//!
//! let publisher = bus.create_publisher(PublisherConfig::new()).await?;
//! publisher.publish("Ping", &41).await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod channel;
pub mod codec;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::{
    CollectingErrorSubscriber, InMemoryBroker, LoggingErrorSubscriber, NullErrorSubscriber,
    TcpTransport, TracingMessageTrace,
};
pub use channel::{ChannelState, InputChannel, OutputChannel, ReceivedMessage, StateTransition};
pub use codec::{BufferPool, FrameCodec, Serializer, SerializerRegistry, SerializerSettings};
pub use domain::{
    headers, BusConfig, BusError, BusId, ConfigError, CorrelationId, EncoderKind, FramingError,
    HandlerError, Message, PublisherConfig, RoutingPredicate, RpcPublisherConfig,
    SerializationError, SubscriberConfig, TransportConfig, TransportError,
};
pub use ports::{
    ErrorContext, ErrorStage, ErrorSubscriber, ExceptionFilter, MessageHandler, MessageTrace,
    Transport,
};
pub use service::{
    DispatcherStats, MessageBus, PendingRpcTable, PublishOptions, Publisher, RpcPublisher,
    Subscriber,
};
