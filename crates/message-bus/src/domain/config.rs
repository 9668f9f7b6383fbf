//! Configuration values.
//!
//! Component configurations ([`PublisherConfig`], [`SubscriberConfig`],
//! [`RpcPublisherConfig`]) are immutable values built with consuming
//! `with_*` setters and validated when the bus creates the component.
//! [`BusConfig`] is the process-level configuration loaded from TOML.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use super::errors::ConfigError;
use super::filter::RoutingPredicate;
use crate::codec::{BufferPool, Serializer, SerializerSettings, DEFAULT_MAX_FRAME_LEN};
use crate::ports::{ErrorSubscriber, ExceptionFilter, MessageTrace};

/// Named queue that outlives its consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableQueue {
    pub name: String,
    /// Bind the queue to the subscriber's exchange and routing key on start.
    pub create_bindings: bool,
}

// ============================================================================
// PUBLISHER
// ============================================================================

#[derive(Clone, Default)]
pub struct PublisherConfig {
    pub(crate) exchange: Option<String>,
    pub(crate) routing_key: Option<String>,
    pub(crate) buffer_pool: Option<Arc<BufferPool>>,
    pub(crate) trace: Option<Arc<dyn MessageTrace>>,
    pub(crate) custom_serializers: Vec<Arc<dyn Serializer>>,
    pub(crate) serializer_settings: SerializerSettings,
}

impl PublisherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish to this exchange instead of the bus default.
    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Fixed routing key for every message. Defaults to the action name.
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Override the bus-wide buffer pool.
    #[must_use]
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_trace(mut self, trace: Arc<dyn MessageTrace>) -> Self {
        self.trace = Some(trace);
        self
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.custom_serializers.push(serializer);
        self
    }

    #[must_use]
    pub fn with_serializer_settings(mut self, settings: SerializerSettings) -> Self {
        self.serializer_settings = settings;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(key) = &self.routing_key {
            if key.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "routing_key",
                    reason: "cannot be empty".into(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PublisherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherConfig")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("buffer_pool", &self.buffer_pool.is_some())
            .field("trace", &self.trace.is_some())
            .field("custom_serializers", &self.custom_serializers.len())
            .field("serializer_settings", &self.serializer_settings)
            .finish()
    }
}

// ============================================================================
// SUBSCRIBER
// ============================================================================

/// Subscriber configuration.
///
/// With `concurrency_level == 1` handlers see messages in transport order.
/// Any higher level processes messages in parallel and gives up ordering.
#[derive(Clone)]
pub struct SubscriberConfig {
    pub(crate) buffer_pool: Option<Arc<BufferPool>>,
    pub(crate) error_subscriber: Option<Arc<dyn ErrorSubscriber>>,
    pub(crate) trace: Option<Arc<dyn MessageTrace>>,
    pub(crate) durable_queue: Option<DurableQueue>,
    pub(crate) transactional: bool,
    pub(crate) exception_filter: Option<Arc<dyn ExceptionFilter>>,
    pub(crate) receive_self_publish: bool,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) never_reply: bool,
    pub(crate) reply_exchange: String,
    pub(crate) concurrency_level: usize,
    pub(crate) task_scheduler: Option<Handle>,
    pub(crate) custom_serializers: Vec<Arc<dyn Serializer>>,
    pub(crate) serializer_settings: SerializerSettings,
    pub(crate) exchange: Option<String>,
    pub(crate) routing_key: String,
    pub(crate) routing_predicate: Option<RoutingPredicate>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            buffer_pool: None,
            error_subscriber: None,
            trace: None,
            durable_queue: None,
            transactional: false,
            exception_filter: None,
            receive_self_publish: false,
            consumer_tag: None,
            never_reply: false,
            reply_exchange: String::new(),
            concurrency_level: 1,
            task_scheduler: None,
            custom_serializers: Vec::new(),
            serializer_settings: SerializerSettings::default(),
            exchange: None,
            routing_key: "#".into(),
            routing_predicate: None,
        }
    }
}

impl SubscriberConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_error_subscriber(mut self, subscriber: Arc<dyn ErrorSubscriber>) -> Self {
        self.error_subscriber = Some(subscriber);
        self
    }

    #[must_use]
    pub fn with_trace(mut self, trace: Arc<dyn MessageTrace>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Consume from a named durable queue instead of a generated one.
    #[must_use]
    pub fn with_durable_queue(mut self, name: impl Into<String>, create_bindings: bool) -> Self {
        self.durable_queue = Some(DurableQueue {
            name: name.into(),
            create_bindings,
        });
        self
    }

    /// Acknowledge only after the handler succeeds.
    #[must_use]
    pub fn with_transactional_delivery(mut self) -> Self {
        self.transactional = true;
        self
    }

    /// Decides which handler failures are requeued in transactional mode.
    /// Without one every failure is retryable.
    #[must_use]
    pub fn with_exception_filter<F>(mut self, filter: F) -> Self
    where
        F: ExceptionFilter + 'static,
    {
        self.exception_filter = Some(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn with_receive_self_publish(mut self) -> Self {
        self.receive_self_publish = true;
        self
    }

    #[must_use]
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    /// Never send replies, even when a request carries a reply address.
    #[must_use]
    pub fn with_never_reply(mut self) -> Self {
        self.never_reply = true;
        self
    }

    /// Exchange replies are published to.
    ///
    /// Fast-reply requesters listen on the default exchange (`""`), so a
    /// responder using a federated reply exchange cannot answer them.
    #[must_use]
    pub fn with_reply_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.reply_exchange = exchange.into();
        self
    }

    /// Number of parallel handler workers. Above one, messages may be
    /// handled out of the order the transport delivered them.
    #[must_use]
    pub fn with_concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = level;
        self
    }

    /// Runtime the receive loop and workers are spawned on.
    #[must_use]
    pub fn with_task_scheduler(mut self, handle: Handle) -> Self {
        self.task_scheduler = Some(handle);
        self
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.custom_serializers.push(serializer);
        self
    }

    #[must_use]
    pub fn with_serializer_settings(mut self, settings: SerializerSettings) -> Self {
        self.serializer_settings = settings;
        self
    }

    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Binding key of the subscriber queue. Defaults to `#` (everything).
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Extra predicate applied by the message filter after delivery.
    #[must_use]
    pub fn with_routing_predicate(mut self, predicate: RoutingPredicate) -> Self {
        self.routing_predicate = Some(predicate);
        self
    }

    pub fn concurrency_level(&self) -> usize {
        self.concurrency_level
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_level == 0 {
            return Err(ConfigError::InvalidConcurrencyLevel(self.concurrency_level));
        }
        if let Some(queue) = &self.durable_queue {
            if queue.name.trim().is_empty() {
                return Err(ConfigError::EmptyQueueName);
            }
        }
        if self.routing_key.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "routing_key",
                reason: "cannot be empty".into(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("durable_queue", &self.durable_queue)
            .field("transactional", &self.transactional)
            .field("exception_filter", &self.exception_filter.is_some())
            .field("receive_self_publish", &self.receive_self_publish)
            .field("consumer_tag", &self.consumer_tag)
            .field("never_reply", &self.never_reply)
            .field("reply_exchange", &self.reply_exchange)
            .field("concurrency_level", &self.concurrency_level)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("routing_predicate", &self.routing_predicate)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// RPC PUBLISHER
// ============================================================================

#[derive(Clone, Debug)]
pub struct RpcPublisherConfig {
    pub(crate) publisher: PublisherConfig,
    pub(crate) use_fast_reply: bool,
    pub(crate) reply_exchange: String,
    pub(crate) default_timeout: Option<Duration>,
}

impl Default for RpcPublisherConfig {
    fn default() -> Self {
        Self {
            publisher: PublisherConfig::default(),
            use_fast_reply: true,
            reply_exchange: String::new(),
            default_timeout: None,
        }
    }
}

impl RpcPublisherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: PublisherConfig) -> Self {
        self.publisher = publisher;
        self
    }

    /// Give every request its own temporary reply queue bound to the reply
    /// exchange. Costs one queue declaration per call but works across
    /// federated brokers, which fast reply does not.
    #[must_use]
    pub fn disable_fast_reply(mut self) -> Self {
        self.use_fast_reply = false;
        self
    }

    /// Exchange the per-call reply queues are bound to.
    #[must_use]
    pub fn with_reply_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.reply_exchange = exchange.into();
        self
    }

    /// Timeout used by `send_and_wait` when the caller gives none.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn uses_fast_reply(&self) -> bool {
        self.use_fast_reply
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.publisher.validate()?;
        if self.default_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "default_timeout",
                reason: "cannot be zero".into(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// BUS
// ============================================================================

/// Transport selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process broker with exchanges, queues and acknowledgements.
    Memory,
    /// Length-prefixed frames over TCP. Subscribers bind, publishers connect.
    Tcp { host: String, port: u16 },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Envelope encoding on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    #[default]
    Json,
    Bincode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Initial capacity of each pooled buffer
    pub buffer_capacity: usize,
    /// Buffers kept for reuse; extra buffers are dropped on release
    pub max_pooled: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 4 * 1024,
            max_pooled: 64,
        }
    }
}

/// Process-level bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus identity; generated when absent
    pub bus_id: Option<String>,
    /// Default exchange for publishers and subscribers
    pub exchange: String,
    pub transport: TransportConfig,
    pub encoder: EncoderKind,
    /// Largest accepted frame body, in bytes
    pub max_frame_len: usize,
    /// Shared buffer pool; `None` disables pooling
    pub buffer_pool: Option<BufferPoolConfig>,
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
    /// Default `send_and_wait` timeout
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// How often abandoned RPC entries are swept
    #[serde(with = "humantime_serde")]
    pub pending_sweep_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_id: None,
            exchange: "amq.topic".into(),
            transport: TransportConfig::default(),
            encoder: EncoderKind::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            buffer_pool: Some(BufferPoolConfig::default()),
            open_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            pending_sweep_interval: Duration::from_secs(5),
        }
    }
}

impl BusConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.bus_id {
            if id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "bus_id",
                    reason: "cannot be blank".into(),
                });
            }
        }

        if self.max_frame_len == 0 || self.max_frame_len > u32::MAX as usize {
            return Err(ConfigError::InvalidValue {
                field: "max_frame_len",
                reason: format!("must be between 1 and {}", u32::MAX),
            });
        }

        if let Some(pool) = &self.buffer_pool {
            if pool.max_pooled == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "buffer_pool.max_pooled",
                    reason: "cannot be 0".into(),
                });
            }
        }

        if let TransportConfig::Tcp { host, .. } = &self.transport {
            if host.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "transport.host",
                    reason: "cannot be empty".into(),
                });
            }
        }

        let timeouts = [
            ("open_timeout", self.open_timeout),
            ("close_timeout", self.close_timeout),
            ("rpc_timeout", self.rpc_timeout),
            ("pending_sweep_interval", self.pending_sweep_interval),
        ];
        for (field, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "cannot be 0".into(),
                });
            }
        }

        Ok(())
    }
}
