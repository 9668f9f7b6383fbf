//! # Message Bus
//!
//! Entry point: owns the transport, the shared buffer pool and the bus
//! identity, and creates publishers, subscribers and RPC publishers bound
//! to them. `dispose` closes everything the bus created.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::correlator::{RpcParts, RpcPublisher};
use super::dispatcher::{DispatcherParts, Subscriber};
use super::publisher::Publisher;
use crate::adapters::{InMemoryBroker, LoggingErrorSubscriber, TcpTransport};
use crate::channel::{InputChannel, OutputChannel};
use crate::codec::{encoder_for, BufferPool, FrameCodec, MessageEncoder, SerializerRegistry};
use crate::domain::{
    BusConfig, BusError, BusId, MessageFilter, PublisherConfig, RpcPublisherConfig,
    SubscriberConfig, TransportConfig,
};
use crate::ports::{ErrorSubscriber, InputBinding, Transport, TransportKind};

enum TrackedChannel {
    Output(Weak<OutputChannel>),
    Input(Weak<InputChannel>),
}

pub struct MessageBus {
    bus_id: BusId,
    config: BusConfig,
    transport: Arc<dyn Transport>,
    encoder: Arc<dyn MessageEncoder>,
    pool: Option<Arc<BufferPool>>,
    runtime: Handle,
    channels: Mutex<Vec<TrackedChannel>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl MessageBus {
    /// Build a bus with the transport named in `config`.
    ///
    /// Must be called inside a Tokio runtime; the runtime is captured for
    /// background tasks and the `*_blocking` operations.
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Memory => Arc::new(InMemoryBroker::new()),
            TransportConfig::Tcp { host, port } => {
                let codec = FrameCodec::new(encoder_for(config.encoder))
                    .with_max_frame_len(config.max_frame_len);
                Arc::new(TcpTransport::new(host.clone(), *port, codec))
            }
        };
        Self::with_transport(config, transport)
    }

    /// Build a bus on an existing transport. Several buses can share one
    /// [`InMemoryBroker`] this way.
    pub fn with_transport(
        config: BusConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BusError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let bus_id = config
            .bus_id
            .as_deref()
            .map_or_else(BusId::generate, BusId::new);
        let pool = config
            .buffer_pool
            .as_ref()
            .map(|pool| Arc::new(BufferPool::from_config(pool)));

        info!(
            bus_id = %bus_id,
            transport = %transport.kind(),
            exchange = %config.exchange,
            encoder = ?config.encoder,
            "Message bus created"
        );

        Ok(Self {
            bus_id,
            encoder: encoder_for(config.encoder),
            config,
            transport,
            pool,
            runtime,
            channels: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn bus_id(&self) -> &BusId {
        &self.bus_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The pool shared by every channel that does not bring its own.
    pub fn buffer_pool(&self) -> Option<&Arc<BufferPool>> {
        self.pool.as_ref()
    }

    /// Create and open a publisher.
    pub async fn create_publisher(&self, config: PublisherConfig) -> Result<Publisher, BusError> {
        self.check_live()?;
        config.validate()?;

        let publisher = self.build_publisher(&config, None)?;
        publisher.channel().open(self.config.open_timeout).await?;
        Ok(publisher)
    }

    /// Create a subscriber. Register handlers, then call `start`.
    pub fn create_subscriber(&self, config: SubscriberConfig) -> Result<Subscriber, BusError> {
        self.check_live()?;
        config.validate()?;
        if config.transactional && !self.transport.supports_acknowledgement() {
            return Err(BusError::Unsupported(
                "transactional delivery needs a transport with acknowledgements",
            ));
        }

        let id = self.next_id();
        let consumer_tag = config
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}.sub-{id}", self.bus_id));
        let exchange = config
            .exchange
            .clone()
            .unwrap_or_else(|| self.config.exchange.clone());

        let mut binding = InputBinding::temporary(exchange, config.routing_key.clone());
        binding.consumer_tag = consumer_tag.clone();
        if let Some(queue) = &config.durable_queue {
            binding.queue_name = Some(queue.name.clone());
            binding.durable = true;
            binding.auto_delete = false;
            binding.create_bindings = queue.create_bindings;
        }

        let codec = self.codec(config.buffer_pool.clone());
        let channel = Arc::new(InputChannel::new(
            consumer_tag.clone(),
            Arc::clone(&self.transport),
            binding,
            codec.clone(),
            Some(self.runtime.clone()),
        ));
        self.track(TrackedChannel::Input(Arc::downgrade(&channel)));

        let serializers =
            SerializerRegistry::new(config.serializer_settings, &config.custom_serializers);
        // stream transports have no reply addressing
        let replies = !config.never_reply && self.transport.kind() != TransportKind::Stream;
        let reply_publisher = if !replies {
            None
        } else {
            let reply_channel = Arc::new(OutputChannel::new(
                format!("{consumer_tag}.reply"),
                Arc::clone(&self.transport),
                config.reply_exchange.clone(),
                codec,
                Some(self.runtime.clone()),
            ));
            self.track(TrackedChannel::Output(Arc::downgrade(&reply_channel)));
            Some(Publisher::new(
                self.bus_id.clone(),
                reply_channel,
                serializers.clone(),
                None,
                config.trace.clone(),
                self.config.close_timeout,
            ))
        };

        debug!(bus_id = %self.bus_id, consumer_tag = %consumer_tag, "Subscriber created");
        Ok(Subscriber::new(DispatcherParts {
            consumer_tag,
            channel,
            filter: MessageFilter::new(
                self.bus_id.clone(),
                config.receive_self_publish,
                config.routing_predicate.clone(),
            ),
            serializers,
            reply_publisher,
            error_subscriber: config.error_subscriber.clone().unwrap_or_else(|| {
                Arc::new(LoggingErrorSubscriber) as Arc<dyn ErrorSubscriber>
            }),
            trace: config.trace.clone(),
            transactional: config.transactional,
            exception_filter: config.exception_filter.clone(),
            concurrency_level: config.concurrency_level,
            task_scheduler: config
                .task_scheduler
                .clone()
                .or_else(|| Some(self.runtime.clone())),
            close_timeout: self.config.close_timeout,
        }))
    }

    /// Create an RPC publisher with its reply path open.
    pub async fn create_rpc_publisher(
        &self,
        config: RpcPublisherConfig,
    ) -> Result<RpcPublisher, BusError> {
        self.check_live()?;
        config.validate()?;
        if self.transport.kind() == TransportKind::Stream {
            return Err(BusError::Unsupported(
                "request/reply needs a broker transport",
            ));
        }

        let publisher = self.build_publisher(&config.publisher, Some("rpc"))?;
        publisher.channel().open(self.config.open_timeout).await?;

        let codec = self.codec(config.publisher.buffer_pool.clone());
        let parts = RpcParts {
            serializers: SerializerRegistry::new(
                config.publisher.serializer_settings,
                &config.publisher.custom_serializers,
            ),
            publisher,
            transport: Arc::clone(&self.transport),
            codec,
            use_fast_reply: config.use_fast_reply,
            reply_exchange: config.reply_exchange.clone(),
            default_timeout: config.default_timeout.unwrap_or(self.config.rpc_timeout),
            open_timeout: self.config.open_timeout,
            close_timeout: self.config.close_timeout,
            sweep_interval: self.config.pending_sweep_interval,
            runtime: Some(self.runtime.clone()),
        };
        match RpcPublisher::start(parts).await {
            Ok(rpc) => Ok(rpc),
            Err(e) => {
                warn!(bus_id = %self.bus_id, error = %e, "RPC publisher failed to start");
                Err(e)
            }
        }
    }

    /// Close every channel this bus created, then release the transport.
    ///
    /// Channels get `close_timeout` to close gracefully and are aborted if
    /// they fail. Further `create_*` calls fail.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let channels = std::mem::take(&mut *self.channels.lock());
        let timeout = self.config.close_timeout;
        for tracked in channels {
            let result = match tracked {
                TrackedChannel::Output(weak) => match weak.upgrade() {
                    Some(channel) => channel.close(timeout).await.map_err(|e| {
                        channel.abort();
                        e
                    }),
                    None => Ok(()),
                },
                TrackedChannel::Input(weak) => match weak.upgrade() {
                    Some(channel) => channel.close(timeout).await.map_err(|e| {
                        channel.abort();
                        e
                    }),
                    None => Ok(()),
                },
            };
            if let Err(e) = result {
                warn!(bus_id = %self.bus_id, error = %e, "Channel did not close cleanly");
            }
        }

        self.transport.dispose().await;
        info!(bus_id = %self.bus_id, "Message bus disposed");
    }

    pub fn dispose_blocking(&self) -> Result<(), BusError> {
        if Handle::try_current().is_ok() {
            return Err(BusError::BlockingInAsyncContext {
                operation: "dispose",
            });
        }
        self.runtime.block_on(self.dispose());
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn build_publisher(
        &self,
        config: &PublisherConfig,
        role: Option<&str>,
    ) -> Result<Publisher, BusError> {
        let id = self.next_id();
        let exchange = config
            .exchange
            .clone()
            .unwrap_or_else(|| self.config.exchange.clone());
        let name = match role {
            Some(role) => format!("{}.{role}-{id}", self.bus_id),
            None => format!("{}.pub-{id}", self.bus_id),
        };

        let channel = Arc::new(OutputChannel::new(
            name,
            Arc::clone(&self.transport),
            exchange,
            self.codec(config.buffer_pool.clone()),
            Some(self.runtime.clone()),
        ));
        self.track(TrackedChannel::Output(Arc::downgrade(&channel)));

        Ok(Publisher::new(
            self.bus_id.clone(),
            channel,
            SerializerRegistry::new(config.serializer_settings, &config.custom_serializers),
            config.routing_key.clone(),
            config.trace.clone(),
            self.config.close_timeout,
        ))
    }

    fn codec(&self, pool: Option<Arc<BufferPool>>) -> FrameCodec {
        FrameCodec::new(Arc::clone(&self.encoder))
            .with_pool(pool.or_else(|| self.pool.clone()))
            .with_max_frame_len(self.config.max_frame_len)
    }

    fn track(&self, channel: TrackedChannel) {
        let mut channels = self.channels.lock();
        channels.retain(|tracked| match tracked {
            TrackedChannel::Output(weak) => weak.strong_count() > 0,
            TrackedChannel::Input(weak) => weak.strong_count() > 0,
        });
        channels.push(channel);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_live(&self) -> Result<(), BusError> {
        if self.is_disposed() {
            return Err(BusError::Aborted {
                channel: format!("bus {}", self.bus_id),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("bus_id", &self.bus_id)
            .field("transport", &self.transport.kind())
            .field("encoder", &self.encoder.name())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
