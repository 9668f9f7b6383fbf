//! # Subscription Dispatcher
//!
//! One receive loop per subscriber pulls messages from the input channel
//! and hands them to a pool of `concurrency_level` workers through a bounded
//! queue. Whichever worker is idle takes the next message, so nothing is
//! dropped or handled twice.
//!
//! Each worker runs a message through:
//!
//! 1. the message filter (self-publish suppression, routing predicate),
//! 2. the handler registered for its action,
//! 3. acknowledgement: before the handler in plain mode; after success in
//!    transactional mode, where failures are requeued or dropped according
//!    to the exception filter,
//! 4. the reply, when the message asked for one and the handler produced a
//!    value.
//!
//! Ordering: with one worker handlers see messages in transport order. More
//! workers process messages in parallel with no ordering guarantee.

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::publisher::{PublishOptions, Publisher};
use crate::channel::{ChannelState, InputChannel, ReceivedMessage};
use crate::codec::SerializerRegistry;
use crate::domain::{headers, BusError, HandlerError, Message, MessageFilter};
use crate::ports::{
    ErrorContext, ErrorStage, ErrorSubscriber, ExceptionFilter, FnHandler, MessageHandler,
    MessageTrace,
};
use bus_telemetry::{log_message_event, metrics};

/// Snapshot of a subscriber's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub received: u64,
    pub filtered: u64,
    pub handled: u64,
    pub failed: u64,
    pub requeued: u64,
    pub replied: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    filtered: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    replied: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            received: self.received.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
        }
    }
}

/// Everything the dispatcher needs, assembled by the bus.
pub(crate) struct DispatcherParts {
    pub consumer_tag: String,
    pub channel: Arc<InputChannel>,
    pub filter: MessageFilter,
    pub serializers: SerializerRegistry,
    pub reply_publisher: Option<Publisher>,
    pub error_subscriber: Arc<dyn ErrorSubscriber>,
    pub trace: Option<Arc<dyn MessageTrace>>,
    pub transactional: bool,
    pub exception_filter: Option<Arc<dyn ExceptionFilter>>,
    pub concurrency_level: usize,
    pub task_scheduler: Option<Handle>,
    pub close_timeout: Duration,
}

struct Dispatcher {
    consumer_tag: String,
    channel: Arc<InputChannel>,
    filter: MessageFilter,
    serializers: SerializerRegistry,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    reply_publisher: Option<Publisher>,
    error_subscriber: Arc<dyn ErrorSubscriber>,
    trace: Option<Arc<dyn MessageTrace>>,
    transactional: bool,
    exception_filter: Option<Arc<dyn ExceptionFilter>>,
    counters: Counters,
}

/// A started-or-not subscription with its handlers.
pub struct Subscriber {
    dispatcher: Arc<Dispatcher>,
    concurrency_level: usize,
    task_scheduler: Option<Handle>,
    close_timeout: Duration,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Subscriber {
    pub(crate) fn new(parts: DispatcherParts) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                consumer_tag: parts.consumer_tag,
                channel: parts.channel,
                filter: parts.filter,
                serializers: parts.serializers,
                handlers: RwLock::new(HashMap::new()),
                reply_publisher: parts.reply_publisher,
                error_subscriber: parts.error_subscriber,
                trace: parts.trace,
                transactional: parts.transactional,
                exception_filter: parts.exception_filter,
                counters: Counters::default(),
            }),
            concurrency_level: parts.concurrency_level,
            task_scheduler: parts.task_scheduler,
            close_timeout: parts.close_timeout,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.dispatcher.consumer_tag
    }

    pub fn channel(&self) -> &Arc<InputChannel> {
        &self.dispatcher.channel
    }

    pub fn state(&self) -> ChannelState {
        self.dispatcher.channel.state()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.counters.snapshot()
    }

    /// Register a typed handler for `action`.
    ///
    /// The body is decoded into `T`. A `()` or `None` result is void; any
    /// other result is sent back when the message carries a reply address.
    pub fn subscribe<T, R, F, Fut>(
        &self,
        action: impl Into<String>,
        handler: F,
    ) -> Result<(), BusError>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        self.subscribe_handler(action, Arc::new(FnHandler::<T, R, F>::new(handler)))
    }

    /// Register a raw handler that sees the whole message.
    pub fn subscribe_handler(
        &self,
        action: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        let action = action.into();
        let mut handlers = self.dispatcher.handlers.write();
        if handlers.contains_key(&action) {
            return Err(BusError::AlreadySubscribed(action));
        }
        debug!(consumer_tag = %self.dispatcher.consumer_tag, %action, "Handler registered");
        handlers.insert(action, handler);
        Ok(())
    }

    /// Open the channels and start the receive loop and workers.
    pub async fn start(&self, timeout: Duration) -> Result<(), BusError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BusError::InvalidState {
                operation: "start",
                state: self.state(),
            });
        }

        let dispatcher = &self.dispatcher;
        dispatcher.channel.open(timeout).await?;
        if let Some(reply) = &dispatcher.reply_publisher {
            if let Err(e) = reply.channel().open(timeout).await {
                dispatcher.channel.abort();
                return Err(e);
            }
        }

        let runtime = self.task_scheduler.clone().unwrap_or_else(Handle::current);
        let (tx, rx) = mpsc::channel(self.concurrency_level);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut tasks = Vec::with_capacity(self.concurrency_level + 1);
        for worker in 0..self.concurrency_level {
            tasks.push(runtime.spawn(worker_loop(
                Arc::clone(dispatcher),
                Arc::clone(&rx),
                worker,
            )));
        }
        tasks.push(runtime.spawn(receive_loop(Arc::clone(dispatcher), tx)));
        *self.tasks.lock() = tasks;

        info!(
            consumer_tag = %dispatcher.consumer_tag,
            queue = ?dispatcher.channel.queue_name(),
            workers = self.concurrency_level,
            transactional = dispatcher.transactional,
            "Subscriber started"
        );
        Ok(())
    }

    pub fn start_blocking(&self, timeout: Duration) -> Result<(), BusError> {
        if Handle::try_current().is_ok() {
            return Err(BusError::BlockingInAsyncContext { operation: "start" });
        }
        let runtime = self.task_scheduler.clone().ok_or(BusError::NoRuntime)?;
        runtime.block_on(self.start(timeout))
    }

    /// Stop consuming. Unacknowledged messages go back to the queue; workers
    /// get until the close timeout to finish their current message.
    pub async fn close(&self) -> Result<(), BusError> {
        let dispatcher = &self.dispatcher;
        let result = dispatcher.channel.close(self.close_timeout).await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(self.close_timeout, join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                consumer_tag = %dispatcher.consumer_tag,
                "Workers did not stop in time, aborting"
            );
            for task in aborts {
                task.abort();
            }
        }

        if let Some(reply) = &dispatcher.reply_publisher {
            reply.close().await?;
        }
        debug!(consumer_tag = %dispatcher.consumer_tag, "Subscriber closed");
        result
    }

    pub fn abort(&self) {
        self.dispatcher.channel.abort();
        if let Some(reply) = &self.dispatcher.reply_publisher {
            reply.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("consumer_tag", &self.dispatcher.consumer_tag)
            .field("channel", &self.dispatcher.channel)
            .field("concurrency_level", &self.concurrency_level)
            .field("transactional", &self.dispatcher.transactional)
            .finish_non_exhaustive()
    }
}

async fn receive_loop(dispatcher: Arc<Dispatcher>, tx: mpsc::Sender<ReceivedMessage>) {
    loop {
        match dispatcher.channel.receive().await {
            Ok(Some(received)) => {
                if tx.send(received).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) if e.is_shutdown() => break,
            Err(e) => {
                // the channel has already been aborted
                let context = ErrorContext::new(&dispatcher.consumer_tag, ErrorStage::Receive);
                dispatcher.report(&e, context);
                break;
            }
        }
    }
    debug!(consumer_tag = %dispatcher.consumer_tag, "Receive loop stopped");
}

async fn worker_loop(
    dispatcher: Arc<Dispatcher>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ReceivedMessage>>>,
    worker: usize,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(received) = next else { break };

        if dispatcher.channel.state() != ChannelState::Opened {
            // closing: the transport requeues what we have not acknowledged
            continue;
        }
        dispatcher.process(received).await;
    }
    debug!(consumer_tag = %dispatcher.consumer_tag, worker, "Worker stopped");
}

impl Dispatcher {
    async fn process(&self, received: ReceivedMessage) {
        let ReceivedMessage {
            message,
            tag,
            redelivered,
        } = received;

        metrics::MESSAGES_RECEIVED.inc();
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if let Some(trace) = &self.trace {
            trace.message_arrived(&self.consumer_tag, &message);
        }

        let decision = self.filter.accepts(&message);
        if !decision.is_accepted() {
            self.drop_filtered(tag, &message, decision.reason()).await;
            return;
        }

        let handler = self.handlers.read().get(message.action()).cloned();
        let Some(handler) = handler else {
            self.drop_filtered(tag, &message, "no_handler").await;
            return;
        };

        if !self.transactional {
            self.acknowledge(tag, &message).await;
        }

        let result = AssertUnwindSafe(handler.handle(&message, &self.serializers))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

        match result {
            Ok(value) => {
                self.counters.handled.fetch_add(1, Ordering::Relaxed);
                if self.transactional {
                    self.acknowledge(tag, &message).await;
                }
                if !value.is_null() {
                    self.reply(&message, value, None).await;
                }
            }
            Err(error) => self.handle_failure(tag, redelivered, &message, error).await,
        }
    }

    async fn handle_failure(
        &self,
        tag: u64,
        redelivered: bool,
        message: &Message,
        error: HandlerError,
    ) {
        metrics::HANDLER_FAILURES.inc();
        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        if self.transactional {
            let retryable = self
                .exception_filter
                .as_ref()
                .map_or(true, |filter| filter.is_retryable(&error));

            if retryable {
                match self.channel.nack(tag, true).await {
                    Ok(()) => {
                        metrics::MESSAGES_REQUEUED.inc();
                        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                        log_message_event!(
                            warn,
                            message.action(),
                            "Handler failed, message requeued",
                            consumer_tag = %self.consumer_tag,
                            redelivered,
                            error = %error
                        );
                    }
                    Err(e) => self.report_ack_failure(&e, message),
                }
                return;
            }
            // poison message: drop it rather than loop forever
            self.acknowledge(tag, message).await;
        }

        self.report(
            &BusError::Handler(error.clone()),
            ErrorContext::new(&self.consumer_tag, ErrorStage::Handle).for_message(message),
        );
        self.reply(message, Value::Null, Some(&error)).await;
    }

    async fn drop_filtered(&self, tag: u64, message: &Message, reason: &'static str) {
        metrics::MESSAGES_FILTERED.with_label_values(&[reason]).inc();
        self.counters.filtered.fetch_add(1, Ordering::Relaxed);
        log_message_event!(
            debug,
            message.action(),
            "Message filtered",
            consumer_tag = %self.consumer_tag,
            reason
        );
        self.acknowledge(tag, message).await;
    }

    async fn acknowledge(&self, tag: u64, message: &Message) {
        if let Err(e) = self.channel.ack(tag).await {
            self.report_ack_failure(&e, message);
        }
    }

    fn report_ack_failure(&self, error: &BusError, message: &Message) {
        if error.is_shutdown() {
            debug!(consumer_tag = %self.consumer_tag, error = %error, "Acknowledgement skipped");
        } else {
            self.report(
                error,
                ErrorContext::new(&self.consumer_tag, ErrorStage::Acknowledge).for_message(message),
            );
        }
    }

    /// Send a reply when the request asked for one.
    ///
    /// `failure` turns it into an error reply carrying the `RpcError` header.
    async fn reply(&self, request: &Message, value: Value, failure: Option<&HandlerError>) {
        let (Some(publisher), Some(reply_to)) = (&self.reply_publisher, request.reply_to()) else {
            return;
        };

        let options = PublishOptions::new().with_routing_key(reply_to);
        let built = publisher
            .build_message(request.action(), &value, options)
            .map(|reply| match request.correlation_id() {
                Some(correlation_id) => reply.with_correlation_id(correlation_id),
                None => reply,
            })
            .map(|reply| match failure {
                Some(error) => reply.with_header(headers::RPC_ERROR, error.to_string()),
                None => reply,
            });

        let outcome = match built {
            Ok(reply) => publisher.send(reply).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                self.counters.replied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.report(
                &e,
                ErrorContext::new(&self.consumer_tag, ErrorStage::Reply).for_message(request),
            ),
        }
    }

    fn report(&self, error: &BusError, context: ErrorContext) {
        self.error_subscriber.on_error(error, &context);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
