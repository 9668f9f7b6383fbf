//! # RPC Correlator
//!
//! Request/reply on top of publish/subscribe. Each request gets a fresh
//! [`CorrelationId`] and a pending entry in [`PendingRpcTable`]; the reply
//! listener completes the entry when a message with that id arrives.
//!
//! Flow:
//! 1. `send_and_wait` registers the id and gets a oneshot receiver
//! 2. The request is published with `CorrelationId` and `ReplyTo` set
//! 3. The reply listener receives the reply and calls `complete()`
//! 4. The caller awaits the receiver until its deadline
//!
//! Reply addressing:
//! - Fast reply (default): one auto-delete reply queue per RPC publisher,
//!   addressed through the default exchange. No per-call setup, but replies
//!   only reach it through the broker that owns the queue, so it does not
//!   work across federated brokers.
//! - Per-call reply: a temporary queue per request, bound to the configured
//!   reply exchange. One extra declaration per call.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::publisher::{PublishOptions, Publisher};
use crate::channel::{ChannelState, InputChannel};
use crate::codec::{FrameCodec, SerializerRegistry};
use crate::domain::{BusError, CorrelationId, Message};
use crate::ports::{InputBinding, Transport};
use bus_telemetry::metrics;

// ============================================================================
// PENDING TABLE
// ============================================================================

/// A request waiting for its reply.
struct PendingRpc {
    /// Single-assignment result slot.
    sender: oneshot::Sender<Message>,
    created_at: Instant,
    action: String,
    timeout: Duration,
}

/// Counters for the pending table.
#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_registered: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_timeouts: AtomicU64,
    /// Entries removed without a reply: cancelled, swept, or caller gone.
    pub total_cancelled: AtomicU64,
}

/// Outstanding requests keyed by correlation id.
///
/// Mutated by the reply listener (on reply) and by callers (on register and
/// timeout). No lock is held while a caller waits.
pub struct PendingRpcTable {
    pending: DashMap<CorrelationId, PendingRpc>,
    default_timeout: Duration,
    stats: PendingStats,
}

impl PendingRpcTable {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            default_timeout,
            stats: PendingStats::default(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a request under a fresh id that is not currently pending.
    pub fn register(
        &self,
        action: &str,
        timeout: Option<Duration>,
    ) -> (CorrelationId, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        let request = PendingRpc {
            sender: tx,
            created_at: Instant::now(),
            action: action.to_string(),
            timeout: timeout.unwrap_or(self.default_timeout),
        };

        let correlation_id = loop {
            let candidate = CorrelationId::new();
            if let Entry::Vacant(slot) = self.pending.entry(candidate) {
                slot.insert(request);
                break candidate;
            }
        };
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        metrics::RPC_PENDING.inc();

        debug!(%correlation_id, action, "Registered pending RPC");
        (correlation_id, rx)
    }

    /// Deliver a reply. Returns `false` if the id is unknown, already
    /// completed, or its caller is gone.
    pub fn complete(&self, correlation_id: CorrelationId, reply: Message) -> bool {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            warn!(%correlation_id, "Reply for unknown or expired correlation ID");
            return false;
        };
        metrics::RPC_PENDING.dec();

        let elapsed = pending.created_at.elapsed();
        match pending.sender.send(reply) {
            Ok(()) => {
                self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
                metrics::RPC_LATENCY.observe(elapsed.as_secs_f64());
                debug!(
                    %correlation_id,
                    action = pending.action,
                    response_time_ms = elapsed.as_millis(),
                    "Completed pending RPC"
                );
                true
            }
            Err(_) => {
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(%correlation_id, action = pending.action, "RPC caller dropped");
                false
            }
        }
    }

    /// Remove an entry without a reply. Returns `false` if it was already
    /// completed.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        if self.pending.remove(correlation_id).is_some() {
            metrics::RPC_PENDING.dec();
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Record that a caller gave up at its deadline. Same as `cancel` but
    /// counted as a timeout.
    pub fn expire(&self, correlation_id: &CorrelationId) -> bool {
        if self.pending.remove(correlation_id).is_some() {
            metrics::RPC_PENDING.dec();
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
            metrics::RPC_TIMEOUTS.inc();
            true
        } else {
            false
        }
    }

    /// Drop entries whose caller vanished, or that outlived twice their
    /// timeout. Callers time themselves out; this only collects leftovers.
    pub fn remove_stale(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.pending.retain(|id, request| {
            let elapsed = now.duration_since(request.created_at);
            let stale =
                request.sender.is_closed() || elapsed > request.timeout.saturating_mul(2);
            if stale {
                debug!(
                    correlation_id = %id,
                    action = request.action,
                    elapsed_ms = elapsed.as_millis(),
                    "Removing stale pending RPC"
                );
                removed += 1;
            }
            !stale
        });

        if removed > 0 {
            self.stats
                .total_cancelled
                .fetch_add(removed as u64, Ordering::Relaxed);
            metrics::RPC_PENDING.sub(removed as f64);
        }
        removed
    }

    /// Drop every entry. Waiting callers resolve with `RpcAborted`.
    pub fn clear(&self) -> usize {
        let mut count = 0;
        self.pending.retain(|_, _| {
            count += 1;
            false
        });
        metrics::RPC_PENDING.sub(count as f64);
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

/// Deadline `timeout` from now. Timeouts past the clock's range wait
/// (practically) forever.
fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// About thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Background task that collects stale entries.
pub async fn sweep_task(table: Arc<PendingRpcTable>, interval: Duration) {
    let mut sweep_interval = tokio::time::interval(interval);
    sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        sweep_interval.tick().await;
        let removed = table.remove_stale();
        if removed > 0 {
            debug!(removed, "Swept stale pending RPCs");
        }
    }
}

/// Feed replies from `channel` into `table` until the channel stops.
async fn reply_listener(channel: Arc<InputChannel>, table: Arc<PendingRpcTable>, shared: bool) {
    loop {
        match channel.receive().await {
            Ok(Some(received)) => {
                if let Err(e) = channel.ack(received.tag).await {
                    debug!(channel = channel.name(), error = %e, "Reply acknowledgement failed");
                }
                match received.message.correlation_id() {
                    Some(correlation_id) => {
                        table.complete(correlation_id, received.message);
                    }
                    None => warn!(
                        channel = channel.name(),
                        action = received.message.action(),
                        "Reply without correlation ID dropped"
                    ),
                }
            }
            Ok(None) => break,
            Err(e) if e.is_shutdown() => break,
            Err(e) => {
                warn!(channel = channel.name(), error = %e, "Reply channel failed");
                break;
            }
        }
    }

    if shared {
        let dropped = table.clear();
        if dropped > 0 {
            warn!(dropped, "Reply listener stopped with requests outstanding");
        }
    }
}

// ============================================================================
// RPC PUBLISHER
// ============================================================================

enum ReplyMode {
    Fast {
        channel: Arc<InputChannel>,
        queue: String,
    },
    PerCall {
        exchange: String,
    },
}

/// Everything the RPC publisher needs, assembled by the bus.
pub(crate) struct RpcParts {
    pub publisher: Publisher,
    pub transport: Arc<dyn Transport>,
    pub codec: FrameCodec,
    pub serializers: SerializerRegistry,
    pub use_fast_reply: bool,
    pub reply_exchange: String,
    pub default_timeout: Duration,
    pub open_timeout: Duration,
    pub close_timeout: Duration,
    pub sweep_interval: Duration,
    pub runtime: Option<Handle>,
}

/// Publisher whose sends wait for a correlated reply.
pub struct RpcPublisher {
    publisher: Publisher,
    transport: Arc<dyn Transport>,
    codec: FrameCodec,
    serializers: SerializerRegistry,
    table: Arc<PendingRpcTable>,
    reply: ReplyMode,
    open_timeout: Duration,
    close_timeout: Duration,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcPublisher {
    /// Open the reply path and start the background tasks. The request
    /// channel is expected to be open already.
    pub(crate) async fn start(parts: RpcParts) -> Result<Self, BusError> {
        let runtime = parts.runtime.unwrap_or_else(Handle::current);
        let table = Arc::new(PendingRpcTable::new(parts.default_timeout));
        let mut tasks = vec![runtime.spawn(sweep_task(Arc::clone(&table), parts.sweep_interval))];

        let reply = if parts.use_fast_reply {
            let channel = Arc::new(InputChannel::new(
                "rpc-fast-reply",
                Arc::clone(&parts.transport),
                InputBinding::temporary("", "#"),
                parts.codec.clone(),
                Some(runtime.clone()),
            ));
            if let Err(e) = channel.open(parts.open_timeout).await {
                for task in &tasks {
                    task.abort();
                }
                return Err(e);
            }
            let queue = channel.queue_name().ok_or(BusError::InvalidState {
                operation: "fast reply",
                state: channel.state(),
            })?;
            tasks.push(runtime.spawn(reply_listener(
                Arc::clone(&channel),
                Arc::clone(&table),
                true,
            )));
            info!(queue = %queue, "Fast reply queue ready");
            ReplyMode::Fast { channel, queue }
        } else {
            ReplyMode::PerCall {
                exchange: parts.reply_exchange,
            }
        };

        Ok(Self {
            publisher: parts.publisher,
            transport: parts.transport,
            codec: parts.codec,
            serializers: parts.serializers,
            table,
            reply,
            open_timeout: parts.open_timeout,
            close_timeout: parts.close_timeout,
            runtime,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn pending(&self) -> &Arc<PendingRpcTable> {
        &self.table
    }

    pub fn uses_fast_reply(&self) -> bool {
        matches!(self.reply, ReplyMode::Fast { .. })
    }

    /// Plain publish with no reply expected.
    pub async fn publish<T>(&self, action: &str, value: &T) -> Result<(), BusError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher.publish(action, value).await
    }

    /// Send `value` and decode the reply body into `R`.
    ///
    /// `timeout` falls back to the configured default. Fails with
    /// `RpcTimeout` when no reply arrives in time and with `RemoteHandler`
    /// when the responder's handler failed.
    pub async fn send_and_wait<T, R>(
        &self,
        action: &str,
        value: &T,
        timeout: Option<Duration>,
    ) -> Result<R, BusError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self
            .send_and_wait_message(action, value, PublishOptions::new(), timeout)
            .await?;
        Ok(self.serializers.from_body(&reply)?)
    }

    /// Like `send_and_wait` but returns the raw reply message.
    pub async fn send_and_wait_message<T>(
        &self,
        action: &str,
        value: &T,
        options: PublishOptions,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError>
    where
        T: Serialize + ?Sized,
    {
        let timeout = timeout.unwrap_or(self.table.default_timeout());
        let deadline = deadline_after(timeout);
        let request = self.publisher.build_message(action, value, options)?;

        let (correlation_id, mut rx) = self.table.register(action, Some(timeout));
        metrics::RPC_REQUESTS.inc();
        // released on every exit, including the caller dropping this future
        let mut call = PendingCall {
            table: &self.table,
            correlation_id,
            reply_channel: None,
            listener: None,
        };

        let reply_to = self.reply_address(&mut call, deadline).await?;
        let request = request
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_to);
        self.publisher.send(request).await?;
        let reply = self.wait(correlation_id, &mut rx, deadline, timeout).await?;
        drop(call);

        match reply.rpc_error() {
            Some(message) => Err(BusError::RemoteHandler {
                action: action.to_string(),
                message: message.to_string(),
            }),
            None => Ok(reply),
        }
    }

    async fn reply_address(
        &self,
        call: &mut PendingCall<'_>,
        deadline: tokio::time::Instant,
    ) -> Result<String, BusError> {
        match &self.reply {
            ReplyMode::Fast { channel, queue } => {
                if channel.state() != ChannelState::Opened {
                    return Err(BusError::InvalidState {
                        operation: "send_and_wait",
                        state: channel.state(),
                    });
                }
                Ok(queue.clone())
            }
            ReplyMode::PerCall { exchange } => {
                let queue = format!("rpc.reply.{}", call.correlation_id);
                let mut binding = InputBinding::temporary(exchange.clone(), queue.clone());
                binding.queue_name = Some(queue.clone());

                let channel = Arc::new(InputChannel::new(
                    queue.clone(),
                    Arc::clone(&self.transport),
                    binding,
                    self.codec.clone(),
                    Some(self.runtime.clone()),
                ));
                call.reply_channel = Some(Arc::clone(&channel));
                let budget = deadline
                    .saturating_duration_since(tokio::time::Instant::now())
                    .min(self.open_timeout);
                channel.open(budget).await?;
                call.listener = Some(self.runtime.spawn(reply_listener(
                    channel,
                    Arc::clone(&self.table),
                    false,
                )));
                Ok(queue)
            }
        }
    }

    async fn wait(
        &self,
        correlation_id: CorrelationId,
        rx: &mut oneshot::Receiver<Message>,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        match tokio::time::timeout_at(deadline, &mut *rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::RpcAborted { correlation_id }),
            Err(_) => settle_expired(&self.table, correlation_id, rx, timeout).await,
        }
    }

    pub async fn close(&self) -> Result<(), BusError> {
        let result = self.publisher.close().await;
        if let ReplyMode::Fast { channel, .. } = &self.reply {
            channel.close(self.close_timeout).await?;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.table.clear();
        result
    }

    pub fn abort(&self) {
        self.publisher.abort();
        if let ReplyMode::Fast { channel, .. } = &self.reply {
            channel.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.table.clear();
    }
}

/// One outstanding call. Dropping it removes the pending entry and tears
/// down a per-call reply queue and its listener.
struct PendingCall<'a> {
    table: &'a PendingRpcTable,
    correlation_id: CorrelationId,
    reply_channel: Option<Arc<InputChannel>>,
    listener: Option<JoinHandle<()>>,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(channel) = self.reply_channel.take() {
            channel.abort();
        }
        if self.table.cancel(&self.correlation_id) {
            debug!(correlation_id = %self.correlation_id, "RPC call dropped before its outcome");
        }
    }
}

/// Resolve a call whose deadline passed. Either the expiry wins, or a reply
/// was already taken out of the table and is on its way through `rx`.
async fn settle_expired(
    table: &PendingRpcTable,
    correlation_id: CorrelationId,
    rx: &mut oneshot::Receiver<Message>,
    timeout: Duration,
) -> Result<Message, BusError> {
    if table.expire(&correlation_id) {
        warn!(%correlation_id, timeout_ms = timeout.as_millis(), "RPC timed out");
        return Err(BusError::RpcTimeout {
            correlation_id,
            timeout,
        });
    }
    // the completer removed the entry first, so it sends or drops promptly
    (&mut *rx)
        .await
        .map_err(|_| BusError::RpcAborted { correlation_id })
}

impl Drop for RpcPublisher {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RpcPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPublisher")
            .field("publisher", &self.publisher)
            .field("fast_reply", &self.uses_fast_reply())
            .field("pending", &self.table.pending_count())
            .finish_non_exhaustive()
    }
}
