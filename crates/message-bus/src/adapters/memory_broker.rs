//! # In-Memory Broker
//!
//! An AMQP-style broker living in the process:
//!
//! - Topic exchanges route by routing key (`*` one word, `#` any words).
//! - The default exchange `""` routes straight to the queue named by the
//!   routing key.
//! - Durable queues outlive their consumers; auto-delete queues vanish with
//!   their last consumer.
//! - Deliveries stay unacknowledged until `ack`. `nack(requeue)` and closing
//!   a consumer put them back at the head of the queue, flagged redelivered.
//!
//! Clone the broker to share it between several buses.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::domain::{topic_matches, TransportError};
use crate::ports::{
    Delivery, InputBinding, InputLink, Link, OutputLink, Transport, TransportKind,
};

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    topology: Mutex<Topology>,
    disposed: AtomicBool,
}

#[derive(Default)]
struct Topology {
    /// exchange name -> (binding pattern, queue name)
    exchanges: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, Arc<Queue>>,
}

struct QueuedFrame {
    frame: Bytes,
    redelivered: bool,
}

struct Queue {
    name: String,
    auto_delete: bool,
    state: Mutex<QueueState>,
    available: Notify,
}

#[derive(Default)]
struct QueueState {
    frames: VecDeque<QueuedFrame>,
    consumers: usize,
    deleted: bool,
}

impl Queue {
    fn new(name: String, auto_delete: bool) -> Self {
        Self {
            name,
            auto_delete,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    fn push_back(&self, frame: Bytes) {
        self.state.lock().frames.push_back(QueuedFrame {
            frame,
            redelivered: false,
        });
        self.available.notify_one();
    }

    /// Return frames to the head of the queue, keeping their order.
    fn requeue(&self, frames: impl DoubleEndedIterator<Item = Bytes>) {
        {
            let mut state = self.state.lock();
            for frame in frames.rev() {
                state.frames.push_front(QueuedFrame {
                    frame,
                    redelivered: true,
                });
            }
        }
        self.available.notify_one();
    }

    /// Take the head frame without waiting.
    fn try_pop(&self) -> Popped {
        let mut state = self.state.lock();
        if state.deleted {
            return Popped::Deleted;
        }
        let Some(frame) = state.frames.pop_front() else {
            return Popped::Empty;
        };
        let more = !state.frames.is_empty();
        drop(state);
        if more {
            // let a competing consumer pick up the rest
            self.available.notify_one();
        }
        Popped::Frame(frame)
    }

    fn delete(&self) {
        {
            let mut state = self.state.lock();
            state.deleted = true;
            state.frames.clear();
        }
        self.available.notify_waiters();
    }

    fn depth(&self) -> usize {
        self.state.lock().frames.len()
    }
}

enum Popped {
    Frame(QueuedFrame),
    Empty,
    Deleted,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a frame through an exchange. Returns the number of queues that
    /// received it; unroutable frames are dropped.
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, frame: Bytes) -> usize {
        let targets: Vec<Arc<Queue>> = {
            let topology = self.inner.topology.lock();
            if exchange.is_empty() {
                topology.queues.get(routing_key).cloned().into_iter().collect()
            } else {
                let mut names: Vec<&String> = topology
                    .exchanges
                    .get(exchange)
                    .map(|bindings| {
                        bindings
                            .iter()
                            .filter(|(pattern, _)| topic_matches(pattern, routing_key))
                            .map(|(_, queue)| queue)
                            .collect()
                    })
                    .unwrap_or_default();
                names.sort();
                names.dedup();
                names
                    .into_iter()
                    .filter_map(|name| topology.queues.get(name).cloned())
                    .collect()
            }
        };

        if targets.is_empty() {
            trace!(exchange, routing_key, "Unroutable frame dropped");
        }
        for queue in &targets {
            queue.push_back(frame.clone());
        }
        targets.len()
    }

    /// Messages waiting in a queue, `None` if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner.topology.lock().queues.get(queue).map(|q| q.depth())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.topology.lock().queues.contains_key(queue)
    }

    /// Names of every declared queue, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .topology
            .lock()
            .queues
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    fn declare_exchange(&self, exchange: &str) {
        if !exchange.is_empty() {
            self.inner
                .topology
                .lock()
                .exchanges
                .entry(exchange.to_string())
                .or_default();
        }
    }

    fn declare_queue(&self, binding: &InputBinding) -> Arc<Queue> {
        let name = binding
            .queue_name
            .clone()
            .unwrap_or_else(|| format!("amq.gen-{}", Uuid::new_v4()));

        let mut topology = self.inner.topology.lock();
        let queue = Arc::clone(topology.queues.entry(name.clone()).or_insert_with(|| {
            debug!(queue = %name, durable = binding.durable, "Queue declared");
            Arc::new(Queue::new(name.clone(), binding.auto_delete && !binding.durable))
        }));

        if binding.create_bindings && !binding.exchange.is_empty() {
            let bindings = topology
                .exchanges
                .entry(binding.exchange.clone())
                .or_default();
            let entry = (binding.routing_key.clone(), name);
            if !bindings.contains(&entry) {
                bindings.push(entry);
            }
        }

        queue.state.lock().consumers += 1;
        queue
    }

    /// Drop a consumer; deletes auto-delete queues left without consumers.
    fn release_consumer(&self, queue: &Arc<Queue>) {
        let orphaned = {
            let mut state = queue.state.lock();
            state.consumers = state.consumers.saturating_sub(1);
            queue.auto_delete && state.consumers == 0
        };
        if orphaned {
            let mut topology = self.inner.topology.lock();
            topology.queues.remove(&queue.name);
            for bindings in topology.exchanges.values_mut() {
                bindings.retain(|(_, name)| name != &queue.name);
            }
            drop(topology);
            queue.delete();
            debug!(queue = %queue.name, "Auto-delete queue removed");
        }
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    fn kind(&self) -> TransportKind {
        TransportKind::Broker
    }

    fn supports_acknowledgement(&self) -> bool {
        true
    }

    async fn connect_output(&self, exchange: &str) -> Result<Arc<dyn OutputLink>, TransportError> {
        self.check_open()?;
        self.declare_exchange(exchange);
        Ok(Arc::new(MemoryOutputLink {
            broker: self.clone(),
            exchange: exchange.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn connect_input(
        &self,
        binding: &InputBinding,
    ) -> Result<Arc<dyn InputLink>, TransportError> {
        self.check_open()?;
        let queue = self.declare_queue(binding);
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(MemoryInputLink {
            broker: self.clone(),
            queue,
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(Vec::new()),
            closed,
        }))
    }

    async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let queues: Vec<Arc<Queue>> = {
            let mut topology = self.inner.topology.lock();
            topology.exchanges.clear();
            topology.queues.drain().map(|(_, q)| q).collect()
        };
        for queue in queues {
            queue.delete();
        }
        debug!("In-memory broker disposed");
    }
}

struct MemoryOutputLink {
    broker: InMemoryBroker,
    exchange: String,
    closed: AtomicBool,
}

#[async_trait]
impl Link for MemoryOutputLink {
    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn abort(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[async_trait]
impl OutputLink for MemoryOutputLink {
    async fn send_frame(&self, routing_key: &str, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        self.broker.check_open()?;
        self.broker
            .publish_raw(&self.exchange, routing_key, Bytes::copy_from_slice(frame));
        Ok(())
    }
}

struct MemoryInputLink {
    broker: InMemoryBroker,
    queue: Arc<Queue>,
    next_tag: AtomicU64,
    /// Delivered but not yet acknowledged, in delivery order.
    unacked: Mutex<Vec<(u64, Bytes)>>,
    closed: watch::Sender<bool>,
}

impl MemoryInputLink {
    fn take_unacked(&self, tag: u64) -> Result<Bytes, TransportError> {
        let mut unacked = self.unacked.lock();
        let index = unacked
            .iter()
            .position(|(t, _)| *t == tag)
            .ok_or_else(|| TransportError::Io(format!("unknown delivery tag {tag}")))?;
        Ok(unacked.remove(index).1)
    }

    /// Requeue everything unacknowledged and leave the queue. Runs once.
    ///
    /// The `unacked` lock is held while the link is marked closed, so a
    /// concurrent `receive_frame` either records its frame before the drain
    /// or sees the link closed and leaves the frame in the queue.
    fn shutdown(&self) {
        {
            let mut unacked = self.unacked.lock();
            if self.closed.send_replace(true) {
                return;
            }
            let pending: Vec<Bytes> = unacked.drain(..).map(|(_, f)| f).collect();
            if !pending.is_empty() {
                debug!(
                    queue = %self.queue.name,
                    count = pending.len(),
                    "Requeueing unacknowledged frames"
                );
                self.queue.requeue(pending.into_iter());
            }
        }
        self.broker.release_consumer(&self.queue);
    }
}

#[async_trait]
impl Link for MemoryInputLink {
    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }

    fn abort(&self) {
        self.shutdown();
    }
}

#[async_trait]
impl InputLink for MemoryInputLink {
    fn queue_name(&self) -> &str {
        &self.queue.name
    }

    async fn receive_frame(&self) -> Result<Option<Delivery>, TransportError> {
        let mut closed = self.closed.subscribe();
        loop {
            let notified = self.queue.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                // pop and record under one lock so shutdown cannot slip between
                let mut unacked = self.unacked.lock();
                if *closed.borrow() {
                    return Ok(None);
                }
                match self.queue.try_pop() {
                    Popped::Frame(queued) => {
                        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
                        unacked.push((tag, queued.frame.clone()));
                        return Ok(Some(Delivery {
                            frame: queued.frame,
                            tag,
                            redelivered: queued.redelivered,
                        }));
                    }
                    // queue deleted under us (broker disposed)
                    Popped::Deleted => {
                        return Err(TransportError::QueueNotFound(self.queue.name.clone()))
                    }
                    Popped::Empty => {}
                }
            }

            tokio::select! {
                _ = closed.wait_for(|c| *c) => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }

    async fn ack(&self, tag: u64) -> Result<(), TransportError> {
        self.take_unacked(tag).map(|_| ())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), TransportError> {
        let frame = self.take_unacked(tag)?;
        if requeue {
            self.queue.requeue(std::iter::once(frame));
        }
        Ok(())
    }
}
