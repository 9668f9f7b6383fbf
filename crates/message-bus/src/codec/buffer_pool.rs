//! Reusable encode buffers shared by every channel of a bus.
//!
//! A free list of `BytesMut`. [`BufferPool::acquire`] hands out a
//! [`PooledBuffer`] that returns its storage to the pool when dropped, so
//! the buffer comes back on every exit path of the code holding it.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::BufferPoolConfig;

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers handed out
    pub acquired: u64,
    /// Buffers returned
    pub released: u64,
    /// Acquisitions served from the free list
    pub reused: u64,
    /// Returned buffers dropped because the free list was full
    pub discarded: u64,
    /// Buffers currently in the free list
    pub pooled: usize,
}

#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    max_pooled: usize,
    acquired: AtomicU64,
    released: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            buffer_capacity,
            max_pooled,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &BufferPoolConfig) -> Self {
        Self::new(config.buffer_capacity, config.max_pooled)
    }

    /// Take an empty buffer with at least `min_capacity` bytes of capacity.
    pub fn acquire(self: &Arc<Self>, min_capacity: usize) -> PooledBuffer {
        self.acquired.fetch_add(1, Ordering::Relaxed);

        let reused = {
            let mut free = self.free.lock();
            free.iter()
                .position(|buf| buf.capacity() >= min_capacity)
                .map(|index| free.swap_remove(index))
                .or_else(|| free.pop())
        };

        let buf = match reused {
            Some(mut buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.reserve(min_capacity);
                buf
            }
            None => BytesMut::with_capacity(min_capacity.max(self.buffer_capacity)),
        };

        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut buf: BytesMut) {
        self.released.fetch_add(1, Ordering::Relaxed);
        buf.clear();

        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            pooled: self.free.lock().len(),
        }
    }

    /// Buffers currently lent out.
    pub fn outstanding(&self) -> u64 {
        self.acquired
            .load(Ordering::Relaxed)
            .saturating_sub(self.released.load(Ordering::Relaxed))
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::from_config(&BufferPoolConfig::default())
    }
}

/// Buffer on loan from a [`BufferPool`]. Returned on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
