//! Fixed-capacity packet buffer pool for NIC queues.
//!
//! One pool is shared by every RX queue of a port (or owned by a single port
//! in client mode). Buffers are preallocated and recycled through a lock-free
//! `ArrayQueue`, so acquire/release never allocate or block.
//!
//! A [`PacketBuf`] returns its storage to the pool when dropped. Holding a
//! `PacketBuf` is the only way to reach the bytes, so a buffer can never be
//! read after it has gone back to the pool.

use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default data room of a pool buffer (fits a 1500-byte MTU frame plus
/// a VLAN tag, rounded up).
pub const DEFAULT_BUF_SIZE: usize = 2048;

/// Per-core object cache size used when sizing pools.
pub const MEMPOOL_CACHE_SIZE: usize = 256;

/// Minimum pool size per queue.
pub const BUFFERS_PER_QUEUE: usize = 8192;

/// Default size of a single-queue pool for the given burst size.
pub fn single_queue_pool_size(burst: usize) -> usize {
    (1 + 1 + burst + 2 * MEMPOOL_CACHE_SIZE).max(BUFFERS_PER_QUEUE)
}

/// Size of the shared receive pool for `queues` queues.
pub fn shared_pool_size(queues: usize, burst: usize) -> usize {
    single_queue_pool_size(burst).max(BUFFERS_PER_QUEUE * queues)
}

pub struct PacketPool {
    name: String,
    buf_size: usize,
    capacity: usize,
    free: ArrayQueue<Box<[u8]>>,
    exhausted: AtomicU64,
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("name", &self.name)
            .field("buf_size", &self.buf_size)
            .field("capacity", &self.capacity)
            .field("available", &self.free.len())
            .finish()
    }
}

impl PacketPool {
    /// Preallocate `capacity` buffers of `buf_size` bytes.
    ///
    /// Returns `None` for a zero capacity or buffer size.
    pub fn new(name: impl Into<String>, capacity: usize, buf_size: usize) -> Option<Arc<Self>> {
        if capacity == 0 || buf_size == 0 {
            return None;
        }
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            // Cannot fail: the queue was sized for exactly `capacity` items.
            let _ = free.push(vec![0u8; buf_size].into_boxed_slice());
        }
        Some(Arc::new(Self {
            name: name.into(),
            buf_size,
            capacity,
            free,
            exhausted: AtomicU64::new(0),
        }))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }

    /// Fraction of buffers currently handed out, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        self.in_use() as f64 / self.capacity as f64
    }

    /// Number of acquire attempts that found the pool empty.
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Take a buffer, or `None` when the pool is empty.
    pub fn acquire(self: &Arc<Self>) -> Option<PacketBuf> {
        match self.free.pop() {
            Some(data) => Some(PacketBuf {
                data: Some(data),
                len: 0,
                pool: Arc::clone(self),
            }),
            None => {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn release(&self, data: Box<[u8]>) {
        if self.free.push(data).is_err() {
            tracing::error!(pool = %self.name, "Buffer returned to a full pool");
        }
    }
}

/// A buffer borrowed from a [`PacketPool`].
///
/// Dereferences to the filled portion (`len` bytes); [`PacketBuf::room_mut`]
/// exposes the whole data room for writing.
pub struct PacketBuf {
    data: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<PacketPool>,
}

impl PacketBuf {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    /// Full data room, regardless of the current length.
    #[inline]
    pub fn room_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }

    /// Set the filled length, clamped to the capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity(), "length exceeds buffer capacity");
        self.len = len.min(self.capacity());
    }

    /// Copy `bytes` into the buffer, replacing its content.
    ///
    /// Returns false (and leaves the buffer unchanged) when it does not fit.
    pub fn fill_from(&mut self, bytes: &[u8]) -> bool {
        let room = self.room_mut();
        if bytes.len() > room.len() {
            return false;
        }
        room[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        true
    }

    /// Pool this buffer belongs to.
    #[inline]
    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuf")
            .field("pool", &self.pool.name)
            .field("len", &self.len)
            .finish()
    }
}

impl Deref for PacketBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        match &self.data {
            Some(d) => &d[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PacketBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        let len = self.len;
        match &mut self.data {
            Some(d) => &mut d[..len],
            None => &mut [],
        }
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(data);
        }
    }
}
