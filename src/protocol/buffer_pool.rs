//! Reusable message buffers.
//!
//! Inbound frames are read into buffers drawn from a [`BufferPool`] so the hot
//! read path does not allocate per message. A buffer goes back to the pool
//! only through [`PooledBuffer::release`]; dropping it frees the memory
//! instead. This keeps the point at which a payload stops being readable
//! explicit: whoever holds the [`Message`](super::Message) decides.
//!
//! # Usage
//!
//! ```
//! use wirelink::protocol::BufferPool;
//!
//! let pool = BufferPool::new(1024, 16);
//! let mut buf = pool.acquire();
//! buf.extend_from_slice(b"frame");
//! buf.release();
//! assert_eq!(pool.pooled_count(), 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Default number of idle buffers kept by a pool.
pub const DEFAULT_MAX_POOLED: usize = 1024;

struct PoolInner {
    /// Idle buffers ready for reuse.
    idle: Mutex<Vec<BytesMut>>,
    /// Initial capacity of every buffer handed out.
    capacity: usize,
    /// Upper bound on idle buffers.
    max_pooled: usize,
}

/// A pool of buffers sharing one initial capacity.
///
/// Cheap to clone; clones share the same idle list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `capacity` bytes and keeping at
    /// most `max_pooled` idle buffers.
    pub fn new(capacity: usize, max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                capacity,
                max_pooled,
            }),
        }
    }

    /// Take an empty buffer from the pool, allocating if none is idle.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.inner.capacity));
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// Initial capacity of buffers from this pool.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of idle buffers.
    pub fn pooled_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    fn put_back(&self, mut buf: BytesMut) {
        buf.clear();
        // Split or shrunk buffers are not worth keeping; grown ones would pin
        // oversized allocations.
        if buf.capacity() != self.inner.capacity {
            return;
        }
        let mut idle = self.inner.idle.lock();
        if idle.len() < self.inner.max_pooled {
            idle.push(buf);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.inner.capacity)
            .field("max_pooled", &self.inner.max_pooled)
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`].
pub struct PooledBuffer {
    buf: BytesMut,
    pool: BufferPool,
}

impl PooledBuffer {
    /// Wrap a standalone buffer. It joins `pool` when released.
    pub fn from_bytes(buf: BytesMut, pool: &BufferPool) -> Self {
        Self {
            buf,
            pool: pool.clone(),
        }
    }

    /// Return the buffer to its pool.
    pub fn release(self) {
        let Self { buf, pool } = self;
        pool.put_back(buf);
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_allocates_configured_capacity() {
        let pool = BufferPool::new(512, 4);
        let buf = pool.acquire();
        assert!(buf.capacity() >= 512);
        assert!(buf.is_empty());
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn test_release_returns_cleared_buffer() {
        let pool = BufferPool::new(64, 4);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"stale data");
        let ptr = buf.as_ptr();
        buf.release();

        assert_eq!(pool.pooled_count(), 1);
        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert_eq!(reused.as_ptr(), ptr);
    }

    #[test]
    fn test_drop_does_not_return_to_pool() {
        let pool = BufferPool::new(64, 4);
        {
            let _buf = pool.acquire();
        }
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn test_max_pooled_is_bounded() {
        let pool = BufferPool::new(16, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        for buf in bufs {
            buf.release();
        }
        assert_eq!(pool.pooled_count(), 2);
    }

    #[test]
    fn test_undersized_buffer_is_discarded() {
        let pool = BufferPool::new(1024, 4);
        let small = PooledBuffer::from_bytes(BytesMut::with_capacity(8), &pool);
        small.release();
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn test_grown_buffer_is_discarded() {
        let pool = BufferPool::new(64, 4);
        let mut buf = pool.acquire();
        buf.extend_from_slice(&[0u8; 1000]);
        assert!(buf.capacity() > 64);
        buf.release();
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn test_clones_share_idle_list() {
        let pool = BufferPool::new(32, 4);
        let other = pool.clone();
        pool.acquire().release();
        assert_eq!(other.pooled_count(), 1);
    }
}
