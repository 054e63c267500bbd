//! Fixed-capacity buffer recycling.

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::trace;

/// Recycles the `BytesMut` buffers that carry frames between the device
/// loops and the relay halves. Owned by the relay session; never global.
/// Every acquired buffer is either released back or dropped, and a release
/// beyond `max_pooled` simply drops the buffer.
pub struct BufferPool {
    capacity: usize,
    max_pooled: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(capacity: usize, max_pooled: usize) -> Self {
        Self {
            capacity,
            max_pooled,
            free: Mutex::new(Vec::with_capacity(max_pooled)),
        }
    }

    /// Pooled buffer, reset empty, or a fresh allocation when the pool is
    /// drained.
    pub fn acquire(&self) -> BytesMut {
        if let Some(mut buf) = self.free.lock().pop() {
            buf.clear();
            return buf;
        }
        trace!(capacity = self.capacity, "pool empty, allocating buffer");
        BytesMut::with_capacity(self.capacity)
    }

    /// Return a buffer for reuse. Undersized or surplus buffers are dropped.
    pub fn release(&self, buf: BytesMut) {
        if buf.capacity() < self.capacity {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    /// Drop every pooled buffer (shutdown path).
    pub fn clear(&self) {
        self.free.lock().clear();
    }

    /// Number of buffers currently held by the pool.
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_empty_buffer() {
        let pool = BufferPool::new(1024, 4);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"stale data");
        pool.release(buf);

        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 1024);
    }

    #[test]
    fn release_caps_retained_buffers() {
        let pool = BufferPool::new(64, 2);
        let bufs: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        for buf in bufs {
            pool.release(buf);
        }
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn distinct_owners_get_distinct_buffers() {
        let pool = BufferPool::new(128, 4);
        let mut a = pool.acquire();
        let mut b = pool.acquire();
        a.extend_from_slice(b"aaaa");
        b.extend_from_slice(b"bbbb");
        assert_eq!(&a[..], b"aaaa");
        assert_eq!(&b[..], b"bbbb");
    }

    #[test]
    fn clear_empties_the_pool() {
        let pool = BufferPool::new(64, 4);
        let buf = pool.acquire();
        pool.release(buf);
        assert_eq!(pool.pooled(), 1);
        pool.clear();
        assert_eq!(pool.pooled(), 0);
    }
}
