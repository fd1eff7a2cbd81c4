use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam_queue::ArrayQueue;

/// A shared pool of reusable string buffers.
///
/// Encoding a message needs a mutable scratch buffer, and allocating one per call would put an
/// allocation on every metric submission. The pool keeps returned buffers around so that, at steady
/// state, encoding is allocation-free. Take and return are both lock-free, so arbitrarily many
/// producer threads can hit the pool concurrently.
///
/// The pool is unordered: callers get *a* buffer, not any particular one. It is also bounded, so
/// returning a buffer to a full pool simply drops it.
pub(crate) struct BufferPool {
    buffers: ArrayQueue<String>,
    misses: AtomicU64,
}

impl BufferPool {
    /// Creates a pool that retains up to `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self { buffers: ArrayQueue::new(capacity), misses: AtomicU64::new(0) }
    }

    /// Takes a buffer from the pool, allocating a fresh one on a pool miss.
    ///
    /// The returned buffer is empty and is handed back to the pool when dropped.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = match self.buffers.pop() {
            Some(buf) => buf,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                String::new()
            }
        };

        PooledBuffer { buf: Some(buf), pool: Arc::clone(self) }
    }

    fn release(&self, mut buf: String) {
        buf.clear();

        // A full pool means we already retain as many buffers as we are willing to, so the
        // returned one is dropped instead.
        let _ = self.buffers.push(buf);
    }

    /// Returns the number of acquires that had to allocate because the pool was empty.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn idle_buffers(&self) -> usize {
        self.buffers.len()
    }
}

/// A scratch buffer owned by the caller until dropped, at which point it returns to its pool.
pub(crate) struct PooledBuffer {
    buf: Option<String>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        self.deref().as_bytes()
    }
}

impl Deref for PooledBuffer {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        // Invariant: `buf` is only `None` after `drop` has started.
        self.buf.as_ref().unwrap_or_else(|| unreachable!("pooled buffer accessed after drop"))
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().unwrap_or_else(|| unreachable!("pooled buffer accessed after drop"))
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
