//! Sample pool: a bounded set of reusable sample containers.
//!
//! Playout copies each assembled sample into a pooled buffer before handing
//! it to the sink. Dropping the buffer hands it back. When every buffer is
//! out the pool is exhausted and `acquire` returns None.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct PoolInner {
    free: Vec<Vec<u8>>,
    outstanding: usize,
    /// 0 = unbounded.
    capacity: usize,
}

#[derive(Debug, Clone)]
pub struct SamplePool {
    inner: Arc<Mutex<PoolInner>>,
}

impl SamplePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                free: Vec::new(),
                outstanding: 0,
                capacity,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn acquire(&self) -> Option<PooledBuffer> {
        let mut pool = self.lock();
        let buf = match pool.free.pop() {
            Some(buf) => buf,
            None if pool.capacity == 0 || pool.outstanding < pool.capacity => Vec::new(),
            None => return None,
        };
        pool.outstanding += 1;
        Some(PooledBuffer {
            buf,
            home: Arc::clone(&self.inner),
        })
    }

    /// Buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.lock().free.len()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }
}

/// A container on loan from a `SamplePool`.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    home: Arc<Mutex<PoolInner>>,
}

impl PooledBuffer {
    /// Replace the contents, reusing the allocation.
    pub fn fill(&mut self, bytes: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(bytes);
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut pool = self.home.lock().unwrap_or_else(|e| e.into_inner());
        pool.outstanding = pool.outstanding.saturating_sub(1);
        pool.free.push(buf);
    }
}
