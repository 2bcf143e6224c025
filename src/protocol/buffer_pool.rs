//! Bounded pool of fixed-size receive spans (spec §3/§9 design note: "a
//! free-list of boxed arrays, returned via a scope guard"). Grounded on the
//! teacher's `defer_lite::defer!` usage in `process_once`, generalized into a
//! `Drop` guard since the thing being returned carries data, not just a
//! closure to run.

use parking_lot::Mutex;
use std::sync::Arc;

/// A single fixed-capacity receive buffer, reused across calls to avoid a
/// per-packet allocation on the hot receive path.
pub struct NativeSpan {
    buffer: Vec<u8>,
    len: usize,
}

impl NativeSpan {
    fn new(capacity: usize) -> Self {
        NativeSpan {
            buffer: vec![0u8; capacity],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    pub fn full_capacity_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.buffer.len(), "span length exceeds capacity");
        self.len = len;
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

struct Inner {
    free: Vec<NativeSpan>,
    span_size: usize,
    max_count: usize,
}

/// Owns up to `max_count` spans of `span_size` bytes each. Spans rented out
/// are tracked only implicitly (by not being in `free`); a pool that is fully
/// checked out simply returns `None` from `rent` until something is dropped.
pub struct BufferPool {
    inner: Mutex<Inner>,
}

impl BufferPool {
    pub fn new(span_size: usize, max_count: usize) -> Arc<Self> {
        let free = (0..max_count).map(|_| NativeSpan::new(span_size)).collect();
        Arc::new(BufferPool {
            inner: Mutex::new(Inner {
                free,
                span_size,
                max_count,
            }),
        })
    }

    pub fn span_size(&self) -> usize {
        self.inner.lock().span_size
    }

    pub fn max_count(&self) -> usize {
        self.inner.lock().max_count
    }

    /// Rents a span, or `None` if every span is currently checked out.
    pub fn rent(self: &Arc<Self>) -> Option<PooledSpan> {
        let span = self.inner.lock().free.pop()?;
        Some(PooledSpan {
            span: Some(span),
            pool: Arc::clone(self),
        })
    }

    fn give_back(&self, mut span: NativeSpan) {
        span.set_len(0);
        self.inner.lock().free.push(span);
    }
}

/// A rented [`NativeSpan`] that returns itself to the pool on drop.
pub struct PooledSpan {
    span: Option<NativeSpan>,
    pool: Arc<BufferPool>,
}

impl std::ops::Deref for PooledSpan {
    type Target = NativeSpan;

    fn deref(&self) -> &NativeSpan {
        self.span.as_ref().expect("span taken before drop")
    }
}

impl std::ops::DerefMut for PooledSpan {
    fn deref_mut(&mut self) -> &mut NativeSpan {
        self.span.as_mut().expect("span taken before drop")
    }
}

impl Drop for PooledSpan {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            self.pool.give_back(span);
        }
    }
}
