//! Shared memory budget for blocking operators.
//!
//! One [`MemoryPool`] is created per query execution from
//! `EngineConfig::mem_budget_bytes`. Operators that buffer input (sort, hash
//! build, aggregation, window) hold a [`MemoryReservation`] and grow it before
//! retaining data. A failed grow is the signal to spill (sort) or to fail the
//! query with `OutOfMemory` (hash tables). Reservations release on drop, so
//! cancelled or failed operators return their bytes without extra bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::{LfqError, Result};

/// Byte budget shared by all reservations of one execution.
#[derive(Debug)]
pub struct MemoryPool {
    budget_bytes: usize,
    in_use_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl MemoryPool {
    /// Create a pool with `budget_bytes` available.
    #[must_use]
    pub fn new(budget_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            budget_bytes,
            in_use_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
        })
    }

    /// Pool that never refuses a grow.
    #[must_use]
    pub fn unbounded() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    /// Configured budget.
    pub fn budget(&self) -> usize {
        self.budget_bytes
    }

    /// Bytes currently reserved.
    pub fn in_use(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    /// Highest reserved total observed so far.
    pub fn peak(&self) -> usize {
        self.peak_bytes.load(Ordering::Acquire)
    }

    /// Open an empty reservation owned by `consumer`.
    #[must_use]
    pub fn reservation(self: &Arc<Self>, consumer: impl Into<String>) -> MemoryReservation {
        MemoryReservation {
            pool: Arc::clone(self),
            consumer: consumer.into(),
            size: 0,
        }
    }

    fn try_acquire(&self, bytes: usize) -> bool {
        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let next = match current.checked_add(bytes) {
                Some(n) if n <= self.budget_bytes => n,
                _ => return false,
            };
            if self
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.peak_bytes.fetch_max(next, Ordering::AcqRel);
                return true;
            }
        }
    }

    fn release(&self, bytes: usize) {
        if bytes > 0 {
            self.in_use_bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
    }
}

/// RAII reservation that releases its bytes on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    pool: Arc<MemoryPool>,
    consumer: String,
    size: usize,
}

impl MemoryReservation {
    /// Bytes currently held.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Name of the operator holding this reservation.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Grow by `bytes`, failing with `OutOfMemory` when the pool is exhausted.
    pub fn try_grow(&mut self, bytes: usize) -> Result<()> {
        if self.pool.try_acquire(bytes) {
            self.size += bytes;
            Ok(())
        } else {
            debug!(
                consumer = %self.consumer,
                requested = bytes,
                held = self.size,
                in_use = self.pool.in_use(),
                budget = self.pool.budget(),
                "memory reservation refused"
            );
            Err(LfqError::OutOfMemory(format!(
                "{} requested {bytes} bytes while holding {} (pool {} of {} bytes in use)",
                self.consumer,
                self.size,
                self.pool.in_use(),
                self.pool.budget()
            )))
        }
    }

    /// Resize to exactly `bytes`, growing or shrinking as needed.
    pub fn try_resize(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.size {
            self.try_grow(bytes - self.size)
        } else {
            self.shrink(self.size - bytes);
            Ok(())
        }
    }

    /// Return `bytes` (capped at the held size) to the pool.
    pub fn shrink(&mut self, bytes: usize) {
        let bytes = bytes.min(self.size);
        self.pool.release(bytes);
        self.size -= bytes;
    }

    /// Return everything; yields the number of bytes released.
    pub fn free(&mut self) -> usize {
        let released = self.size;
        self.shrink(released);
        released
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_releases_budget_on_drop() {
        let pool = MemoryPool::new(100);
        {
            let mut r1 = pool.reservation("sort");
            r1.try_grow(80).expect("fits");
            let mut r2 = pool.reservation("agg");
            assert!(matches!(r2.try_grow(30), Err(LfqError::OutOfMemory(_))));
            r2.try_grow(20).expect("exact fit");
            assert_eq!(pool.in_use(), 100);
        }
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.peak(), 100);
    }

    #[test]
    fn resize_moves_both_directions() {
        let pool = MemoryPool::new(64);
        let mut r = pool.reservation("join");
        r.try_resize(40).expect("grow");
        r.try_resize(10).expect("shrink");
        assert_eq!(r.size(), 10);
        assert_eq!(pool.in_use(), 10);
        assert_eq!(r.free(), 10);
        assert_eq!(pool.in_use(), 0);
    }
}
