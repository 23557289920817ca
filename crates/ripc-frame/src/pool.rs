//! Pooled byte regions.
//!
//! [`BufferPool::acquire`] hands out an owned [`ByteBufferPair`];
//! [`BufferPool::release`] takes it back by value, so a released pair can
//! neither be touched again nor returned twice. Standard requests are served
//! from power-of-two tiers; anything larger than the largest tier comes from a
//! big-buffer sub-pool keyed by doubling thresholds.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::error::{FrameError, Result};

/// Sizing and limits of a [`BufferPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of the smallest standard tier. Rounded up to a power of two.
    pub smallest_tier: usize,
    /// Capacity of the largest standard tier.
    pub largest_tier: usize,
    /// Base of the big-buffer thresholds (`base * 2^n`, n >= 1).
    pub big_base: usize,
    /// Idle buffers kept per tier; extras are dropped on release.
    pub max_idle_per_tier: usize,
    /// Cap on bytes checked out at once. `None` means unbounded.
    pub max_outstanding_bytes: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            smallest_tier: 64,
            largest_tier: 64 * 1024,
            big_base: 64 * 1024,
            max_idle_per_tier: 64,
            max_outstanding_bytes: None,
        }
    }
}

/// Where a pair goes back to on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Standard(usize),
    Big(usize),
    Unpooled,
}

/// A fixed-capacity byte region with a write cursor (`position`) and a
/// `limit` bounding how far the cursor may advance.
///
/// Bytes `[0, position)` have been written; the read-only view of a delimited
/// message is any sub-range of those.
pub struct ByteBufferPair {
    buf: Box<[u8]>,
    position: usize,
    limit: usize,
    origin: Origin,
}

impl ByteBufferPair {
    /// A pair not owned by any pool, e.g. a channel's read buffer.
    pub fn unpooled(capacity: usize) -> Self {
        Self::with_origin(vec![0; capacity].into_boxed_slice(), Origin::Unpooled)
    }

    fn with_origin(buf: Box<[u8]>, origin: Origin) -> Self {
        let limit = buf.len();
        Self {
            buf,
            position: 0,
            limit,
            origin,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the write cursor. Clamped to the limit.
    pub fn set_position(&mut self, position: usize) {
        debug_assert!(position <= self.limit, "position past limit");
        self.position = position.min(self.limit);
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bound the write cursor. Clamped to the capacity; pulls the cursor back
    /// if it sits beyond the new limit.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.min(self.capacity());
        self.position = self.position.min(self.limit);
    }

    /// Room left between the cursor and the limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn is_full(&self) -> bool {
        self.position == self.limit
    }

    /// Reset the cursor to 0 and the limit to the full capacity.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.position]
    }

    /// The whole backing region regardless of cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// The writable region between the cursor and the limit.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.position..self.limit]
    }

    /// Advance the cursor after writing into [`Self::spare_mut`].
    pub fn advance(&mut self, count: usize) {
        self.set_position(self.position + count);
    }

    /// Copy `src` in at the cursor.
    ///
    /// Returns `false` without writing anything if it does not fit.
    pub fn try_append(&mut self, src: &[u8]) -> bool {
        if src.len() > self.remaining() {
            return false;
        }
        self.buf[self.position..self.position + src.len()].copy_from_slice(src);
        self.position += src.len();
        true
    }

    /// Slide `[from, position)` down to offset 0 and reopen the full capacity.
    pub fn compact_from(&mut self, from: usize) {
        let from = from.min(self.position);
        self.buf.copy_within(from..self.position, 0);
        self.position -= from;
        self.limit = self.capacity();
    }

    /// A read-only window of written bytes.
    ///
    /// Out-of-range windows are clipped to what has been written.
    pub fn window(&self, start: usize, len: usize) -> &[u8] {
        let start = start.min(self.position);
        let end = start.saturating_add(len).min(self.position);
        &self.buf[start..end]
    }
}

impl std::fmt::Debug for ByteBufferPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBufferPair")
            .field("capacity", &self.capacity())
            .field("position", &self.position)
            .field("limit", &self.limit)
            .finish()
    }
}

/// Counters describing what a pool currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Pairs checked out and not yet released.
    pub outstanding: usize,
    /// Bytes of capacity checked out.
    pub outstanding_bytes: usize,
    /// Idle pairs waiting for reuse.
    pub idle: usize,
}

#[derive(Default)]
struct PoolInner {
    standard: Vec<Vec<Box<[u8]>>>,
    big: BTreeMap<usize, Vec<Box<[u8]>>>,
    outstanding: usize,
    outstanding_bytes: usize,
}

/// Thread-safe tiered pool of [`ByteBufferPair`]s.
///
/// Share one pool between channels with `Arc<BufferPool>`; a pool private to
/// one channel is never contended.
pub struct BufferPool {
    config: PoolConfig,
    tiers: Vec<usize>,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Self {
        let smallest = config.smallest_tier.max(1).next_power_of_two();
        let largest = config.largest_tier.max(smallest);

        let mut tiers = Vec::new();
        let mut capacity = smallest;
        while capacity < largest {
            tiers.push(capacity);
            capacity *= 2;
        }
        tiers.push(largest);

        let inner = PoolInner {
            standard: vec![Vec::new(); tiers.len()],
            ..PoolInner::default()
        };

        Self {
            config,
            tiers,
            inner: Mutex::new(inner),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a pair with at least `min_capacity` bytes, cursor at 0.
    pub fn acquire(&self, min_capacity: usize) -> Result<ByteBufferPair> {
        let mut inner = self.lock();

        let (origin, reused) = match self.tiers.iter().position(|&cap| cap >= min_capacity) {
            Some(tier) => (Origin::Standard(tier), inner.standard[tier].pop()),
            None => {
                // Smallest existing threshold with an idle buffer wins.
                let idle = inner
                    .big
                    .range_mut(min_capacity..)
                    .find_map(|(&threshold, idle)| idle.pop().map(|buf| (threshold, buf)));
                match idle {
                    Some((threshold, buf)) => (Origin::Big(threshold), Some(buf)),
                    None => (Origin::Big(self.big_threshold(min_capacity)), None),
                }
            }
        };

        let capacity = match origin {
            Origin::Standard(tier) => self.tiers[tier],
            Origin::Big(threshold) => threshold,
            Origin::Unpooled => min_capacity,
        };

        if let Some(max) = self.config.max_outstanding_bytes {
            if inner.outstanding_bytes + capacity > max {
                if let Some(buf) = reused {
                    Self::park(&mut inner, origin, buf, self.config.max_idle_per_tier);
                }
                debug!(
                    requested = min_capacity,
                    outstanding_bytes = inner.outstanding_bytes,
                    "buffer pool exhausted"
                );
                return Err(FrameError::NoBuffers {
                    requested: min_capacity,
                });
            }
        }

        let buf = match reused {
            Some(buf) => {
                trace!(capacity, "reusing pooled buffer");
                buf
            }
            None => {
                debug!(capacity, "no idle buffer in tier: allocating");
                vec![0; capacity].into_boxed_slice()
            }
        };

        inner.outstanding += 1;
        inner.outstanding_bytes += capacity;
        Ok(ByteBufferPair::with_origin(buf, origin))
    }

    /// Return a pair to the tier it came from.
    pub fn release(&self, pair: ByteBufferPair) {
        if pair.origin == Origin::Unpooled {
            return;
        }
        let capacity = pair.capacity();
        let mut inner = self.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        inner.outstanding_bytes = inner.outstanding_bytes.saturating_sub(capacity);
        Self::park(&mut inner, pair.origin, pair.buf, self.config.max_idle_per_tier);
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            outstanding: inner.outstanding,
            outstanding_bytes: inner.outstanding_bytes,
            idle: inner.standard.iter().map(Vec::len).sum::<usize>()
                + inner.big.values().map(Vec::len).sum::<usize>(),
        }
    }

    fn park(inner: &mut PoolInner, origin: Origin, buf: Box<[u8]>, max_idle: usize) {
        let idle = match origin {
            Origin::Standard(tier) => &mut inner.standard[tier],
            Origin::Big(threshold) => inner.big.entry(threshold).or_default(),
            Origin::Unpooled => return,
        };
        if idle.len() < max_idle {
            trace!(capacity = buf.len(), "returning buffer to pool");
            idle.push(buf);
        } else {
            trace!(capacity = buf.len(), "tier full: discarding returned buffer");
        }
    }

    fn big_threshold(&self, min_capacity: usize) -> usize {
        let mut threshold = self.config.big_base.max(1).saturating_mul(2);
        while threshold < min_capacity {
            threshold = threshold.saturating_mul(2);
        }
        threshold
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("tiers", &self.tiers)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_acquire_rounds_up_to_tier() {
        let pool = BufferPool::default();
        let pair = pool.acquire(100).unwrap();
        assert_eq!(pair.capacity(), 128);
        assert_eq!(pair.position(), 0);
        assert_eq!(pair.limit(), 128);
        pool.release(pair);
    }

    #[test]
    fn test_release_then_reuse_same_tier() {
        let pool = BufferPool::default();
        let mut pair = pool.acquire(64).unwrap();
        assert!(pair.try_append(b"stale"));
        pool.release(pair);
        assert_eq!(pool.stats().idle, 1);

        let pair = pool.acquire(50).unwrap();
        assert_eq!(pair.position(), 0, "reused pair must come back cleared");
        assert_eq!(pool.stats().idle, 0);
        pool.release(pair);
    }

    #[test]
    fn test_big_buffers_use_doubling_thresholds() {
        let pool = BufferPool::new(PoolConfig {
            largest_tier: 1024,
            big_base: 1024,
            ..PoolConfig::default()
        });
        let pair = pool.acquire(1500).unwrap();
        assert_eq!(pair.capacity(), 2048);
        let huge = pool.acquire(5000).unwrap();
        assert_eq!(huge.capacity(), 8192);
        pool.release(pair);
        pool.release(huge);

        // Smallest idle threshold that fits is picked first.
        let again = pool.acquire(1800).unwrap();
        assert_eq!(again.capacity(), 2048);
        pool.release(again);
    }

    #[test]
    fn test_outstanding_budget_reports_no_buffers() {
        let pool = BufferPool::new(PoolConfig {
            max_outstanding_bytes: Some(256),
            ..PoolConfig::default()
        });
        let first = pool.acquire(256).unwrap();
        let err = pool.acquire(64).unwrap_err();
        assert!(matches!(err, FrameError::NoBuffers { requested: 64 }));

        pool.release(first);
        let second = pool.acquire(64).unwrap();
        pool.release(second);
    }

    #[test]
    fn test_stats_return_to_baseline() {
        let pool = BufferPool::default();
        let baseline = pool.stats().outstanding;
        let pairs: Vec<_> = (0..8).map(|i| pool.acquire(32 << i).unwrap()).collect();
        assert_eq!(pool.stats().outstanding, baseline + 8);
        for pair in pairs {
            pool.release(pair);
        }
        assert_eq!(pool.stats().outstanding, baseline);
        assert_eq!(pool.stats().outstanding_bytes, 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(BufferPool::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let pair = pool.acquire(n * 7).unwrap();
                        pool.release(pair);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_try_append_refuses_overflow() {
        let mut pair = ByteBufferPair::unpooled(8);
        pair.set_limit(4);
        assert!(pair.try_append(b"abc"));
        assert!(!pair.try_append(b"de"));
        assert_eq!(pair.written(), b"abc");
        assert!(pair.try_append(b"d"));
        assert!(pair.is_full());
    }

    #[test]
    fn test_compact_from_moves_tail_down() {
        let mut pair = ByteBufferPair::unpooled(8);
        assert!(pair.try_append(b"abcdef"));
        pair.compact_from(4);
        assert_eq!(pair.written(), b"ef");
        assert_eq!(pair.limit(), 8);
    }

    #[test]
    fn test_window_is_clipped() {
        let mut pair = ByteBufferPair::unpooled(8);
        assert!(pair.try_append(b"abc"));
        assert_eq!(pair.window(1, 10), b"bc");
        assert_eq!(pair.window(5, 2), b"");
    }
}
