//! Tiered buffer pool for frame encoding and message assembly.
//!
//! Buffers are grouped in power-of-two capacity tiers from [`MIN_TIER`] to [`MAX_TIER`], each
//! backed by a bounded lock-free `ArrayQueue`. [`BufferPool::get`] hands out a [`PooledBuf`],
//! an owned handle that returns its buffer to the right tier when dropped, so a buffer is
//! released exactly once and cannot be touched afterwards.
//!
//! Requests above [`MAX_TIER`] are allocated directly and freed on drop. A full tier drops the
//! returned buffer instead of growing.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crossbeam_queue::ArrayQueue;

/// Smallest tier capacity.
pub const MIN_TIER: usize = 128;

/// Largest pooled capacity. Bigger requests bypass the pool.
pub const MAX_TIER: usize = 256 * 1024;

const TIER_COUNT: usize = (MAX_TIER / MIN_TIER).trailing_zeros() as usize + 1;

/// Buffers retained per tier by default.
pub const DEFAULT_TIER_DEPTH: usize = 64;

/// Lock-free pool of `Vec<u8>` buffers in power-of-two capacity tiers.
pub struct BufferPool {
    tiers: Vec<ArrayQueue<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Creates a pool retaining up to `depth` buffers per tier.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is 0.
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "depth must be positive");
        Self {
            tiers: (0..TIER_COUNT).map(|_| ArrayQueue::new(depth)).collect(),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Acquires an empty buffer with at least `capacity` bytes of capacity.
    ///
    /// Recycled buffers come back cleared but keep their allocation.
    pub fn get(self: &Arc<Self>, capacity: usize) -> PooledBuf {
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        let tier = tier_index(capacity);
        let buf = match tier {
            Some(index) => self.tiers[index]
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(tier_capacity(index))),
            None => Vec::with_capacity(capacity),
        };

        PooledBuf {
            buf,
            tier,
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers handed out and not yet dropped.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of idle buffers held across all tiers.
    pub fn available(&self) -> usize {
        self.tiers.iter().map(ArrayQueue::len).sum()
    }

    fn put(&self, mut buf: Vec<u8>, tier: Option<usize>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        let Some(mut index) = tier else {
            return;
        };
        // taken or shrunk buffers are not worth keeping
        if buf.capacity() < tier_capacity(index) {
            return;
        }
        // a buffer that grew past its tier is filed under the tier it now fits
        while index + 1 < TIER_COUNT && buf.capacity() >= tier_capacity(index + 1) {
            index += 1;
        }
        buf.clear();
        let _ = self.tiers[index].push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_TIER_DEPTH)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("outstanding", &self.outstanding())
            .field("available", &self.available())
            .finish()
    }
}

#[inline]
fn tier_capacity(index: usize) -> usize {
    MIN_TIER << index
}

#[inline]
fn tier_index(capacity: usize) -> Option<usize> {
    if capacity > MAX_TIER {
        return None;
    }
    let rounded = capacity.max(MIN_TIER).next_power_of_two();
    Some((rounded / MIN_TIER).trailing_zeros() as usize)
}

/// Buffer on loan from a [`BufferPool`].
///
/// Dereferences to `Vec<u8>`. Dropping the handle returns the buffer to its pool.
pub struct PooledBuf {
    buf: Vec<u8>,
    tier: Option<usize>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Pool the buffer will return to.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    #[inline]
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .field("tier", &self.tier)
            .finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(buf, self.tier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_selection() {
        assert_eq!(tier_index(0), Some(0));
        assert_eq!(tier_index(128), Some(0));
        assert_eq!(tier_index(129), Some(1));
        assert_eq!(tier_index(4096), Some(5));
        assert_eq!(tier_index(MAX_TIER), Some(TIER_COUNT - 1));
        assert_eq!(tier_index(MAX_TIER + 1), None);
    }

    #[test]
    fn test_get_returns_empty_buffer_with_capacity() {
        let pool = Arc::new(BufferPool::default());
        let buf = pool.get(1000);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 1024);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_drop_returns_to_tier() {
        let pool = Arc::new(BufferPool::default());

        let mut buf = pool.get(200);
        buf.extend_from_slice(b"hello world");
        let capacity = buf.capacity();
        drop(buf);

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);

        let recycled = pool.get(200);
        assert!(recycled.is_empty(), "recycled buffer should be cleared");
        assert_eq!(recycled.capacity(), capacity);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_oversized_buffers_bypass_pool() {
        let pool = Arc::new(BufferPool::default());
        let buf = pool.get(MAX_TIER + 1);
        assert!(buf.capacity() > MAX_TIER);
        drop(buf);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_taken_buffer_is_not_recycled() {
        let pool = Arc::new(BufferPool::default());
        let mut buf = pool.get(512);
        let owned = std::mem::take(&mut *buf);
        drop(buf);
        assert!(owned.capacity() >= 512);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_full_tier_drops_excess() {
        let pool = Arc::new(BufferPool::new(2));
        let buffers: Vec<_> = (0..3).map(|_| pool.get(64)).collect();
        assert_eq!(pool.outstanding(), 3);
        drop(buffers);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_concurrent_get_and_drop() {
        let pool = Arc::new(BufferPool::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for n in 0..500 {
                        let mut buf = pool.get((i * 97 + n) % 8192);
                        buf.push(n as u8);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "depth must be positive")]
    fn test_zero_depth_panics() {
        let _pool = BufferPool::new(0);
    }
}
