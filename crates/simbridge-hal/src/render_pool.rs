//! [`RenderTargetPool`] – reusable pixel buffers.
//!
//! Buffers are bucketed by `(width, height, format)`.  An acquired buffer
//! always has exactly the requested key; a released buffer only ever goes
//! back into its own bucket, so a depth target can never be handed out as a
//! colour target of the same size.
//!
//! The pool is owned by whoever creates it (normally the pipeline) and is
//! shared by `Arc`.  By default buckets grow without bound; set
//! [`with_max_per_key`][RenderTargetPool::with_max_per_key] to cap them.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use simbridge_types::{PixelFormat, RawImage};
use tracing::debug;

type PoolKey = (u32, u32, PixelFormat);

/// Counters reported by [`RenderTargetPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated because the bucket was empty.
    pub allocations: u64,
    /// Acquisitions served from a bucket.
    pub reuses: u64,
    /// Buffers currently held by the pool.
    pub pooled: usize,
}

#[derive(Default)]
struct PoolInner {
    buckets: HashMap<PoolKey, Vec<Vec<u8>>>,
    allocations: u64,
    reuses: u64,
}

/// Free-list of render targets.
#[derive(Default)]
pub struct RenderTargetPool {
    inner: Mutex<PoolInner>,
    max_per_key: Option<usize>,
}

impl RenderTargetPool {
    /// An unbounded pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max` idle buffers per key; further releases are dropped.
    pub fn with_max_per_key(mut self, max: usize) -> Self {
        self.max_per_key = Some(max);
        self
    }

    /// Take a buffer of exactly `width × height × format`.
    ///
    /// A reused buffer keeps its previous contents; a fresh one is zeroed.
    pub fn acquire(&self, width: u32, height: u32, format: PixelFormat) -> RawImage {
        let mut inner = self.lock();
        let reused = inner
            .buckets
            .get_mut(&(width, height, format))
            .and_then(Vec::pop);

        let data = match reused {
            Some(data) => {
                inner.reuses += 1;
                data
            }
            None => {
                inner.allocations += 1;
                debug!(width, height, ?format, "allocating render target");
                vec![0u8; width as usize * height as usize * format.bytes_per_pixel()]
            }
        };
        RawImage {
            width,
            height,
            format,
            data,
        }
    }

    /// Return `image` to the bucket of its own key.
    ///
    /// Buffers whose length does not match their key, and buffers beyond the
    /// per-key cap, are dropped.
    pub fn release(&self, image: RawImage) {
        if image.data.len() != image.expected_len() {
            debug!(
                width = image.width,
                height = image.height,
                len = image.data.len(),
                "dropping mis-sized render target"
            );
            return;
        }
        let mut inner = self.lock();
        let bucket = inner
            .buckets
            .entry((image.width, image.height, image.format))
            .or_default();
        if self.max_per_key.is_some_and(|max| bucket.len() >= max) {
            return;
        }
        bucket.push(image.data);
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            allocations: inner.allocations,
            reuses: inner.reuses,
            pooled: inner.buckets.values().map(Vec::len).sum(),
        }
    }

    /// Release every pooled buffer.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let freed: usize = inner.buckets.values().map(Vec::len).sum();
        inner.buckets.clear();
        debug!(freed, "render target pool cleared");
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_allocates_zeroed_buffer_of_exact_size() {
        let pool = RenderTargetPool::new();
        let target = pool.acquire(4, 3, PixelFormat::R16);
        assert_eq!(target.data.len(), 4 * 3 * 2);
        assert!(target.data.iter().all(|&b| b == 0));
        assert_eq!(pool.stats().allocations, 1);
    }

    #[test]
    fn released_buffer_is_reused_for_same_key() {
        let pool = RenderTargetPool::new();
        let mut target = pool.acquire(2, 2, PixelFormat::Rgba8);
        target.data[0] = 42;
        pool.release(target);
        assert_eq!(pool.stats().pooled, 1);

        let again = pool.acquire(2, 2, PixelFormat::Rgba8);
        assert_eq!(again.data[0], 42);
        assert_eq!(
            pool.stats(),
            PoolStats {
                allocations: 1,
                reuses: 1,
                pooled: 0
            }
        );
    }

    #[test]
    fn no_cross_format_reuse() {
        let pool = RenderTargetPool::new();
        // Same byte size: 2×2 RGBA8 and 2×2 RFloat are both 16 bytes.
        pool.release(pool.acquire(2, 2, PixelFormat::Rgba8));

        let depth = pool.acquire(2, 2, PixelFormat::RFloat);
        assert_eq!(depth.format, PixelFormat::RFloat);
        assert_eq!(pool.stats().allocations, 2);
        assert_eq!(pool.stats().reuses, 0);
        assert_eq!(pool.stats().pooled, 1);
    }

    #[test]
    fn no_cross_size_reuse() {
        let pool = RenderTargetPool::new();
        pool.release(pool.acquire(4, 1, PixelFormat::R16));
        let target = pool.acquire(1, 4, PixelFormat::R16);
        assert_eq!((target.width, target.height), (1, 4));
        assert_eq!(pool.stats().reuses, 0);
    }

    #[test]
    fn mis_sized_release_is_dropped() {
        let pool = RenderTargetPool::new();
        pool.release(RawImage {
            width: 2,
            height: 2,
            format: PixelFormat::R16,
            data: vec![0; 3],
        });
        assert_eq!(pool.stats().pooled, 0);
    }

    #[test]
    fn cap_limits_idle_buffers_per_key() {
        let pool = RenderTargetPool::new().with_max_per_key(1);
        let a = pool.acquire(2, 2, PixelFormat::R16);
        let b = pool.acquire(2, 2, PixelFormat::R16);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().pooled, 1);
    }

    #[test]
    fn clear_empties_every_bucket() {
        let pool = RenderTargetPool::new();
        pool.release(pool.acquire(2, 2, PixelFormat::R16));
        pool.release(pool.acquire(8, 8, PixelFormat::Rgba8));
        assert_eq!(pool.stats().pooled, 2);

        pool.clear();
        assert_eq!(pool.stats().pooled, 0);
        assert_eq!(pool.stats().allocations, 2);
    }
}
