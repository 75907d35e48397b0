//! # Node Allocation Cache
//!
//! Installing a mapping may need up to three new intermediate tables. If those
//! were allocated on demand in the middle of a walk, a page fault taken while
//! the frame pool itself is being paged in would recurse into the very path
//! it is servicing. The cache breaks that cycle: before any walk the
//! [`PageMap`](crate::PageMap) tops the cache up, so the walk itself only ever
//! pops pages that already exist.
//!
//! ## Bookkeeping
//!
//! The free pages form a LIFO stack. A page reclaimed from an emptied table is
//! the first one reused. Pages are zeroed when drawn, not when stored, so
//! refills stay cheap and a reclaimed table never needs to be cleaned twice.
//!
//! Refill happens in [`reserve`](NodeCache::reserve) only, and only when the
//! stack holds fewer pages than `max(low_water, needed)`. It then allocates up
//! to [`capacity`](NodeCacheConfig::capacity) in one batch. Pages released
//! while the stack is full go straight back to the frame pool.

use crate::PageMapError;
use crate::platform::{self, FramePool, Platform};
use alloc::vec::Vec;
use kernel_info::memory::{NODE_CACHE_CAPACITY, NODE_CACHE_LOW_WATER};
use kernel_memory_addresses::{PageGranularity, PhysicalPage, Size4K};
use log::trace;

/// Sizing of a [`NodeCache`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NodeCacheConfig {
    /// Maximum number of cached pages.
    pub capacity: usize,
    /// Refill threshold.
    pub low_water: usize,
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        Self {
            capacity: NODE_CACHE_CAPACITY,
            low_water: NODE_CACHE_LOW_WATER,
        }
    }
}

/// Free pages reserved for new intermediate tables.
#[derive(Debug)]
pub struct NodeCache {
    free: Vec<PhysicalPage<Size4K>>,
    config: NodeCacheConfig,
}

impl NodeCache {
    #[must_use]
    pub fn new(config: NodeCacheConfig) -> Self {
        debug_assert!(config.low_water <= config.capacity);
        Self {
            free: Vec::with_capacity(config.capacity),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> NodeCacheConfig {
        self.config
    }

    /// Number of cached pages.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Make sure at least `needed` pages can be drawn without allocating.
    ///
    /// # Errors
    /// [`PageMapError::OutOfNodes`] if the frame pool cannot provide enough
    /// pages. Pages allocated so far stay cached.
    pub fn reserve(&mut self, pool: &dyn Platform, needed: usize) -> Result<(), PageMapError> {
        if self.free.len() >= needed.max(self.config.low_water) {
            return Ok(());
        }

        let target = self.config.capacity.max(needed);
        let before = self.free.len();
        while self.free.len() < target {
            match pool.allocate(1, PageGranularity::Size4K) {
                Some(pa) => self.free.push(pa.page()),
                None if self.free.len() >= needed => break,
                None => return Err(PageMapError::OutOfNodes),
            }
        }

        trace!(
            "node cache refilled with {} pages ({} cached)",
            self.free.len() - before,
            self.free.len()
        );
        Ok(())
    }

    /// Draw a zeroed page.
    pub fn take(&mut self, platform: &dyn Platform) -> Option<PhysicalPage<Size4K>> {
        let page = self.free.pop()?;
        // SAFETY: cached pages are owned by the cache and referenced by no entry.
        unsafe { platform::zero_table(platform, page) };
        Some(page)
    }

    /// Give back a page that no longer backs a table.
    pub fn release(&mut self, pool: &dyn Platform, page: PhysicalPage<Size4K>) {
        if self.free.len() < self.config.capacity {
            self.free.push(page);
        } else {
            pool.free(page.base(), 1);
        }
    }

    /// Return every cached page to `pool`.
    pub fn drain(&mut self, pool: &dyn FramePool) {
        for page in self.free.drain(..) {
            pool.free(page.base(), 1);
        }
    }
}
