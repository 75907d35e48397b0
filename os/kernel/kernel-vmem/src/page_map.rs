//! # Page Map
//!
//! [`PageMap`] owns one translation tree and implements the structural
//! operations on it: map, unmap, protect and the side-effect-free walk.
//!
//! ## Walk discipline
//!
//! - Every mutating walk first tops up the [node cache](crate::node_cache) with
//!   [`NODES_PER_WALK`] pages, then descends without touching the frame pool.
//! - A leaf is cleared, its translation flushed, and only then is its frame
//!   returned to the pool.
//! - An intermediate table left without mapped entries is unlinked from its
//!   parent and handed back to the cache, bottom-up, on every unmap and after
//!   every failed map.

use crate::entry::{Level, PageTableEntry};
use crate::node_cache::{NodeCache, NodeCacheConfig};
use crate::platform::{self, Platform};
use crate::protection::{MapFlags, Protection};
use crate::table::ENTRIES;
use crate::PageMapError;
use core::ops::Range;
use kernel_info::memory::NODES_PER_WALK;
use kernel_memory_addresses::{
    PageGranularity, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};
use log::{trace, warn};

/// A leaf found by a walk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    /// Level of the leaf entry.
    pub level: Level,
    /// The leaf entry as stored.
    pub entry: PageTableEntry,
    /// Page size of the leaf.
    pub granularity: PageGranularity,
    /// First virtual address covered by the leaf.
    pub base: VirtualAddress,
    /// Physical address the walked address translates to, offset included.
    pub phys: PhysicalAddress,
}

impl Translation {
    /// Access rights the leaf grants.
    #[must_use]
    pub fn protection(&self) -> Protection {
        Protection::from_entry(self.entry)
    }
}

/// Outcome of [`PageMap::walk`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Walk {
    Mapped(Translation),
    /// The entry at `level` was not mapped.
    Missing { level: Level },
}

/// What [`PageMap::unmap`] removed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Unmapped {
    /// Base of the frame run the leaf pointed at.
    pub phys: PhysicalAddress,
    pub granularity: PageGranularity,
    /// `true` if the frame was not returned to the pool.
    pub shared: bool,
}

/// The slot holding a leaf.
#[derive(Copy, Clone)]
struct Slot {
    table: PhysicalPage<Size4K>,
    level: Level,
    entry: PageTableEntry,
}

impl Slot {
    fn granularity(self) -> PageGranularity {
        // A slot is only formed for leaves, which never sit at L4.
        self.level
            .leaf_granularity()
            .unwrap_or(PageGranularity::Size4K)
    }
}

/// Handle to one hierarchical page table.
pub struct PageMap<'p> {
    platform: &'p dyn Platform,
    root: PhysicalPage<Size4K>,
    cache: NodeCache,
    owned: bool,
}

impl<'p> PageMap<'p> {
    /// Allocate a new, empty table.
    ///
    /// # Errors
    /// [`PageMapError::OutOfNodes`] if the root frame cannot be allocated.
    pub fn new(platform: &'p dyn Platform) -> Result<Self, PageMapError> {
        Self::with_config(platform, NodeCacheConfig::default())
    }

    /// Allocate a new, empty table with a custom node cache.
    ///
    /// # Errors
    /// [`PageMapError::OutOfNodes`] if the root frame cannot be allocated.
    pub fn with_config(
        platform: &'p dyn Platform,
        config: NodeCacheConfig,
    ) -> Result<Self, PageMapError> {
        let root = platform
            .allocate(1, PageGranularity::Size4K)
            .ok_or(PageMapError::OutOfNodes)?
            .page();
        // SAFETY: the frame was just allocated for us.
        unsafe { platform::zero_table(platform, root) };
        trace!("new page map rooted at {root}");
        Ok(Self {
            platform,
            root,
            cache: NodeCache::new(config),
            owned: true,
        })
    }

    /// Take over an existing table, e.g. the one set up by the boot loader.
    ///
    /// Dropping the returned map releases the node cache only. The root and
    /// the tables below it are left alone.
    ///
    /// # Safety
    /// `root` must be a valid L4 table reachable through `platform`, and no
    /// other `PageMap` may modify it while this one exists.
    pub unsafe fn from_root(
        platform: &'p dyn Platform,
        root: PhysicalPage<Size4K>,
        config: NodeCacheConfig,
    ) -> Self {
        Self {
            platform,
            root,
            cache: NodeCache::new(config),
            owned: false,
        }
    }

    /// Physical page of the L4 table.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    #[must_use]
    pub fn platform(&self) -> &'p dyn Platform {
        self.platform
    }

    #[inline]
    #[must_use]
    pub const fn node_cache(&self) -> &NodeCache {
        &self.cache
    }

    fn read(&self, table: PhysicalPage<Size4K>, index: usize) -> PageTableEntry {
        // SAFETY: every table reachable from the root belongs to this map.
        unsafe { platform::table_ptr(self.platform, table).as_ref().get(index) }
    }

    fn write(&mut self, table: PhysicalPage<Size4K>, index: usize, entry: PageTableEntry) {
        // SAFETY: as in `read`; `&mut self` makes this the only writer.
        unsafe { platform::table_ptr(self.platform, table).as_mut().set(index, entry) };
    }

    fn table_is_empty(&self, table: PhysicalPage<Size4K>) -> bool {
        // SAFETY: as in `read`.
        unsafe { platform::table_ptr(self.platform, table).as_ref().is_empty() }
    }

    /// Walk to the leaf for `va`, or report the level of the first unmapped entry.
    fn find_leaf(&self, va: VirtualAddress) -> Result<Slot, Level> {
        let mut table = self.root;
        for level in Level::WALK {
            let entry = self.read(table, level.index_of(va));
            if !entry.is_mapped() {
                return Err(level);
            }
            if level != Level::L4 && entry.is_leaf_at(level) {
                return Ok(Slot {
                    table,
                    level,
                    entry,
                });
            }
            table = entry.next_table();
        }
        // L1 entries are always leaves.
        Err(Level::L1)
    }

    /// Tables visited for `va`, indexed by [`Level::depth`].
    fn tables_along(&self, va: VirtualAddress) -> [Option<PhysicalPage<Size4K>>; 4] {
        let mut path = [None; 4];
        let mut table = self.root;
        for level in Level::WALK {
            path[level.depth()] = Some(table);
            let entry = self.read(table, level.index_of(va));
            if level == Level::L1 || !entry.present() || entry.huge() {
                break;
            }
            table = entry.next_table();
        }
        path
    }

    /// Walk down to the table holding leaves at `leaf_level`, creating missing
    /// intermediate tables from the node cache.
    fn descend(
        &mut self,
        va: VirtualAddress,
        leaf_level: Level,
    ) -> Result<PhysicalPage<Size4K>, PageMapError> {
        let mut table = self.root;
        let mut level = Level::L4;
        while level != leaf_level {
            let index = level.index_of(va);
            let entry = self.read(table, index);
            table = if entry.present() && !entry.huge() {
                entry.next_table()
            } else if entry.is_mapped() {
                // A larger leaf already covers `va`.
                return Err(PageMapError::AlreadyMapped(va));
            } else {
                let node = self
                    .cache
                    .take(self.platform)
                    .ok_or(PageMapError::OutOfNodes)?;
                self.write(table, index, PageTableEntry::table(node));
                trace!("new {:?} table {node} for {va}", level.lower());
                node
            };
            level = match level.lower() {
                Some(lower) => lower,
                None => break,
            };
        }
        Ok(table)
    }

    /// Unlink empty tables on the path to `va`, lowest first.
    fn collapse(&mut self, va: VirtualAddress) {
        let path = self.tables_along(va);
        for level in [Level::L1, Level::L2, Level::L3] {
            let Some(table) = path[level.depth()] else {
                continue;
            };
            if !self.table_is_empty(table) {
                break;
            }
            let parent_level = Level::WALK[level.depth() - 1];
            let Some(parent) = path[parent_level.depth()] else {
                break;
            };
            self.write(parent, parent_level.index_of(va), PageTableEntry::new());
            self.platform.flush(va);
            self.cache.release(self.platform, table);
            trace!("reclaimed {level:?} table {table}");
        }
    }

    /// Install a leaf for `va`.
    ///
    /// With `pa == None` a frame run of the requested page size is allocated
    /// from the pool. Returns the physical base that was mapped.
    ///
    /// # Errors
    /// - [`PageMapError::Misaligned`] if `va` or `pa` is not aligned to the page size.
    /// - [`PageMapError::Unsupported`] if the machine lacks that page size.
    /// - [`PageMapError::AlreadyMapped`] if a leaf exists and `SHARED` is not set.
    /// - [`PageMapError::OutOfNodes`] / [`PageMapError::OutOfFrames`] on exhaustion.
    pub fn map(
        &mut self,
        va: VirtualAddress,
        pa: Option<PhysicalAddress>,
        protection: Protection,
        flags: MapFlags,
    ) -> Result<PhysicalAddress, PageMapError> {
        let granularity = flags.granularity()?;
        if granularity != PageGranularity::Size4K && !self.platform.supports(granularity) {
            return Err(PageMapError::Unsupported(granularity));
        }
        if !va.is_aligned(granularity) {
            return Err(PageMapError::misaligned(va.as_u64(), granularity));
        }
        if let Some(pa) = pa
            && !pa.is_aligned(granularity)
        {
            return Err(PageMapError::misaligned(pa.as_u64(), granularity));
        }

        self.cache.reserve(self.platform, NODES_PER_WALK)?;
        let leaf_level = Level::for_granularity(granularity);
        let table = match self.descend(va, leaf_level) {
            Ok(table) => table,
            Err(e) => {
                self.collapse(va);
                return Err(e);
            }
        };

        let index = leaf_level.index_of(va);
        let old = self.read(table, index);
        let shared = flags.contains(MapFlags::SHARED);
        // Only a leaf may be replaced; a table pointer keeps its subtree.
        if old.is_mapped() && (!shared || !old.is_leaf_at(leaf_level)) {
            return Err(PageMapError::AlreadyMapped(va));
        }

        let frame = if let Some(pa) = pa {
            pa
        } else if let Some(pa) = self.platform.allocate(granularity.frames(), granularity) {
            pa
        } else {
            self.collapse(va);
            return Err(PageMapError::OutOfFrames);
        };

        self.write(table, index, protection.leaf_entry(frame, leaf_level, shared));
        if old.is_mapped() {
            self.platform.flush(va);
            if !old.shared()
                && let Some(old_granularity) = leaf_level.leaf_granularity()
            {
                self.platform.free(old.address(), old_granularity.frames());
            }
        }
        trace!("mapped {va} -> {frame} ({granularity}, {protection:?})");
        Ok(frame)
    }

    /// Remove the leaf mapping `va`.
    ///
    /// `va` must be the base of the leaf, so a large leaf can only be removed
    /// as a whole.
    ///
    /// # Errors
    /// - [`PageMapError::NotMapped`] if there is no leaf.
    /// - [`PageMapError::Misaligned`] if `va` is inside, but not at the base of, a large leaf.
    pub fn unmap(&mut self, va: VirtualAddress) -> Result<Unmapped, PageMapError> {
        let slot = self.find_leaf(va).map_err(|_| PageMapError::NotMapped(va))?;
        let granularity = slot.granularity();
        if !va.is_aligned(granularity) {
            return Err(PageMapError::misaligned(va.as_u64(), granularity));
        }

        self.write(slot.table, slot.level.index_of(va), PageTableEntry::new());
        self.platform.flush(va);

        let phys = slot.entry.address();
        let shared = slot.entry.shared();
        if !shared {
            self.platform.free(phys, granularity.frames());
        }
        self.collapse(va);
        trace!("unmapped {va} ({granularity}, was {phys})");
        Ok(Unmapped {
            phys,
            granularity,
            shared,
        })
    }

    /// Re-encode the leaf at `va` with `protection`, keeping its frame.
    ///
    /// # Errors
    /// As for [`unmap`](Self::unmap).
    pub fn protect(&mut self, va: VirtualAddress, protection: Protection) -> Result<(), PageMapError> {
        let slot = self.find_leaf(va).map_err(|_| PageMapError::NotMapped(va))?;
        let granularity = slot.granularity();
        if !va.is_aligned(granularity) {
            return Err(PageMapError::misaligned(va.as_u64(), granularity));
        }
        let entry = protection.leaf_entry(slot.entry.address(), slot.level, slot.entry.shared());
        self.write(slot.table, slot.level.index_of(va), entry);
        self.platform.flush(va);
        Ok(())
    }

    /// Visit every leaf intersecting `range`, skipping holes by the span of
    /// the level at which the walk stopped.
    ///
    /// Fails without calling `f` at all if a leaf crosses either end of the range.
    fn for_each_leaf(
        &mut self,
        range: &Range<VirtualAddress>,
        mut f: impl FnMut(&mut Self, VirtualAddress) -> Result<(), PageMapError>,
    ) -> Result<usize, PageMapError> {
        let mut leaves = 0usize;
        for apply in [false, true] {
            let mut va = range.start;
            while va < range.end {
                let next = match self.find_leaf(va) {
                    Err(level) => {
                        let span = level.span();
                        (va.as_u64() & !(span - 1)).checked_add(span)
                    }
                    Ok(slot) => {
                        let granularity = slot.granularity();
                        let base = va.align_down(granularity);
                        let end = base.checked_add(granularity.bytes());
                        if base < range.start || end.is_none_or(|end| end > range.end) {
                            return Err(PageMapError::misaligned(base.as_u64(), granularity));
                        }
                        if apply {
                            f(self, base)?;
                            leaves += 1;
                        }
                        end.map(VirtualAddress::as_u64)
                    }
                };
                match next {
                    Some(next) => va = VirtualAddress::new(next),
                    None => break,
                }
            }
        }
        Ok(leaves)
    }

    /// Unmap every leaf inside `range`. Returns the number of leaves removed.
    ///
    /// # Errors
    /// [`PageMapError::Misaligned`] if a large leaf straddles either end; nothing is unmapped then.
    pub fn unmap_range(&mut self, range: Range<VirtualAddress>) -> Result<usize, PageMapError> {
        self.for_each_leaf(&range, |map, va| map.unmap(va).map(|_| ()))
    }

    /// Change the protection of every leaf inside `range`.
    ///
    /// # Errors
    /// As for [`unmap_range`](Self::unmap_range).
    pub fn protect_range(
        &mut self,
        range: Range<VirtualAddress>,
        protection: Protection,
    ) -> Result<usize, PageMapError> {
        self.for_each_leaf(&range, |map, va| map.protect(va, protection))
    }

    /// Walk the tree for `va` without allocating anything.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Walk {
        match self.find_leaf(va) {
            Ok(slot) => {
                let granularity = slot.granularity();
                let base = va.align_down(granularity);
                Walk::Mapped(Translation {
                    level: slot.level,
                    entry: slot.entry,
                    granularity,
                    base,
                    phys: slot.entry.address() + (va - base),
                })
            }
            Err(level) => Walk::Missing { level },
        }
    }

    /// The leaf translating `va`, if any.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<Translation> {
        match self.walk(va) {
            Walk::Mapped(t) => Some(t),
            Walk::Missing { .. } => None,
        }
    }

    /// Invalidate the cached translation for `va`.
    #[inline]
    pub fn flush(&self, va: VirtualAddress) {
        self.platform.flush(va);
    }

    /// Make this table the active one.
    ///
    /// # Safety
    /// See [`Mmu::activate`](crate::Mmu::activate).
    pub unsafe fn activate(&self) {
        unsafe { self.platform.activate(self.root) };
    }

    /// Whether the CPU currently uses this table.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.platform.active_root() == Some(self.root)
    }

    /// Free all tables below `table`, returning the number of leaves found.
    fn free_subtree(&self, table: PhysicalPage<Size4K>, level: Level) -> usize {
        let mut leaves = 0;
        for index in 0..ENTRIES {
            let entry = self.read(table, index);
            if !entry.is_mapped() {
                continue;
            }
            let Some(lower) = level.lower().filter(|_| !entry.is_leaf_at(level)) else {
                leaves += 1;
                if !entry.shared() {
                    let frames = level.leaf_granularity().map_or(1, PageGranularity::frames);
                    self.platform.free(entry.address(), frames);
                }
                continue;
            };
            let child = entry.next_table();
            if child == self.root {
                // Self-map slot.
                continue;
            }
            leaves += self.free_subtree(child, lower);
            self.platform.free(child.base(), 1);
        }
        leaves
    }
}

impl Drop for PageMap<'_> {
    fn drop(&mut self) {
        if self.owned {
            let leaves = self.free_subtree(self.root, Level::L4);
            if leaves > 0 {
                warn!("page map {} dropped with {leaves} leaf mappings", self.root);
            }
            self.platform.free(self.root.base(), 1);
        }
        self.cache.drain(self.platform);
    }
}

#[cfg(test)]
mod tests;
