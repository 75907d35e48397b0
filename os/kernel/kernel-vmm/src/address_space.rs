//! # Address Space
//!
//! An [`AddressSpace`] pairs one [`PageMap`] with the sorted list of areas
//! living in it.
//!
//! ## Invariants
//!
//! After every public operation returns, successfully or not:
//!
//! - areas are sorted by start address and do not overlap;
//! - no two adjacent areas are compatible (same handler type, protection,
//!   flags and page size, both mergeable) *and* approved by the left handler's
//!   merge callback. Such pairs are merged eagerly.
//!
//! ## Concurrency
//!
//! Every structural operation and the fault path take `&mut self`. An address
//! space shared between CPUs must be wrapped in a lock by its owner.

mod access;
mod restructure;

use crate::area::{Area, AreaFlags};
use crate::error::VmError;
use crate::ops::{AreaOps, Proposal};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_info::memory::{DEFAULT_MAP_BASE, LOWEST_MAP_ADDRESS, USERSPACE_END};
use kernel_memory_addresses::{PageGranularity, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{NodeCacheConfig, PageMap, Platform, Protection};
use log::{debug, trace, warn};

pub use restructure::RangeFlags;

/// Bounds of the range areas may be placed in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SpaceConfig {
    /// Lowest address an area may start at.
    pub base: VirtualAddress,
    /// Exclusive upper bound for area ends.
    pub limit: VirtualAddress,
    /// Where the search for anywhere-placed areas begins.
    pub search_start: VirtualAddress,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            base: VirtualAddress::new(LOWEST_MAP_ADDRESS),
            limit: VirtualAddress::new(USERSPACE_END),
            search_start: VirtualAddress::new(DEFAULT_MAP_BASE),
        }
    }
}

impl SpaceConfig {
    fn validate(&self) -> Result<(), VmError> {
        let page = PageGranularity::Size4K;
        let ordered = self.base < self.limit
            && self.base <= self.search_start
            && self.search_start < self.limit;
        if !ordered {
            return Err(VmError::InvalidArgument);
        }
        if !self.base.is_aligned(page) || !self.limit.is_aligned(page) {
            return Err(VmError::Misaligned(page));
        }
        Ok(())
    }
}

/// Where a new area goes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Placement {
    /// First gap large enough, searching upward from the handler's preferred
    /// base or [`SpaceConfig::search_start`].
    Anywhere,
    /// Exactly here.
    At(VirtualAddress),
}

bitflags::bitflags! {
    /// Options for [`AddressSpace::map`].
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MapFlags: u32 {
        /// Remove whatever occupies a fixed placement first.
        const REPLACE       = 1 << 0;
        /// Resolve every page before returning.
        const POPULATE      = 1 << 1;
        /// Use 2 MiB pages.
        const LARGE         = 1 << 2;
        /// Use 1 GiB pages.
        const HUGE          = 1 << 3;
        /// See [`AreaFlags::UNINITIALIZED`].
        const UNINITIALIZED = 1 << 4;
        /// See [`AreaFlags::NO_MERGE`].
        const NO_MERGE      = 1 << 5;
    }
}

impl MapFlags {
    fn page_size(self) -> Result<PageGranularity, VmError> {
        match (self.contains(Self::LARGE), self.contains(Self::HUGE)) {
            (false, false) => Ok(PageGranularity::Size4K),
            (true, false) => Ok(PageGranularity::Size2M),
            (false, true) => Ok(PageGranularity::Size1G),
            (true, true) => Err(VmError::InvalidArgument),
        }
    }

    fn area_flags(self) -> AreaFlags {
        let mut flags = AreaFlags::empty();
        flags.set(AreaFlags::UNINITIALIZED, self.contains(Self::UNINITIALIZED));
        flags.set(AreaFlags::NO_MERGE, self.contains(Self::NO_MERGE));
        flags
    }
}

/// Arguments of [`AddressSpace::map`] that do not depend on the area type.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MapRequest {
    pub placement: Placement,
    pub length: u64,
    pub protection: Protection,
    pub flags: MapFlags,
    pub name: Option<&'static str>,
}

impl MapRequest {
    #[must_use]
    pub const fn anywhere(length: u64, protection: Protection) -> Self {
        Self {
            placement: Placement::Anywhere,
            length,
            protection,
            flags: MapFlags::empty(),
            name: None,
        }
    }

    #[must_use]
    pub const fn at(base: VirtualAddress, length: u64, protection: Protection) -> Self {
        Self {
            placement: Placement::At(base),
            ..Self::anywhere(length, protection)
        }
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: MapFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }
}

/// A virtual address space: page table plus areas.
pub struct AddressSpace<'p> {
    pub(crate) pages: PageMap<'p>,
    pub(crate) areas: Vec<Area>,
    config: SpaceConfig,
    demand_paging: bool,
}

impl<'p> AddressSpace<'p> {
    /// An empty address space with the default layout.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the root table cannot be allocated.
    pub fn new(platform: &'p dyn Platform) -> Result<Self, VmError> {
        Self::with_config(platform, SpaceConfig::default(), NodeCacheConfig::default())
    }

    /// An empty address space.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] / [`VmError::Misaligned`] for a bad `config`.
    /// - [`VmError::OutOfMemory`] if the root table cannot be allocated.
    pub fn with_config(
        platform: &'p dyn Platform,
        config: SpaceConfig,
        cache: NodeCacheConfig,
    ) -> Result<Self, VmError> {
        config.validate()?;
        Ok(Self {
            pages: PageMap::with_config(platform, cache)?,
            areas: Vec::new(),
            config,
            demand_paging: true,
        })
    }

    /// Wrap an existing table, e.g. the one built during bootstrap.
    ///
    /// # Errors
    /// As for [`with_config`](Self::with_config), minus allocation failures.
    ///
    /// # Safety
    /// See [`PageMap::from_root`].
    pub unsafe fn adopt(
        platform: &'p dyn Platform,
        root: PhysicalPage<Size4K>,
        config: SpaceConfig,
    ) -> Result<Self, VmError> {
        config.validate()?;
        Ok(Self {
            // SAFETY: forwarded to the caller.
            pages: unsafe { PageMap::from_root(platform, root, NodeCacheConfig::default()) },
            areas: Vec::new(),
            config,
            demand_paging: true,
        })
    }

    #[must_use]
    pub const fn config(&self) -> SpaceConfig {
        self.config
    }

    /// The page table, read-only. Areas are changed through this type only.
    #[must_use]
    pub const fn page_map(&self) -> &PageMap<'p> {
        &self.pages
    }

    /// All areas, sorted by start address.
    #[must_use]
    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    /// The area containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&Area> {
        self.area_index(va).map(|i| &self.areas[i])
    }

    pub(crate) fn area_index(&self, va: VirtualAddress) -> Option<usize> {
        let i = self.areas.partition_point(|a| a.end() <= va);
        (i < self.areas.len() && self.areas[i].contains(va)).then_some(i)
    }

    /// Make this the CPU's address space.
    ///
    /// # Safety
    /// See [`kernel_vmem::Mmu::activate`].
    pub unsafe fn activate(&self) {
        unsafe { self.pages.activate() };
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.pages.is_active()
    }

    #[must_use]
    pub const fn demand_paging(&self) -> bool {
        self.demand_paging
    }

    /// With demand paging off, every new area is populated as it is mapped.
    /// Returns the previous setting.
    pub fn set_demand_paging(&mut self, enabled: bool) -> bool {
        core::mem::replace(&mut self.demand_paging, enabled)
    }

    /// Run `f` with demand paging off, restoring the previous setting after.
    pub fn with_demand_paging_disabled<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = self.set_demand_paging(false);
        let result = f(self);
        self.set_demand_paging(previous);
        result
    }

    /// Create a new area handled by `ops`. Returns its start address.
    ///
    /// # Errors
    /// - [`VmError::Misaligned`] if the address or length does not fit the page size.
    /// - [`VmError::Unsupported`] if the page size is not available.
    /// - [`VmError::Collision`] for an occupied fixed placement without `REPLACE`.
    /// - [`VmError::NoSpace`] if no gap is large enough.
    /// - Any error of the handler's `allocate` or of population; the space is
    ///   left as it was, except for areas removed by `REPLACE`.
    pub fn map(
        &mut self,
        request: MapRequest,
        mut ops: Box<dyn AreaOps>,
    ) -> Result<VirtualAddress, VmError> {
        let proposal = match self.propose(&request, &mut *ops) {
            Ok(proposal) => proposal,
            Err(e) => {
                self.discard(&request, &mut *ops);
                return Err(e);
            }
        };

        let start = proposal.base;
        let range = start..start + proposal.length;
        if request.flags.contains(MapFlags::REPLACE)
            && let Err(e) = self.remove(range.clone(), false)
        {
            self.discard(&request, &mut *ops);
            return Err(e);
        }

        let index = self.insert(Area {
            range,
            protection: proposal.protection,
            flags: proposal.flags,
            page_size: proposal.page_size,
            name: request.name,
            ops,
        });
        debug!("mapped {:?}", self.areas[index]);

        if request.flags.contains(MapFlags::POPULATE) || !self.demand_paging {
            let full = self.areas[index].range();
            if let Err(e) = self.populate(index, full) {
                warn!("populating {start} failed: {e}; rolling back");
                self.destroy_at(index);
                return Err(e);
            }
        }

        self.merge_around(index);
        debug_assert!(self.is_ordered());
        Ok(start)
    }

    /// Validate `request`, choose the base and let the handler weigh in.
    fn propose(&self, request: &MapRequest, ops: &mut dyn AreaOps) -> Result<Proposal, VmError> {
        let page_size = request.flags.page_size()?;
        if page_size != PageGranularity::Size4K && !self.pages.platform().supports(page_size) {
            return Err(VmError::Unsupported(page_size));
        }
        if request.length == 0 {
            return Err(VmError::InvalidArgument);
        }
        if !page_size.is_aligned(request.length) {
            return Err(VmError::Misaligned(page_size));
        }

        let fixed = match request.placement {
            Placement::At(base) => Some(base),
            Placement::Anywhere => None,
        };
        let base = match fixed {
            Some(base) => {
                if !base.is_aligned(page_size) {
                    return Err(VmError::Misaligned(page_size));
                }
                let range = self.bounded(base, request.length)?;
                if !request.flags.contains(MapFlags::REPLACE) && self.overlaps(&range) {
                    return Err(VmError::Collision);
                }
                base
            }
            None => {
                let hint = ops.preferred_base().unwrap_or(self.config.search_start);
                self.find_gap(hint, request.length, page_size)?
            }
        };

        let mut proposal = Proposal {
            base,
            length: request.length,
            protection: request.protection,
            flags: request.flags.area_flags(),
            page_size,
            fixed: fixed.is_some(),
        };
        ops.allocate(&mut proposal)?;

        if proposal.length != request.length || proposal.page_size != page_size {
            return Err(VmError::InvalidArgument);
        }
        if proposal.base != base {
            if fixed.is_some() {
                return Err(VmError::InvalidArgument);
            }
            if !proposal.base.is_aligned(page_size) {
                return Err(VmError::Misaligned(page_size));
            }
            let range = self.bounded(proposal.base, proposal.length)?;
            if self.overlaps(&range) {
                return Err(VmError::Collision);
            }
        }
        Ok(proposal)
    }

    /// Give a handler that will never be inserted the chance to release what it owns.
    fn discard(&mut self, request: &MapRequest, ops: &mut dyn AreaOps) {
        let start = match request.placement {
            Placement::At(base) => base,
            Placement::Anywhere => VirtualAddress::zero(),
        };
        let info = crate::area::AreaInfo {
            start,
            end: start.checked_add(request.length).unwrap_or(start),
            protection: request.protection,
            flags: request.flags.area_flags(),
            page_size: request.flags.page_size().unwrap_or_default(),
            kind: ops.kind(),
            name: request.name,
        };
        ops.destroy(&info, &mut self.pages);
    }

    /// `[base, base + length)` if it lies within the configured bounds.
    fn bounded(&self, base: VirtualAddress, length: u64) -> Result<Range<VirtualAddress>, VmError> {
        let end = base.checked_add(length).ok_or(VmError::InvalidArgument)?;
        if base < self.config.base || end > self.config.limit {
            return Err(VmError::InvalidArgument);
        }
        Ok(base..end)
    }

    fn overlaps(&self, range: &Range<VirtualAddress>) -> bool {
        !self.overlapping(range).is_empty()
    }

    /// Indices of the areas intersecting `range`.
    pub(crate) fn overlapping(&self, range: &Range<VirtualAddress>) -> Range<usize> {
        let lo = self.areas.partition_point(|a| a.end() <= range.start);
        let hi = self.areas.partition_point(|a| a.start() < range.end);
        lo..hi.max(lo)
    }

    /// First gap of `length` bytes at or above `hint`, aligned to `align`.
    /// Wraps around to the configured base once before giving up.
    fn find_gap(
        &self,
        hint: VirtualAddress,
        length: u64,
        align: PageGranularity,
    ) -> Result<VirtualAddress, VmError> {
        let hint = hint.max(self.config.base);
        let search = |from: VirtualAddress| -> Option<VirtualAddress> {
            let mut candidate = from.checked_align_up(align)?;
            let first = self.areas.partition_point(|a| a.end() <= candidate);
            for area in &self.areas[first..] {
                if candidate.checked_add(length)? <= area.start() {
                    break;
                }
                // Too small: continue behind this area.
                candidate = area.end().max(candidate).checked_align_up(align)?;
            }
            let end = candidate.checked_add(length)?;
            (end <= self.config.limit).then_some(candidate)
        };

        search(hint)
            .or_else(|| (hint > self.config.base).then(|| search(self.config.base)).flatten())
            .inspect(|base| trace!("gap for {length:#x} bytes at {base}"))
            .ok_or(VmError::NoSpace)
    }

    fn insert(&mut self, area: Area) -> usize {
        let index = self.areas.partition_point(|a| a.start() < area.start());
        self.areas.insert(index, area);
        index
    }

    /// Remove the area at `index`, dropping its translations.
    pub(crate) fn destroy_at(&mut self, index: usize) {
        let mut area = self.areas.remove(index);
        let info = area.info();
        if let Err(e) = area.ops.unmap_range(&info, info.range(), &mut self.pages) {
            warn!("unmapping {:?} failed: {e}", area);
        }
        area.ops.destroy(&info, &mut self.pages);
        debug!("destroyed {area:?}");
    }

    /// Fold `areas[left + 1]` into `areas[left]` if they are compatible and
    /// the left handler agrees.
    pub(crate) fn try_merge(&mut self, left: usize) -> bool {
        if left + 1 >= self.areas.len() {
            return false;
        }
        let (head, tail) = self.areas.split_at_mut(left + 1);
        let (l, r) = (&mut head[left], &tail[0]);
        if l.end() != r.start() || !l.compatible(r) {
            return false;
        }
        let (left_info, right_info) = (l.info(), r.info());
        if !l.ops.merge(&left_info, &right_info, &*r.ops) {
            return false;
        }
        l.range.end = r.range.end;
        self.areas.remove(left + 1);
        debug!("merged {:?}", self.areas[left]);
        true
    }

    fn merge_around(&mut self, index: usize) {
        self.try_merge(index);
        if index > 0 {
            self.try_merge(index - 1);
        }
    }

    /// Merge compatible neighbors among the areas touching `range`.
    pub(crate) fn remerge(&mut self, range: &Range<VirtualAddress>) {
        let hits = self.overlapping(range);
        let mut i = hits.start.saturating_sub(1);
        let mut end = (hits.end + 1).min(self.areas.len());
        while i + 1 < end {
            if self.try_merge(i) {
                end -= 1;
            } else {
                i += 1;
            }
        }
        debug_assert!(self.is_ordered());
    }

    /// Sorted and non-overlapping.
    pub(crate) fn is_ordered(&self) -> bool {
        self.areas
            .windows(2)
            .all(|w| w[0].end() <= w[1].start())
            && self.areas.iter().all(|a| a.start() < a.end())
    }
}

impl Drop for AddressSpace<'_> {
    fn drop(&mut self) {
        while !self.areas.is_empty() {
            self.destroy_at(self.areas.len() - 1);
        }
    }
}

#[cfg(test)]
mod tests;
