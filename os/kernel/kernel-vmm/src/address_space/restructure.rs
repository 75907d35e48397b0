//! Operations that cut areas: unmap, protection changes and advice.
//!
//! Each of them validates the whole range before changing anything, so a
//! rejected call leaves the area list and the page table exactly as they were.

use super::AddressSpace;
use crate::area::Area;
use crate::error::VmError;
use crate::ops::{Advice, AdviceOutcome, Capabilities};
use core::ops::Range;
use kernel_memory_addresses::{PageGranularity, VirtualAddress};
use kernel_vmem::Protection;
use log::{debug, warn};

bitflags::bitflags! {
    /// Options for range operations.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct RangeFlags: u32 {
        /// Every byte of the range must belong to some area.
        const STRICT = 1 << 0;
    }
}

impl AddressSpace<'_> {
    /// Remove `[start, start + length)` from the address space.
    ///
    /// Areas partially inside the range are trimmed or split. Holes are
    /// skipped unless `STRICT` is given.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for an empty or wrapping range.
    /// - [`VmError::Misaligned`] if a boundary is not page aligned, or cuts a
    ///   large-page area off its page size.
    /// - [`VmError::NotCovered`] for a hole under `STRICT`.
    /// - [`VmError::NotPermitted`] if an area that cannot be split would have to be.
    pub fn unmap(&mut self, start: VirtualAddress, length: u64, flags: RangeFlags) -> Result<(), VmError> {
        let range = span(start, length)?;
        self.remove(range, flags.contains(RangeFlags::STRICT))
    }

    pub(crate) fn remove(&mut self, range: Range<VirtualAddress>, strict: bool) -> Result<(), VmError> {
        let hits = self.check_range(&range, strict)?;
        self.check_cuts(hits, &range)?;
        let hits = match self.isolate(&range) {
            Ok(hits) => hits,
            Err(e) => {
                self.remerge(&range);
                return Err(e);
            }
        };

        let removed: alloc::vec::Vec<Area> = self.areas.drain(hits).collect();
        let mut result = Ok(());
        for mut area in removed {
            let info = area.info();
            if let Err(e) = area.ops.unmap_range(&info, info.range(), &mut self.pages) {
                warn!("unmapping {area:?} failed: {e}");
                result = result.and(Err(e));
            }
            area.ops.destroy(&info, &mut self.pages);
            debug!("unmapped {area:?}");
        }
        result
    }

    /// Give `[start, start + length)` the protection `protection`.
    ///
    /// # Errors
    /// As for [`unmap`](Self::unmap), plus failures of the handlers.
    pub fn set_protection(
        &mut self,
        start: VirtualAddress,
        length: u64,
        protection: Protection,
        flags: RangeFlags,
    ) -> Result<(), VmError> {
        let range = span(start, length)?;
        let hits = self.check_range(&range, flags.contains(RangeFlags::STRICT))?;
        self.check_cuts(hits.clone(), &range)?;
        let changing = self.areas[hits]
            .iter()
            .any(|a| a.protection != protection);
        if !changing {
            return Ok(());
        }

        let result = self.isolate(&range).and_then(|hits| {
            for index in hits {
                let area = &mut self.areas[index];
                if area.protection == protection {
                    continue;
                }
                let info = area.info();
                area.ops
                    .set_protection(&info, info.range(), protection, &mut self.pages)?;
                area.protection = protection;
                debug!("protected {area:?}");
            }
            Ok(())
        });
        self.remerge(&range);
        result
    }

    /// Pass `advice` for `[start, start + length)` to the areas in it.
    ///
    /// Advice never changes the area list.
    ///
    /// # Errors
    /// - As for [`unmap`](Self::unmap), except that no split is needed.
    /// - Failures of the handlers or of population.
    pub fn advise(
        &mut self,
        start: VirtualAddress,
        length: u64,
        advice: Advice,
        flags: RangeFlags,
    ) -> Result<(), VmError> {
        let range = span(start, length)?;
        let hits = self.check_range(&range, flags.contains(RangeFlags::STRICT))?;
        for area in &self.areas[hits.clone()] {
            let part = intersect(&area.range, &range);
            if !part.start.is_aligned(area.page_size) || !part.end.is_aligned(area.page_size) {
                return Err(VmError::Misaligned(area.page_size));
            }
        }

        for index in hits {
            let area = &mut self.areas[index];
            let info = area.info();
            let part = intersect(&area.range, &range);
            let outcome = area.ops.advise(&info, part.clone(), advice, &mut self.pages)?;
            if outcome == AdviceOutcome::Populate {
                self.populate(index, part)?;
            }
        }
        Ok(())
    }

    /// Validate a range and find the areas it touches.
    fn check_range(&self, range: &Range<VirtualAddress>, strict: bool) -> Result<Range<usize>, VmError> {
        let page = PageGranularity::Size4K;
        if !range.start.is_aligned(page) || !range.end.is_aligned(page) {
            return Err(VmError::Misaligned(page));
        }
        let hits = self.overlapping(range);
        if strict {
            let mut covered = range.start;
            for area in &self.areas[hits.clone()] {
                if area.start() > covered {
                    return Err(VmError::NotCovered);
                }
                covered = area.end();
            }
            if covered < range.end {
                return Err(VmError::NotCovered);
            }
        }
        Ok(hits)
    }

    /// Check that every area the range boundaries fall inside can be cut there.
    fn check_cuts(&self, hits: Range<usize>, range: &Range<VirtualAddress>) -> Result<(), VmError> {
        for area in &self.areas[hits] {
            for cut in [range.start, range.end] {
                if area.start() < cut && cut < area.end() {
                    if !area.ops.capabilities().contains(Capabilities::SPLIT) {
                        return Err(VmError::NotPermitted);
                    }
                    if !cut.is_aligned(area.page_size) {
                        return Err(VmError::Misaligned(area.page_size));
                    }
                }
            }
        }
        Ok(())
    }

    /// Split areas so that `range` starts and ends on area boundaries.
    /// Returns the indices of the areas inside it.
    fn isolate(&mut self, range: &Range<VirtualAddress>) -> Result<Range<usize>, VmError> {
        let hits = self.overlapping(range);
        if hits.is_empty() {
            return Ok(hits);
        }
        if self.areas[hits.start].start() < range.start {
            self.split_at(hits.start, range.start)?;
        }
        let hits = self.overlapping(range);
        let last = hits.end - 1;
        if range.end < self.areas[last].end() {
            self.split_at(last, range.end)?;
        }
        Ok(self.overlapping(range))
    }

    /// Cut the area at `index` in two at `at`.
    fn split_at(&mut self, index: usize, at: VirtualAddress) -> Result<(), VmError> {
        let area = &mut self.areas[index];
        let info = area.info();
        let ops = area.ops.split(&info, at)?;
        let right = Area {
            range: at..area.range.end,
            protection: area.protection,
            flags: area.flags,
            page_size: area.page_size,
            name: area.name,
            ops,
        };
        area.range.end = at;
        debug!("split {area:?} at {at}");
        self.areas.insert(index + 1, right);
        Ok(())
    }
}

/// `[start, start + length)`, rejecting empty and wrapping ranges.
fn span(start: VirtualAddress, length: u64) -> Result<Range<VirtualAddress>, VmError> {
    if length == 0 {
        return Err(VmError::InvalidArgument);
    }
    let end = start.checked_add(length).ok_or(VmError::InvalidArgument)?;
    Ok(start..end)
}

fn intersect(a: &Range<VirtualAddress>, b: &Range<VirtualAddress>) -> Range<VirtualAddress> {
    a.start.max(b.start)..a.end.min(b.end)
}
