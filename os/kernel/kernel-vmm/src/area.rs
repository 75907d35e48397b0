//! # Virtual Memory Areas
//!
//! An [`Area`] is a half-open range `[start, end)` of one address space with
//! uniform protection, flags and page size. What the range *contains* is
//! decided by its handler, an [`AreaOps`] object owned by the area.

use crate::ops::{AreaOps, Capabilities};
use alloc::boxed::Box;
use core::fmt;
use core::ops::Range;
use kernel_memory_addresses::{PageGranularity, VirtualAddress};
use kernel_vmem::Protection;

bitflags::bitflags! {
    /// Properties of an area beyond its protection.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct AreaFlags: u32 {
        /// Fresh pages need not be zeroed.
        const UNINITIALIZED = 1 << 0;
        /// Never merge with a neighbor.
        const NO_MERGE      = 1 << 1;
        /// Backed by fixed physical memory rather than the frame pool.
        const PHYSICAL      = 1 << 2;
    }
}

/// The handler family of an area.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AreaKind {
    Anonymous,
    File,
    Physical,
    Stack,
    Reservation,
}

/// Geometry and attributes of an area, passed to its handler.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AreaInfo {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub protection: Protection,
    pub flags: AreaFlags,
    pub page_size: PageGranularity,
    pub kind: AreaKind,
    pub name: Option<&'static str>,
}

impl AreaInfo {
    #[inline]
    #[must_use]
    pub const fn range(&self) -> Range<VirtualAddress> {
        self.start..self.end
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Offset of `va` from the start of the area.
    #[inline]
    #[must_use]
    pub fn offset_of(&self, va: VirtualAddress) -> u64 {
        va - self.start
    }
}

/// One virtual memory area.
pub struct Area {
    pub(crate) range: Range<VirtualAddress>,
    pub(crate) protection: Protection,
    pub(crate) flags: AreaFlags,
    pub(crate) page_size: PageGranularity,
    pub(crate) name: Option<&'static str>,
    pub(crate) ops: Box<dyn AreaOps>,
}

impl Area {
    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.range.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.range.end
    }

    #[inline]
    #[must_use]
    pub fn range(&self) -> Range<VirtualAddress> {
        self.range.clone()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.range.contains(&va)
    }

    #[inline]
    #[must_use]
    pub const fn protection(&self) -> Protection {
        self.protection
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> AreaFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> PageGranularity {
        self.page_size
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> Option<&'static str> {
        self.name
    }

    #[must_use]
    pub fn kind(&self) -> AreaKind {
        self.ops.kind()
    }

    /// The handler, e.g. for [`downcast_ref`](dyn AreaOps::downcast_ref).
    #[must_use]
    pub fn ops(&self) -> &dyn AreaOps {
        &*self.ops
    }

    #[must_use]
    pub fn info(&self) -> AreaInfo {
        AreaInfo {
            start: self.range.start,
            end: self.range.end,
            protection: self.protection,
            flags: self.flags,
            page_size: self.page_size,
            kind: self.ops.kind(),
            name: self.name,
        }
    }

    /// Whether `self` and `right` could form one area if they were adjacent.
    ///
    /// The handler's merge callback has the final word.
    pub(crate) fn compatible(&self, right: &Self) -> bool {
        let mergeable = |a: &Self| {
            a.ops.capabilities().contains(Capabilities::MERGE)
                && !a.flags.contains(AreaFlags::NO_MERGE)
        };
        self.ops.as_any().type_id() == right.ops.as_any().type_id()
            && self.protection == right.protection
            && self.flags == right.flags
            && self.page_size == right.page_size
            && mergeable(self)
            && mergeable(right)
    }
}

impl fmt::Debug for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Area")
            .field("range", &self.range)
            .field("kind", &self.ops.kind())
            .field("protection", &self.protection)
            .field("flags", &self.flags)
            .field("page_size", &self.page_size)
            .field("name", &self.name)
            .finish()
    }
}
