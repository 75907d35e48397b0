//! # Direct-Physical Areas
//!
//! Windows onto fixed physical ranges, borrowed or owned.

use crate::area::{AreaFlags, AreaInfo, AreaKind};
use crate::error::VmError;
use crate::fault::FaultContext;
use crate::ops::{AreaOps, Proposal};
use alloc::boxed::Box;
use kernel_memory_addresses::{PageGranularity, PhysicalAddress, VirtualAddress};
use kernel_vmem::PageMap;
use log::debug;

/// Who returns the frames of a [`DirectPhysical`] area to the pool.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Ownership {
    /// Device memory or frames owned elsewhere. Never freed by the area.
    Borrowed,
    /// Frames from the pool, freed when the area (or a piece of it) goes away.
    Owned,
}

/// A fixed window onto physical memory, e.g. for DMA buffers or MMIO.
///
/// Leaves are installed as shared so that unmapping never frees the frames
/// through the page table; an [`Owned`](Ownership::Owned) area frees them
/// itself on destroy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DirectPhysical {
    phys: PhysicalAddress,
    len: u64,
    ownership: Ownership,
}

impl DirectPhysical {
    #[must_use]
    pub const fn new(phys: PhysicalAddress, len: u64, ownership: Ownership) -> Self {
        Self {
            phys,
            len,
            ownership,
        }
    }

    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    #[must_use]
    pub const fn ownership(&self) -> Ownership {
        self.ownership
    }
}

impl AreaOps for DirectPhysical {
    fn kind(&self) -> AreaKind {
        AreaKind::Physical
    }

    fn allocate(&mut self, proposal: &mut Proposal) -> Result<(), VmError> {
        if !self.phys.is_aligned(proposal.page_size) {
            return Err(VmError::Misaligned(proposal.page_size));
        }
        if proposal.length != self.len || self.phys.checked_add(self.len).is_none() {
            return Err(VmError::InvalidArgument);
        }
        proposal.flags |= AreaFlags::PHYSICAL;
        Ok(())
    }

    fn fault(&mut self, area: &AreaInfo, fault: &mut FaultContext<'_>) -> Result<(), VmError> {
        fault.resolve_shared(self.phys + area.offset_of(fault.base));
        Ok(())
    }

    fn split(&mut self, area: &AreaInfo, at: VirtualAddress) -> Result<Box<dyn AreaOps>, VmError> {
        let head = area.offset_of(at);
        let right = Self {
            phys: self.phys + head,
            len: self.len - head,
            ownership: self.ownership,
        };
        self.len = head;
        Ok(Box::new(right))
    }

    fn merge(&mut self, _left: &AreaInfo, _right: &AreaInfo, right_ops: &dyn AreaOps) -> bool {
        let Some(right) = right_ops.downcast_ref::<Self>() else {
            return false;
        };
        if right.ownership != self.ownership || self.phys.checked_add(self.len) != Some(right.phys) {
            return false;
        }
        self.len += right.len;
        true
    }

    fn destroy(&mut self, _area: &AreaInfo, pages: &mut PageMap<'_>) {
        if self.ownership == Ownership::Owned && self.len > 0 {
            debug!("returning {:#x} bytes at {} to the pool", self.len, self.phys);
            pages
                .platform()
                .free(self.phys, self.len / PageGranularity::Size4K.bytes());
        }
    }
}
