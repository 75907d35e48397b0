//! # Stacks
//!
//! Anonymous memory with a guard region at its low end.

use super::Anonymous;
use crate::area::{AreaInfo, AreaKind};
use crate::error::VmError;
use crate::fault::FaultContext;
use crate::ops::{AreaOps, Capabilities, Proposal};
use core::ops::Range;
use kernel_memory_addresses::VirtualAddress;

/// A downward-growing stack: anonymous memory with an unbacked guard region
/// at its low end.
///
/// Stacks are atomic. They cannot be split or merged, so any range operation
/// that would cut one fails with [`VmError::NotPermitted`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Stack {
    guard: u64,
}

impl Stack {
    #[must_use]
    pub const fn new(guard: u64) -> Self {
        Self { guard }
    }

    #[must_use]
    pub const fn guard(&self) -> u64 {
        self.guard
    }

    fn guard_end(&self, area: &AreaInfo) -> VirtualAddress {
        area.start + self.guard
    }
}

impl AreaOps for Stack {
    fn kind(&self) -> AreaKind {
        AreaKind::Stack
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn allocate(&mut self, proposal: &mut Proposal) -> Result<(), VmError> {
        if !proposal.page_size.is_aligned(self.guard) || self.guard >= proposal.length {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }

    fn fault(&mut self, area: &AreaInfo, fault: &mut FaultContext<'_>) -> Result<(), VmError> {
        if fault.address < self.guard_end(area) {
            return Err(VmError::GuardPage(fault.address));
        }
        Anonymous::fill(area, fault)
    }

    fn populatable(&self, area: &AreaInfo) -> Option<Range<VirtualAddress>> {
        Some(self.guard_end(area)..area.end)
    }
}
