//! # Anonymous Areas
//!
//! Private memory from the frame pool, zero-filled on demand.

use crate::area::{AreaFlags, AreaInfo, AreaKind};
use crate::error::VmError;
use crate::fault::FaultContext;
use crate::ops::AreaOps;
use alloc::boxed::Box;
use kernel_memory_addresses::VirtualAddress;

/// Memory backed by fresh frames from the pool, zeroed on first touch unless
/// the area is [`UNINITIALIZED`](AreaFlags::UNINITIALIZED).
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Anonymous;

impl Anonymous {
    /// Back the faulting page with a fresh frame run.
    pub(crate) fn fill(area: &AreaInfo, fault: &mut FaultContext<'_>) -> Result<(), VmError> {
        let frame = fault.allocate_frame()?;
        if !area.flags.contains(AreaFlags::UNINITIALIZED) {
            fault.zero_frame();
        }
        fault.resolve(frame);
        Ok(())
    }
}

impl AreaOps for Anonymous {
    fn kind(&self) -> AreaKind {
        AreaKind::Anonymous
    }

    fn fault(&mut self, area: &AreaInfo, fault: &mut FaultContext<'_>) -> Result<(), VmError> {
        Self::fill(area, fault)
    }

    fn split(&mut self, _area: &AreaInfo, _at: VirtualAddress) -> Result<Box<dyn AreaOps>, VmError> {
        Ok(Box::new(Self))
    }
}
