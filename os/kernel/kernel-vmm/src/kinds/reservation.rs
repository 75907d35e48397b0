//! # Reservations

use crate::area::{AreaInfo, AreaKind};
use crate::error::VmError;
use crate::fault::FaultContext;
use crate::ops::AreaOps;
use alloc::boxed::Box;
use core::ops::Range;
use kernel_memory_addresses::VirtualAddress;

/// Claims address space and nothing else. Every access faults.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Reservation;

impl AreaOps for Reservation {
    fn kind(&self) -> AreaKind {
        AreaKind::Reservation
    }

    fn fault(&mut self, _area: &AreaInfo, fault: &mut FaultContext<'_>) -> Result<(), VmError> {
        Err(VmError::Unresolved(fault.address))
    }

    fn split(&mut self, _area: &AreaInfo, _at: VirtualAddress) -> Result<Box<dyn AreaOps>, VmError> {
        Ok(Box::new(Self))
    }

    fn populatable(&self, _area: &AreaInfo) -> Option<Range<VirtualAddress>> {
        None
    }
}
