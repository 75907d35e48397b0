//! # Area Kinds
//!
//! The built-in [`AreaOps`] implementations and the `map_*` shortcuts that
//! pair each of them with [`AddressSpace::map`].

mod anonymous;
mod file;
mod physical;
mod reservation;
mod stack;

pub use anonymous::Anonymous;
pub use file::{FileArea, FileSource};
pub use physical::{DirectPhysical, Ownership};
pub use reservation::Reservation;
pub use stack::Stack;

use crate::address_space::{AddressSpace, MapRequest};
use crate::error::VmError;
use alloc::boxed::Box;
use alloc::sync::Arc;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

impl AddressSpace<'_> {
    /// Demand-zero memory.
    ///
    /// # Errors
    /// As for [`map`](Self::map).
    pub fn map_anonymous(&mut self, request: MapRequest) -> Result<VirtualAddress, VmError> {
        self.map(request, Box::new(Anonymous))
    }

    /// A private copy of `source`, starting at byte `offset`.
    ///
    /// # Errors
    /// As for [`map`](Self::map).
    pub fn map_file(
        &mut self,
        request: MapRequest,
        source: Arc<dyn FileSource>,
        offset: u64,
    ) -> Result<VirtualAddress, VmError> {
        self.map(request, Box::new(FileArea::new(source, offset)))
    }

    /// A window onto the physical range starting at `phys`.
    ///
    /// # Errors
    /// As for [`map`](Self::map); [`VmError::Misaligned`] if `phys` does not
    /// fit the page size.
    pub fn map_physical(
        &mut self,
        request: MapRequest,
        phys: PhysicalAddress,
        ownership: Ownership,
    ) -> Result<VirtualAddress, VmError> {
        let ops = DirectPhysical::new(phys, request.length, ownership);
        self.map(request, Box::new(ops))
    }

    /// A stack whose lowest `guard` bytes are never backed.
    ///
    /// # Errors
    /// As for [`map`](Self::map); [`VmError::InvalidArgument`] if the guard
    /// is not page aligned or leaves no room for the stack.
    pub fn map_stack(&mut self, request: MapRequest, guard: u64) -> Result<VirtualAddress, VmError> {
        self.map(request, Box::new(Stack::new(guard)))
    }

    /// Address space without content.
    ///
    /// # Errors
    /// As for [`map`](Self::map).
    pub fn reserve(&mut self, request: MapRequest) -> Result<VirtualAddress, VmError> {
        self.map(request, Box::new(Reservation))
    }
}
