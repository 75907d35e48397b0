//! Software access to the memory of an address space that need not be active.
//!
//! Used for copying arguments in and out of user space and by tests. Pages
//! are faulted in on demand, exactly as a CPU access would.

use super::AddressSpace;
use crate::fault::{Access, FaultCause};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::Platform;
use kernel_vmem::platform::{read_phys, write_phys};

impl AddressSpace<'_> {
    /// Copy memory at `va` into `buf`.
    ///
    /// Returns the number of bytes copied, which is short if the range runs
    /// into memory that cannot be read.
    pub fn read(&mut self, va: VirtualAddress, buf: &mut [u8]) -> usize {
        self.transfer(va, buf.len(), Access::Read, |platform, pa, at, n| {
            // SAFETY: `pa` is the target of a readable leaf.
            unsafe { read_phys(platform, pa, &mut buf[at..at + n]) };
        })
    }

    /// Copy `bytes` to memory at `va`.
    ///
    /// Returns the number of bytes copied, which is short if the range runs
    /// into memory that cannot be written.
    pub fn write(&mut self, va: VirtualAddress, bytes: &[u8]) -> usize {
        self.transfer(va, bytes.len(), Access::Write, |platform, pa, at, n| {
            // SAFETY: `pa` is the target of a writable leaf of this space.
            unsafe { write_phys(platform, pa, &bytes[at..at + n]) };
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn transfer(
        &mut self,
        va: VirtualAddress,
        len: usize,
        access: Access,
        mut copy: impl FnMut(&dyn Platform, PhysicalAddress, usize, usize),
    ) -> usize {
        let mut done = 0usize;
        while done < len {
            let Some(at) = va.checked_add(done as u64) else {
                break;
            };
            let Some(pa) = self.accessible(at, access) else {
                break;
            };
            let room = (Size4K::SIZE - at.offset::<Size4K>()) as usize;
            let n = room.min(len - done);
            copy(self.pages.platform(), pa, done, n);
            done += n;
        }
        done
    }

    /// The physical address behind `va` once `access` is allowed there.
    fn accessible(&mut self, va: VirtualAddress, access: Access) -> Option<PhysicalAddress> {
        let cause = match self.pages.translate(va) {
            Some(t) if access.permitted_by(t.protection()) => return Some(t.phys),
            Some(_) => FaultCause::Misconfigured,
            None => FaultCause::NotPresent,
        };
        self.fault_in(va, access, cause).ok()?;
        self.pages
            .translate(va)
            .filter(|t| access.permitted_by(t.protection()))
            .map(|t| t.phys)
    }
}
