//! # Page Faults
//!
//! The trap handler calls [`AddressSpace::handle_fault`]. The dispatcher finds
//! the area, checks the access against its protection and hands a
//! [`FaultContext`] to the area's handler. The handler only *provides* a frame;
//! installing the leaf is done here, so handlers never touch the page table
//! for a fault.
//!
//! A frame obtained through [`FaultContext::allocate_frame`] belongs to the
//! context until the leaf is committed. If the handler or the commit fails,
//! the frame goes back to the pool.

use crate::address_space::AddressSpace;
use crate::error::VmError;
use core::ops::Range;
use kernel_memory_addresses::{PageGranularity, PhysicalAddress, VirtualAddress};
use kernel_vmem::{Level, MapFlags, Platform, Protection};
use log::{error, trace};

/// The kind of access that faulted.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// Whether `protection` allows this access.
    #[must_use]
    pub const fn permitted_by(self, protection: Protection) -> bool {
        match self {
            Self::Read => protection.contains(Protection::READ),
            Self::Write => protection.contains(Protection::WRITE),
            Self::Execute => protection.contains(Protection::EXECUTE),
        }
    }
}

/// Why the fault was raised.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FaultCause {
    /// No translation exists.
    NotPresent,
    /// A translation exists but does not allow the access.
    Misconfigured,
    /// Raised by the manager itself, e.g. to populate or for a software access.
    Software,
}

/// Everything a handler needs to resolve one fault.
pub struct FaultContext<'p> {
    /// The faulting address.
    pub address: VirtualAddress,
    /// `address` rounded down to the area's page size.
    pub base: VirtualAddress,
    /// Bytes covered by the leaf that will be installed.
    pub length: u64,
    pub access: Access,
    pub cause: FaultCause,
    /// Level at which the leaf will be installed.
    pub level: Level,
    /// Protection of the leaf to install. Starts as the area's protection.
    pub protection: Protection,
    granularity: PageGranularity,
    phys: Option<PhysicalAddress>,
    shared: bool,
    allocated: Option<PhysicalAddress>,
    platform: &'p dyn Platform,
}

impl<'p> FaultContext<'p> {
    fn new(
        platform: &'p dyn Platform,
        address: VirtualAddress,
        granularity: PageGranularity,
        access: Access,
        cause: FaultCause,
        protection: Protection,
    ) -> Self {
        Self {
            address,
            base: address.align_down(granularity),
            length: granularity.bytes(),
            access,
            cause,
            level: Level::for_granularity(granularity),
            protection,
            granularity,
            phys: None,
            shared: false,
            allocated: None,
            platform,
        }
    }

    /// Page size of the fault.
    #[must_use]
    pub const fn granularity(&self) -> PageGranularity {
        self.granularity
    }

    /// Take a fresh frame run of [`granularity`](Self::granularity) from the pool.
    ///
    /// The contents are undefined until [`zero_frame`](Self::zero_frame) or
    /// [`write_frame`](Self::write_frame) is called. Calling this again
    /// returns the previous run to the pool.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the pool is exhausted.
    pub fn allocate_frame(&mut self) -> Result<PhysicalAddress, VmError> {
        let granularity = self.granularity();
        let frame = self
            .platform
            .allocate(granularity.frames(), granularity)
            .ok_or(VmError::OutOfMemory)?;
        if let Some(previous) = self.allocated.replace(frame) {
            self.platform.free(previous, granularity.frames());
        }
        Ok(frame)
    }

    /// Zero the frame run from [`allocate_frame`](Self::allocate_frame).
    pub fn zero_frame(&self) {
        if let Some(frame) = self.allocated {
            // SAFETY: the run is owned by this context and not yet mapped.
            unsafe { kernel_vmem::platform::zero_phys(self.platform, frame, self.length) };
        }
    }

    /// Copy `bytes` into the allocated frame run at `offset`.
    ///
    /// Bytes past the end of the run are dropped.
    pub fn write_frame(&self, offset: u64, bytes: &[u8]) {
        let Some(frame) = self.allocated else {
            return;
        };
        let room = self.length.saturating_sub(offset);
        let n = bytes.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        // SAFETY: the run is owned by this context and `offset + n` stays inside it.
        unsafe { kernel_vmem::platform::write_phys(self.platform, frame + offset, &bytes[..n]) };
    }

    /// Map the fault to `phys`. The pool reclaims it when the leaf goes away.
    pub const fn resolve(&mut self, phys: PhysicalAddress) {
        self.phys = Some(phys);
        self.shared = false;
    }

    /// Map the fault to `phys`, which the pool must never reclaim.
    pub const fn resolve_shared(&mut self, phys: PhysicalAddress) {
        self.phys = Some(phys);
        self.shared = true;
    }

    /// Release an allocated run that did not make it into the table, either
    /// because the fault failed or because the handler resolved elsewhere.
    fn abandon(&mut self) {
        if let Some(frame) = self.allocated.take() {
            self.platform.free(frame, self.granularity().frames());
        }
    }
}

impl AddressSpace<'_> {
    /// Resolve a fault at `address`.
    ///
    /// Returns `Ok` once a translation that allows `access` exists; the access
    /// can then be retried.
    ///
    /// # Errors
    /// - [`VmError::NoArea`] if no area contains `address`.
    /// - [`VmError::AccessViolation`] if the area's protection forbids `access`.
    /// - Any error of the area's handler or of the page table.
    pub fn handle_fault(
        &mut self,
        address: VirtualAddress,
        access: Access,
        cause: FaultCause,
    ) -> Result<(), VmError> {
        self.fault_in(address, access, cause)
            .inspect_err(|e| error!("unresolved {cause:?} fault at {address}: {e}"))
    }

    /// [`handle_fault`](Self::handle_fault) without the report.
    pub(crate) fn fault_in(
        &mut self,
        address: VirtualAddress,
        access: Access,
        cause: FaultCause,
    ) -> Result<(), VmError> {
        let index = self.area_index(address).ok_or(VmError::NoArea(address))?;
        if !access.permitted_by(self.areas[index].protection) {
            return Err(VmError::AccessViolation { address, access });
        }
        self.resolve(index, address, access, cause)
    }

    /// Make sure a leaf for `address` exists, asking the handler if not.
    fn resolve(
        &mut self,
        index: usize,
        address: VirtualAddress,
        access: Access,
        cause: FaultCause,
    ) -> Result<(), VmError> {
        let info = self.areas[index].info();
        let platform = self.pages.platform();
        let mut ctx = FaultContext::new(platform, address, info.page_size, access, cause, info.protection);

        if let Some(existing) = self.pages.translate(ctx.base) {
            if cause == FaultCause::Software || access.permitted_by(existing.protection()) {
                trace!("spurious fault at {address}");
                return Ok(());
            }
            // The leaf lags behind the area; bring it in line and keep the frame.
            self.pages.protect(existing.base, info.protection)?;
            return Ok(());
        }

        let handled = self.areas[index].ops.fault(&info, &mut ctx);
        let committed = handled.and_then(|()| self.commit(&ctx));
        if committed.is_err() || ctx.allocated != ctx.phys {
            ctx.abandon();
        }
        committed
    }

    fn commit(&mut self, ctx: &FaultContext<'_>) -> Result<(), VmError> {
        let phys = ctx.phys.ok_or(VmError::Unresolved(ctx.address))?;
        let mut flags = MapFlags::for_granularity(ctx.granularity());
        if ctx.shared {
            flags |= MapFlags::SHARED;
        }
        self.pages.map(ctx.base, Some(phys), ctx.protection, flags)?;
        self.pages.flush(ctx.base);
        trace!("resolved {:?} fault at {} with {phys}", ctx.access, ctx.address);
        Ok(())
    }

    /// Resolve every populatable page of `range` within the area at `index`.
    pub(crate) fn populate(&mut self, index: usize, range: Range<VirtualAddress>) -> Result<(), VmError> {
        let info = self.areas[index].info();
        let Some(fill) = self.areas[index].ops.populatable(&info) else {
            return Ok(());
        };
        let step = info.page_size.bytes();
        let mut va = range.start.max(fill.start).align_down(info.page_size);
        let end = range.end.min(fill.end);
        while va < end {
            self.resolve(index, va, Access::Read, FaultCause::Software)?;
            match va.checked_add(step) {
                Some(next) => va = next,
                None => break,
            }
        }
        Ok(())
    }
}
