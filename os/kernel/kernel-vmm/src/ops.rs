//! # Area Operations
//!
//! Every area type implements [`AreaOps`]. The manager calls these hooks and
//! never looks inside the handler; the handler never sees the area list.
//!
//! Optional behavior is expressed through defaults. Two of them encode a
//! refusal rather than a no-op:
//!
//! - [`AreaOps::split`] fails with [`VmError::NotPermitted`] unless overridden.
//!   A handler that cannot be split also leaves [`Capabilities::SPLIT`] out of
//!   [`AreaOps::capabilities`], so the manager rejects partial changes before
//!   touching anything.
//! - [`AreaOps::fault`] has no default; each type decides how to fill a page.

use crate::area::{AreaFlags, AreaInfo, AreaKind};
use crate::error::VmError;
use crate::fault::FaultContext;
use alloc::boxed::Box;
use core::any::Any;
use core::ops::Range;
use kernel_memory_addresses::{PageGranularity, VirtualAddress};
use kernel_vmem::{PageMap, Protection};

bitflags::bitflags! {
    /// Structural changes an area type accepts.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct Capabilities: u8 {
        /// May be cut into pieces, including prefix/suffix removal.
        const SPLIT = 1 << 0;
        /// May absorb a compatible neighbor.
        const MERGE = 1 << 1;
    }
}

/// Hint passed to [`AreaOps::advise`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Advice {
    Normal,
    /// The range will be used soon; populate it.
    WillNeed,
    /// Drop the physical backing now; the next access faults it back in.
    DontNeed,
}

/// What the manager still has to do after [`AreaOps::advise`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AdviceOutcome {
    Applied,
    /// Resolve every populatable page of the range through the fault path.
    Populate,
}

/// A new area as it will be inserted, offered to [`AreaOps::allocate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Proposal {
    /// Chosen start. A handler may move it; the manager re-checks the range.
    pub base: VirtualAddress,
    pub length: u64,
    pub protection: Protection,
    /// Handlers may add flags, e.g. [`AreaFlags::PHYSICAL`].
    pub flags: AreaFlags,
    pub page_size: PageGranularity,
    /// The caller asked for exactly `base`.
    pub fixed: bool,
}

/// Type-specific behavior of an area.
pub trait AreaOps: Any {
    fn kind(&self) -> AreaKind;

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    /// Where anywhere-placed areas of this type should start searching.
    fn preferred_base(&self) -> Option<VirtualAddress> {
        None
    }

    /// Accept, adjust or veto a new area before it is inserted.
    ///
    /// # Errors
    /// Any error aborts the map call with nothing changed.
    fn allocate(&mut self, _proposal: &mut Proposal) -> Result<(), VmError> {
        Ok(())
    }

    /// Provide the physical page for the fault described by `fault`.
    ///
    /// # Errors
    /// The fault is fatal to the faulting context.
    fn fault(&mut self, area: &AreaInfo, fault: &mut FaultContext<'_>) -> Result<(), VmError>;

    /// Remove the translations of `range`, a part of `area`.
    ///
    /// # Errors
    /// Propagates page table failures.
    fn unmap_range(
        &mut self,
        _area: &AreaInfo,
        range: Range<VirtualAddress>,
        pages: &mut PageMap<'_>,
    ) -> Result<(), VmError> {
        pages.unmap_range(range)?;
        Ok(())
    }

    /// Cut the area at `at`. `self` keeps `[start, at)` and the returned
    /// handler takes `[at, end)`.
    ///
    /// # Errors
    /// [`VmError::NotPermitted`] unless the type supports splitting.
    fn split(&mut self, _area: &AreaInfo, _at: VirtualAddress) -> Result<Box<dyn AreaOps>, VmError> {
        Err(VmError::NotPermitted)
    }

    /// Approve absorbing the adjacent area `right`, whose handler is `right_ops`.
    ///
    /// On `true` the manager extends `left` and drops `right_ops` without
    /// calling [`destroy`](Self::destroy); `self` takes over whatever the
    /// right handler owned.
    fn merge(&mut self, _left: &AreaInfo, _right: &AreaInfo, _right_ops: &dyn AreaOps) -> bool {
        true
    }

    /// Apply `protection` to the translations of `range`.
    ///
    /// # Errors
    /// Propagates page table failures.
    fn set_protection(
        &mut self,
        _area: &AreaInfo,
        range: Range<VirtualAddress>,
        protection: Protection,
        pages: &mut PageMap<'_>,
    ) -> Result<(), VmError> {
        pages.protect_range(range, protection)?;
        Ok(())
    }

    /// React to `advice` for `range`.
    ///
    /// # Errors
    /// Propagates page table failures.
    fn advise(
        &mut self,
        _area: &AreaInfo,
        range: Range<VirtualAddress>,
        advice: Advice,
        pages: &mut PageMap<'_>,
    ) -> Result<AdviceOutcome, VmError> {
        match advice {
            Advice::Normal => Ok(AdviceOutcome::Applied),
            Advice::WillNeed => Ok(AdviceOutcome::Populate),
            Advice::DontNeed => {
                pages.unmap_range(range)?;
                Ok(AdviceOutcome::Applied)
            }
        }
    }

    /// The part of `area` that eager population may fill, if any.
    fn populatable(&self, area: &AreaInfo) -> Option<Range<VirtualAddress>> {
        Some(area.range())
    }

    /// Release type-specific resources. Translations are already gone.
    fn destroy(&mut self, _area: &AreaInfo, _pages: &mut PageMap<'_>) {}
}

impl dyn AreaOps {
    #[inline]
    #[must_use]
    pub fn as_any(&self) -> &dyn Any {
        self
    }

    #[inline]
    #[must_use]
    pub fn downcast_ref<T: AreaOps>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}
