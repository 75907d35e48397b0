use crate::{MemoryAddress, PageGranularity, PageSize, PhysicalPage};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Physical memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **physical** addresses
/// (host RAM / MMIO). Like [`VirtualAddress`](super::VirtualAddress), this type carries intent and
/// prevents accidental VA/PA mix-ups.
///
/// ### Notes
/// - Page-table entries store a **page-aligned** physical base; use
///   [`page`](Self::page) and [`offset`](Self::offset) to reason about base vs.
///   offset explicitly.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(pub(crate) MemoryAddress);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::<S>::from_addr(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0.offset::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, granularity: PageGranularity) -> Self {
        Self(self.0.align_down(granularity))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, granularity: PageGranularity) -> bool {
        self.0.is_aligned(granularity)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage<S>) -> Self {
        value.base()
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
