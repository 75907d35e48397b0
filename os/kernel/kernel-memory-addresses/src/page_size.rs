use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
    /// The runtime equivalent of this marker.
    const GRANULARITY: PageGranularity;
}

/// 4 KiB page (4096 bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;
    const GRANULARITY: PageGranularity = PageGranularity::Size4K;
}

/// 2 MiB page (`2_097_152` bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;
impl sealed::Sealed for Size2M {}
impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;
    const GRANULARITY: PageGranularity = PageGranularity::Size2M;
}

/// 1 GiB page (`1_073_741_824` bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size1G;
impl sealed::Sealed for Size1G {}
impl PageSize for Size1G {
    const SIZE: u64 = 1024 * 1024 * 1024;
    const SHIFT: u32 = 30;
    const GRANULARITY: PageGranularity = PageGranularity::Size1G;
}

macro_rules! display_marker {
    ($($ty:ident => $s:literal),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    f.write_str($s)
                }
            }

            impl fmt::Debug for $ty {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    fmt::Display::fmt(&self, f)
                }
            }
        )*
    };
}

display_marker!(Size4K => "4K", Size2M => "2M", Size1G => "1G");

/// Page size chosen at runtime.
///
/// Virtual memory areas pick their page size when they are created, so the
/// mapping code cannot always name a [`PageSize`] marker at compile time.
/// Ordering follows the size: `Size4K < Size2M < Size1G`.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageGranularity {
    /// Regular 4 KiB page.
    #[default]
    Size4K,
    /// 2 MiB large page.
    Size2M,
    /// 1 GiB huge page.
    Size1G,
}

impl PageGranularity {
    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => Size4K::SIZE,
            Self::Size2M => Size2M::SIZE,
            Self::Size1G => Size1G::SIZE,
        }
    }

    /// log2 of [`bytes`](Self::bytes).
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => Size4K::SHIFT,
            Self::Size2M => Size2M::SHIFT,
            Self::Size1G => Size1G::SHIFT,
        }
    }

    /// Number of 4 KiB frames one page of this size spans.
    #[inline]
    #[must_use]
    pub const fn frames(self) -> u64 {
        self.bytes() / Size4K::SIZE
    }

    /// Returns `true` if `value` is a multiple of this page size.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, value: u64) -> bool {
        value & (self.bytes() - 1) == 0
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size4K => "4K",
            Self::Size2M => "2M",
            Self::Size1G => "1G",
        }
    }
}

impl fmt::Display for PageGranularity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PageGranularity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}
