//! # Page Table Errors

use kernel_memory_addresses::{PageGranularity, VirtualAddress};

/// Failure of a page table operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PageMapError {
    #[error("address 0x{address:016X} is not aligned to {granularity}")]
    Misaligned {
        address: u64,
        granularity: PageGranularity,
    },
    #[error("LARGE and HUGE are mutually exclusive")]
    ConflictingFlags,
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} pages are not supported by this machine")]
    Unsupported(PageGranularity),
    #[error("frame pool exhausted")]
    OutOfFrames,
    #[error("no frame available for a page-table node")]
    OutOfNodes,
}

impl PageMapError {
    pub(crate) const fn misaligned(address: u64, granularity: PageGranularity) -> Self {
        Self::Misaligned {
            address,
            granularity,
        }
    }
}
