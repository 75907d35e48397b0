//! # Errors
//!
//! [`VmError`] and its mapping to negative status codes.

use crate::fault::Access;
use kernel_memory_addresses::{PageGranularity, VirtualAddress};
use kernel_vmem::PageMapError;

const EPERM: i32 = 1;
const ENXIO: i32 = 6;
const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EFAULT: i32 = 14;
const EEXIST: i32 = 17;
const EINVAL: i32 = 22;
const ENOTSUP: i32 = 95;

/// Failure of an address space operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("address or length is not aligned to {0}")]
    Misaligned(PageGranularity),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("range collides with an existing area")]
    Collision,
    #[error("range is not covered by areas")]
    NotCovered,
    #[error("no free range large enough")]
    NoSpace,
    #[error("out of memory")]
    OutOfMemory,
    #[error("the area type does not permit this operation")]
    NotPermitted,
    #[error("{0} pages are not supported")]
    Unsupported(PageGranularity),
    #[error("no area contains {0}")]
    NoArea(VirtualAddress),
    #[error("{access:?} access to {address} is not permitted")]
    AccessViolation {
        address: VirtualAddress,
        access: Access,
    },
    #[error("guard page hit at {0}")]
    GuardPage(VirtualAddress),
    #[error("fault at {0} was not resolved")]
    Unresolved(VirtualAddress),
    #[error("backing store read failed")]
    Backing,
}

impl VmError {
    /// Negative error code for callers that speak `0 or -errno`.
    #[must_use]
    pub const fn errno(self) -> i32 {
        -match self {
            Self::Misaligned(_) | Self::InvalidArgument => EINVAL,
            Self::Collision => EEXIST,
            Self::NotCovered => ENXIO,
            Self::NoSpace | Self::OutOfMemory => ENOMEM,
            Self::NotPermitted => EPERM,
            Self::Unsupported(_) => ENOTSUP,
            Self::NoArea(_)
            | Self::AccessViolation { .. }
            | Self::GuardPage(_)
            | Self::Unresolved(_) => EFAULT,
            Self::Backing => EIO,
        }
    }
}

/// `0` on success, the negative [`errno`](VmError::errno) otherwise.
#[must_use]
pub const fn status<T>(result: &Result<T, VmError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.errno(),
    }
}

impl From<PageMapError> for VmError {
    fn from(value: PageMapError) -> Self {
        match value {
            PageMapError::Misaligned { granularity, .. } => Self::Misaligned(granularity),
            PageMapError::ConflictingFlags => Self::InvalidArgument,
            PageMapError::AlreadyMapped(_) => Self::Collision,
            PageMapError::NotMapped(_) => Self::NotCovered,
            PageMapError::Unsupported(granularity) => Self::Unsupported(granularity),
            PageMapError::OutOfFrames | PageMapError::OutOfNodes => Self::OutOfMemory,
        }
    }
}
