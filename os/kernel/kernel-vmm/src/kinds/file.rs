//! # File-Backed Areas
//!
//! A [`FileArea`] copies pages of a [`FileSource`] into fresh frames on first
//! touch.

use crate::area::{AreaInfo, AreaKind};
use crate::error::VmError;
use crate::fault::FaultContext;
use crate::ops::{AreaOps, Proposal};
use alloc::boxed::Box;
use alloc::sync::Arc;
use kernel_memory_addresses::VirtualAddress;

const CHUNK: usize = 4096;

/// Read access to the contents of a file.
pub trait FileSource {
    /// Size of the file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns the number read,
    /// which is zero at end of file.
    ///
    /// # Errors
    /// Any failure of the backing store.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmError>;
}

/// A private copy of a file. Pages are read in on first touch; bytes past the
/// end of the file read as zero.
#[derive(Clone)]
pub struct FileArea {
    source: Arc<dyn FileSource>,
    offset: u64,
}

impl FileArea {
    #[must_use]
    pub fn new(source: Arc<dyn FileSource>, offset: u64) -> Self {
        Self { source, offset }
    }

    /// File offset of the first byte of the area.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl core::fmt::Debug for FileArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileArea")
            .field("offset", &self.offset)
            .field("len", &self.source.len())
            .finish_non_exhaustive()
    }
}

impl AreaOps for FileArea {
    fn kind(&self) -> AreaKind {
        AreaKind::File
    }

    fn allocate(&mut self, proposal: &mut Proposal) -> Result<(), VmError> {
        // Every file offset the area can reach must be representable.
        self.offset
            .checked_add(proposal.length)
            .map(|_| ())
            .ok_or(VmError::InvalidArgument)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn fault(&mut self, area: &AreaInfo, fault: &mut FaultContext<'_>) -> Result<(), VmError> {
        let frame = fault.allocate_frame()?;
        fault.zero_frame();

        let start = self.offset + area.offset_of(fault.base);
        let size = self.source.len();
        let mut buf = [0u8; CHUNK];
        let mut done = 0u64;
        while done < fault.length && start + done < size {
            let want = (size - start - done).min(fault.length - done).min(CHUNK as u64) as usize;
            let read = self
                .source
                .read_at(start + done, &mut buf[..want])
                .map_err(|_| VmError::Backing)?;
            if read == 0 {
                break;
            }
            fault.write_frame(done, &buf[..read]);
            done += read as u64;
        }

        fault.resolve(frame);
        Ok(())
    }

    fn split(&mut self, area: &AreaInfo, at: VirtualAddress) -> Result<Box<dyn AreaOps>, VmError> {
        Ok(Box::new(Self {
            source: Arc::clone(&self.source),
            offset: self.offset + area.offset_of(at),
        }))
    }

    fn merge(&mut self, left: &AreaInfo, _right: &AreaInfo, right_ops: &dyn AreaOps) -> bool {
        right_ops.downcast_ref::<Self>().is_some_and(|right| {
            Arc::ptr_eq(&self.source, &right.source) && self.offset + left.len() == right.offset
        })
    }
}
