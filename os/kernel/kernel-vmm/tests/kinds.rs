mod common;

use common::{PAGE, dirty, machine, relative};
use kernel_memory_addresses::PageGranularity;
use kernel_vmem::{FramePool, Protection};
use kernel_vmm::kinds::{DirectPhysical, FileArea, FileSource, Ownership, Stack};
use kernel_vmm::{
    Access, AddressSpace, Advice, AreaFlags, AreaKind, FaultCause, MapFlags, MapRequest,
    RangeFlags, VmError,
};
use std::sync::Arc;

const RW: Protection = Protection::READ_WRITE;

struct Bytes(Vec<u8>);

impl FileSource for Bytes {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmError> {
        let data = self.0.get(offset as usize..).unwrap_or_default();
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

struct Broken;

impl FileSource for Broken {
    fn len(&self) -> u64 {
        PAGE
    }

    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, VmError> {
        Err(VmError::InvalidArgument)
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn file_pages_come_from_the_source() {
    let m = machine();
    dirty(&m, 64);
    let data = pattern(0x2800);
    let source: Arc<dyn FileSource> = Arc::new(Bytes(data.clone()));
    let mut space = AddressSpace::new(&m).unwrap();
    let va = space
        .map_file(MapRequest::anywhere(3 * PAGE, RW), source, 0x800)
        .unwrap();

    let mut buf = vec![0xFFu8; (3 * PAGE) as usize];
    assert_eq!(space.read(va, &mut buf), buf.len());
    assert_eq!(&buf[..0x2000], &data[0x800..]);
    assert!(buf[0x2000..].iter().all(|&b| b == 0));

    assert_eq!(space.write(va, b"changed"), 7);
    let mut head = [0u8; 7];
    assert_eq!(space.read(va, &mut head), 7);
    assert_eq!(&head, b"changed");
}

#[test]
fn file_pieces_keep_their_offsets() {
    let m = machine();
    let data = pattern(0x4000);
    let source: Arc<dyn FileSource> = Arc::new(Bytes(data.clone()));
    let mut space = AddressSpace::new(&m).unwrap();
    let va = space
        .map_file(MapRequest::anywhere(4 * PAGE, RW), Arc::clone(&source), 0)
        .unwrap();

    space.unmap(va + PAGE, PAGE, RangeFlags::STRICT).unwrap();
    assert_eq!(relative(&space, va), [(0, PAGE), (2 * PAGE, 4 * PAGE)]);
    let right = space.find(va + 2 * PAGE).unwrap();
    assert_eq!(right.ops().downcast_ref::<FileArea>().unwrap().offset(), 2 * PAGE);

    let mut buf = vec![0u8; PAGE as usize];
    assert_eq!(space.read(va + 3 * PAGE, &mut buf), buf.len());
    assert_eq!(&buf[..], &data[0x3000..0x4000]);

    // Putting the hole back with the matching offset merges everything.
    space
        .map_file(MapRequest::at(va + PAGE, PAGE, RW), Arc::clone(&source), PAGE)
        .unwrap();
    assert_eq!(relative(&space, va), [(0, 4 * PAGE)]);

    // A different offset or another source does not.
    let other: Arc<dyn FileSource> = Arc::new(Bytes(data));
    space
        .map_file(MapRequest::at(va + 4 * PAGE, PAGE, RW), Arc::clone(&source), 0)
        .unwrap();
    space
        .map_file(MapRequest::at(va + 5 * PAGE, PAGE, RW), other, 5 * PAGE)
        .unwrap();
    assert_eq!(
        relative(&space, va),
        [(0, 4 * PAGE), (4 * PAGE, 5 * PAGE), (5 * PAGE, 6 * PAGE)]
    );
}

#[test]
fn file_read_errors_fail_the_fault() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let va = space
        .map_file(MapRequest::anywhere(PAGE, RW), Arc::new(Broken), 0)
        .unwrap();
    let frames = m.allocated_frames();

    let result = space.handle_fault(va, Access::Read, FaultCause::NotPresent);
    assert_eq!(result, Err(VmError::Backing));
    assert_eq!(result.unwrap_err().errno(), -5);
    assert_eq!(m.allocated_frames(), frames);
}

#[test]
fn uninitialized_anonymous_memory_is_not_cleared() {
    let m = machine();
    dirty(&m, 64);
    let mut space = AddressSpace::new(&m).unwrap();
    let request = MapRequest::anywhere(PAGE, RW).with_flags(MapFlags::UNINITIALIZED);
    let va = space.map_anonymous(request).unwrap();
    assert!(space.find(va).unwrap().flags().contains(AreaFlags::UNINITIALIZED));

    let mut buf = [0u8; 16];
    assert_eq!(space.read(va, &mut buf), 16);
    assert_eq!(buf, [0xAA; 16]);
}

#[test]
fn physical_areas_never_free_borrowed_frames() {
    let m = machine();
    let phys = m.allocate(2, PageGranularity::Size4K).unwrap();
    let mut space = AddressSpace::new(&m).unwrap();

    let va = space
        .map_physical(MapRequest::anywhere(2 * PAGE, RW), phys, Ownership::Borrowed)
        .unwrap();
    let area = space.find(va).unwrap();
    assert_eq!(area.kind(), AreaKind::Physical);
    assert!(area.flags().contains(AreaFlags::PHYSICAL));
    assert_eq!(area.ops().downcast_ref::<DirectPhysical>().unwrap().phys(), phys);

    assert_eq!(space.write(va + PAGE, b"dma"), 3);
    space.advise(va, 2 * PAGE, Advice::DontNeed, RangeFlags::STRICT).unwrap();
    assert!(space.page_map().translate(va + PAGE).is_none());
    let mut buf = [0u8; 3];
    assert_eq!(space.read(va + PAGE, &mut buf), 3);
    assert_eq!(&buf, b"dma");

    space.unmap(va, 2 * PAGE, RangeFlags::STRICT).unwrap();
    assert!(m.is_allocated(phys) && m.is_allocated(phys + PAGE));

    let misaligned = space.map_physical(
        MapRequest::anywhere(0x20_0000, RW).with_flags(MapFlags::LARGE),
        phys + PAGE,
        Ownership::Borrowed,
    );
    assert_eq!(misaligned, Err(VmError::Misaligned(PageGranularity::Size2M)));
    assert!(space.areas().is_empty());
}

#[test]
fn windows_past_the_end_of_memory_are_refused() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let top = kernel_memory_addresses::PhysicalAddress::new(u64::MAX - PAGE + 1);
    assert_eq!(
        space.map_physical(MapRequest::anywhere(2 * PAGE, RW), top, Ownership::Borrowed),
        Err(VmError::InvalidArgument)
    );

    let source: Arc<dyn FileSource> = Arc::new(Bytes(pattern(0x100)));
    assert_eq!(
        space.map_file(MapRequest::anywhere(2 * PAGE, RW), source, u64::MAX - PAGE),
        Err(VmError::InvalidArgument)
    );
    assert!(space.areas().is_empty());
}

#[test]
fn owned_physical_pieces_are_freed_as_they_go() {
    let m = machine();
    let phys = m.allocate(3, PageGranularity::Size4K).unwrap();
    let mut space = AddressSpace::new(&m).unwrap();
    let va = space
        .map_physical(MapRequest::anywhere(3 * PAGE, RW), phys, Ownership::Owned)
        .unwrap();

    space.unmap(va + PAGE, PAGE, RangeFlags::STRICT).unwrap();
    assert!(!m.is_allocated(phys + PAGE));
    assert!(m.is_allocated(phys) && m.is_allocated(phys + 2 * PAGE));

    let right = space.find(va + 2 * PAGE).unwrap();
    assert_eq!(
        right.ops().downcast_ref::<DirectPhysical>().unwrap().phys(),
        phys + 2 * PAGE
    );

    drop(space);
    assert_eq!(m.allocated_frames(), 0);
}

#[test]
fn stacks_populate_above_their_guard_only() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let request = MapRequest::anywhere(4 * PAGE, RW).with_flags(MapFlags::POPULATE);
    let va = space.map_stack(request, 2 * PAGE).unwrap();

    assert!(space.page_map().translate(va).is_none());
    assert!(space.page_map().translate(va + PAGE).is_none());
    assert!(space.page_map().translate(va + 2 * PAGE).is_some());
    assert!(space.page_map().translate(va + 3 * PAGE).is_some());
    let stack = space.find(va).unwrap().ops().downcast_ref::<Stack>().unwrap();
    assert_eq!(stack.guard(), 2 * PAGE);

    // Adjacent stacks stay separate.
    space
        .map_stack(MapRequest::at(va + 4 * PAGE, 4 * PAGE, RW), 2 * PAGE)
        .unwrap();
    assert_eq!(relative(&space, va), [(0, 4 * PAGE), (4 * PAGE, 8 * PAGE)]);

    assert_eq!(
        space.map_stack(MapRequest::anywhere(2 * PAGE, RW), 2 * PAGE),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        space.map_stack(MapRequest::anywhere(2 * PAGE, RW), 0x800),
        Err(VmError::InvalidArgument)
    );
}

#[test]
fn advice_drops_and_prefetches_anonymous_pages() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let va = space
        .map_anonymous(MapRequest::anywhere(4 * PAGE, RW))
        .unwrap();

    space.advise(va, 4 * PAGE, Advice::WillNeed, RangeFlags::STRICT).unwrap();
    for page in 0..4 {
        assert!(space.page_map().translate(va + page * PAGE).is_some());
    }
    assert_eq!(space.write(va + PAGE, b"gone"), 4);

    let frames = m.allocated_frames();
    space.advise(va + PAGE, PAGE, Advice::DontNeed, RangeFlags::empty()).unwrap();
    assert_eq!(m.allocated_frames(), frames - 1);
    assert_eq!(space.areas().len(), 1);

    let mut buf = [0xFFu8; 4];
    assert_eq!(space.read(va + PAGE, &mut buf), 4);
    assert_eq!(buf, [0; 4]);

    space.advise(va, 4 * PAGE, Advice::Normal, RangeFlags::empty()).unwrap();
    assert_eq!(
        space.advise(va, 8 * PAGE, Advice::WillNeed, RangeFlags::STRICT),
        Err(VmError::NotCovered)
    );
}

#[test]
fn advice_respects_large_pages_and_reservations() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let large = space
        .map_anonymous(MapRequest::anywhere(0x20_0000, RW).with_flags(MapFlags::LARGE))
        .unwrap();
    assert_eq!(
        space.advise(large, PAGE, Advice::WillNeed, RangeFlags::empty()),
        Err(VmError::Misaligned(PageGranularity::Size2M))
    );
    space
        .advise(large, 0x20_0000, Advice::WillNeed, RangeFlags::empty())
        .unwrap();
    assert_eq!(
        space.page_map().translate(large).unwrap().granularity,
        PageGranularity::Size2M
    );

    let reserved = space.reserve(MapRequest::anywhere(PAGE, RW)).unwrap();
    space
        .advise(reserved, PAGE, Advice::WillNeed, RangeFlags::STRICT)
        .unwrap();
    assert!(space.page_map().translate(reserved).is_none());
}
