use super::*;
use crate::area::{AreaInfo, AreaKind};
use crate::fault::FaultContext;
use crate::kinds::{Anonymous, Reservation};
use kernel_vmem::sim::SimMachine;
use std::cell::Cell;
use std::rc::Rc;

const RW: Protection = Protection::READ_WRITE;
const PAGE: u64 = 0x1000;

fn machine() -> SimMachine {
    SimMachine::new(1024)
}

fn small() -> SpaceConfig {
    SpaceConfig {
        base: VirtualAddress::new(0x1_0000),
        limit: VirtualAddress::new(0x2_0000),
        search_start: VirtualAddress::new(0x1_8000),
    }
}

fn ranges(space: &AddressSpace<'_>) -> Vec<(u64, u64)> {
    space
        .areas()
        .iter()
        .map(|a| (a.start().as_u64(), a.end().as_u64()))
        .collect()
}

/// Records what the manager asks of it.
struct Probe {
    destroyed: Rc<Cell<u32>>,
    veto: bool,
    relocate: Option<VirtualAddress>,
}

impl Probe {
    fn new(destroyed: &Rc<Cell<u32>>) -> Self {
        Self {
            destroyed: Rc::clone(destroyed),
            veto: false,
            relocate: None,
        }
    }
}

impl AreaOps for Probe {
    fn kind(&self) -> AreaKind {
        AreaKind::Anonymous
    }

    fn allocate(&mut self, proposal: &mut Proposal) -> Result<(), VmError> {
        if self.veto {
            return Err(VmError::NotPermitted);
        }
        if let Some(base) = self.relocate {
            proposal.base = base;
        }
        Ok(())
    }

    fn fault(&mut self, _area: &AreaInfo, fault: &mut FaultContext<'_>) -> Result<(), VmError> {
        Err(VmError::Unresolved(fault.address))
    }

    fn destroy(&mut self, _area: &AreaInfo, _pages: &mut PageMap<'_>) {
        self.destroyed.set(self.destroyed.get() + 1);
    }
}

#[test]
fn config_is_validated() {
    assert!(SpaceConfig::default().validate().is_ok());

    let inverted = SpaceConfig {
        base: small().limit,
        limit: small().base,
        ..small()
    };
    assert_eq!(inverted.validate(), Err(VmError::InvalidArgument));

    let unaligned = SpaceConfig {
        base: VirtualAddress::new(0x1_0800),
        ..small()
    };
    assert_eq!(
        unaligned.validate(),
        Err(VmError::Misaligned(PageGranularity::Size4K))
    );

    let m = machine();
    assert!(AddressSpace::with_config(&m, inverted, NodeCacheConfig::default()).is_err());
}

#[test]
fn anywhere_starts_at_search_start_and_merges() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let search = space.config().search_start;

    let a = space.reserve(MapRequest::anywhere(0x3000, RW)).unwrap();
    let b = space.reserve(MapRequest::anywhere(0x2000, RW)).unwrap();
    assert_eq!(a, search);
    assert_eq!(b, search + 0x3000);
    assert_eq!(ranges(&space), [(search.as_u64(), search.as_u64() + 0x5000)]);

    let area = space.find(b + 0x1FFF).unwrap();
    assert_eq!(area.kind(), AreaKind::Reservation);
    assert!(space.find(b + 0x2000).is_none());
}

#[test]
fn gap_search_skips_small_gaps() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let search = space.config().search_start;

    space
        .reserve(MapRequest::at(search + PAGE, PAGE, RW))
        .unwrap();
    let va = space.reserve(MapRequest::anywhere(2 * PAGE, RW)).unwrap();
    assert_eq!(va, search + 2 * PAGE);
    assert!(space.is_ordered());
}

#[test]
fn gap_search_wraps_once() {
    let m = machine();
    let mut space = AddressSpace::with_config(&m, small(), NodeCacheConfig::default()).unwrap();

    space
        .reserve(MapRequest::at(VirtualAddress::new(0x1_8000), 0x8000, RW).with_flags(MapFlags::NO_MERGE))
        .unwrap();
    let wrapped = space.reserve(MapRequest::anywhere(0x4000, RW)).unwrap();
    assert_eq!(wrapped, VirtualAddress::new(0x1_0000));

    assert_eq!(
        space.reserve(MapRequest::anywhere(0x8000, RW)),
        Err(VmError::NoSpace)
    );
    assert_eq!(
        space.reserve(MapRequest::at(VirtualAddress::new(0x1_C000), 0x8000, RW)),
        Err(VmError::InvalidArgument)
    );
}

#[test]
fn fixed_placement_collides_unless_replacing() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let base = space.config().search_start;

    space.reserve(MapRequest::at(base, 4 * PAGE, RW)).unwrap();
    assert_eq!(
        space.map_anonymous(MapRequest::at(base + PAGE, PAGE, RW)),
        Err(VmError::Collision)
    );

    space
        .map_anonymous(MapRequest::at(base + PAGE, PAGE, RW).with_flags(MapFlags::REPLACE))
        .unwrap();
    let b = base.as_u64();
    assert_eq!(
        ranges(&space),
        [(b, b + PAGE), (b + PAGE, b + 2 * PAGE), (b + 2 * PAGE, b + 4 * PAGE)]
    );
    let kinds: Vec<_> = space.areas().iter().map(Area::kind).collect();
    assert_eq!(
        kinds,
        [AreaKind::Reservation, AreaKind::Anonymous, AreaKind::Reservation]
    );
}

#[test]
fn page_size_flags_are_checked() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();

    let both = MapFlags::LARGE | MapFlags::HUGE;
    assert_eq!(
        space.reserve(MapRequest::anywhere(0x20_0000, RW).with_flags(both)),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        space.reserve(MapRequest::anywhere(PAGE, RW).with_flags(MapFlags::LARGE)),
        Err(VmError::Misaligned(PageGranularity::Size2M))
    );
    assert_eq!(
        space.reserve(MapRequest::anywhere(0, RW)),
        Err(VmError::InvalidArgument)
    );

    m.set_large_pages(false);
    assert_eq!(
        space.reserve(MapRequest::anywhere(0x20_0000, RW).with_flags(MapFlags::LARGE)),
        Err(VmError::Unsupported(PageGranularity::Size2M))
    );

    m.set_large_pages(true);
    let va = space
        .reserve(MapRequest::anywhere(0x20_0000, RW).with_flags(MapFlags::LARGE))
        .unwrap();
    assert!(va.is_aligned(PageGranularity::Size2M));
    assert_eq!(space.find(va).unwrap().page_size(), PageGranularity::Size2M);
}

#[test]
fn vetoed_map_changes_nothing() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let destroyed = Rc::new(Cell::new(0));

    let mut probe = Probe::new(&destroyed);
    probe.veto = true;
    assert_eq!(
        space.map(MapRequest::anywhere(PAGE, RW), Box::new(probe)),
        Err(VmError::NotPermitted)
    );
    assert!(space.areas().is_empty());
    assert_eq!(destroyed.get(), 1);
}

#[test]
fn handler_may_move_an_anywhere_base() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let destroyed = Rc::new(Cell::new(0));
    let target = VirtualAddress::new(0x4000_0000);

    let mut probe = Probe::new(&destroyed);
    probe.relocate = Some(target);
    assert_eq!(
        space.map(MapRequest::anywhere(PAGE, RW), Box::new(probe)),
        Ok(target)
    );

    let mut probe = Probe::new(&destroyed);
    probe.relocate = Some(target);
    assert_eq!(
        space.map(MapRequest::anywhere(PAGE, RW), Box::new(probe)),
        Err(VmError::Collision)
    );

    let mut probe = Probe::new(&destroyed);
    probe.relocate = Some(target + 0x10_0000);
    assert_eq!(
        space.map(MapRequest::at(target + 0x20_0000, PAGE, RW), Box::new(probe)),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(destroyed.get(), 2);
    assert_eq!(space.areas().len(), 1);
}

#[test]
fn demand_paging_off_populates_at_map_time() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();

    let lazy = space.map_anonymous(MapRequest::anywhere(2 * PAGE, RW)).unwrap();
    assert!(space.page_map().translate(lazy).is_none());

    let eager = space.with_demand_paging_disabled(|space| {
        assert!(!space.demand_paging());
        space
            .map_anonymous(MapRequest::anywhere(2 * PAGE, RW).with_flags(MapFlags::NO_MERGE))
            .unwrap()
    });
    assert!(space.demand_paging());
    assert!(space.page_map().translate(eager).is_some());
    assert!(space.page_map().translate(eager + PAGE).is_some());

    // Reservations are never populated.
    let reserved = space.with_demand_paging_disabled(|space| {
        space.reserve(MapRequest::anywhere(PAGE, RW)).unwrap()
    });
    assert!(space.page_map().translate(reserved).is_none());
}

#[test]
fn failed_populate_rolls_back() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let capacity = space.page_map().node_cache().config().capacity;

    // Root, a full node cache and four data frames.
    m.set_frame_limit(Some(1 + capacity + 4));
    let request = MapRequest::anywhere(8 * PAGE, RW).with_flags(MapFlags::POPULATE);
    assert_eq!(space.map_anonymous(request), Err(VmError::OutOfMemory));
    assert!(space.areas().is_empty());

    let search = space.config().search_start;
    for page in 0..8 {
        assert!(space.page_map().translate(search + page * PAGE).is_none());
    }
    assert_eq!(m.allocated_frames(), 1 + capacity);
}

#[test]
fn drop_returns_every_frame() {
    let m = machine();
    {
        let mut space = AddressSpace::new(&m).unwrap();
        space
            .map_anonymous(MapRequest::anywhere(16 * PAGE, RW).with_flags(MapFlags::POPULATE))
            .unwrap();
        space.reserve(MapRequest::anywhere(PAGE, RW)).unwrap();
        assert!(m.allocated_frames() > 16);
    }
    assert_eq!(m.allocated_frames(), 0);
}

#[test]
fn merge_requires_matching_attributes() {
    let m = machine();
    let mut space = AddressSpace::new(&m).unwrap();
    let base = space.config().search_start;

    space.map_anonymous(MapRequest::at(base, PAGE, RW)).unwrap();
    space
        .map_anonymous(MapRequest::at(base + PAGE, PAGE, Protection::READ))
        .unwrap();
    space.reserve(MapRequest::at(base + 2 * PAGE, PAGE, Protection::READ)).unwrap();
    space
        .map(MapRequest::at(base + 3 * PAGE, PAGE, Protection::READ), Box::new(Anonymous))
        .unwrap();
    space
        .map(MapRequest::at(base + 4 * PAGE, PAGE, Protection::READ), Box::new(Reservation))
        .unwrap();

    let b = base.as_u64();
    assert_eq!(
        ranges(&space),
        [
            (b, b + PAGE),
            (b + PAGE, b + 2 * PAGE),
            (b + 2 * PAGE, b + 3 * PAGE),
            (b + 3 * PAGE, b + 4 * PAGE),
            (b + 4 * PAGE, b + 5 * PAGE),
        ]
    );
}
