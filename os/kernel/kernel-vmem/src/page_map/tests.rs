use super::*;
use crate::platform::{FramePool, PhysMapper};
use crate::sim::{SimEvent, SimMachine};
use std::collections::BTreeMap;

const VA: VirtualAddress = VirtualAddress::new(0x0000_4000_0020_3000);
const RW: Protection = Protection::READ_WRITE;

fn machine() -> SimMachine {
    SimMachine::new(2048)
}

fn frame(m: &SimMachine) -> PhysicalAddress {
    m.allocate(1, PageGranularity::Size4K).unwrap()
}

fn root_is_empty(m: &SimMachine, map: &PageMap<'_>) -> bool {
    unsafe { platform::table_ptr(m, map.root()).as_ref().is_empty() }
}

#[test]
fn map_4k_creates_tables_and_leaf() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    assert_eq!(m.allocated_frames(), 1);

    let pa = frame(&m);
    let mapped = map
        .map(VA, Some(pa), RW | Protection::GLOBAL, MapFlags::empty())
        .unwrap();
    assert_eq!(mapped, pa);

    let t = map.translate(VA + 0x123).unwrap();
    assert_eq!(t.phys, pa + 0x123);
    assert_eq!(t.base, VA);
    assert_eq!(t.level, Level::L1);
    assert_eq!(t.granularity, PageGranularity::Size4K);
    assert!(t.entry.global() && t.entry.no_execute() && !t.entry.huge());
    assert_eq!(t.protection(), RW | Protection::GLOBAL);

    // Three intermediate tables came out of a cache filled to capacity.
    let capacity = map.node_cache().config().capacity;
    assert_eq!(map.node_cache().len(), capacity - 3);
    assert_eq!(m.allocated_frames(), 1 + capacity + 1);
}

#[test]
fn map_2m_sets_huge_bit() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let va = VirtualAddress::new(0x0000_4000_0020_0000);
    let pa = map.map(va, None, RW, MapFlags::LARGE).unwrap();
    assert!(pa.is_aligned(PageGranularity::Size2M));

    let t = map.translate(va + 0x1_2345).unwrap();
    assert_eq!(t.level, Level::L2);
    assert_eq!(t.granularity, PageGranularity::Size2M);
    assert_eq!(t.phys, pa + 0x1_2345);
    assert!(t.entry.huge());

    let before = m.allocated_frames();
    map.unmap(va).unwrap();
    assert_eq!(m.allocated_frames(), before - 512);
}

#[test]
fn map_1g_shared_foreign_frame() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let va = VirtualAddress::new(0x0000_0080_0000_0000);
    let pa = PhysicalAddress::new(0x4000_0000);
    map.map(va, Some(pa), RW, MapFlags::HUGE | MapFlags::SHARED)
        .unwrap();

    let t = map.translate(va + 0x3FFF_FFFF).unwrap();
    assert_eq!(t.level, Level::L3);
    assert_eq!(t.phys.as_u64(), 0x7FFF_FFFF);

    let before = m.allocated_frames();
    let gone = map.unmap(va).unwrap();
    assert_eq!(
        gone,
        Unmapped {
            phys: pa,
            granularity: PageGranularity::Size1G,
            shared: true
        }
    );
    assert_eq!(m.allocated_frames(), before);
}

#[test]
fn large_pages_unsupported() {
    let m = machine();
    m.set_large_pages(false);
    let mut map = PageMap::new(&m).unwrap();
    let va = VirtualAddress::new(0x20_0000);
    assert_eq!(
        map.map(va, None, RW, MapFlags::LARGE),
        Err(PageMapError::Unsupported(PageGranularity::Size2M))
    );
    assert_eq!(map.walk(va), Walk::Missing { level: Level::L4 });
    assert!(map.map(va, None, RW, MapFlags::empty()).is_ok());
}

#[test]
fn misaligned_requests() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    assert!(matches!(
        map.map(VA + 0x10, None, RW, MapFlags::empty()),
        Err(PageMapError::Misaligned { .. })
    ));
    assert_eq!(
        map.map(VA, None, RW, MapFlags::LARGE),
        Err(PageMapError::Misaligned {
            address: VA.as_u64(),
            granularity: PageGranularity::Size2M
        })
    );
    let va = VirtualAddress::new(0x40_0000);
    let pa = PhysicalAddress::new(0x1000_1000);
    assert!(matches!(
        map.map(va, Some(pa), RW, MapFlags::LARGE),
        Err(PageMapError::Misaligned { .. })
    ));
    assert_eq!(
        map.map(va, None, RW, MapFlags::LARGE | MapFlags::HUGE),
        Err(PageMapError::ConflictingFlags)
    );
}

#[test]
fn already_mapped_unless_shared() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let first = map.map(VA, None, RW, MapFlags::empty()).unwrap();
    assert_eq!(
        map.map(VA, None, RW, MapFlags::empty()),
        Err(PageMapError::AlreadyMapped(VA))
    );

    let alias = frame(&m);
    m.clear_logs();
    map.map(VA, Some(alias), RW, MapFlags::SHARED).unwrap();
    assert_eq!(map.translate(VA).unwrap().phys, alias);
    assert!(!m.is_allocated(first), "replaced owned frame is released");
    assert_eq!(m.events(), vec![SimEvent::Flush(VA), SimEvent::Free(first, 1)]);

    let gone = map.unmap(VA).unwrap();
    assert!(gone.shared);
    assert!(m.is_allocated(alias));
    m.free(alias, 1);
}

#[test]
fn shared_large_leaf_never_replaces_a_table() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let small = map.map(VA, None, RW, MapFlags::empty()).unwrap();
    let frames = m.allocated_frames();

    let va = VA.align_down(PageGranularity::Size2M);
    let pa = PhysicalAddress::new(0x4000_0000);
    assert_eq!(
        map.map(va, Some(pa), RW, MapFlags::LARGE | MapFlags::SHARED),
        Err(PageMapError::AlreadyMapped(va))
    );
    assert_eq!(m.allocated_frames(), frames);
    assert_eq!(map.translate(VA).unwrap().phys, small);
    assert_eq!(map.translate(VA).unwrap().level, Level::L1);
}

#[test]
fn replaced_large_leaf_frees_its_own_run() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let va = VirtualAddress::new(0x0000_4000_0020_0000);
    let owned = map.map(va, None, RW, MapFlags::LARGE).unwrap();
    let frames = m.allocated_frames();

    let pa = PhysicalAddress::new(0x4000_0000);
    map.map(va, Some(pa), RW, MapFlags::LARGE | MapFlags::SHARED)
        .unwrap();
    assert_eq!(m.allocated_frames(), frames - 512);
    assert!(!m.is_allocated(owned));
    assert_eq!(map.translate(va).unwrap().phys, pa);
}

#[test]
fn large_leaf_blocks_smaller_mapping_below() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let va = VirtualAddress::new(0x0000_4000_0020_0000);
    map.map(va, None, RW, MapFlags::LARGE).unwrap();
    assert_eq!(
        map.map(va + 0x1000, None, RW, MapFlags::empty()),
        Err(PageMapError::AlreadyMapped(va + 0x1000))
    );
}

#[test]
fn any_allocates_and_unmap_frees() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let pa = map.map(VA, None, RW, MapFlags::empty()).unwrap();
    assert!(m.is_allocated(pa));

    let gone = map.unmap(VA).unwrap();
    assert_eq!(
        gone,
        Unmapped {
            phys: pa,
            granularity: PageGranularity::Size4K,
            shared: false
        }
    );
    assert!(!m.is_allocated(pa));
    assert_eq!(map.unmap(VA), Err(PageMapError::NotMapped(VA)));
}

#[test]
fn flush_precedes_free() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let pa = map.map(VA, None, RW, MapFlags::empty()).unwrap();
    m.clear_logs();
    map.unmap(VA).unwrap();

    let events = m.events();
    let flush = events.iter().position(|e| *e == SimEvent::Flush(VA));
    let free = events.iter().position(|e| *e == SimEvent::Free(pa, 1));
    assert!(matches!((flush, free), (Some(f), Some(r)) if f < r), "{events:?}");
}

#[test]
fn empty_tables_are_reclaimed() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let capacity = map.node_cache().config().capacity;

    map.map(VA, None, RW, MapFlags::empty()).unwrap();
    map.map(VA + 0x1000, None, RW, MapFlags::empty()).unwrap();

    map.unmap(VA).unwrap();
    assert_eq!(map.walk(VA), Walk::Missing { level: Level::L1 });
    assert!(map.translate(VA + 0x1000).is_some());

    map.unmap(VA + 0x1000).unwrap();
    assert_eq!(map.walk(VA), Walk::Missing { level: Level::L4 });
    assert!(root_is_empty(&m, &map));
    assert_eq!(map.node_cache().len(), capacity);
}

#[test]
fn unmap_inside_large_leaf_rejected() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let va = VirtualAddress::new(0x0000_4000_0020_0000);
    map.map(va, None, RW, MapFlags::LARGE).unwrap();
    assert_eq!(
        map.unmap(va + 0x1000),
        Err(PageMapError::Misaligned {
            address: va.as_u64() + 0x1000,
            granularity: PageGranularity::Size2M
        })
    );
    assert!(map.translate(va).is_some());
}

#[test]
fn protect_rewrites_leaf() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let pa = map.map(VA, None, RW, MapFlags::empty()).unwrap();

    m.clear_logs();
    map.protect(VA, Protection::READ).unwrap();
    let t = map.translate(VA).unwrap();
    assert!(!t.entry.writable());
    assert_eq!(t.phys, pa);
    assert_eq!(m.flushes(), vec![VA]);

    map.protect(VA, Protection::empty()).unwrap();
    let t = map.translate(VA).unwrap();
    assert!(t.entry.inaccessible() && !t.entry.present());
    assert_eq!(t.protection(), Protection::empty());
    assert_eq!(t.phys, pa);

    map.protect(VA, RW).unwrap();
    assert_eq!(map.translate(VA).unwrap().protection(), RW);
    assert_eq!(
        map.protect(VA + 0x1000, RW),
        Err(PageMapError::NotMapped(VA + 0x1000))
    );
}

#[test]
fn unmap_range_skips_holes() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let pages = [
        VirtualAddress::new(0x1000_0000),
        VirtualAddress::new(0x0000_0040_0000_0000),
        VirtualAddress::new(0x0000_7000_0000_0000),
    ];
    let frames: Vec<_> = pages
        .iter()
        .map(|&va| map.map(va, None, RW, MapFlags::empty()).unwrap())
        .collect();

    let removed = map
        .unmap_range(VirtualAddress::new(0x1000)..VirtualAddress::new(0x0000_8000_0000_0000))
        .unwrap();
    assert_eq!(removed, 3);
    assert!(frames.iter().all(|&pa| !m.is_allocated(pa)));
    assert!(root_is_empty(&m, &map));
}

#[test]
fn range_rejects_straddling_large_leaf() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    let large = VirtualAddress::new(0x20_0000);
    let small = VirtualAddress::new(0x1000);
    map.map(large, None, RW, MapFlags::LARGE).unwrap();
    map.map(small, None, RW, MapFlags::empty()).unwrap();

    assert_eq!(
        map.unmap_range(small..VirtualAddress::new(0x30_0000)),
        Err(PageMapError::Misaligned {
            address: large.as_u64(),
            granularity: PageGranularity::Size2M
        })
    );
    // Nothing was touched before the straddle was detected.
    assert!(map.translate(small).is_some());

    let changed = map
        .protect_range(VirtualAddress::zero()..VirtualAddress::new(0x40_0000), Protection::READ)
        .unwrap();
    assert_eq!(changed, 2);
    assert!(!map.translate(large).unwrap().entry.writable());
    assert!(!map.translate(small).unwrap().entry.writable());
}

#[test]
fn failed_map_prunes_fresh_tables() {
    let m = machine();
    let mut map = PageMap::new(&m).unwrap();
    map.map(VA, None, RW, MapFlags::empty()).unwrap();
    map.unmap(VA).unwrap();
    let cached = map.node_cache().len();

    m.set_frame_limit(Some(m.allocated_frames()));
    assert_eq!(
        map.map(VA, None, RW, MapFlags::empty()),
        Err(PageMapError::OutOfFrames)
    );
    assert_eq!(map.walk(VA), Walk::Missing { level: Level::L4 });
    assert_eq!(map.node_cache().len(), cached);
}

#[test]
fn out_of_nodes() {
    let m = machine();
    m.set_frame_limit(Some(2));
    let mut map = PageMap::new(&m).unwrap();
    assert_eq!(
        map.map(VA, Some(PhysicalAddress::new(0x5000)), RW, MapFlags::SHARED),
        Err(PageMapError::OutOfNodes)
    );
}

#[test]
fn activate_tracks_root() {
    let m = machine();
    let a = PageMap::new(&m).unwrap();
    let b = PageMap::new(&m).unwrap();
    unsafe { a.activate() };
    assert!(a.is_active() && !b.is_active());
    unsafe { b.activate() };
    assert!(b.is_active() && !a.is_active());
}

#[test]
fn drop_returns_every_frame() {
    let m = machine();
    {
        let mut map = PageMap::new(&m).unwrap();
        map.map(VA, None, RW, MapFlags::empty()).unwrap();
        map.map(VirtualAddress::new(0x20_0000), None, RW, MapFlags::LARGE)
            .unwrap();
        map.map(VirtualAddress::new(0x0000_7000_0000_0000), None, Protection::empty(), MapFlags::empty())
            .unwrap();
    }
    assert_eq!(m.allocated_frames(), 0);
}

#[test]
fn node_cache_stress() {
    let m = machine();
    let config = NodeCacheConfig {
        capacity: 4,
        low_water: 3,
    };
    let mut map = PageMap::with_config(&m, config).unwrap();
    let mut live = BTreeMap::new();

    // Addresses differ in their L1, L2, L3 and L4 indices in turn, so tables are
    // created and reclaimed at every level.
    for i in 0u64..600 {
        let n = (i * 7919) % 211;
        let va = VirtualAddress::new(
            0x10_0000
                + (n % 3) * 0x1000
                + (n / 3 % 3) * 0x20_0000
                + (n / 9 % 3) * 0x4000_0000
                + (n / 27 % 2) * 0x80_0000_0000,
        );
        if let Some(pa) = live.remove(&va) {
            assert_eq!(map.unmap(va).unwrap().phys, pa);
        } else {
            let pa = map.map(va, None, RW, MapFlags::empty()).unwrap();
            live.insert(va, pa);
        }
        assert!(map.node_cache().len() <= config.capacity);
    }

    for (&va, &pa) in &live {
        assert_eq!(map.translate(va).unwrap().phys, pa);
    }
    for &va in live.keys() {
        map.unmap(va).unwrap();
    }
    assert!(root_is_empty(&m, &map));
    assert_eq!(m.allocated_frames(), 1 + map.node_cache().len());
    drop(map);
    assert_eq!(m.allocated_frames(), 0);
}

#[test]
fn table_pages_are_reachable_through_the_mapper() {
    let m = machine();
    let map = PageMap::new(&m).unwrap();
    let p = unsafe { m.phys_to_virt(map.root().base()) };
    assert_eq!(p.as_ptr().addr() % 4096, 0);
}
