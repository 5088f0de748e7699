use super::*;
use crate::phys::PaPartition;

const PHYS_BASE: u64 = 0x8000_0000;

fn manager(seed: u64) -> PageTableManager {
    let phys = PhysicalAddressSpace::new(PHYS_BASE, 0x100_0000, 0x100_0000).unwrap();
    PageTableManager::new(Arch::RiscV64, phys, seed)
}

fn with_table(seed: u64) -> (PageTableManager, PageTableId) {
    let mut mgr = manager(seed);
    let id = mgr
        .create_page_table("core0/supervisor", 0, ExecutionContext::Supervisor)
        .unwrap();
    (mgr, id)
}

fn data_batch(mgr: &mut PageTableManager, id: PageTableId, count: usize) -> Vec<Arc<Page>> {
    mgr.allocate_page(id, &PageRequest::new(PageSize::Size4K, PageType::Data).sequential(count))
        .unwrap()
}

#[test]
fn sequential_batches_are_contiguous_in_va_and_pa() {
    let (mut mgr, id) = with_table(0x5EED);
    for _ in 0..2 {
        let pages = mgr
            .allocate_page(
                id,
                &PageRequest::new(PageSize::Size4K, PageType::Code).sequential(3),
            )
            .unwrap();
        assert_eq!(pages.len(), 3);
        let (va, pa) = (pages[0].va(), pages[0].pa());
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(page.va(), va + i as u64 * 0x1000);
            assert_eq!(page.pa(), pa + i as u64 * 0x1000);
            assert_eq!(page.mapping(), Mapping::Regular);
            assert!(mgr
                .phys()
                .partition_range(PaPartition::Code)
                .contains(&page.pa()));
        }
    }

    let table = mgr.page_table(id).unwrap();
    assert_eq!(table.page_count(), 6);
    assert_eq!(table.non_allocated_bytes_of(PageType::Code), 0x6000);
    mgr.check_invariants().unwrap();
}

#[test]
fn identity_pages_have_equal_va_and_pa() {
    let (mut mgr, id) = with_table(7);
    let pages = mgr
        .allocate_page(
            id,
            &PageRequest::new(PageSize::Size4K, PageType::Code)
                .sequential(2)
                .identity(),
        )
        .unwrap();
    for page in &pages {
        assert_eq!(page.va(), page.pa());
        assert_eq!(page.mapping(), Mapping::Identity);
    }
    assert!(mgr
        .phys()
        .partition_range(PaPartition::Code)
        .contains(&pages[0].pa()));
    mgr.check_invariants().unwrap();
}

#[test]
fn identity_without_common_space_fails_without_side_effects() {
    let phys = PhysicalAddressSpace::new(PHYS_BASE, 0x10_0000, 0x10_0000).unwrap();
    let mut mgr = PageTableManager::with_va_range(Arch::RiscV64, phys, 0..0x10_0000, 1).unwrap();
    let id = mgr
        .create_page_table("core0/machine", 0, ExecutionContext::Monitor)
        .unwrap();
    let phys_before = mgr.phys().unmapped().clone();
    let va_before = mgr.page_table(id).unwrap().unmapped().clone();

    let err = mgr
        .allocate_page(
            id,
            &PageRequest::new(PageSize::Size4K, PageType::Code).identity(),
        )
        .unwrap_err();
    assert!(
        matches!(err, LayoutError::IdentityUnavailable { size: 0x1000, .. }),
        "{err}"
    );
    assert_eq!(mgr.phys().unmapped(), &phys_before);
    assert_eq!(mgr.page_table(id).unwrap().unmapped(), &va_before);

    // Regular mappings are still possible in the same table.
    data_batch(&mut mgr, id, 1);
    mgr.check_invariants().unwrap();
}

#[test]
fn forced_address_must_be_aligned_and_free() {
    let (mut mgr, id) = with_table(3);
    let request = PageRequest::new(PageSize::Size4K, PageType::Data).at(0x4000_0000);
    let pages = mgr.allocate_page(id, &request).unwrap();
    assert_eq!(pages[0].va(), 0x4000_0000);

    let err = mgr.allocate_page(id, &request).unwrap_err();
    assert!(
        matches!(
            err,
            LayoutError::RegionUnavailable {
                space: Space::Virtual,
                start: 0x4000_0000,
                ..
            }
        ),
        "{err}"
    );

    let err = mgr
        .allocate_page(
            id,
            &PageRequest::new(PageSize::Size4K, PageType::Data).at(0x4000_0800),
        )
        .unwrap_err();
    assert!(matches!(err, LayoutError::MisalignedAddress { .. }), "{err}");
}

#[test]
fn page_requests_are_validated() {
    let (mut mgr, id) = with_table(4);
    let err = mgr
        .allocate_page(
            id,
            &PageRequest::new(PageSize::Size2M, PageType::Data).aligned(12),
        )
        .unwrap_err();
    assert!(
        matches!(err, LayoutError::AlignmentBelowPageSize { alignment_bits: 12, .. }),
        "{err}"
    );

    let err = mgr
        .allocate_page(
            id,
            &PageRequest::new(PageSize::Size4K, PageType::Data).sequential(0),
        )
        .unwrap_err();
    assert!(matches!(err, LayoutError::InvalidPageCount { count: 0 }), "{err}");

    let err = mgr
        .allocate_page(
            PageTableId(9),
            &PageRequest::new(PageSize::Size4K, PageType::Data),
        )
        .unwrap_err();
    assert!(matches!(err, LayoutError::UnknownPageTable { id: 9 }), "{err}");
}

#[test]
fn page_table_names_and_contexts_are_unique() {
    let mut mgr = manager(5);
    mgr.create_page_table("a", 0, ExecutionContext::User).unwrap();

    let err = mgr
        .create_page_table("a", 1, ExecutionContext::User)
        .unwrap_err();
    assert!(matches!(err, LayoutError::DuplicatePageTable { .. }), "{err}");

    let err = mgr
        .create_page_table("b", 0, ExecutionContext::User)
        .unwrap_err();
    assert!(matches!(err, LayoutError::DuplicateContext { core_id: 0, .. }), "{err}");

    let phys = PhysicalAddressSpace::new(PHYS_BASE, 0x1000, 0x1000).unwrap();
    let mut x86 = PageTableManager::new(Arch::X86_64, phys, 5);
    let err = x86
        .create_page_table("smm", 0, ExecutionContext::Monitor)
        .unwrap_err();
    assert!(matches!(err, LayoutError::UnsupportedContext { .. }), "{err}");

    assert_eq!(mgr.page_tables().count(), 1);
    assert!(mgr.page_table_by_name("a").is_some());
    assert!(mgr.page_table_by_name("b").is_none());
}

#[test]
fn segment_spanning_a_batch_translates_through_its_pages() {
    let (mut mgr, id) = with_table(11);
    data_batch(&mut mgr, id, 3);

    let seg_id = mgr
        .allocate_memory_segment(
            id,
            &SegmentRequest::new("big", 0x2800, MemoryType::DataShared),
        )
        .unwrap();
    let segment = mgr.segment(seg_id).unwrap();
    assert_eq!(segment.pages().len(), 3);
    let table = mgr.page_table(id).unwrap();
    assert_eq!(
        table.translate(segment.va_address()),
        Some(segment.pa_address())
    );
    assert_eq!(segment.va_address() % 8, 0);
    assert_eq!(table.allocated().free_bytes(), 0x2800);
    assert_eq!(mgr.phys().allocated().free_bytes(), 0x2800);
    mgr.check_invariants().unwrap();
}

#[test]
fn segment_larger_than_any_region_fails() {
    let (mut mgr, id) = with_table(12);
    data_batch(&mut mgr, id, 1);
    data_batch(&mut mgr, id, 1);

    let err = mgr
        .allocate_memory_segment(
            id,
            &SegmentRequest::new("too-big", 0x1800, MemoryType::DataShared),
        )
        .unwrap_err();
    match err {
        LayoutError::SegmentSpaceExhausted {
            free,
            largest,
            size,
            ..
        } => {
            assert_eq!((free, largest, size), (0x2000, 0x1000, 0x1800));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mgr.page_table(id).unwrap().allocated().free_bytes(), 0);
    assert_eq!(mgr.phys().allocated().free_bytes(), 0);
}

#[test]
fn identity_segments_only_use_identity_pages() {
    let (mut mgr, id) = with_table(13);
    mgr.allocate_page(id, &PageRequest::new(PageSize::Size4K, PageType::Code))
        .unwrap();

    let boot = SegmentRequest::new("boot", 0x200, MemoryType::BootCode).identity();
    let err = mgr.allocate_memory_segment(id, &boot).unwrap_err();
    assert!(
        matches!(err, LayoutError::SegmentSpaceExhausted { identity: true, .. }),
        "{err}"
    );

    mgr.allocate_page(
        id,
        &PageRequest::new(PageSize::Size4K, PageType::Code).identity(),
    )
    .unwrap();
    let seg_id = mgr.allocate_memory_segment(id, &boot).unwrap();
    let segment = mgr.segment(seg_id).unwrap();
    assert_eq!(segment.va_address(), segment.pa_address());
    assert_eq!(segment.pages()[0].mapping(), Mapping::Identity);
}

#[test]
fn code_segments_emit_units_in_order() {
    let (mut mgr, id) = with_table(14);
    mgr.allocate_page(id, &PageRequest::new(PageSize::Size4K, PageType::Code))
        .unwrap();

    let seg_id = mgr
        .allocate_memory_segment(
            id,
            &SegmentRequest::new("main", 0x100, MemoryType::Code).aligned(0),
        )
        .unwrap();
    let segment = mgr.segment_mut(seg_id).unwrap();
    assert_eq!(segment.alignment_bits(), 3);
    assert_eq!(segment.va_address() % 8, 0);
    assert_eq!(segment.code().unwrap().start_label(), "main_start");

    let base = segment.va_address();
    assert_eq!(segment.append_code(Some("entry".into()), 0x80).unwrap(), base);
    assert_eq!(segment.append_code(None, 0x80).unwrap(), base + 0x80);
    let err = segment.append_code(None, 4).unwrap_err();
    assert!(
        matches!(err, LayoutError::CodeOverflow { remaining: 0, .. }),
        "{err}"
    );
    assert_eq!(segment.code().unwrap().units().len(), 2);
}

#[test]
fn preserved_data_items_are_carved_from_their_segment() {
    let (mut mgr, id) = with_table(15);
    data_batch(&mut mgr, id, 1);

    let preserve = mgr
        .allocate_memory_segment(
            id,
            &SegmentRequest::new("saved", 0x100, MemoryType::DataPreserve),
        )
        .unwrap();
    let item = mgr.allocate_data_item(preserve, "counter", 8, None).unwrap();
    let segment = mgr.segment(preserve).unwrap();
    assert!(item.va >= segment.va_address() && item.va + 8 <= segment.va_end());
    assert_eq!(item.va % 8, 0);
    assert_eq!(segment.translate(item.va), Some(item.pa));
    assert_eq!(segment.data().unwrap().free_bytes(), Some(0xf8));

    let err = mgr
        .allocate_data_item(preserve, "counter", 8, None)
        .unwrap_err();
    assert!(matches!(err, LayoutError::DuplicateDataItem { .. }), "{err}");

    let shared = mgr
        .allocate_memory_segment(
            id,
            &SegmentRequest::new("scratch", 0x40, MemoryType::DataShared),
        )
        .unwrap();
    let err = mgr.allocate_data_item(shared, "x", 8, None).unwrap_err();
    assert!(matches!(err, LayoutError::WrongSegmentKind { .. }), "{err}");
}

#[test]
fn stack_lookup_requires_exactly_one_stack() {
    let (mut mgr, id) = with_table(16);
    data_batch(&mut mgr, id, 2);

    let err = mgr
        .segments(id)
        .unwrap()
        .get_stack_start_address()
        .unwrap_err();
    assert!(
        matches!(err, LayoutError::SegmentMultiplicity { found: 0, .. }),
        "{err}"
    );

    let stack = mgr
        .allocate_memory_segment(id, &SegmentRequest::new("stack", 0x800, MemoryType::Stack))
        .unwrap();
    let top = mgr.segment(stack).unwrap().va_end();
    assert_eq!(
        mgr.segments(id).unwrap().get_stack_start_address().unwrap(),
        top
    );

    mgr.allocate_memory_segment(id, &SegmentRequest::new("stack1", 0x800, MemoryType::Stack))
        .unwrap();
    let err = mgr
        .segments(id)
        .unwrap()
        .get_stack_start_address()
        .unwrap_err();
    assert!(
        matches!(err, LayoutError::SegmentMultiplicity { found: 2, .. }),
        "{err}"
    );
}

#[test]
fn segment_queries_filter_by_type_and_exclusivity() {
    let (mut mgr, id) = with_table(17);
    data_batch(&mut mgr, id, 2);
    for (name, memory_type, shared) in [
        ("a", MemoryType::DataShared, false),
        ("b", MemoryType::DataShared, true),
        ("c", MemoryType::DataPreserve, true),
        ("s", MemoryType::Stack, false),
    ] {
        let mut request = SegmentRequest::new(name, 0x40, memory_type);
        if shared {
            request = request.shared();
        }
        mgr.allocate_memory_segment(id, &request).unwrap();
    }

    let segments = mgr.segments(id).unwrap();
    let names = |found: Vec<&Segment>| found.iter().map(|s| s.name().to_string()).collect::<Vec<_>>();
    assert_eq!(
        names(segments.get_segments(&[MemoryType::DataShared], false)),
        ["a", "b"]
    );
    assert_eq!(
        names(segments.get_segments(&[MemoryType::DataShared, MemoryType::DataPreserve], true)),
        ["b", "c"]
    );
    assert_eq!(segments.get_segment("s").unwrap().memory_type(), MemoryType::Stack);
    assert!(matches!(
        segments.get_segment("missing"),
        Err(LayoutError::UnknownSegment { .. })
    ));

    let err = mgr
        .allocate_memory_segment(id, &SegmentRequest::new("a", 0x40, MemoryType::DataShared))
        .unwrap_err();
    assert!(matches!(err, LayoutError::DuplicateSegment { .. }), "{err}");
}

#[test]
fn released_segments_return_their_bytes() {
    let (mut mgr, id) = with_table(18);
    data_batch(&mut mgr, id, 1);
    let seg = mgr
        .allocate_memory_segment(id, &SegmentRequest::new("tmp", 0x1000, MemoryType::DataShared))
        .unwrap();
    assert_eq!(mgr.page_table(id).unwrap().non_allocated_bytes(), 0);

    mgr.release_segment(seg).unwrap();
    assert_eq!(mgr.page_table(id).unwrap().non_allocated_bytes(), 0x1000);
    assert_eq!(mgr.phys().allocated().free_bytes(), 0);
    assert!(matches!(
        mgr.segment(seg),
        Err(LayoutError::StaleSegment { .. })
    ));

    // The same name and bytes can be used again.
    mgr.allocate_memory_segment(id, &SegmentRequest::new("tmp", 0x1000, MemoryType::DataShared))
        .unwrap();
    mgr.check_invariants().unwrap();
}

#[test]
fn cross_core_segments_share_one_physical_range() {
    let mut mgr = manager(0x5EED);
    let tables: Vec<PageTableId> = (0..3)
        .map(|core| {
            mgr.create_page_table(
                format!("core{core}/supervisor"),
                core,
                ExecutionContext::Supervisor,
            )
            .unwrap()
        })
        .collect();

    let group_id = mgr
        .allocate_cross_core_page(PageSize::Size4K, PageType::Data)
        .unwrap();
    let group = mgr.cross_core_group(group_id).unwrap().clone();
    assert_eq!(group.pages().len(), 3);
    for (_, page) in group.pages() {
        assert_eq!(page.pa(), group.pa());
        assert_eq!(page.size(), PageSize::Size4K);
        assert!(page.is_cross_core());
    }

    let ids = mgr
        .allocate_cross_core_data_segment("barrier0", 0x40, None)
        .unwrap();
    assert_eq!(ids.len(), 3);
    let pa = mgr.segment(ids[0]).unwrap().pa_address();
    for (id, table) in ids.iter().zip(&tables) {
        let segment = mgr.segment(*id).unwrap();
        assert_eq!(segment.pa_address(), pa);
        assert_eq!(segment.table(), *table);
        assert!(segment.is_cross_core());
        assert!(!segment.is_exclusive());
        let page = group.page_for(*table).unwrap();
        assert_eq!(segment.va_address(), page.va() + (pa - group.pa()));
    }

    let err = mgr.release_segment(ids[1]).unwrap_err();
    assert!(matches!(err, LayoutError::CrossCoreRelease { .. }), "{err}");

    let err = mgr
        .allocate_cross_core_data_segment("barrier0", 0x40, None)
        .unwrap_err();
    assert!(matches!(err, LayoutError::DuplicateSegment { .. }), "{err}");

    // Cross-core pages are not handed out to per-table segments.
    let err = mgr
        .allocate_memory_segment(
            tables[0],
            &SegmentRequest::new("local", 0x40, MemoryType::DataShared),
        )
        .unwrap_err();
    assert!(matches!(err, LayoutError::SegmentSpaceExhausted { .. }), "{err}");

    mgr.check_invariants().unwrap();
}

#[test]
fn cross_core_allocation_needs_tables_and_room() {
    let mut mgr = manager(19);
    let err = mgr
        .allocate_cross_core_page(PageSize::Size4K, PageType::Data)
        .unwrap_err();
    assert!(matches!(err, LayoutError::NoPageTables), "{err}");

    mgr.create_page_table("core0/user", 0, ExecutionContext::User)
        .unwrap();
    let err = mgr
        .allocate_cross_core_data_segment("barrier", 0x40, None)
        .unwrap_err();
    assert!(
        matches!(err, LayoutError::CrossCoreExhausted { groups: 0, .. }),
        "{err}"
    );

    mgr.allocate_cross_core_page(PageSize::Size4K, PageType::Data)
        .unwrap();
    let err = mgr
        .allocate_cross_core_data_segment("huge", 0x2000, None)
        .unwrap_err();
    assert!(
        matches!(err, LayoutError::CrossCoreExhausted { groups: 1, .. }),
        "{err}"
    );
}

#[test]
fn alignments_wider_than_an_address_are_rejected() {
    let (mut mgr, id) = with_table(20);
    let too_wide = |err: LayoutError| {
        assert!(
            matches!(err, LayoutError::InvalidAlignment { alignment_bits: 64 }),
            "{err}"
        );
    };

    for request in [
        PageRequest::new(PageSize::Size4K, PageType::Code).identity(),
        PageRequest::new(PageSize::Size4K, PageType::Data).at(0x4000_0000),
        PageRequest::new(PageSize::Size4K, PageType::Data),
    ] {
        too_wide(mgr.allocate_page(id, &request.aligned(64)).unwrap_err());
    }
    assert_eq!(mgr.page_table(id).unwrap().page_count(), 0);

    let page = data_batch(&mut mgr, id, 1).remove(0);
    for request in [
        SegmentRequest::new("wide", 0x40, MemoryType::DataShared),
        SegmentRequest::new("wide", 0x40, MemoryType::Code).identity(),
        SegmentRequest::new("wide", 0x40, MemoryType::DataShared).at(page.va()),
    ] {
        too_wide(
            mgr.allocate_memory_segment(id, &request.aligned(64))
                .unwrap_err(),
        );
    }

    let preserve = mgr
        .allocate_memory_segment(
            id,
            &SegmentRequest::new("saved", 0x40, MemoryType::DataPreserve),
        )
        .unwrap();
    too_wide(
        mgr.allocate_data_item(preserve, "word", 8, Some(64))
            .unwrap_err(),
    );

    mgr.allocate_cross_core_page(PageSize::Size4K, PageType::Data)
        .unwrap();
    too_wide(
        mgr.allocate_cross_core_data_segment("barrier", 8, Some(64))
            .unwrap_err(),
    );

    assert_eq!(mgr.phys().allocated().free_bytes(), 0x40);
    mgr.check_invariants().unwrap();
}

#[test]
fn cross_core_segments_are_aligned_in_every_table() {
    for seed in 0..16 {
        // Tables whose VA range is disjoint from physical space never reuse VA == PA.
        let phys = PhysicalAddressSpace::new(PHYS_BASE, 0x100_0000, 0x100_0000).unwrap();
        let mut mgr =
            PageTableManager::with_va_range(Arch::RiscV64, phys, 0..0x4000_0000, seed).unwrap();
        for core in 0..3 {
            mgr.create_page_table(
                format!("core{core}/supervisor"),
                core,
                ExecutionContext::Supervisor,
            )
            .unwrap();
        }
        mgr.allocate_cross_core_page(PageSize::Size4K, PageType::Data)
            .unwrap();

        let err = mgr
            .allocate_cross_core_data_segment("b", 0x40, Some(13))
            .unwrap_err();
        assert!(
            matches!(
                err,
                LayoutError::CrossCoreAlignment {
                    alignment_bits: 13,
                    page_bits: 12,
                    ..
                }
            ),
            "{err}"
        );
        assert_eq!(mgr.phys().allocated().free_bytes(), 0);

        for (name, alignment_bits) in [("b12", 12), ("b6", 6)] {
            for id in mgr
                .allocate_cross_core_data_segment(name, 0x40, Some(alignment_bits))
                .unwrap()
            {
                let segment = mgr.segment(id).unwrap();
                assert_ne!(segment.va_address(), segment.pa_address());
                assert_eq!(segment.alignment_bits(), alignment_bits);
                assert!(
                    is_aligned(segment.va_address(), alignment_bits),
                    "seed {seed}: va={:#x}",
                    segment.va_address()
                );
            }
        }

        // A 2 MiB group can honor alignments above 4 KiB; the 4 KiB group is skipped.
        let huge = mgr
            .allocate_cross_core_page(PageSize::Size2M, PageType::Data)
            .unwrap();
        for id in mgr
            .allocate_cross_core_data_segment("b13", 0x40, Some(13))
            .unwrap()
        {
            let segment = mgr.segment(id).unwrap();
            assert_eq!(segment.cross_core_group(), Some(huge));
            assert!(is_aligned(segment.va_address(), 13), "seed {seed}");
            assert!(is_aligned(segment.pa_address(), 13), "seed {seed}");
        }
        mgr.check_invariants().unwrap();
    }
}

#[test]
fn same_seed_same_layout() {
    let run = |seed| {
        let (mut mgr, id) = with_table(seed);
        let pages = data_batch(&mut mgr, id, 2);
        let seg = mgr
            .allocate_memory_segment(id, &SegmentRequest::new("d", 0x100, MemoryType::DataShared))
            .unwrap();
        let segment = mgr.segment(seg).unwrap();
        (pages[0].va(), pages[0].pa(), segment.va_address())
    };
    assert_eq!(run(42), run(42));
    assert_ne!(run(42), run(43));
}
