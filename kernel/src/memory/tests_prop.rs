//! Property-based tests for the memory manager
//!
//! TEST_SCOPE:
//!   - The block list stays a contiguous, maximally merged partition after
//!     any sequence of operations, failed ones included
//!   - Heap resizing only moves the heap end and accounts every page
//!
//! TEST_SCENARIOS:
//!   - partition_survives_random_operations(): random heap, attribute,
//!     borrow and physical memory operations keep the partition valid
//!   - heap_resize_moves_only_the_end(): heap blocks always span exactly
//!     `[heap start, heap start + heap size)`
//!   - physical_memory_round_trip_frees_everything(): mapping and unmapping
//!     random alias ranges returns every page

#![cfg(test)]

use proptest::prelude::*;

use super::flags::{MemoryAttribute, MemoryState};
use super::test_support::Fixture;
use super::{MemoryInfo, MemoryManager, PAGE_SIZE};

const MAX_PAGES: u64 = 32;

#[derive(Debug, Clone)]
enum Op {
    ResizeHeap(u64),
    SetUncached { offset: u64, pages: u64, set: bool },
    Borrow { offset: u64, pages: u64 },
    Unborrow { offset: u64, pages: u64 },
    MapPhysical { offset: u64, pages: u64 },
    UnmapPhysical { offset: u64, pages: u64 },
}

fn arb_range() -> impl Strategy<Value = (u64, u64)> {
    (0..MAX_PAGES, 1..=8u64)
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..=MAX_PAGES).prop_map(Op::ResizeHeap),
        (arb_range(), any::<bool>())
            .prop_map(|((offset, pages), set)| Op::SetUncached { offset, pages, set }),
        arb_range().prop_map(|(offset, pages)| Op::Borrow { offset, pages }),
        arb_range().prop_map(|(offset, pages)| Op::Unborrow { offset, pages }),
        arb_range().prop_map(|(offset, pages)| Op::MapPhysical { offset, pages }),
        arb_range().prop_map(|(offset, pages)| Op::UnmapPhysical { offset, pages }),
    ]
}

fn apply(manager: &MemoryManager, op: &Op) {
    let heap = manager.heap_region().start;
    let alias = manager.alias_region().start;

    // Failures are expected; only the resulting partition matters
    let _ = match *op {
        Op::ResizeHeap(pages) => manager.set_heap_size(pages * PAGE_SIZE).map(|_| ()),
        Op::SetUncached { offset, pages, set } => manager.set_memory_attribute(
            heap + offset * PAGE_SIZE,
            pages * PAGE_SIZE,
            MemoryAttribute::UNCACHED,
            if set {
                MemoryAttribute::UNCACHED
            } else {
                MemoryAttribute::NONE
            },
        ),
        Op::Borrow { offset, pages } => {
            manager.borrow_ipc_buffer(heap + offset * PAGE_SIZE, pages * PAGE_SIZE)
        }
        Op::Unborrow { offset, pages } => {
            manager.unborrow_ipc_buffer(heap + offset * PAGE_SIZE, pages * PAGE_SIZE)
        }
        Op::MapPhysical { offset, pages } => {
            manager.map_physical_memory(alias + offset * PAGE_SIZE, pages * PAGE_SIZE)
        }
        Op::UnmapPhysical { offset, pages } => {
            manager.unmap_physical_memory(alias + offset * PAGE_SIZE, pages * PAGE_SIZE)
        }
    };
}

fn assert_partition(manager: &MemoryManager, blocks: &[MemoryInfo]) -> Result<(), TestCaseError> {
    let space = manager.layout().addr_space();

    prop_assert_eq!(blocks.first().map(|b| b.address), Some(space.start));
    prop_assert_eq!(blocks.last().map(|b| b.end_address()), Some(space.end));

    for pair in blocks.windows(2) {
        prop_assert_eq!(pair[0].end_address(), pair[1].address);
        let same_signature = pair[0].state == pair[1].state
            && pair[0].permission == pair[1].permission
            && pair[0].attribute == pair[1].attribute
            && pair[0].source_permission == pair[1].source_permission
            && pair[0].ipc_ref_count == pair[1].ipc_ref_count
            && pair[0].device_ref_count == pair[1].device_ref_count;
        prop_assert!(!same_signature, "unmerged neighbors at {:#x}", pair[1].address);
    }

    prop_assert!(blocks.iter().all(|b| b.size != 0));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn partition_survives_random_operations(ops in prop::collection::vec(arb_op(), 1..24)) {
        let fixture = Fixture::new();
        let manager = &fixture.manager;

        for op in &ops {
            apply(manager, op);
            assert_partition(manager, &manager.blocks())?;
        }

        manager.validate_internal_state();
    }

    #[test]
    fn heap_resize_moves_only_the_end(sizes in prop::collection::vec(0..=MAX_PAGES, 1..12)) {
        let fixture = Fixture::new();
        let manager = &fixture.manager;
        let heap = manager.heap_region().start;
        let free_at_start = fixture.free_pages();

        for pages in sizes {
            let base = manager.set_heap_size(pages * PAGE_SIZE).unwrap();
            prop_assert_eq!(base, heap);
            prop_assert_eq!(manager.heap_size(), pages * PAGE_SIZE);
            prop_assert_eq!(fixture.free_pages(), free_at_start - pages);

            let heap_bytes: u64 = manager
                .blocks()
                .iter()
                .filter(|b| b.state == MemoryState::HEAP)
                .map(|b| b.size)
                .sum();
            prop_assert_eq!(heap_bytes, pages * PAGE_SIZE);
            if pages != 0 {
                prop_assert_eq!(manager.query_memory(heap).state, MemoryState::HEAP);
            }
        }
    }

    #[test]
    fn physical_memory_round_trip_frees_everything(
        ranges in prop::collection::vec(arb_range(), 1..8)
    ) {
        let fixture = Fixture::new();
        let manager = &fixture.manager;
        let alias = manager.alias_region().start;
        let free_at_start = fixture.free_pages();

        for &(offset, pages) in &ranges {
            manager
                .map_physical_memory(alias + offset * PAGE_SIZE, pages * PAGE_SIZE)
                .unwrap();
        }

        let mapped: u64 = manager
            .blocks()
            .iter()
            .filter(|b| b.state == MemoryState::HEAP)
            .map(|b| b.size / PAGE_SIZE)
            .sum();
        prop_assert_eq!(fixture.free_pages(), free_at_start - mapped);
        prop_assert_eq!(manager.physical_memory_usage(), mapped * PAGE_SIZE);

        manager
            .unmap_physical_memory(alias, (MAX_PAGES + 8) * PAGE_SIZE)
            .unwrap();

        prop_assert_eq!(fixture.free_pages(), free_at_start);
        prop_assert_eq!(manager.block_count(), 1);
        prop_assert_eq!(fixture.limit.current_value(crate::process::LimitableResource::Memory), 0);
    }
}
