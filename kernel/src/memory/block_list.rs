//! Block List (Address-Space Partition Engine)
//!
//! An ordered map of [`MemoryBlock`]s keyed by base address that exactly
//! partitions `[start, end)`. Two invariants hold after every mutation:
//!
//! - Contiguity: blocks cover the whole space with no gaps or overlaps
//! - Maximal merge: no two neighbors share the same full signature
//!
//! All mutation goes through [`BlockList::insert_block`], which splits the
//! blocks straddling the target range, applies a [`BlockMutation`] to the
//! exact middle part and merges equal neighbors back together. Validation
//! goes through [`BlockList::check_range`]. Capacity is not checked here;
//! callers ask the [`MemoryBlockSlab`] first.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::block::{MemoryBlock, MemoryInfo};
use super::block_allocator::MemoryBlockSlab;
use super::flags::{MemoryAttribute, MemoryPermission, MemoryState};
use super::{PAGE_SIZE, align_down};
use crate::{KernelError, KernelResult};

/// Signature change applied to every block of an insertion range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMutation {
    /// Replace state, permission and attribute (transient bits survive)
    Overwrite {
        /// New state
        state: MemoryState,
        /// New permission
        permission: MemoryPermission,
        /// New attribute
        attribute: MemoryAttribute,
    },
    /// Lend through IPC with the given read/write permission
    IpcLend(MemoryPermission),
    /// Return one IPC lend
    IpcRestore,
}

impl BlockMutation {
    /// Overwrite with `state`/`permission` and no attribute
    pub const fn state(state: MemoryState, permission: MemoryPermission) -> Self {
        Self::Overwrite {
            state,
            permission,
            attribute: MemoryAttribute::NONE,
        }
    }

    fn apply(self, block: &mut MemoryBlock) {
        match self {
            Self::Overwrite {
                state,
                permission,
                attribute,
            } => block.set_state(permission, state, attribute),
            Self::IpcLend(permission) => block.set_ipc_lend_permission(permission),
            Self::IpcRestore => block.restore_ipc_lend_permission(),
        }
    }
}

/// Only blocks with exactly this signature are mutated by an insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeFilter {
    /// Required state
    pub state: MemoryState,
    /// Required permission
    pub permission: MemoryPermission,
    /// Required attribute, ignoring the transient IPC/device bits
    pub attribute: MemoryAttribute,
}

impl RangeFilter {
    fn matches(&self, block: &MemoryBlock) -> bool {
        let transient = MemoryAttribute::IPC_AND_DEVICE_MAPPED;
        block.state() == self.state
            && block.permission() == self.permission
            && (block.attribute() | transient) == (self.attribute | transient)
    }
}

/// Ordered partition of an address space into memory blocks
#[derive(Debug)]
pub struct BlockList {
    blocks: BTreeMap<u64, MemoryBlock>,
    start: u64,
    end: u64,
    slab: Arc<MemoryBlockSlab>,
}

impl BlockList {
    /// Create a list holding a single unmapped block over `[start, end)`
    pub fn new(start: u64, end: u64, slab: Arc<MemoryBlockSlab>) -> KernelResult<Self> {
        // The first insertion never splits anything.
        if !slab.can_allocate(1) {
            return Err(KernelError::OutOfResource);
        }

        let mut blocks = BTreeMap::new();
        blocks.insert(
            start,
            MemoryBlock::new(
                start,
                (end - start) / PAGE_SIZE,
                MemoryState::UNMAPPED,
                MemoryPermission::NONE,
                MemoryAttribute::NONE,
            ),
        );
        slab.adjust(1);

        Ok(Self {
            blocks,
            start,
            end,
            slab,
        })
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the list is empty (never true for a live address space)
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Start of the partitioned space
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// End of the partitioned space
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Shared block budget this list draws from
    pub fn slab(&self) -> &MemoryBlockSlab {
        &self.slab
    }

    /// Blocks in address order
    pub fn iter(&self) -> impl Iterator<Item = &MemoryBlock> {
        self.blocks.values()
    }

    /// Block containing `address`
    pub fn find_block(&self, address: u64) -> Option<&MemoryBlock> {
        self.blocks
            .range(..=address)
            .next_back()
            .map(|(_, block)| block)
            .filter(|block| block.contains(address))
    }

    fn first_key_for(&self, address: u64) -> u64 {
        self.blocks
            .range(..=address)
            .next_back()
            .map_or(address, |(base, _)| *base)
    }

    /// Snapshots of every block overlapping `[start, end)`
    pub fn iter_range(&self, start: u64, end: u64) -> impl Iterator<Item = MemoryInfo> + '_ {
        let first = self.first_key_for(start);
        let last = end.max(first);
        self.blocks.range(first..last).map(|(_, block)| block.info())
    }

    /// Check that `[address, address + size)` has one homogeneous signature
    /// satisfying the masks.
    ///
    /// Every covered block must share the first block's state and
    /// permission, and its attribute may differ from the first block's only
    /// in `attribute_ignore_mask` bits. Returns the common state, permission
    /// and attribute (with ignored bits cleared).
    #[allow(clippy::too_many_arguments)]
    pub fn check_range(
        &self,
        address: u64,
        size: u64,
        state_mask: MemoryState,
        state_expected: MemoryState,
        permission_mask: MemoryPermission,
        permission_expected: MemoryPermission,
        attribute_mask: MemoryAttribute,
        attribute_expected: MemoryAttribute,
        attribute_ignore_mask: MemoryAttribute,
    ) -> Option<(MemoryState, MemoryPermission, MemoryAttribute)> {
        let end = address.checked_add(size)?;
        let first = *self.find_block(address)?;

        let first_state = first.state();
        let first_permission = first.permission();
        let first_attribute = first.attribute();

        for block in self.blocks.range(first.base_address()..).map(|(_, block)| block) {
            if first_state != block.state()
                || first_permission != block.permission()
                || (block.attribute() & attribute_mask) != attribute_expected
                || (first_attribute | attribute_ignore_mask)
                    != (block.attribute() | attribute_ignore_mask)
                || (first_state & state_mask) != state_expected
                || (first_permission & permission_mask) != permission_expected
            {
                return None;
            }

            if end <= block.end_address() {
                return Some((
                    first_state,
                    first_permission,
                    first_attribute & !attribute_ignore_mask,
                ));
            }
        }

        None
    }

    /// Check every block overlapping the range against the masks, without
    /// requiring the blocks to be identical
    #[allow(clippy::too_many_arguments)]
    pub fn check_range_all(
        &self,
        address: u64,
        size: u64,
        state_mask: MemoryState,
        state_expected: MemoryState,
        permission_mask: MemoryPermission,
        permission_expected: MemoryPermission,
        attribute_mask: MemoryAttribute,
        attribute_expected: MemoryAttribute,
    ) -> bool {
        let Some(end) = address.checked_add(size) else {
            return false;
        };

        self.iter_range(address, end).all(|info| {
            (info.state & state_mask) == state_expected
                && (info.permission & permission_mask) == permission_expected
                && (info.attribute & attribute_mask) == attribute_expected
        })
    }

    /// Whether the whole range is a single unmapped signature
    pub fn is_unmapped(&self, address: u64, size: u64) -> bool {
        self.check_range(
            address,
            size,
            MemoryState::MASK,
            MemoryState::UNMAPPED,
            MemoryPermission::MASK,
            MemoryPermission::NONE,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
            MemoryAttribute::IPC_AND_DEVICE_MAPPED,
        )
        .is_some()
    }

    /// Apply `mutation` to `[address, address + pages_count * PAGE_SIZE)`.
    ///
    /// With a `filter`, blocks whose signature differs from it are left
    /// untouched. Straddling blocks are split at the range edges and equal
    /// neighbors merged afterwards.
    pub fn insert_block(
        &mut self,
        address: u64,
        pages_count: u64,
        mutation: BlockMutation,
        filter: Option<RangeFilter>,
    ) {
        let old_len = self.blocks.len();
        let end = address + pages_count * PAGE_SIZE;
        let mut cursor = address;

        while cursor < end {
            let Some(mut block) = self
                .blocks
                .range(..=cursor)
                .next_back()
                .map(|(_, block)| *block)
            else {
                break;
            };

            let base = block.base_address();
            let block_end = block.end_address();
            if block_end <= cursor {
                break;
            }

            if filter.is_some_and(|filter| !filter.matches(&block)) {
                cursor = block_end;
                continue;
            }

            self.blocks.remove(&base);

            if cursor > base {
                let left = block.split_right_at_address(cursor);
                self.blocks.insert(left.base_address(), left);
            }

            if end < block_end {
                let middle = block.split_right_at_address(end);
                self.blocks.insert(block.base_address(), block);
                block = middle;
            }

            mutation.apply(&mut block);

            let middle_base = block.base_address();
            self.blocks.insert(middle_base, block);
            self.merge_equal_state_neighbors(middle_base);

            cursor = block_end;
        }

        let delta = self.blocks.len() as isize - old_len as isize;
        self.slab.adjust(delta);

        #[cfg(any(debug_assertions, feature = "strict-validation"))]
        self.validate_internal_state();
    }

    fn merge_equal_state_neighbors(&mut self, base: u64) {
        let Some(mut block) = self.blocks.remove(&base) else {
            return;
        };
        let mut merged_base = base;

        let previous = self.blocks.range(..base).next_back().map(|(_, b)| *b);
        if let Some(mut previous) = previous {
            if previous.end_address() == base && previous.state_equals(&block) {
                previous.add_pages(block.pages_count());
                merged_base = previous.base_address();
                block = previous;
            }
        }

        let next_base = block.end_address();
        if let Some(next) = self.blocks.get(&next_base).copied() {
            if next.state_equals(&block) {
                self.blocks.remove(&next_base);
                block.add_pages(next.pages_count());
            }
        }

        self.blocks.insert(merged_base, block);
    }

    /// First address in the region with room for `needed_pages` surrounded
    /// by `reserved_pages` guard pages, aligned to `alignment` (plus
    /// `reserved_start`).
    pub fn find_first_fit(
        &self,
        region_start: u64,
        region_pages: u64,
        needed_pages: u64,
        alignment: u64,
        reserved_start: u64,
        reserved_pages: u64,
    ) -> Option<u64> {
        let reserved_size = reserved_pages * PAGE_SIZE;
        let total_needed_size = reserved_size + needed_pages * PAGE_SIZE;
        let region_end = region_start + region_pages * PAGE_SIZE;
        let first = self.first_key_for(region_start);

        for block in self.blocks.range(first..region_end).map(|(_, block)| block) {
            if block.state() != MemoryState::UNMAPPED {
                continue;
            }

            let block_start = block.base_address().max(region_start);
            let curr_base = block_start + reserved_size;
            let curr_last = block.end_address() - 1;

            let mut address = align_down(curr_base, alignment) + reserved_start;
            if curr_base > address {
                address += alignment;
            }

            let allocation_last = address + total_needed_size - 1;
            if allocation_last < region_end && allocation_last <= curr_last && address < allocation_last
            {
                return Some(address);
            }
        }

        None
    }

    /// Check contiguity and maximal merging; a violation is fatal
    pub fn validate_internal_state(&self) {
        let mut expected = self.start;
        let mut previous: Option<&MemoryBlock> = None;

        for (&base, block) in &self.blocks {
            if base != block.base_address() || base != expected {
                fatal!(
                    "block list is not contiguous: expected block at {:#x}, found {:#x}",
                    expected,
                    base
                );
            }
            if block.pages_count() == 0 {
                fatal!("empty block at {:#x}", base);
            }
            if previous.is_some_and(|previous| previous.state_equals(block)) {
                fatal!("unmerged equal blocks at {:#x}", base);
            }

            expected = block.end_address();
            previous = Some(block);
        }

        if expected != self.end {
            fatal!(
                "block list ends at {:#x} instead of {:#x}",
                expected,
                self.end
            );
        }
    }
}

impl Drop for BlockList {
    fn drop(&mut self) {
        self.slab.adjust(-(self.blocks.len() as isize));
    }
}
