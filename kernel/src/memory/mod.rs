//! Memory Management Subsystem
//!
//! This module provides guest memory management for the HLE kernel. It is
//! organized as a small stack of components, leaves first:
//!
//! - Page lists (runs of contiguous physical pages backing a range)
//! - Memory blocks (homogeneous, contiguous virtual ranges)
//! - Block list (the ordered partition of the address space and its
//!   split/merge/validate primitives)
//! - Region layout and ASLR placement
//! - The memory manager (every kernel-style memory operation)
//! - IPC lending (edge-page safe buffer transfer between processes)
//!
//! # Design Principles
//!
//! - Validate the full precondition and reserve block capacity before any
//!   host-visible mutation
//! - Keep the block partition contiguous and maximally merged at all times
//! - Bit-exact state/permission/attribute flag algebra
//!
//! # Memory Layout
//!
//! ```text
//! 39-bit guest address space (ASLR disabled):
//! 0x0000000000 - 0x0008000000 : Reserved low area
//! code start   - code end     : Loaded module image (2 MiB aligned)
//! map base                    : Alias region (64 GiB)
//!              + alias size   : Heap region (6 GiB)
//!              + heap size    : Stack region (2 GiB)
//!              + stack size   : TLS/IO region (64 GiB)
//! ```

use static_assertions::const_assert;

pub mod allocator;
pub mod block;
pub mod block_allocator;
pub mod block_list;
pub mod flags;
pub mod ipc;
pub mod manager;
pub mod page_list;
pub mod region;
pub mod virtual_memory;

#[cfg(test)]
pub(crate) mod test_support;
#[cfg(test)]
mod tests_prop;

pub use allocator::{BuddyPageAllocator, Dram, PageAllocator};
pub use block::{MemoryBlock, MemoryInfo};
pub use block_allocator::MemoryBlockSlab;
pub use block_list::{BlockList, BlockMutation, RangeFilter};
pub use flags::{MemoryAttribute, MemoryPermission, MemoryState};
pub use manager::{AddressSpaceConfig, KernelContext, MemoryManager};
pub use page_list::{PageList, PageNode};
pub use region::{AddressSpaceLayout, AddressSpaceType, Region};
pub use virtual_memory::{HostMapper, PageTable};

/// Guest page size in bytes
pub const PAGE_SIZE: u64 = 0x1000;

/// Page size shift
pub const PAGE_SHIFT: u32 = 12;

/// Mask of the in-page offset bits
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Alignment of region placement and ASLR offsets (2 MiB)
pub const REGION_ALIGNMENT: u64 = 0x20_0000;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1u64 << PAGE_SHIFT == PAGE_SIZE);
const_assert!(REGION_ALIGNMENT % PAGE_SIZE == 0);

/// Round `value` down to a multiple of `align` (power of two)
#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (power of two)
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    align_down(value.wrapping_add(align - 1), align)
}

/// Whether `value` is page aligned
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}
