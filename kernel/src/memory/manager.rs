//! Memory Manager
//!
//! One [`MemoryManager`] per guest process. It owns the process's block list
//! and region layout and implements every kernel memory operation on top of
//! the partition engine.
//!
//! # Operation Shape
//!
//! Every mutating operation follows the same sequence, under the manager
//! lock:
//! 1. Validate the current signature of the affected ranges
//! 2. Confirm the block slab can supply the worst-case number of new blocks
//! 3. Mutate the host page table (reverting on failure)
//! 4. Commit the new signature with `insert_block`
//!
//! Nothing guest-visible changes unless every check passed.
//!
//! # Locking
//!
//! The manager lock is taken first; the page table, page allocator, DRAM and
//! resource limit locks are leaves taken under it. No operation holds two
//! manager locks at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use spin::Mutex;

use super::allocator::{Dram, PageAllocator};
use super::block::MemoryInfo;
use super::block_allocator::MemoryBlockSlab;
use super::block_list::{BlockList, BlockMutation, RangeFilter};
use super::flags::{MemoryAttribute, MemoryPermission, MemoryState};
use super::ipc::IpcMapping;
use super::page_list::PageList;
use super::region::{AddressSpaceLayout, AddressSpaceType, Region, random_in_range};
use super::virtual_memory::HostMapper;
use super::{BuddyPageAllocator, PAGE_MASK, PAGE_SIZE, align_down, is_page_aligned};
use crate::process::{LimitableResource, ResourceLimiter};
use crate::{KernelError, KernelResult};

/// Worst-case number of new blocks a single-range insertion creates
pub const MAX_BLOCKS_NEEDED_FOR_INSERTION: usize = 2;

/// Guard pages kept free before and after a searched placement
const GUARD_PAGES_COUNT: u64 = 4;

/// Random placements tried before falling back to a first-fit scan
const ASLR_PLACEMENT_ATTEMPTS: usize = 8;

/// Per-process address space configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceConfig {
    /// Address space flavor
    pub space_type: AddressSpaceType,
    /// Randomize region layout and placements
    pub aslr_enabled: bool,
    /// Seed of the ASLR generator
    pub aslr_seed: u64,
    /// Start of the main module image
    pub code_address: u64,
    /// Size of the main module image
    pub code_size: u64,
}

impl AddressSpaceConfig {
    /// Configuration with ASLR disabled
    pub const fn new(space_type: AddressSpaceType, code_address: u64, code_size: u64) -> Self {
        Self {
            space_type,
            aslr_enabled: false,
            aslr_seed: 0,
            code_address,
            code_size,
        }
    }

    /// Enable ASLR with a reproducible seed
    pub const fn with_aslr(mut self, seed: u64) -> Self {
        self.aslr_enabled = true;
        self.aslr_seed = seed;
        self
    }
}

/// Kernel-wide collaborators shared by every process
#[derive(Clone)]
pub struct KernelContext {
    /// Source of physical pages
    pub page_allocator: Arc<dyn PageAllocator>,
    /// Emulated physical memory
    pub dram: Arc<Dram>,
    /// Shared memory block budget
    pub block_slab: Arc<MemoryBlockSlab>,
}

impl KernelContext {
    /// Context over `dram`, with a buddy allocator covering all of it
    pub fn with_dram(dram: Dram, block_capacity: usize) -> Self {
        let page_allocator = Arc::new(BuddyPageAllocator::for_dram(&dram));
        Self {
            page_allocator,
            dram: Arc::new(dram),
            block_slab: Arc::new(MemoryBlockSlab::new(block_capacity)),
        }
    }
}

/// Mutable state guarded by the manager lock
pub(super) struct ManagerState {
    pub(super) blocks: BlockList,
    pub(super) current_heap_end: u64,
    pub(super) heap_capacity: u64,
    pub(super) physical_memory_usage: u64,
    pub(super) ipc_mappings: BTreeMap<u64, IpcMapping>,
    pub(super) rng: ChaCha20Rng,
}

/// Virtual memory manager of one guest process
pub struct MemoryManager {
    pub(super) layout: AddressSpaceLayout,
    pub(super) aslr_enabled: bool,
    pub(super) context: KernelContext,
    pub(super) mapper: Arc<dyn HostMapper>,
    pub(super) resource_limit: Option<Arc<dyn ResourceLimiter>>,
    pub(super) inner: Mutex<ManagerState>,
}

impl core::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("layout", &self.layout)
            .field("aslr_enabled", &self.aslr_enabled)
            .finish_non_exhaustive()
    }
}

/// Abort when a reverting host operation fails
pub(super) fn expect_revert(result: KernelResult<()>, what: &str) {
    if let Err(error) = result {
        fatal!("unexpected failure trying to {}: {}", what, error);
    }
}

impl MemoryManager {
    /// Create the address space of a new process.
    ///
    /// The whole space starts as a single unmapped block and the heap is
    /// empty.
    pub fn new(
        config: AddressSpaceConfig,
        context: KernelContext,
        mapper: Arc<dyn HostMapper>,
        resource_limit: Option<Arc<dyn ResourceLimiter>>,
    ) -> KernelResult<Self> {
        let mut rng = ChaCha20Rng::seed_from_u64(config.aslr_seed);
        let layout = AddressSpaceLayout::new(
            config.space_type,
            config.code_address,
            config.code_size,
            if config.aslr_enabled {
                Some(&mut rng as &mut dyn RngCore)
            } else {
                None
            },
        )?;

        let space = layout.addr_space();
        let blocks = BlockList::new(space.start, space.end, context.block_slab.clone())?;
        let heap_start = layout.heap_region().start;

        debug_print!(
            INFO,
            "created {}-bit address space (aslr {})",
            layout.addr_space_width(),
            if config.aslr_enabled { "on" } else { "off" }
        );

        Ok(Self {
            layout,
            aslr_enabled: config.aslr_enabled,
            context,
            mapper,
            resource_limit,
            inner: Mutex::new(ManagerState {
                blocks,
                current_heap_end: heap_start,
                heap_capacity: 0,
                physical_memory_usage: 0,
                ipc_mappings: BTreeMap::new(),
                rng,
            }),
        })
    }

    // ---- shared helpers -------------------------------------------------

    pub(super) fn ensure_capacity(&self, count: usize) -> KernelResult<()> {
        if self.context.block_slab.can_allocate(count) {
            Ok(())
        } else {
            debug_print!(DEBUG, "memory block slab exhausted");
            Err(KernelError::OutOfResource)
        }
    }

    fn reserve_memory(&self, size: u64) -> KernelResult<()> {
        match &self.resource_limit {
            Some(limit) if size != 0 && !limit.reserve(LimitableResource::Memory, size) => {
                Err(KernelError::ResLimitExceeded)
            }
            _ => Ok(()),
        }
    }

    fn release_memory(&self, size: u64) {
        if let Some(limit) = &self.resource_limit {
            if size != 0 {
                limit.release(LimitableResource::Memory, size);
            }
        }
    }

    /// Map the runs of `pages` back to back starting at `address`
    pub(super) fn map_page_list(
        &self,
        address: u64,
        pages: &PageList,
        permission: MemoryPermission,
    ) -> KernelResult<()> {
        let mut va = address;
        for node in pages {
            let size = node.pages_count * PAGE_SIZE;
            debug_print!(TRACE, "map {:#x} -> {:#x} ({:#x} bytes, {})", va, node.address, size, permission);

            if let Err(error) = self.mapper.map(va, node.address, size, permission) {
                if va != address {
                    expect_revert(self.mapper.unmap(address, va - address), "unmap partial mapping");
                }
                return Err(error);
            }
            va += size;
        }
        Ok(())
    }

    /// Physical pages currently backing `[address, address + pages_count)`
    pub(super) fn page_list_of(&self, address: u64, pages_count: u64) -> PageList {
        let mut pages = PageList::new();
        for index in 0..pages_count {
            if let Some(pa) = self.mapper.translate(address + index * PAGE_SIZE) {
                pages.add_range(pa, 1);
            }
        }
        pages
    }

    fn zero_pages(&self, pages: &PageList) -> KernelResult<()> {
        for node in pages {
            self.context.dram.fill(node.address, node.pages_count * PAGE_SIZE, 0)?;
        }
        Ok(())
    }

    fn allocate_and_map_pages(
        &self,
        address: u64,
        pages_count: u64,
        permission: MemoryPermission,
    ) -> KernelResult<()> {
        let pages = self.context.page_allocator.allocate_pages(pages_count)?;
        let result = self
            .zero_pages(&pages)
            .and_then(|()| self.map_page_list(address, &pages, permission));

        if result.is_err() {
            self.context.page_allocator.free_pages(&pages);
        }
        result
    }

    /// Find a free, guarded, aligned placement for `needed_pages` in a region
    pub(super) fn allocate_va(
        &self,
        state: &mut ManagerState,
        region_start: u64,
        region_pages: u64,
        needed_pages: u64,
        alignment: u64,
    ) -> Option<u64> {
        if alignment == 0 {
            return None;
        }

        let region_end = region_start + region_pages * PAGE_SIZE;

        if self.aslr_enabled {
            let total_needed_size = (GUARD_PAGES_COUNT + needed_pages) * PAGE_SIZE;
            let remaining_pages = region_pages.saturating_sub(needed_pages);
            let aslr_max_offset = ((remaining_pages + GUARD_PAGES_COUNT) * PAGE_SIZE) / alignment;

            for _ in 0..ASLR_PLACEMENT_ATTEMPTS {
                let offset = random_in_range(&mut state.rng, 0, aslr_max_offset);
                let address = align_down(region_start + offset * alignment, alignment);
                let end = address + total_needed_size;

                let Some(block) = state.blocks.find_block(address) else {
                    continue;
                };
                if block.state() != MemoryState::UNMAPPED {
                    continue;
                }

                let base = block.base_address() + GUARD_PAGES_COUNT * PAGE_SIZE;
                if address >= region_start
                    && address >= base
                    && end - 1 <= region_end - 1
                    && end - 1 <= block.end_address() - 1
                {
                    return Some(address);
                }
            }

            let aslr_page = random_in_range(&mut state.rng, 0, aslr_max_offset);
            if aslr_page < region_pages {
                let found = state.blocks.find_first_fit(
                    region_start + aslr_page * PAGE_SIZE,
                    region_pages - aslr_page,
                    needed_pages,
                    alignment,
                    0,
                    GUARD_PAGES_COUNT,
                );
                if found.is_some() {
                    return found;
                }
            }
        }

        state.blocks.find_first_fit(
            region_start,
            region_pages,
            needed_pages,
            alignment,
            0,
            GUARD_PAGES_COUNT,
        )
    }

    // ---- page mapping ---------------------------------------------------

    /// Map the caller-owned `pages` at `address` as `state`
    pub fn map_pages(
        &self,
        address: u64,
        pages: &PageList,
        state: MemoryState,
        permission: MemoryPermission,
    ) -> KernelResult<()> {
        let pages_count = pages.pages_count();
        let size = pages_count * PAGE_SIZE;

        if !self.layout.can_contain(address, size, state) {
            return Err(KernelError::InvalidMemState);
        }

        let mut inner = self.inner.lock();

        if !inner.blocks.is_unmapped(address, size) {
            return Err(KernelError::InvalidMemState);
        }

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;
        self.map_page_list(address, pages, permission)?;

        inner
            .blocks
            .insert_block(address, pages_count, BlockMutation::state(state, permission), None);
        Ok(())
    }

    /// Unmap `pages` from `address`; the range must still be backed by
    /// exactly those pages and be a single `state` range
    pub fn unmap_pages(&self, address: u64, pages: &PageList, state: MemoryState) -> KernelResult<()> {
        let pages_count = pages.pages_count();
        let size = pages_count * PAGE_SIZE;

        if !self.is_inside_addr_space(address, size) {
            return Err(KernelError::InvalidMemState);
        }

        let mut inner = self.inner.lock();

        if self.page_list_of(address, pages_count) != *pages {
            return Err(KernelError::InvalidMemRange);
        }

        inner
            .blocks
            .check_range(
                address,
                size,
                MemoryState::MASK,
                state,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                MemoryAttribute::NONE,
                MemoryAttribute::IPC_AND_DEVICE_MAPPED,
            )
            .ok_or(KernelError::InvalidMemState)?;

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        debug_print!(TRACE, "unmap {:#x} ({:#x} bytes)", address, size);
        self.mapper.unmap(address, size)?;

        inner.blocks.insert_block(
            address,
            pages_count,
            BlockMutation::state(MemoryState::UNMAPPED, MemoryPermission::NONE),
            None,
        );
        Ok(())
    }

    /// Map `pages_count` pages somewhere in a region and return the address.
    ///
    /// With `src_pa` the physically contiguous run starting there is mapped
    /// and becomes owned by the mapping; otherwise fresh zeroed pages are
    /// allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn map_pages_find_free(
        &self,
        pages_count: u64,
        alignment: u64,
        src_pa: Option<u64>,
        region_start: u64,
        region_pages: u64,
        state: MemoryState,
        permission: MemoryPermission,
    ) -> KernelResult<u64> {
        if alignment == 0 {
            return Err(KernelError::InvalidAddress);
        }

        let region_size = region_pages * PAGE_SIZE;

        if !self.layout.can_contain(region_start, region_size, state) {
            return Err(KernelError::InvalidMemState);
        }

        if region_pages <= pages_count {
            return Err(KernelError::OutOfMemory);
        }

        let mut inner = self.inner.lock();

        let address = self
            .allocate_va(&mut inner, region_start, region_pages, pages_count, alignment)
            .ok_or(KernelError::OutOfMemory)?;

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        match src_pa {
            Some(pa) => {
                let size = pages_count * PAGE_SIZE;
                debug_print!(TRACE, "map {:#x} -> {:#x} ({:#x} bytes, {})", address, pa, size, permission);
                self.mapper.map(address, pa, size, permission)?;
            }
            None => self.allocate_and_map_pages(address, pages_count, permission)?,
        }

        inner
            .blocks
            .insert_block(address, pages_count, BlockMutation::state(state, permission), None);
        Ok(address)
    }

    /// Map fresh zeroed pages at `address` for a newly loaded module
    pub fn map_new_process_code(
        &self,
        address: u64,
        pages_count: u64,
        state: MemoryState,
        permission: MemoryPermission,
    ) -> KernelResult<()> {
        let size = pages_count * PAGE_SIZE;

        if !self.layout.can_contain(address, size, state) {
            return Err(KernelError::InvalidMemState);
        }

        let mut inner = self.inner.lock();

        if !inner.blocks.is_unmapped(address, size) {
            return Err(KernelError::InvalidMemState);
        }

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;
        self.allocate_and_map_pages(address, pages_count, permission)?;

        inner
            .blocks
            .insert_block(address, pages_count, BlockMutation::state(state, permission), None);
        Ok(())
    }

    /// Unmap kernel-owned pages of `state` and free them.
    ///
    /// Only states whose pages belong to the mapping itself are accepted.
    /// Heap, aliases, IPC buffers, shared and transfer memory have owners of
    /// their own and are `InvalidMemState` here.
    pub fn unmap_for_kernel(&self, address: u64, pages_count: u64, state: MemoryState) -> KernelResult<()> {
        if !state.is_kernel_owned() {
            debug_print!(DEBUG, "refusing to free pages of {}", state);
            return Err(KernelError::InvalidMemState);
        }

        let size = pages_count * PAGE_SIZE;
        let mut inner = self.inner.lock();

        inner
            .blocks
            .check_range(
                address,
                size,
                MemoryState::MASK,
                state,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                MemoryAttribute::NONE,
                MemoryAttribute::IPC_AND_DEVICE_MAPPED,
            )
            .ok_or(KernelError::InvalidMemState)?;

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        let pages = self.page_list_of(address, pages_count);
        debug_print!(TRACE, "unmap {:#x} ({:#x} bytes)", address, size);
        self.mapper.unmap(address, size)?;
        self.context.page_allocator.free_pages(&pages);

        inner.blocks.insert_block(
            address,
            pages_count,
            BlockMutation::state(MemoryState::UNMAPPED, MemoryPermission::NONE),
            None,
        );
        Ok(())
    }

    // ---- process code ---------------------------------------------------

    /// Alias heap pages at `src` as module code at `dst`.
    ///
    /// The source becomes inaccessible and borrowed; the destination is
    /// mapped with no permission as `ModCodeStatic`.
    pub fn map_process_code_memory(&self, dst: u64, src: u64, size: u64) -> KernelResult<()> {
        let mut inner = self.inner.lock();

        let source = inner.blocks.check_range(
            src,
            size,
            MemoryState::MASK,
            MemoryState::HEAP,
            MemoryPermission::MASK,
            MemoryPermission::READ_AND_WRITE,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
            MemoryAttribute::IPC_AND_DEVICE_MAPPED,
        );

        let Some((state, permission, _)) = source else {
            return Err(KernelError::InvalidMemState);
        };
        if !inner.blocks.is_unmapped(dst, size) {
            return Err(KernelError::InvalidMemState);
        }

        let pages_count = size / PAGE_SIZE;
        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION * 2)?;

        let pages = self.page_list_of(src, pages_count);

        self.mapper.reprotect(src, size, MemoryPermission::NONE)?;

        if let Err(error) = self.map_page_list(dst, &pages, MemoryPermission::NONE) {
            expect_revert(
                self.mapper.reprotect(src, size, permission),
                "restore source permission",
            );
            return Err(error);
        }

        inner.blocks.insert_block(
            src,
            pages_count,
            BlockMutation::Overwrite {
                state,
                permission: MemoryPermission::NONE,
                attribute: MemoryAttribute::BORROWED,
            },
            None,
        );
        inner.blocks.insert_block(
            dst,
            pages_count,
            BlockMutation::state(MemoryState::MOD_CODE_STATIC, MemoryPermission::NONE),
            None,
        );
        Ok(())
    }

    /// Tear down a module alias made by [`Self::map_process_code_memory`]
    /// and give the heap pages back to the source
    pub fn unmap_process_code_memory(&self, dst: u64, src: u64, size: u64) -> KernelResult<()> {
        let mut inner = self.inner.lock();

        let source_ok = inner
            .blocks
            .check_range(
                src,
                size,
                MemoryState::MASK,
                MemoryState::HEAP,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                MemoryAttribute::BORROWED,
                MemoryAttribute::IPC_AND_DEVICE_MAPPED,
            )
            .is_some();

        let destination = inner.blocks.check_range(
            dst,
            PAGE_SIZE,
            MemoryState::UNMAP_PROCESS_CODE_MEMORY_ALLOWED,
            MemoryState::UNMAP_PROCESS_CODE_MEMORY_ALLOWED,
            MemoryPermission::NONE,
            MemoryPermission::NONE,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
            MemoryAttribute::IPC_AND_DEVICE_MAPPED,
        );

        let Some((dst_state, dst_permission, _)) = destination.filter(|_| source_ok) else {
            return Err(KernelError::InvalidMemState);
        };

        if !inner.blocks.check_range_all(
            dst,
            size,
            MemoryState::MASK,
            dst_state,
            MemoryPermission::NONE,
            MemoryPermission::NONE,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
        ) {
            return Err(KernelError::InvalidMemState);
        }

        // TODO: reject the call when dst is no longer backed by the pages of src
        let pages_count = size / PAGE_SIZE;
        let dst_pages = self.page_list_of(dst, pages_count);

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION * 2)?;

        self.mapper.unmap(dst, size)?;

        if let Err(error) = self
            .mapper
            .reprotect(src, size, MemoryPermission::READ_AND_WRITE)
        {
            expect_revert(
                self.map_page_list(dst, &dst_pages, dst_permission),
                "remap module code",
            );
            return Err(error);
        }

        inner.blocks.insert_block(
            dst,
            pages_count,
            BlockMutation::state(MemoryState::UNMAPPED, MemoryPermission::NONE),
            None,
        );
        inner.blocks.insert_block(
            src,
            pages_count,
            BlockMutation::state(MemoryState::HEAP, MemoryPermission::READ_AND_WRITE),
            None,
        );
        Ok(())
    }

    /// Change the permission of loaded code.
    ///
    /// Granting write turns static code into its mutable state.
    pub fn set_process_memory_permission(
        &self,
        address: u64,
        size: u64,
        permission: MemoryPermission,
    ) -> KernelResult<()> {
        let mut inner = self.inner.lock();

        let (old_state, old_permission, _) = inner
            .blocks
            .check_range(
                address,
                size,
                MemoryState::PROCESS_PERMISSION_CHANGE_ALLOWED,
                MemoryState::PROCESS_PERMISSION_CHANGE_ALLOWED,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                MemoryAttribute::NONE,
                MemoryAttribute::IPC_AND_DEVICE_MAPPED,
            )
            .ok_or(KernelError::InvalidMemState)?;

        let new_state = if permission.contains(MemoryPermission::WRITE) {
            match old_state {
                MemoryState::CODE_STATIC => MemoryState::CODE_MUTABLE,
                MemoryState::MOD_CODE_STATIC => MemoryState::MOD_CODE_MUTABLE,
                _ => return Err(KernelError::InvalidMemState),
            }
        } else {
            old_state
        };

        if new_state == old_state && permission == old_permission {
            return Ok(());
        }

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        let pages_count = size / PAGE_SIZE;
        debug_print!(TRACE, "reprotect {:#x} ({:#x} bytes) {} -> {}", address, size, old_permission, permission);
        self.mapper.reprotect(address, size, permission)?;

        inner.blocks.insert_block(
            address,
            pages_count,
            BlockMutation::state(new_state, permission),
            None,
        );
        Ok(())
    }

    // ---- heap -----------------------------------------------------------

    /// Resize the heap to `size` bytes and return the heap base.
    ///
    /// The heap is always the single range `[heap_start, heap_start + size)`.
    pub fn set_heap_size(&self, size: u64) -> KernelResult<u64> {
        let heap = self.layout.heap_region();

        if !is_page_aligned(size) {
            return Err(KernelError::InvalidSize);
        }
        if size > heap.size() {
            return Err(KernelError::OutOfMemory);
        }

        let mut inner = self.inner.lock();

        if inner.heap_capacity != 0 && size > inner.heap_capacity {
            debug_print!(DEBUG, "heap size {:#x} exceeds capacity {:#x}", size, inner.heap_capacity);
            return Err(KernelError::OutOfMemory);
        }

        let current_size = inner.current_heap_end - heap.start;

        if size > current_size {
            let delta = size - current_size;
            let pages_count = delta / PAGE_SIZE;
            let address = inner.current_heap_end;

            self.reserve_memory(delta)?;

            if let Err(error) = self.expand_heap(&inner.blocks, address, pages_count) {
                self.release_memory(delta);
                return Err(error);
            }

            inner.blocks.insert_block(
                address,
                pages_count,
                BlockMutation::state(MemoryState::HEAP, MemoryPermission::READ_AND_WRITE),
                None,
            );
        } else if size < current_size {
            let free_address = heap.start + size;
            let delta = current_size - size;
            let pages_count = delta / PAGE_SIZE;

            self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

            inner
                .blocks
                .check_range(
                    free_address,
                    delta,
                    MemoryState::MASK,
                    MemoryState::HEAP,
                    MemoryPermission::MASK,
                    MemoryPermission::READ_AND_WRITE,
                    MemoryAttribute::MASK,
                    MemoryAttribute::NONE,
                    MemoryAttribute::IPC_AND_DEVICE_MAPPED,
                )
                .ok_or(KernelError::InvalidMemState)?;

            let pages = self.page_list_of(free_address, pages_count);

            debug_print!(TRACE, "unmap {:#x} ({:#x} bytes)", free_address, delta);
            self.mapper.unmap(free_address, delta)?;
            self.context.page_allocator.free_pages(&pages);
            self.release_memory(delta);

            inner.blocks.insert_block(
                free_address,
                pages_count,
                BlockMutation::state(MemoryState::UNMAPPED, MemoryPermission::NONE),
                None,
            );
        }

        inner.current_heap_end = heap.start + size;
        Ok(heap.start)
    }

    fn expand_heap(&self, blocks: &BlockList, address: u64, pages_count: u64) -> KernelResult<()> {
        let pages = self.context.page_allocator.allocate_pages(pages_count)?;

        let result = self
            .ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)
            .and_then(|()| {
                if blocks.is_unmapped(address, pages_count * PAGE_SIZE) {
                    Ok(())
                } else {
                    Err(KernelError::InvalidMemState)
                }
            })
            .and_then(|()| self.zero_pages(&pages))
            .and_then(|()| self.map_page_list(address, &pages, MemoryPermission::READ_AND_WRITE));

        if result.is_err() {
            self.context.page_allocator.free_pages(&pages);
        }
        result
    }

    /// Current heap size in bytes
    pub fn heap_size(&self) -> u64 {
        self.inner.lock().current_heap_end - self.layout.heap_region().start
    }

    /// Heap size plus memory mapped with [`Self::map_physical_memory`]
    pub fn total_heap_size(&self) -> u64 {
        let inner = self.inner.lock();
        inner.current_heap_end - self.layout.heap_region().start + inner.physical_memory_usage
    }

    /// Cap the size [`Self::set_heap_size`] accepts; zero removes the cap
    pub fn set_heap_capacity(&self, capacity: u64) {
        self.inner.lock().heap_capacity = capacity;
    }

    /// Heap capacity granted to the process
    pub fn heap_capacity(&self) -> u64 {
        self.inner.lock().heap_capacity
    }

    /// Bytes mapped with [`Self::map_physical_memory`]
    pub fn physical_memory_usage(&self) -> u64 {
        self.inner.lock().physical_memory_usage
    }

    // ---- attributes and queries -----------------------------------------

    /// Set the attribute bits selected by `mask` to `value`
    pub fn set_memory_attribute(
        &self,
        address: u64,
        size: u64,
        mask: MemoryAttribute,
        value: MemoryAttribute,
    ) -> KernelResult<()> {
        let mut inner = self.inner.lock();

        let (state, permission, attribute) = inner
            .blocks
            .check_range(
                address,
                size,
                MemoryState::ATTRIBUTE_CHANGE_ALLOWED,
                MemoryState::ATTRIBUTE_CHANGE_ALLOWED,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::BORROWED_AND_IPC_MAPPED,
                MemoryAttribute::NONE,
                MemoryAttribute::DEVICE_MAPPED_AND_UNCACHED,
            )
            .ok_or(KernelError::InvalidMemState)?;

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        let attribute = (attribute & !mask) | (mask & value);
        inner.blocks.insert_block(
            address,
            size / PAGE_SIZE,
            BlockMutation::Overwrite {
                state,
                permission,
                attribute,
            },
            None,
        );
        Ok(())
    }

    /// Snapshot of the block containing `address`.
    ///
    /// Outside the address space a synthetic `Reserved` range covering
    /// everything past the end is returned.
    pub fn query_memory(&self, address: u64) -> MemoryInfo {
        let space = self.layout.addr_space();
        if address >= space.start && address < space.end {
            if let Some(block) = self.inner.lock().blocks.find_block(address) {
                return block.info();
            }
        }

        MemoryInfo {
            address: space.end,
            size: (!space.end).wrapping_add(1),
            state: MemoryState::RESERVED,
            permission: MemoryPermission::NONE,
            attribute: MemoryAttribute::NONE,
            source_permission: MemoryPermission::NONE,
            ipc_ref_count: 0,
            device_ref_count: 0,
        }
    }

    // ---- stack aliasing -------------------------------------------------

    /// Alias `size` bytes of `src` at `dst` in the stack region.
    ///
    /// The source stays mapped but becomes inaccessible and borrowed until
    /// [`Self::unmap`] is called with the same arguments.
    pub fn map(&self, dst: u64, src: u64, size: u64) -> KernelResult<()> {
        if !self.is_inside_stack_region(dst, size) {
            return Err(KernelError::InvalidMemRange);
        }

        let mut inner = self.inner.lock();

        let source = inner.blocks.check_range(
            src,
            size,
            MemoryState::MAP_ALLOWED,
            MemoryState::MAP_ALLOWED,
            MemoryPermission::MASK,
            MemoryPermission::READ_AND_WRITE,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
            MemoryAttribute::IPC_AND_DEVICE_MAPPED,
        );

        let Some((src_state, _, _)) = source else {
            return Err(KernelError::InvalidMemState);
        };
        if !inner.blocks.is_unmapped(dst, size) {
            return Err(KernelError::InvalidMemState);
        }

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION * 2)?;

        let pages_count = size / PAGE_SIZE;
        let pages = self.page_list_of(src, pages_count);

        self.mapper.reprotect(src, size, MemoryPermission::NONE)?;

        if let Err(error) = self.map_page_list(dst, &pages, MemoryPermission::READ_AND_WRITE) {
            expect_revert(
                self.mapper
                    .reprotect(src, size, MemoryPermission::READ_AND_WRITE),
                "restore source permission",
            );
            return Err(error);
        }

        inner.blocks.insert_block(
            src,
            pages_count,
            BlockMutation::Overwrite {
                state: src_state,
                permission: MemoryPermission::NONE,
                attribute: MemoryAttribute::BORROWED,
            },
            None,
        );
        inner.blocks.insert_block(
            dst,
            pages_count,
            BlockMutation::state(MemoryState::STACK, MemoryPermission::READ_AND_WRITE),
            None,
        );
        Ok(())
    }

    /// Undo [`Self::map`]; `dst` must still alias exactly the pages of `src`
    pub fn unmap(&self, dst: u64, src: u64, size: u64) -> KernelResult<()> {
        if !self.is_inside_stack_region(dst, size) {
            return Err(KernelError::InvalidMemRange);
        }

        let mut inner = self.inner.lock();

        let source = inner.blocks.check_range(
            src,
            size,
            MemoryState::MAP_ALLOWED,
            MemoryState::MAP_ALLOWED,
            MemoryPermission::MASK,
            MemoryPermission::NONE,
            MemoryAttribute::MASK,
            MemoryAttribute::BORROWED,
            MemoryAttribute::IPC_AND_DEVICE_MAPPED,
        );

        let destination = inner.blocks.check_range(
            dst,
            size,
            MemoryState::MASK,
            MemoryState::STACK,
            MemoryPermission::NONE,
            MemoryPermission::NONE,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
            MemoryAttribute::IPC_AND_DEVICE_MAPPED,
        );

        let (Some((src_state, _, _)), Some((_, dst_permission, _))) = (source, destination) else {
            return Err(KernelError::InvalidMemState);
        };

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION * 2)?;

        let pages_count = size / PAGE_SIZE;
        let src_pages = self.page_list_of(src, pages_count);
        let dst_pages = self.page_list_of(dst, pages_count);

        if src_pages != dst_pages {
            return Err(KernelError::InvalidMemRange);
        }

        self.mapper.unmap(dst, size)?;

        if let Err(error) = self
            .mapper
            .reprotect(src, size, MemoryPermission::READ_AND_WRITE)
        {
            expect_revert(
                self.map_page_list(dst, &dst_pages, dst_permission),
                "remap stack alias",
            );
            return Err(error);
        }

        inner.blocks.insert_block(
            src,
            pages_count,
            BlockMutation::state(src_state, MemoryPermission::READ_AND_WRITE),
            None,
        );
        inner.blocks.insert_block(
            dst,
            pages_count,
            BlockMutation::state(MemoryState::UNMAPPED, MemoryPermission::NONE),
            None,
        );
        Ok(())
    }

    // ---- physical memory donation ---------------------------------------

    /// Back every unmapped hole of an alias-region range with fresh heap
    /// pages; already mapped parts are left alone
    pub fn map_physical_memory(&self, address: u64, size: u64) -> KernelResult<()> {
        if !self.is_inside_alias_region(address, size) {
            return Err(KernelError::InvalidMemRange);
        }

        let end = address + size;
        let mut inner = self.inner.lock();

        let holes: Vec<(u64, u64)> = inner
            .blocks
            .iter_range(address, end)
            .filter(|info| info.state == MemoryState::UNMAPPED)
            .map(|info| (info.address_in_range(address), info.size_in_range(address, end)))
            .collect();

        let unmapped_size: u64 = holes.iter().map(|(_, size)| size).sum();
        if unmapped_size == 0 {
            return Ok(());
        }

        self.reserve_memory(unmapped_size)?;

        let pages = match self.context.page_allocator.allocate_pages(unmapped_size / PAGE_SIZE) {
            Ok(pages) => pages,
            Err(error) => {
                self.release_memory(unmapped_size);
                return Err(error);
            }
        };

        let mut mapped = Vec::new();
        let result = self
            .ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)
            .and_then(|()| self.zero_pages(&pages))
            .and_then(|()| self.map_into_holes(&holes, &pages, &mut mapped));

        if let Err(error) = result {
            for (va, size) in mapped {
                expect_revert(self.mapper.unmap(va, size), "unmap donated memory");
            }
            self.context.page_allocator.free_pages(&pages);
            self.release_memory(unmapped_size);
            return Err(error);
        }

        inner.physical_memory_usage += unmapped_size;
        inner.blocks.insert_block(
            address,
            size / PAGE_SIZE,
            BlockMutation::state(MemoryState::HEAP, MemoryPermission::READ_AND_WRITE),
            Some(RangeFilter {
                state: MemoryState::UNMAPPED,
                permission: MemoryPermission::NONE,
                attribute: MemoryAttribute::NONE,
            }),
        );
        Ok(())
    }

    fn map_into_holes(
        &self,
        holes: &[(u64, u64)],
        pages: &PageList,
        mapped: &mut Vec<(u64, u64)>,
    ) -> KernelResult<()> {
        let mut nodes = pages.iter().copied();
        let (mut pa, mut pa_pages) = (0, 0);

        for &(hole_address, hole_size) in holes {
            let mut va = hole_address;
            let mut va_pages = hole_size / PAGE_SIZE;

            while va_pages != 0 {
                if pa_pages == 0 {
                    let node = nodes.next().ok_or(KernelError::OutOfMemory)?;
                    pa = node.address;
                    pa_pages = node.pages_count;
                }

                let count = pa_pages.min(va_pages);
                let size = count * PAGE_SIZE;
                debug_print!(TRACE, "map {:#x} -> {:#x} ({:#x} bytes, RW-)", va, pa, size);
                self.mapper
                    .map(va, pa, size, MemoryPermission::READ_AND_WRITE)?;
                mapped.push((va, size));

                va += size;
                pa += size;
                pa_pages -= count;
                va_pages -= count;
            }
        }

        Ok(())
    }

    /// Unmap and free every donated heap piece of an alias-region range
    pub fn unmap_physical_memory(&self, address: u64, size: u64) -> KernelResult<()> {
        if !self.is_inside_alias_region(address, size) {
            return Err(KernelError::InvalidMemRange);
        }

        let end = address + size;
        let mut inner = self.inner.lock();

        let mut pieces = Vec::new();
        for info in inner.blocks.iter_range(address, end) {
            if info.state == MemoryState::HEAP {
                if info.attribute != MemoryAttribute::NONE {
                    return Err(KernelError::InvalidMemState);
                }
                pieces.push((info.address_in_range(address), info.size_in_range(address, end)));
            } else if info.state != MemoryState::UNMAPPED {
                return Err(KernelError::InvalidMemState);
            }
        }

        let heap_mapped_size: u64 = pieces.iter().map(|(_, size)| size).sum();
        if heap_mapped_size == 0 {
            return Ok(());
        }

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        let backing: Vec<PageList> = pieces
            .iter()
            .map(|&(va, size)| self.page_list_of(va, size / PAGE_SIZE))
            .collect();

        for (index, &(va, size)) in pieces.iter().enumerate() {
            debug_print!(TRACE, "unmap {:#x} ({:#x} bytes)", va, size);
            if let Err(error) = self.mapper.unmap(va, size) {
                for (&(va, _), pages) in pieces.iter().zip(&backing).take(index) {
                    expect_revert(
                        self.map_page_list(va, pages, MemoryPermission::READ_AND_WRITE),
                        "remap donated memory",
                    );
                }
                return Err(error);
            }
        }

        for pages in &backing {
            self.context.page_allocator.free_pages(pages);
        }

        inner.physical_memory_usage = inner.physical_memory_usage.saturating_sub(heap_mapped_size);
        self.release_memory(heap_mapped_size);

        inner.blocks.insert_block(
            address,
            size / PAGE_SIZE,
            BlockMutation::state(MemoryState::UNMAPPED, MemoryPermission::NONE),
            None,
        );
        Ok(())
    }

    // ---- stubs ----------------------------------------------------------

    /// Map normal memory (not supported yet: succeeds without mapping)
    pub fn map_normal_memory(&self, address: u64, size: u64, permission: MemoryPermission) -> KernelResult<()> {
        debug_print!(
            WARN,
            "stubbed map_normal_memory({:#x}, {:#x}, {})",
            address,
            size,
            permission
        );
        Ok(())
    }

    /// Map device IO memory (not supported yet: succeeds without mapping)
    pub fn map_io_memory(&self, address: u64, size: u64, permission: MemoryPermission) -> KernelResult<()> {
        debug_print!(
            WARN,
            "stubbed map_io_memory({:#x}, {:#x}, {})",
            address,
            size,
            permission
        );
        Ok(())
    }

    // ---- user copies ----------------------------------------------------

    /// Copy `size` bytes from `src` in this (client) address space to `dst`
    /// in `current` (server) after checking every covered client block
    #[allow(clippy::too_many_arguments)]
    pub fn copy_data_to_current_process(
        &self,
        current: &MemoryManager,
        dst: u64,
        size: u64,
        src: u64,
        state_mask: MemoryState,
        state_expected: MemoryState,
        permission: MemoryPermission,
        attribute_mask: MemoryAttribute,
        attribute_expected: MemoryAttribute,
    ) -> KernelResult<()> {
        self.copy_data_with_current_process(
            current,
            size,
            src,
            dst,
            (state_mask, state_expected),
            permission,
            (attribute_mask, attribute_expected),
            true,
        )
    }

    /// Copy `size` bytes from `src` in `current` (server) to `dst` in this
    /// (client) address space after checking every covered client block
    #[allow(clippy::too_many_arguments)]
    pub fn copy_data_from_current_process(
        &self,
        current: &MemoryManager,
        dst: u64,
        size: u64,
        state_mask: MemoryState,
        state_expected: MemoryState,
        permission: MemoryPermission,
        attribute_mask: MemoryAttribute,
        attribute_expected: MemoryAttribute,
        src: u64,
    ) -> KernelResult<()> {
        self.copy_data_with_current_process(
            current,
            size,
            dst,
            src,
            (state_mask, state_expected),
            permission,
            (attribute_mask, attribute_expected),
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_data_with_current_process(
        &self,
        current: &MemoryManager,
        size: u64,
        client_address: u64,
        server_address: u64,
        (state_mask, state_expected): (MemoryState, MemoryState),
        permission: MemoryPermission,
        (attribute_mask, attribute_expected): (MemoryAttribute, MemoryAttribute),
        to_server: bool,
    ) -> KernelResult<()> {
        let client_end = client_address
            .checked_add(size)
            .filter(|end| *end > client_address)
            .ok_or(KernelError::InvalidMemState)?;
        let space = self.layout.addr_space();
        if client_address < space.start || client_end - 1 > space.end - 1 {
            return Err(KernelError::InvalidMemState);
        }

        let inner = self.inner.lock();

        if !inner.blocks.check_range_all(
            client_address,
            size,
            state_mask,
            state_expected,
            permission,
            permission,
            attribute_mask | MemoryAttribute::UNCACHED,
            attribute_expected,
        ) {
            return Err(KernelError::InvalidMemState);
        }

        let mut buffer = vec![0u8; PAGE_SIZE as usize];
        let mut copied = 0;
        while copied < size {
            let chunk = (size - copied).min(PAGE_SIZE) as usize;
            let buffer = &mut buffer[..chunk];

            if to_server {
                self.read_memory(client_address + copied, buffer)?;
                current.write_memory(server_address + copied, buffer)?;
            } else {
                current.read_memory(server_address + copied, buffer)?;
                self.write_memory(client_address + copied, buffer)?;
            }

            copied += chunk as u64;
        }

        drop(inner);
        Ok(())
    }

    // ---- guest memory access --------------------------------------------

    /// Physical address backing `va`, if mapped
    pub fn translate(&self, va: u64) -> Option<u64> {
        self.mapper.translate(va)
    }

    /// Read guest memory through the page table, ignoring permissions
    pub fn read_memory(&self, address: u64, buf: &mut [u8]) -> KernelResult<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let va = address + offset as u64;
            let chunk = ((PAGE_SIZE - (va & PAGE_MASK)) as usize).min(buf.len() - offset);
            let pa = self.mapper.translate(va).ok_or(KernelError::InvalidAddress)?;

            self.context.dram.read(pa, &mut buf[offset..offset + chunk])?;
            offset += chunk;
        }
        Ok(())
    }

    /// Write guest memory through the page table, ignoring permissions
    pub fn write_memory(&self, address: u64, data: &[u8]) -> KernelResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let va = address + offset as u64;
            let chunk = ((PAGE_SIZE - (va & PAGE_MASK)) as usize).min(data.len() - offset);
            let pa = self.mapper.translate(va).ok_or(KernelError::InvalidAddress)?;

            self.context.dram.write(pa, &data[offset..offset + chunk])?;
            offset += chunk;
        }
        Ok(())
    }

    // ---- layout queries -------------------------------------------------

    /// Region layout of this address space
    pub fn layout(&self) -> &AddressSpaceLayout {
        &self.layout
    }

    /// Address width in bits
    pub fn addr_space_width(&self) -> u32 {
        self.layout.addr_space_width()
    }

    /// Base of the range code-like states may live in
    pub fn addr_space_base(&self) -> u64 {
        self.layout.addr_space_base()
    }

    /// Size of the range code-like states may live in
    pub fn addr_space_size(&self) -> u64 {
        self.layout.addr_space_size()
    }

    /// Whether the range lies within the address space
    pub fn is_inside_addr_space(&self, address: u64, size: u64) -> bool {
        self.layout.addr_space().contains_range(address, size)
    }

    /// Whether the range lies within the alias region
    pub fn is_inside_alias_region(&self, address: u64, size: u64) -> bool {
        self.layout.alias_region().contains_range(address, size)
    }

    /// Whether the range lies within the heap region
    pub fn is_inside_heap_region(&self, address: u64, size: u64) -> bool {
        self.layout.heap_region().contains_range(address, size)
    }

    /// Whether the range lies within the stack region
    pub fn is_inside_stack_region(&self, address: u64, size: u64) -> bool {
        self.layout.stack_region().contains_range(address, size)
    }

    /// Whether the range does not touch the stack region
    pub fn is_outside_stack_region(&self, address: u64, size: u64) -> bool {
        self.layout.stack_region().excludes_range(address, size)
    }

    /// Whether the range lies past the code-like range
    pub fn is_invalid_region(&self, address: u64, size: u64) -> bool {
        self.layout.is_invalid_region(address, size)
    }

    /// Heap region bounds
    pub fn heap_region(&self) -> Region {
        self.layout.heap_region()
    }

    /// Alias region bounds
    pub fn alias_region(&self) -> Region {
        self.layout.alias_region()
    }

    /// Stack region bounds
    pub fn stack_region(&self) -> Region {
        self.layout.stack_region()
    }

    /// TLS/IO region bounds
    pub fn tls_io_region(&self) -> Region {
        self.layout.tls_io_region()
    }

    // ---- diagnostics ----------------------------------------------------

    /// Number of blocks in the partition
    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Snapshot of every block, in address order
    pub fn blocks(&self) -> Vec<MemoryInfo> {
        self.inner.lock().blocks.iter().map(|block| block.info()).collect()
    }

    /// Check the partition invariants; a violation is fatal
    pub fn validate_internal_state(&self) {
        self.inner.lock().blocks.validate_internal_state();
    }
}
