//! Shared fixtures for memory tests

use std::sync::Arc;

use super::allocator::{BuddyPageAllocator, Dram, PageAllocator};
use super::block_allocator::MemoryBlockSlab;
use super::manager::{AddressSpaceConfig, KernelContext, MemoryManager};
use super::page_list::PageList;
use super::region::AddressSpaceType;
use super::virtual_memory::PageTable;
use super::PAGE_SIZE;
use crate::process::{LimitableResource, ResourceLimit};

pub(crate) const DRAM_BASE: u64 = 0x8000_0000;
pub(crate) const DRAM_SIZE: usize = 16 << 20;
pub(crate) const BLOCK_CAPACITY: usize = 4096;

/// One process over a small emulated DRAM
pub(crate) struct Fixture {
    pub allocator: Arc<BuddyPageAllocator>,
    pub context: KernelContext,
    pub limit: Arc<ResourceLimit>,
    pub table: Arc<PageTable>,
    pub manager: MemoryManager,
}

impl Fixture {
    pub fn config() -> AddressSpaceConfig {
        AddressSpaceConfig::new(AddressSpaceType::Bits39, 0x800_0000, 0x10_0000)
    }

    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    pub fn with_config(config: AddressSpaceConfig) -> Self {
        Self::build(config, BLOCK_CAPACITY)
    }

    pub fn with_block_capacity(block_capacity: usize) -> Self {
        Self::build(Self::config(), block_capacity)
    }

    fn build(config: AddressSpaceConfig, block_capacity: usize) -> Self {
        let dram = Dram::new(DRAM_BASE, DRAM_SIZE);
        let allocator = Arc::new(BuddyPageAllocator::for_dram(&dram));
        let context = KernelContext {
            page_allocator: allocator.clone(),
            dram: Arc::new(dram),
            block_slab: Arc::new(MemoryBlockSlab::new(block_capacity)),
        };

        let limit = Arc::new(ResourceLimit::new());
        limit
            .set_limit_value(LimitableResource::Memory, DRAM_SIZE as u64)
            .unwrap();

        let table = Arc::new(PageTable::new());
        let manager = MemoryManager::new(
            config,
            context.clone(),
            table.clone(),
            Some(limit.clone()),
        )
        .unwrap();

        Self {
            allocator,
            context,
            limit,
            table,
            manager,
        }
    }

    /// Another process sharing this fixture's kernel context
    pub fn spawn(&self) -> MemoryManager {
        MemoryManager::new(
            Self::config(),
            self.context.clone(),
            Arc::new(PageTable::new()),
            None,
        )
        .unwrap()
    }

    pub fn free_pages(&self) -> u64 {
        self.allocator.free_pages_count()
    }

    pub fn allocate(&self, pages_count: u64) -> PageList {
        self.allocator.allocate_pages(pages_count).unwrap()
    }

    /// A free, page aligned address that `map_pages(SHARED_MEMORY)` accepts
    pub fn shared_address(&self) -> u64 {
        self.manager.stack_region().start
    }
}

/// Grow the heap to `pages_count` pages and return its base
pub(crate) fn heap_pages(manager: &MemoryManager, pages_count: u64) -> u64 {
    manager.set_heap_size(pages_count * PAGE_SIZE).unwrap()
}
