//! Fixture shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use hle_kernel::memory::{
    AddressSpaceConfig, AddressSpaceType, BuddyPageAllocator, Dram, KernelContext, MemoryBlockSlab,
    MemoryManager, PAGE_SIZE, PageTable,
};
use hle_kernel::process::{LimitableResource, ResourceLimit};

pub const DRAM_BASE: u64 = 0x8000_0000;
pub const DRAM_SIZE: usize = 32 << 20;
pub const CODE_ADDRESS: u64 = 0x800_0000;
pub const CODE_SIZE: u64 = 0x10_0000;

pub struct Kernel {
    pub allocator: Arc<BuddyPageAllocator>,
    pub context: KernelContext,
}

impl Kernel {
    pub fn new(block_capacity: usize) -> Self {
        let dram = Dram::new(DRAM_BASE, DRAM_SIZE);
        let allocator = Arc::new(BuddyPageAllocator::for_dram(&dram));
        let context = KernelContext {
            page_allocator: allocator.clone(),
            dram: Arc::new(dram),
            block_slab: Arc::new(MemoryBlockSlab::new(block_capacity)),
        };
        Self { allocator, context }
    }

    pub fn process(&self, space_type: AddressSpaceType) -> Process {
        self.process_with(AddressSpaceConfig::new(space_type, CODE_ADDRESS, CODE_SIZE))
    }

    pub fn process_with(&self, config: AddressSpaceConfig) -> Process {
        let limit = Arc::new(ResourceLimit::new());
        limit
            .set_limit_value(LimitableResource::Memory, DRAM_SIZE as u64)
            .unwrap();

        let table = Arc::new(PageTable::new());
        let manager =
            MemoryManager::new(config, self.context.clone(), table.clone(), Some(limit.clone()))
                .unwrap();

        Process {
            manager,
            table,
            limit,
        }
    }

    pub fn free_pages(&self) -> u64 {
        self.allocator.free_pages_count()
    }
}

pub struct Process {
    pub manager: MemoryManager,
    pub table: Arc<PageTable>,
    pub limit: Arc<ResourceLimit>,
}

impl Process {
    pub fn heap(&self, pages_count: u64) -> u64 {
        self.manager.set_heap_size(pages_count * PAGE_SIZE).unwrap()
    }
}
