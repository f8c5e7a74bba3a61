//! Shared Memory Objects
//!
//! A shared memory object owns a run of physical pages that any number of
//! processes can map. The owner and the other users each get a fixed
//! permission, chosen at creation.

use std::sync::Arc;

use crate::memory::{
    MemoryManager, MemoryPermission, MemoryState, PAGE_SIZE, PageAllocator, PageList, align_up,
};
use crate::{KernelError, KernelResult};

/// Physical pages mappable into several address spaces
pub struct SharedMemory {
    allocator: Arc<dyn PageAllocator>,
    pages: PageList,
    size: u64,
    owner_permission: MemoryPermission,
    user_permission: MemoryPermission,
}

impl core::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("size", &self.size)
            .field("owner_permission", &self.owner_permission)
            .field("user_permission", &self.user_permission)
            .finish_non_exhaustive()
    }
}

impl SharedMemory {
    /// Allocate `size` bytes (rounded up to pages) of backing memory
    pub fn new(
        allocator: Arc<dyn PageAllocator>,
        size: u64,
        owner_permission: MemoryPermission,
        user_permission: MemoryPermission,
    ) -> KernelResult<Self> {
        let size = align_up(size, PAGE_SIZE);
        if size == 0 {
            return Err(KernelError::InvalidSize);
        }

        let pages = allocator.allocate_pages(size / PAGE_SIZE)?;

        debug_print!(DEBUG, "shared memory of {:#x} bytes created", size);

        Ok(Self {
            allocator,
            pages,
            size,
            owner_permission,
            user_permission,
        })
    }

    /// Object size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Backing pages
    pub fn pages(&self) -> &PageList {
        &self.pages
    }

    fn check_size(&self, size: u64) -> KernelResult<()> {
        if align_up(size, PAGE_SIZE) != self.size {
            return Err(KernelError::InvalidSize);
        }
        Ok(())
    }

    /// Map the object at `address` in `manager`'s address space
    pub fn map_into_process(
        &self,
        manager: &MemoryManager,
        address: u64,
        size: u64,
        is_owner: bool,
        permission: MemoryPermission,
    ) -> KernelResult<()> {
        self.check_size(size)?;

        let expected = if is_owner {
            self.owner_permission
        } else {
            self.user_permission
        };
        if permission != expected {
            return Err(KernelError::InvalidPermission);
        }

        manager.map_pages(address, &self.pages, MemoryState::SHARED_MEMORY, permission)
    }

    /// Unmap the object from `address` in `manager`'s address space
    pub fn unmap_from_process(&self, manager: &MemoryManager, address: u64, size: u64) -> KernelResult<()> {
        self.check_size(size)?;
        manager.unmap_pages(address, &self.pages, MemoryState::SHARED_MEMORY)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        self.allocator.free_pages(&self.pages);
    }
}
