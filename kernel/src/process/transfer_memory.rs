//! Transfer Memory Objects
//!
//! Transfer memory lends part of a process's heap to another process. While
//! the object is initialized the range is borrowed: its attribute carries
//! `BORROWED` and it cannot be freed or lent again.

use crate::memory::{MemoryManager, MemoryPermission, PageList};
use crate::{KernelError, KernelResult};

#[derive(Debug)]
struct Borrowed {
    address: u64,
    size: u64,
    pages: PageList,
}

/// A borrowed range of the owner's address space
#[derive(Debug, Default)]
pub struct TransferMemory {
    borrowed: Option<Borrowed>,
    permission: MemoryPermission,
}

impl TransferMemory {
    /// An uninitialized object
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a range is currently borrowed
    pub fn is_initialized(&self) -> bool {
        self.borrowed.is_some()
    }

    /// Owner permission while borrowed
    pub fn permission(&self) -> MemoryPermission {
        self.permission
    }

    /// Pages backing the borrowed range
    pub fn pages(&self) -> Option<&PageList> {
        self.borrowed.as_ref().map(|borrowed| &borrowed.pages)
    }

    /// Borrow `[address, address + size)` from `manager`
    pub fn initialize(
        &mut self,
        manager: &MemoryManager,
        address: u64,
        size: u64,
        permission: MemoryPermission,
    ) -> KernelResult<()> {
        if self.borrowed.is_some() {
            return Err(KernelError::InvalidState);
        }

        let pages = manager.borrow_transfer_memory(address, size, permission)?;

        self.permission = permission;
        self.borrowed = Some(Borrowed {
            address,
            size,
            pages,
        });
        Ok(())
    }

    /// Return the borrowed range to `manager`
    pub fn reset(&mut self, manager: &MemoryManager) -> KernelResult<()> {
        let Some(borrowed) = self.borrowed.as_ref() else {
            return Err(KernelError::InvalidState);
        };

        manager.unborrow_transfer_memory(borrowed.address, borrowed.size, &borrowed.pages)?;

        self.borrowed = None;
        self.permission = MemoryPermission::NONE;
        Ok(())
    }
}
