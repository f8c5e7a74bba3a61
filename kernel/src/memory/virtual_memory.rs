//! Host Page Table
//!
//! The manager never touches guest memory directly: it asks a [`HostMapper`]
//! to map, unmap and reprotect guest virtual pages, and to translate them
//! back to physical addresses. [`PageTable`] is the in-process mapper used
//! when the emulator does not supply its own.
//!
//! # Features
//!
//! - Page granular mapping of virtual to physical addresses
//! - All-or-nothing range operations
//! - Permission tracking per page

use std::collections::BTreeMap;

use spin::Mutex;

use super::flags::MemoryPermission;
use super::{PAGE_MASK, PAGE_SIZE, is_page_aligned};
use crate::{KernelError, KernelResult};

/// Host-side page table of one guest address space
pub trait HostMapper: Send + Sync {
    /// Map `size` bytes at `va` to physical `pa` with `permission`
    fn map(&self, va: u64, pa: u64, size: u64, permission: MemoryPermission) -> KernelResult<()>;

    /// Remove the mapping of `size` bytes at `va`
    fn unmap(&self, va: u64, size: u64) -> KernelResult<()>;

    /// Change the permission of `size` mapped bytes at `va`
    fn reprotect(&self, va: u64, size: u64, permission: MemoryPermission) -> KernelResult<()>;

    /// Physical address backing `va`, if mapped
    fn translate(&self, va: u64) -> Option<u64>;
}

/// Page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    /// Physical page address
    pub pa: u64,
    /// Access permission
    pub permission: MemoryPermission,
}

/// Page table keyed by virtual page address
#[derive(Debug, Default)]
pub struct PageTable {
    entries: Mutex<BTreeMap<u64, PageTableEntry>>,
}

fn check_range(va: u64, size: u64) -> KernelResult<u64> {
    if !is_page_aligned(va) || !is_page_aligned(size) {
        return Err(KernelError::InvalidAddress);
    }
    va.checked_add(size).ok_or(KernelError::InvalidAddress)
}

impl PageTable {
    /// Create an empty page table
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry of the page containing `va`
    pub fn entry(&self, va: u64) -> Option<PageTableEntry> {
        self.entries.lock().get(&(va & !PAGE_MASK)).copied()
    }

    /// Number of mapped pages
    pub fn mapped_pages_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether every page of the range is mapped
    pub fn is_mapped(&self, va: u64, size: u64) -> bool {
        let Ok(end) = check_range(va, size) else {
            return false;
        };
        let entries = self.entries.lock();
        entries.range(va..end).count() as u64 == size / PAGE_SIZE
    }
}

impl HostMapper for PageTable {
    fn map(&self, va: u64, pa: u64, size: u64, permission: MemoryPermission) -> KernelResult<()> {
        let end = check_range(va, size)?;
        let mut entries = self.entries.lock();

        if entries.range(va..end).next().is_some() {
            return Err(KernelError::InvalidMemState);
        }

        for (index, page) in (va..end).step_by(PAGE_SIZE as usize).enumerate() {
            entries.insert(
                page,
                PageTableEntry {
                    pa: pa + index as u64 * PAGE_SIZE,
                    permission,
                },
            );
        }

        Ok(())
    }

    fn unmap(&self, va: u64, size: u64) -> KernelResult<()> {
        let end = check_range(va, size)?;
        let mut entries = self.entries.lock();

        if entries.range(va..end).count() as u64 != size / PAGE_SIZE {
            return Err(KernelError::InvalidMemState);
        }

        for page in (va..end).step_by(PAGE_SIZE as usize) {
            entries.remove(&page);
        }

        Ok(())
    }

    fn reprotect(&self, va: u64, size: u64, permission: MemoryPermission) -> KernelResult<()> {
        let end = check_range(va, size)?;
        let mut entries = self.entries.lock();

        if entries.range(va..end).count() as u64 != size / PAGE_SIZE {
            return Err(KernelError::InvalidMemState);
        }

        for (_, entry) in entries.range_mut(va..end) {
            entry.permission = permission;
        }

        Ok(())
    }

    fn translate(&self, va: u64) -> Option<u64> {
        self.entry(va).map(|entry| entry.pa + (va & PAGE_MASK))
    }
}
