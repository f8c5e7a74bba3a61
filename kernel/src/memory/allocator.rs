//! Physical Memory
//!
//! Emulated DRAM and the page allocator that hands out its pages.
//!
//! # Algorithm
//!
//! Pages come from a buddy system (`buddy_system_allocator::FrameAllocator`)
//! whose frames are DRAM page numbers:
//! 1. A request for `n` pages is split into power-of-two chunks, largest first
//! 2. Chunks are appended to a page list, merging physically contiguous runs
//! 3. If any chunk cannot be served, every chunk already taken is returned
//! 4. Freeing splits each run back into naturally aligned power-of-two pieces,
//!    which the buddy system coalesces
//!
//! # Time Complexity
//!
//! - Allocation: O(log n) chunks, each O(log n) in the buddy system
//! - Deallocation: O(log n) pieces per run

use buddy_system_allocator::FrameAllocator;
use spin::Mutex;

use super::page_list::PageList;
use super::{PAGE_SHIFT, PAGE_SIZE};
use crate::{KernelError, KernelResult};

/// Maximum buddy order (2^31 pages)
const MAX_ORDER: usize = 32;

/// Source of physical pages backing guest memory
pub trait PageAllocator: Send + Sync {
    /// Allocate `pages_count` pages, not necessarily contiguous
    fn allocate_pages(&self, pages_count: u64) -> KernelResult<PageList>;

    /// Allocate a single page
    fn allocate_single_page(&self) -> KernelResult<u64>;

    /// Return every page of the list
    fn free_pages(&self, pages: &PageList);

    /// Return a single page
    fn free_single_page(&self, address: u64);
}

/// Emulated physical memory
#[derive(Debug)]
pub struct Dram {
    base: u64,
    bytes: Mutex<Vec<u8>>,
}

impl Dram {
    /// Create `size` bytes of zeroed memory starting at physical `base`
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: Mutex::new(vec![0; size]),
        }
    }

    /// First physical address
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn offset(&self, address: u64, len: usize, size: usize) -> KernelResult<usize> {
        let offset = address
            .checked_sub(self.base)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or(KernelError::InvalidAddress)?;

        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset),
            _ => Err(KernelError::InvalidAddress),
        }
    }

    /// Read `buf.len()` bytes at `address`
    pub fn read(&self, address: u64, buf: &mut [u8]) -> KernelResult<()> {
        let bytes = self.bytes.lock();
        let offset = self.offset(address, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    /// Write `data` at `address`
    pub fn write(&self, address: u64, data: &[u8]) -> KernelResult<()> {
        let mut bytes = self.bytes.lock();
        let offset = self.offset(address, data.len(), bytes.len())?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Set `len` bytes at `address` to `value`
    pub fn fill(&self, address: u64, len: u64, value: u8) -> KernelResult<()> {
        let len = usize::try_from(len).map_err(|_| KernelError::InvalidAddress)?;
        let mut bytes = self.bytes.lock();
        let offset = self.offset(address, len, bytes.len())?;
        bytes[offset..offset + len].fill(value);
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst`
    pub fn copy(&self, dst: u64, src: u64, len: u64) -> KernelResult<()> {
        let len = usize::try_from(len).map_err(|_| KernelError::InvalidAddress)?;
        let mut bytes = self.bytes.lock();
        let src = self.offset(src, len, bytes.len())?;
        let dst = self.offset(dst, len, bytes.len())?;
        bytes.copy_within(src..src + len, dst);
        Ok(())
    }
}

/// Allocation statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    /// Pages managed by the allocator
    pub total_pages: u64,
    /// Pages currently free
    pub free_pages: u64,
    /// Failed allocation requests
    pub failed_allocations: u64,
}

struct BuddyState {
    frames: FrameAllocator<MAX_ORDER>,
    stats: AllocationStats,
}

impl BuddyState {
    fn take(&mut self, pages_count: u64) -> Option<u64> {
        let count = usize::try_from(pages_count).ok()?;
        let frame = self.frames.alloc(count)?;
        self.stats.free_pages -= pages_count;
        Some((frame as u64) << PAGE_SHIFT)
    }

    fn give_back(&mut self, address: u64, pages_count: u64) {
        let mut frame = address >> PAGE_SHIFT;
        let mut remaining = pages_count;

        while remaining != 0 {
            let alignment = if frame == 0 { 1 << 63 } else { 1u64 << frame.trailing_zeros() };
            let fit = 1u64 << (63 - remaining.leading_zeros());
            let piece = alignment.min(fit);

            self.frames.dealloc(frame as usize, piece as usize);
            frame += piece;
            remaining -= piece;
        }

        self.stats.free_pages += pages_count;
    }
}

/// Buddy-system page allocator over a range of physical memory
pub struct BuddyPageAllocator {
    state: Mutex<BuddyState>,
}

impl core::fmt::Debug for BuddyPageAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BuddyPageAllocator")
            .field("stats", &self.stats())
            .finish()
    }
}

impl BuddyPageAllocator {
    /// Manage the pages of `[base, base + size)`
    pub fn new(base: u64, size: u64) -> Self {
        let start = base.div_ceil(PAGE_SIZE);
        let end = (base + size) / PAGE_SIZE;

        let mut frames = FrameAllocator::<MAX_ORDER>::new();
        if end > start {
            frames.add_frame(start as usize, end as usize);
        }

        let total_pages = end.saturating_sub(start);
        Self {
            state: Mutex::new(BuddyState {
                frames,
                stats: AllocationStats {
                    total_pages,
                    free_pages: total_pages,
                    failed_allocations: 0,
                },
            }),
        }
    }

    /// Manage every page of `dram`
    pub fn for_dram(dram: &Dram) -> Self {
        Self::new(dram.base(), dram.size())
    }

    /// Current statistics
    pub fn stats(&self) -> AllocationStats {
        self.state.lock().stats
    }

    /// Number of free pages
    pub fn free_pages_count(&self) -> u64 {
        self.stats().free_pages
    }
}

impl PageAllocator for BuddyPageAllocator {
    fn allocate_pages(&self, pages_count: u64) -> KernelResult<PageList> {
        let mut state = self.state.lock();
        let mut pages = PageList::new();
        let mut chunks: Vec<(u64, u64)> = Vec::new();
        let mut remaining = pages_count;

        while remaining != 0 {
            let chunk = 1u64 << (63 - remaining.leading_zeros());
            let Some(address) = state.take(chunk) else {
                for (address, count) in chunks {
                    state.give_back(address, count);
                }
                state.stats.failed_allocations += 1;
                debug_print!(DEBUG, "page allocator exhausted serving {} pages", pages_count);
                return Err(KernelError::OutOfMemory);
            };

            chunks.push((address, chunk));
            pages.add_range(address, chunk);
            remaining -= chunk;
        }

        Ok(pages)
    }

    fn allocate_single_page(&self) -> KernelResult<u64> {
        let mut state = self.state.lock();
        match state.take(1) {
            Some(address) => Ok(address),
            None => {
                state.stats.failed_allocations += 1;
                Err(KernelError::OutOfMemory)
            }
        }
    }

    fn free_pages(&self, pages: &PageList) {
        let mut state = self.state.lock();
        for node in pages {
            state.give_back(node.address, node.pages_count);
        }
    }

    fn free_single_page(&self, address: u64) {
        self.state.lock().give_back(address, 1);
    }
}
