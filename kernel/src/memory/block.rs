//! Memory Blocks
//!
//! A memory block describes one homogeneous, contiguous range of guest
//! virtual pages. Its shape (base and page count) only changes through
//! splitting and merging in the block list; its contents (state, permission,
//! attribute and IPC lending bookkeeping) are rewritten in place.

use super::PAGE_SIZE;
use super::flags::{MemoryAttribute, MemoryPermission, MemoryState};

/// Descriptor of a contiguous range with a single signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    base_address: u64,
    pages_count: u64,
    state: MemoryState,
    permission: MemoryPermission,
    attribute: MemoryAttribute,
    source_permission: MemoryPermission,
    ipc_ref_count: u16,
    device_ref_count: u16,
}

/// Snapshot of a block, as returned by memory queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Base virtual address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// Memory state
    pub state: MemoryState,
    /// Current permission
    pub permission: MemoryPermission,
    /// Attribute bits
    pub attribute: MemoryAttribute,
    /// Permission saved while the range is lent through IPC
    pub source_permission: MemoryPermission,
    /// Number of outstanding IPC lends
    pub ipc_ref_count: u16,
    /// Number of outstanding device mappings
    pub device_ref_count: u16,
}

impl MemoryInfo {
    /// Address one past the end of the range (wrapping for the reserved tail)
    pub const fn end_address(&self) -> u64 {
        self.address.wrapping_add(self.size)
    }

    /// Size of the part of this range that falls inside `[start, end)`
    pub fn size_in_range(&self, start: u64, end: u64) -> u64 {
        let lo = self.address.max(start);
        let hi = self.end_address().min(end);
        hi.saturating_sub(lo)
    }

    /// Start of the part of this range that falls inside `[start, ..)`
    pub fn address_in_range(&self, start: u64) -> u64 {
        self.address.max(start)
    }
}

impl MemoryBlock {
    /// Create a block with no IPC or device references
    pub const fn new(
        base_address: u64,
        pages_count: u64,
        state: MemoryState,
        permission: MemoryPermission,
        attribute: MemoryAttribute,
    ) -> Self {
        Self {
            base_address,
            pages_count,
            state,
            permission,
            attribute,
            source_permission: MemoryPermission::NONE,
            ipc_ref_count: 0,
            device_ref_count: 0,
        }
    }

    /// Base virtual address
    pub const fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Number of pages
    pub const fn pages_count(&self) -> u64 {
        self.pages_count
    }

    /// Address one past the last page
    pub const fn end_address(&self) -> u64 {
        self.base_address + self.pages_count * PAGE_SIZE
    }

    /// Memory state
    pub const fn state(&self) -> MemoryState {
        self.state
    }

    /// Current permission
    pub const fn permission(&self) -> MemoryPermission {
        self.permission
    }

    /// Attribute bits
    pub const fn attribute(&self) -> MemoryAttribute {
        self.attribute
    }

    /// Permission saved by the first IPC lend
    pub const fn source_permission(&self) -> MemoryPermission {
        self.source_permission
    }

    /// Outstanding IPC lends
    pub const fn ipc_ref_count(&self) -> u16 {
        self.ipc_ref_count
    }

    /// Outstanding device mappings
    pub const fn device_ref_count(&self) -> u16 {
        self.device_ref_count
    }

    /// Whether `address` lies inside the block
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address < self.end_address()
    }

    /// Overwrite the signature, keeping the transient IPC/device bits
    pub fn set_state(
        &mut self,
        permission: MemoryPermission,
        state: MemoryState,
        attribute: MemoryAttribute,
    ) {
        self.permission = permission;
        self.state = state;
        self.attribute &= MemoryAttribute::IPC_AND_DEVICE_MAPPED;
        self.attribute |= attribute;
    }

    /// Lend the range through IPC, overriding its read/write permission.
    ///
    /// Only the first lend saves the permission; later lends just count.
    pub fn set_ipc_lend_permission(&mut self, new_permission: MemoryPermission) {
        let old_ref_count = self.ipc_ref_count;

        self.ipc_ref_count = self.ipc_ref_count.wrapping_add(1);
        if self.ipc_ref_count == 0 {
            fatal!(
                "IPC reference count increment overflowed on block {:#x}",
                self.base_address
            );
        }

        if old_ref_count == 0 {
            self.source_permission = self.permission;
            self.permission &= !MemoryPermission::READ_AND_WRITE;
            self.permission |= MemoryPermission::READ_AND_WRITE & new_permission;
        }

        self.attribute |= MemoryAttribute::IPC_MAPPED;
    }

    /// Undo one IPC lend; the last one restores the saved permission
    pub fn restore_ipc_lend_permission(&mut self) {
        let old_ref_count = self.ipc_ref_count;
        if old_ref_count == 0 {
            fatal!(
                "IPC reference count decrement underflowed on block {:#x}",
                self.base_address
            );
        }

        self.ipc_ref_count = old_ref_count - 1;

        if old_ref_count == 1 {
            self.permission = self.source_permission;
            self.source_permission = MemoryPermission::NONE;
            self.attribute &= !MemoryAttribute::IPC_MAPPED;
        }
    }

    /// Shrink to `[address, end)` and return the left part `[base, address)`
    pub fn split_right_at_address(&mut self, address: u64) -> Self {
        debug_assert!(address > self.base_address && address < self.end_address());

        let left_address = self.base_address;
        let left_pages_count = (address - left_address) / PAGE_SIZE;

        self.base_address = address;
        self.pages_count -= left_pages_count;

        Self {
            base_address: left_address,
            pages_count: left_pages_count,
            ..*self
        }
    }

    /// Grow by `pages_count` pages (absorbing the following block)
    pub fn add_pages(&mut self, pages_count: u64) {
        self.pages_count += pages_count;
    }

    /// Whether two blocks have the same full signature and may merge
    pub fn state_equals(&self, other: &Self) -> bool {
        self.state == other.state
            && self.permission == other.permission
            && self.attribute == other.attribute
            && self.source_permission == other.source_permission
            && self.ipc_ref_count == other.ipc_ref_count
            && self.device_ref_count == other.device_ref_count
    }

    /// Read-only snapshot
    pub const fn info(&self) -> MemoryInfo {
        MemoryInfo {
            address: self.base_address,
            size: self.pages_count * PAGE_SIZE,
            state: self.state,
            permission: self.permission,
            attribute: self.attribute,
            source_permission: self.source_permission,
            ipc_ref_count: self.ipc_ref_count,
            device_ref_count: self.device_ref_count,
        }
    }
}
