//! IPC Buffer Lending
//!
//! Moves buffers between a client and a server address space for IPC, and
//! borrows ranges for IPC buffers and transfer memory.
//!
//! # Edge Pages
//!
//! A lent buffer rarely starts or ends on a page boundary. Mapping the
//! client's edge pages into the server would expose whatever else lives in
//! them, so each unaligned edge is replaced by a fresh page holding only the
//! buffer bytes (or nothing, when no copy is requested), zeroed everywhere
//! else. Interior pages are shared directly.
//!
//! ```text
//! client:  |..xxxx|xxxxxx|xxx...|
//! server:  |00xxxx|xxxxxx|xxx000|
//!           fresh  shared fresh
//! ```
//!
//! # Locking
//!
//! The client lends under its own lock, then the server maps under its own
//! lock. The two manager locks are never held together.

use heapless::Vec as EdgePages;

use super::block::MemoryInfo;
use super::block_list::BlockMutation;
use super::flags::{MemoryAttribute, MemoryPermission, MemoryState};
use super::manager::{MAX_BLOCKS_NEEDED_FOR_INSERTION, MemoryManager, expect_revert};
use super::page_list::PageList;
use super::{PAGE_SIZE, align_down, align_up};
use crate::{KernelError, KernelResult};

/// Placement alignments for a server mapping, tried largest first
const MAPPING_UNIT_SIZES: [u64; 6] = [
    0x1000,
    0x1_0000,
    0x20_0000,
    0x40_0000,
    0x200_0000,
    0x4000_0000,
];

/// Page boundaries around an unaligned buffer
#[derive(Debug, Clone, Copy)]
struct LendRange {
    address_truncated: u64,
    address_rounded: u64,
    end_truncated: u64,
    end_rounded: u64,
}

impl LendRange {
    fn new(address: u64, size: u64) -> Self {
        let end = address + size;
        Self {
            address_truncated: align_down(address, PAGE_SIZE),
            address_rounded: align_up(address, PAGE_SIZE),
            end_truncated: align_down(end, PAGE_SIZE),
            end_rounded: align_up(end, PAGE_SIZE),
        }
    }

    fn has_first_edge(&self) -> bool {
        self.address_truncated < self.address_rounded
    }

    /// The end edge only gets its own page when it is not the start edge page
    fn has_last_edge(&self) -> bool {
        self.end_truncated < self.end_rounded
            && (self.address_truncated == self.address_rounded
                || self.address_truncated < self.end_truncated)
    }

    fn interior_pages(&self) -> u64 {
        if self.address_rounded < self.end_truncated {
            (self.end_truncated - self.address_rounded) / PAGE_SIZE
        } else {
            0
        }
    }
}

/// Pages handed from a client to a server for one buffer
struct IpcTransfer {
    pages: PageList,
    edge_pages: EdgePages<u64, 2>,
}

/// A live server mapping of a client buffer, keyed by its page-aligned base
#[derive(Debug)]
pub(super) struct IpcMapping {
    pages_count: u64,
    edge_pages: EdgePages<u64, 2>,
}

impl MemoryManager {
    fn check_buffer_bounds(&self, address: u64, size: u64) -> KernelResult<u64> {
        let space = self.layout.addr_space();
        let end = address
            .checked_add(size)
            .filter(|end| *end > address)
            .ok_or(KernelError::InvalidMemState)?;

        if address < space.start || end - 1 > space.end - 1 {
            return Err(KernelError::InvalidMemState);
        }
        Ok(end)
    }

    /// Client side: validate and lend `[address, address + size)`, and
    /// collect the pages a server should map
    fn get_pages_for_mapping_into_another_process(
        &self,
        address: u64,
        size: u64,
        permission: MemoryPermission,
        state: MemoryState,
        copy_data: bool,
    ) -> KernelResult<IpcTransfer> {
        self.check_buffer_bounds(address, size)?;

        let state_mask = state.ipc_send_mask().ok_or(KernelError::InvalidCombination)?;

        let permission_mask = if permission == MemoryPermission::READ_AND_WRITE {
            MemoryPermission::NONE
        } else {
            MemoryPermission::READ
        };

        let mut attribute_mask = MemoryAttribute::BORROWED | MemoryAttribute::UNCACHED;
        if state == MemoryState::IPC_BUFFER0 {
            attribute_mask |= MemoryAttribute::DEVICE_MAPPED;
        }

        let range = LendRange::new(address, size);

        let mut inner = self.inner.lock();

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        let mut reprotected: Vec<(u64, u64, MemoryPermission)> = Vec::new();
        let mut visited_size = 0;

        let restore = |reprotected: &[(u64, u64, MemoryPermission)]| {
            for &(address, size, permission) in reprotected.iter().rev() {
                expect_revert(
                    self.mapper.reprotect(address, size, permission),
                    "restore lent permission",
                );
            }
        };

        if range.address_rounded < range.end_truncated {
            let infos: Vec<MemoryInfo> = inner
                .blocks
                .iter_range(range.address_truncated, range.end_rounded)
                .collect();

            for info in infos {
                if (info.state & state_mask) != state_mask
                    || (info.permission & permission) != permission
                    || (info.attribute & attribute_mask) != MemoryAttribute::NONE
                {
                    restore(&reprotected);
                    return Err(KernelError::InvalidMemState);
                }

                let block_address = info.address_in_range(range.address_rounded);
                let block_size = info.size_in_range(range.address_rounded, range.end_truncated);

                if block_size != 0
                    && (info.permission & MemoryPermission::READ_AND_WRITE) != permission_mask
                    && info.ipc_ref_count == 0
                {
                    let lent_permission =
                        (info.permission & !MemoryPermission::READ_AND_WRITE) | permission_mask;

                    debug_print!(TRACE, "lend {:#x} ({:#x} bytes) as {}", block_address, block_size, lent_permission);
                    if let Err(error) = self.mapper.reprotect(block_address, block_size, lent_permission) {
                        restore(&reprotected);
                        return Err(error);
                    }
                    reprotected.push((block_address, block_size, info.permission));
                }

                visited_size += block_size;
            }
        }

        let transfer = match self.get_pages_for_ipc_transfer(address, size, copy_data) {
            Ok(transfer) => transfer,
            Err(error) => {
                restore(&reprotected);
                return Err(error);
            }
        };

        if visited_size != 0 {
            inner.blocks.insert_block(
                range.address_rounded,
                visited_size / PAGE_SIZE,
                BlockMutation::IpcLend(permission_mask),
                None,
            );
        }

        Ok(transfer)
    }

    /// Build the page list of a lent buffer, replacing unaligned edge pages
    /// with fresh zero-padded copies
    fn get_pages_for_ipc_transfer(&self, address: u64, size: u64, copy_data: bool) -> KernelResult<IpcTransfer> {
        let range = LendRange::new(address, size);
        let allocator = &self.context.page_allocator;
        let mut edge_pages: EdgePages<u64, 2> = EdgePages::new();

        let first_page = if range.has_first_edge() {
            let pa = allocator.allocate_single_page()?;
            let _ = edge_pages.push(pa);
            Some(pa)
        } else {
            None
        };

        let last_page = if range.has_last_edge() {
            match allocator.allocate_single_page() {
                Ok(pa) => {
                    let _ = edge_pages.push(pa);
                    Some(pa)
                }
                Err(error) => {
                    for &pa in &edge_pages {
                        allocator.free_single_page(pa);
                    }
                    return Err(error);
                }
            }
        } else {
            None
        };

        match self.fill_ipc_pages(address, size, copy_data, range, first_page, last_page) {
            Ok(pages) => Ok(IpcTransfer { pages, edge_pages }),
            Err(error) => {
                for &pa in &edge_pages {
                    allocator.free_single_page(pa);
                }
                Err(error)
            }
        }
    }

    fn fill_ipc_pages(
        &self,
        address: u64,
        size: u64,
        copy_data: bool,
        range: LendRange,
        first_page: Option<u64>,
        last_page: Option<u64>,
    ) -> KernelResult<PageList> {
        let dram = &self.context.dram;
        let end = address + size;
        let mut pages = PageList::new();

        if let Some(pa) = first_page {
            let mut fill_address = pa;
            let unused_after;

            if copy_data {
                let unused_before = address - range.address_truncated;
                dram.fill(pa, unused_before, 0)?;

                let copy_size = if range.address_rounded <= end {
                    range.address_rounded - address
                } else {
                    size
                };
                let mut data = vec![0u8; copy_size as usize];
                self.read_memory(address, &mut data)?;
                dram.write(pa + unused_before, &data)?;

                fill_address += unused_before + copy_size;
                unused_after = range.address_rounded.saturating_sub(end);
            } else {
                unused_after = PAGE_SIZE;
            }

            if unused_after != 0 {
                dram.fill(fill_address, unused_after, 0)?;
            }
            pages.add_range(pa, 1);
        }

        let interior_pages = range.interior_pages();
        if interior_pages != 0 {
            for node in &self.page_list_of(range.address_rounded, interior_pages) {
                pages.add_range(node.address, node.pages_count);
            }
        }

        if let Some(pa) = last_page {
            let (fill_address, unused_after) = if copy_data {
                let copy_size = end - range.end_truncated;
                let mut data = vec![0u8; copy_size as usize];
                self.read_memory(range.end_truncated, &mut data)?;
                dram.write(pa, &data)?;
                (pa + copy_size, PAGE_SIZE - copy_size)
            } else {
                (pa, PAGE_SIZE)
            };

            dram.fill(fill_address, unused_after, 0)?;
            pages.add_range(pa, 1);
        }

        Ok(pages)
    }

    /// Server side: map a client's buffer pages into the alias region
    fn map_pages_from_another_process(
        &self,
        size: u64,
        address: u64,
        permission: MemoryPermission,
        state: MemoryState,
        transfer: &IpcTransfer,
    ) -> KernelResult<u64> {
        let range = LendRange::new(address, size);
        let needed_pages = (range.end_rounded - range.address_truncated) / PAGE_SIZE;
        let alias = self.layout.alias_region();
        let region_pages = alias.size() / PAGE_SIZE;

        let mut inner = self.inner.lock();

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        let va = MAPPING_UNIT_SIZES
            .iter()
            .rev()
            .find_map(|&alignment| {
                self.allocate_va(&mut inner, alias.start, region_pages, needed_pages, alignment)
            })
            .ok_or(KernelError::OutOfVaSpace)?;

        if !transfer.pages.is_empty() {
            self.map_page_list(va, &transfer.pages, permission)?;
        }

        inner
            .blocks
            .insert_block(va, needed_pages, BlockMutation::state(state, permission), None);
        inner.ipc_mappings.insert(
            va,
            IpcMapping {
                pages_count: needed_pages,
                edge_pages: transfer.edge_pages.clone(),
            },
        );

        Ok(va + (address - range.address_truncated))
    }

    /// Map `size` bytes at `src` of `client` into this (server) address
    /// space as an IPC buffer of `state` and return the server address.
    ///
    /// The client range is lent for the lifetime of the mapping; undo with
    /// [`Self::unmap_no_attribute_if_state_equals`] here and
    /// [`Self::unmap_ipc_restore_permission`] on the client.
    #[allow(clippy::too_many_arguments)]
    pub fn map_buffer_from_client_process(
        &self,
        size: u64,
        src: u64,
        client: &MemoryManager,
        permission: MemoryPermission,
        state: MemoryState,
        copy_data: bool,
    ) -> KernelResult<u64> {
        let transfer =
            client.get_pages_for_mapping_into_another_process(src, size, permission, state, copy_data)?;

        match self.map_pages_from_another_process(size, src, permission, state, &transfer) {
            Ok(dst) => Ok(dst),
            Err(error) => {
                for &pa in &transfer.edge_pages {
                    client.context.page_allocator.free_single_page(pa);
                }
                if let Err(restore_error) = client.unmap_ipc_restore_permission(src, size, state) {
                    debug_print!(WARN, "failed to restore lent buffer {:#x}: {}", src, restore_error);
                }
                Err(error)
            }
        }
    }

    /// Server side: unmap an IPC buffer of `state` and free its edge pages.
    ///
    /// The page window of `[address, address + size)` must be exactly the
    /// window of one buffer mapped by
    /// [`Self::map_buffer_from_client_process`]; anything else is
    /// `InvalidMemRange`.
    pub fn unmap_no_attribute_if_state_equals(&self, address: u64, size: u64, state: MemoryState) -> KernelResult<()> {
        self.check_buffer_bounds(address, size)?;

        let mut inner = self.inner.lock();

        inner
            .blocks
            .check_range(
                address,
                size,
                MemoryState::MASK,
                state,
                MemoryPermission::READ,
                MemoryPermission::READ,
                MemoryAttribute::MASK,
                MemoryAttribute::NONE,
                MemoryAttribute::IPC_AND_DEVICE_MAPPED,
            )
            .ok_or(KernelError::InvalidMemState)?;

        let range = LendRange::new(address, size);
        let pages_count = (range.end_rounded - range.address_truncated) / PAGE_SIZE;

        let whole_mapping = inner
            .ipc_mappings
            .get(&range.address_truncated)
            .is_some_and(|mapping| mapping.pages_count == pages_count);
        if !whole_mapping {
            debug_print!(DEBUG, "{:#x} ({:#x} bytes) is not a whole IPC mapping", address, size);
            return Err(KernelError::InvalidMemRange);
        }

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        debug_print!(TRACE, "unmap {:#x} ({:#x} bytes)", range.address_truncated, pages_count * PAGE_SIZE);
        self.mapper
            .unmap(range.address_truncated, pages_count * PAGE_SIZE)?;

        if let Some(mapping) = inner.ipc_mappings.remove(&range.address_truncated) {
            for &pa in &mapping.edge_pages {
                self.context.page_allocator.free_single_page(pa);
            }
        }

        inner.blocks.insert_block(
            range.address_truncated,
            pages_count,
            BlockMutation::state(MemoryState::UNMAPPED, MemoryPermission::NONE),
            None,
        );
        Ok(())
    }

    /// Client side: end one lend of the interior pages of a buffer
    pub fn unmap_ipc_restore_permission(&self, address: u64, size: u64, state: MemoryState) -> KernelResult<()> {
        let range = LendRange::new(address, size);
        let pages_count = range.interior_pages();
        if pages_count == 0 {
            return Ok(());
        }

        let state_mask = state.ipc_send_mask().ok_or(KernelError::InvalidCombination)?;

        let mut attribute_mask =
            MemoryAttribute::BORROWED | MemoryAttribute::IPC_MAPPED | MemoryAttribute::UNCACHED;
        if state == MemoryState::IPC_BUFFER0 {
            attribute_mask |= MemoryAttribute::DEVICE_MAPPED;
        }

        let mut inner = self.inner.lock();

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        let infos: Vec<MemoryInfo> = inner
            .blocks
            .iter_range(range.address_rounded, range.end_truncated)
            .collect();

        let lent = infos.iter().all(|info| {
            (info.state & state_mask) == state_mask
                && (info.attribute & attribute_mask) == MemoryAttribute::IPC_MAPPED
        });
        if !lent {
            return Err(KernelError::InvalidMemState);
        }

        for info in &infos {
            if info.permission != info.source_permission && info.ipc_ref_count == 1 {
                let block_address = info.address_in_range(range.address_rounded);
                let block_size = info.size_in_range(range.address_rounded, range.end_truncated);

                debug_print!(TRACE, "restore {:#x} ({:#x} bytes) to {}", block_address, block_size, info.source_permission);
                self.mapper
                    .reprotect(block_address, block_size, info.source_permission)?;
            }
        }

        inner.blocks.insert_block(
            range.address_rounded,
            pages_count,
            BlockMutation::IpcRestore,
            None,
        );
        Ok(())
    }

    // ---- borrowing ------------------------------------------------------

    /// Borrow `[address, address + size)` and optionally change its
    /// permission (`NONE` keeps the current one); returns its backing
    #[allow(clippy::too_many_arguments)]
    fn set_attributes_and_change_permission(
        &self,
        address: u64,
        size: u64,
        state_capability: MemoryState,
        permission_mask: MemoryPermission,
        permission_expected: MemoryPermission,
        attribute_mask: MemoryAttribute,
        attribute_expected: MemoryAttribute,
        new_permission: MemoryPermission,
        attribute_set: MemoryAttribute,
    ) -> KernelResult<PageList> {
        if !self.is_inside_addr_space(address, size) {
            return Err(KernelError::InvalidMemState);
        }

        let mut inner = self.inner.lock();

        let pool_capability = state_capability | MemoryState::IS_POOL_ALLOCATED;
        let (old_state, old_permission, old_attribute) = inner
            .blocks
            .check_range(
                address,
                size,
                pool_capability,
                pool_capability,
                permission_mask,
                permission_expected,
                attribute_mask,
                attribute_expected,
                MemoryAttribute::IPC_AND_DEVICE_MAPPED,
            )
            .ok_or(KernelError::InvalidMemState)?;

        let pages_count = size / PAGE_SIZE;
        let pages = self.page_list_of(address, pages_count);

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        let new_permission = if new_permission == MemoryPermission::NONE {
            old_permission
        } else {
            new_permission
        };

        if new_permission != old_permission {
            self.mapper.reprotect(address, size, new_permission)?;
        }

        inner.blocks.insert_block(
            address,
            pages_count,
            BlockMutation::Overwrite {
                state: old_state,
                permission: new_permission,
                attribute: old_attribute | attribute_set,
            },
            None,
        );
        Ok(pages)
    }

    /// Return a borrowed range, optionally checking it is still backed by
    /// `expected_pages`
    #[allow(clippy::too_many_arguments)]
    fn clear_attributes_and_change_permission(
        &self,
        address: u64,
        size: u64,
        state_capability: MemoryState,
        attribute_expected: MemoryAttribute,
        new_permission: MemoryPermission,
        attribute_clear: MemoryAttribute,
        expected_pages: Option<&PageList>,
    ) -> KernelResult<()> {
        if !self.is_inside_addr_space(address, size) {
            return Err(KernelError::InvalidMemState);
        }

        let mut inner = self.inner.lock();

        let pool_capability = state_capability | MemoryState::IS_POOL_ALLOCATED;
        let (old_state, old_permission, old_attribute) = inner
            .blocks
            .check_range(
                address,
                size,
                pool_capability,
                pool_capability,
                MemoryPermission::NONE,
                MemoryPermission::NONE,
                MemoryAttribute::MASK,
                attribute_expected,
                MemoryAttribute::IPC_AND_DEVICE_MAPPED,
            )
            .ok_or(KernelError::InvalidMemState)?;

        let pages_count = size / PAGE_SIZE;

        if let Some(expected) = expected_pages {
            if self.page_list_of(address, pages_count) != *expected {
                return Err(KernelError::InvalidMemRange);
            }
        }

        self.ensure_capacity(MAX_BLOCKS_NEEDED_FOR_INSERTION)?;

        let new_permission = if new_permission == MemoryPermission::NONE {
            old_permission
        } else {
            new_permission
        };

        if new_permission != old_permission {
            self.mapper.reprotect(address, size, new_permission)?;
        }

        inner.blocks.insert_block(
            address,
            pages_count,
            BlockMutation::Overwrite {
                state: old_state,
                permission: new_permission,
                attribute: old_attribute & !attribute_clear,
            },
            None,
        );
        Ok(())
    }

    /// Mark a read/write range as borrowed for use as an IPC buffer
    pub fn borrow_ipc_buffer(&self, address: u64, size: u64) -> KernelResult<()> {
        self.set_attributes_and_change_permission(
            address,
            size,
            MemoryState::IPC_BUFFER_ALLOWED,
            MemoryPermission::MASK,
            MemoryPermission::READ_AND_WRITE,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
            MemoryPermission::NONE,
            MemoryAttribute::BORROWED,
        )
        .map(|_| ())
    }

    /// Release a range borrowed by [`Self::borrow_ipc_buffer`]
    pub fn unborrow_ipc_buffer(&self, address: u64, size: u64) -> KernelResult<()> {
        self.clear_attributes_and_change_permission(
            address,
            size,
            MemoryState::IPC_BUFFER_ALLOWED,
            MemoryAttribute::BORROWED,
            MemoryPermission::READ_AND_WRITE,
            MemoryAttribute::BORROWED,
            None,
        )
    }

    /// Borrow a read/write range as transfer memory, setting its permission
    /// to `permission` (`NONE` keeps read/write); returns the pages backing
    /// the range
    pub fn borrow_transfer_memory(
        &self,
        address: u64,
        size: u64,
        permission: MemoryPermission,
    ) -> KernelResult<PageList> {
        self.set_attributes_and_change_permission(
            address,
            size,
            MemoryState::TRANSFER_MEMORY_ALLOWED,
            MemoryPermission::MASK,
            MemoryPermission::READ_AND_WRITE,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
            permission,
            MemoryAttribute::BORROWED,
        )
    }

    /// Release transfer memory; the range must still be backed by `pages`
    pub fn unborrow_transfer_memory(&self, address: u64, size: u64, pages: &PageList) -> KernelResult<()> {
        self.clear_attributes_and_change_permission(
            address,
            size,
            MemoryState::TRANSFER_MEMORY_ALLOWED,
            MemoryAttribute::BORROWED,
            MemoryPermission::READ_AND_WRITE,
            MemoryAttribute::BORROWED,
            Some(pages),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_MASK;
    use crate::memory::test_support::{Fixture, heap_pages};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    #[test]
    fn lend_range_edges() {
        let range = LendRange::new(0x1800, 0x100);
        assert!(range.has_first_edge());
        assert!(!range.has_last_edge());
        assert_eq!(range.interior_pages(), 0);

        let range = LendRange::new(0x1800, 0x2000);
        assert!(range.has_first_edge());
        assert!(range.has_last_edge());
        assert_eq!(range.interior_pages(), 1);

        let range = LendRange::new(0x1000, 0x1800);
        assert!(!range.has_first_edge());
        assert!(range.has_last_edge());
    }

    #[test]
    fn edge_pages_expose_only_the_buffer() {
        let fixture = Fixture::new();
        let client = &fixture.manager;
        let server = fixture.spawn();

        let heap = heap_pages(client, 4);
        let data = pattern(0x4000);
        client.write_memory(heap, &data).unwrap();

        let src = heap + 0x800;
        let size = 0x2000;
        let dst = server
            .map_buffer_from_client_process(
                size,
                src,
                client,
                MemoryPermission::READ_AND_WRITE,
                MemoryState::IPC_BUFFER0,
                true,
            )
            .unwrap();
        assert_eq!(dst & PAGE_MASK, 0x800);

        let base = dst - 0x800;
        let mut mapped = vec![0u8; 0x3000];
        server.read_memory(base, &mut mapped).unwrap();

        assert!(mapped[..0x800].iter().all(|&b| b == 0));
        assert_eq!(&mapped[0x800..0x2800], &data[0x800..0x2800]);
        assert!(mapped[0x2800..].iter().all(|&b| b == 0));

        assert_eq!(server.translate(base + 0x1000), client.translate(heap + 0x1000));
        assert_ne!(server.translate(base), client.translate(heap));
    }

    #[test]
    fn buffer_inside_one_page() {
        let fixture = Fixture::new();
        let client = &fixture.manager;
        let server = fixture.spawn();

        let heap = heap_pages(client, 1);
        client.write_memory(heap, &pattern(0x1000)).unwrap();

        let dst = server
            .map_buffer_from_client_process(
                0x20,
                heap + 0x100,
                client,
                MemoryPermission::READ,
                MemoryState::IPC_BUFFER1,
                true,
            )
            .unwrap();

        let mut page = vec![0u8; 0x1000];
        server.read_memory(dst & !PAGE_MASK, &mut page).unwrap();
        assert!(page[..0x100].iter().all(|&b| b == 0));
        assert_eq!(&page[0x100..0x120], &pattern(0x1000)[0x100..0x120]);
        assert!(page[0x120..].iter().all(|&b| b == 0));

        assert_eq!(client.query_memory(heap).ipc_ref_count, 0);
    }

    #[test]
    fn edge_pages_without_copy_are_zero() {
        let fixture = Fixture::new();
        let client = &fixture.manager;
        let server = fixture.spawn();

        let heap = heap_pages(client, 3);
        client.write_memory(heap, &pattern(0x3000)).unwrap();

        let dst = server
            .map_buffer_from_client_process(
                0x1800,
                heap + 0x400,
                client,
                MemoryPermission::READ_AND_WRITE,
                MemoryState::IPC_BUFFER0,
                false,
            )
            .unwrap();

        let mut first = vec![0xffu8; 0x1000];
        server.read_memory(dst & !PAGE_MASK, &mut first).unwrap();
        assert!(first.iter().all(|&b| b == 0));
    }

    #[test]
    fn lend_and_return_round_trip() {
        let fixture = Fixture::new();
        let client = &fixture.manager;
        let server = fixture.spawn();

        let heap = heap_pages(client, 8);
        let blocks_before = client.blocks();
        let free_before = fixture.free_pages();

        let src = heap + 0x1100;
        let size = 0x4000;
        let dst = server
            .map_buffer_from_client_process(
                size,
                src,
                client,
                MemoryPermission::READ_AND_WRITE,
                MemoryState::IPC_BUFFER0,
                true,
            )
            .unwrap();

        let lent = client.query_memory(heap + 0x2000);
        assert_eq!(lent.permission, MemoryPermission::NONE);
        assert_eq!(lent.source_permission, MemoryPermission::READ_AND_WRITE);
        assert_eq!(lent.attribute, MemoryAttribute::IPC_MAPPED);
        assert_eq!(server.query_memory(dst).state, MemoryState::IPC_BUFFER0);
        assert_eq!(fixture.free_pages(), free_before - 2);

        server
            .unmap_no_attribute_if_state_equals(dst, size, MemoryState::IPC_BUFFER0)
            .unwrap();
        client
            .unmap_ipc_restore_permission(src, size, MemoryState::IPC_BUFFER0)
            .unwrap();

        assert_eq!(client.blocks(), blocks_before);
        assert_eq!(server.block_count(), 1);
        assert_eq!(fixture.free_pages(), free_before);
    }

    #[test]
    fn server_unmap_needs_the_whole_window() {
        let fixture = Fixture::new();
        let client = &fixture.manager;
        let server = fixture.spawn();

        let heap = heap_pages(client, 4);
        client.write_memory(heap, &pattern(0x4000)).unwrap();
        let blocks_before = client.blocks();
        let free_before = fixture.free_pages();

        let size = 0x2000;
        let src = heap + 0x800;
        let dst = server
            .map_buffer_from_client_process(
                size,
                src,
                client,
                MemoryPermission::READ_AND_WRITE,
                MemoryState::IPC_BUFFER0,
                true,
            )
            .unwrap();
        let base = dst & !PAGE_MASK;
        let shared = client.translate(heap + 0x1000);
        assert_eq!(server.translate(base + 0x1000), shared);

        for (address, size) in [(base + 0x1800, 0x800), (base, 0x1000), (dst, 0x1000), (base + 0x1000, 0x2000)] {
            assert_eq!(
                server.unmap_no_attribute_if_state_equals(address, size, MemoryState::IPC_BUFFER0),
                Err(KernelError::InvalidMemRange)
            );
        }

        assert_eq!(server.translate(base + 0x1000), shared);
        assert_eq!(client.translate(heap + 0x1000), shared);
        assert_eq!(fixture.free_pages(), free_before - 2);

        server
            .unmap_no_attribute_if_state_equals(dst, size, MemoryState::IPC_BUFFER0)
            .unwrap();
        assert_eq!(server.block_count(), 1);
        assert_eq!(fixture.free_pages(), free_before);
        assert_eq!(
            server.unmap_no_attribute_if_state_equals(dst, size, MemoryState::IPC_BUFFER0),
            Err(KernelError::InvalidMemState)
        );

        client
            .unmap_ipc_restore_permission(src, size, MemoryState::IPC_BUFFER0)
            .unwrap();
        assert_eq!(client.blocks(), blocks_before);
        assert_eq!(client.translate(heap + 0x1000), shared);
        assert_eq!(fixture.free_pages(), free_before);
    }

    #[test]
    fn server_mapping_prefers_the_largest_alignment() {
        let fixture = Fixture::new();
        let client = &fixture.manager;
        let server = fixture.spawn();
        let heap = heap_pages(client, 2);

        let dst = server
            .map_buffer_from_client_process(
                0x2000,
                heap,
                client,
                MemoryPermission::READ,
                MemoryState::IPC_BUFFER1,
                false,
            )
            .unwrap();

        let largest = MAPPING_UNIT_SIZES[MAPPING_UNIT_SIZES.len() - 1];
        assert_eq!(dst % largest, 0);
        assert!(server.is_inside_alias_region(dst, 0x2000));
    }

    #[test]
    fn exhausted_slab_leaves_the_client_untouched() {
        // Client empty space plus heap take three blocks, the server one more
        let fixture = Fixture::with_block_capacity(4);
        let client = &fixture.manager;
        let heap = heap_pages(client, 4);
        let server = fixture.spawn();

        let blocks_before = client.blocks();
        let free_before = fixture.free_pages();

        assert_eq!(
            server.map_buffer_from_client_process(
                0x1800,
                heap + 0x1800,
                client,
                MemoryPermission::READ_AND_WRITE,
                MemoryState::IPC_BUFFER0,
                true,
            ),
            Err(KernelError::OutOfResource)
        );

        assert_eq!(client.blocks(), blocks_before);
        assert_eq!(fixture.free_pages(), free_before);
        assert_eq!(
            fixture.table.entry(heap + 0x2000).map(|entry| entry.permission),
            Some(MemoryPermission::READ_AND_WRITE)
        );
        assert_eq!(server.block_count(), 1);
    }

    #[test]
    fn lending_twice_keeps_first_permission() {
        let fixture = Fixture::new();
        let client = &fixture.manager;
        let server = fixture.spawn();
        let heap = heap_pages(client, 4);

        for _ in 0..2 {
            server
                .map_buffer_from_client_process(
                    0x4000,
                    heap,
                    client,
                    MemoryPermission::READ,
                    MemoryState::IPC_BUFFER1,
                    false,
                )
                .unwrap();
        }

        let info = client.query_memory(heap);
        assert_eq!(info.ipc_ref_count, 2);
        assert_eq!(info.permission, MemoryPermission::READ);

        client
            .unmap_ipc_restore_permission(heap, 0x4000, MemoryState::IPC_BUFFER1)
            .unwrap();
        assert_eq!(client.query_memory(heap).permission, MemoryPermission::READ);

        client
            .unmap_ipc_restore_permission(heap, 0x4000, MemoryState::IPC_BUFFER1)
            .unwrap();
        assert_eq!(
            client.query_memory(heap).permission,
            MemoryPermission::READ_AND_WRITE
        );
    }

    #[test]
    fn unsupported_buffer_state_is_rejected() {
        let fixture = Fixture::new();
        let client = &fixture.manager;
        let server = fixture.spawn();
        let heap = heap_pages(client, 1);

        assert_eq!(
            server.map_buffer_from_client_process(
                0x1000,
                heap,
                client,
                MemoryPermission::READ,
                MemoryState::HEAP,
                false
            ),
            Err(KernelError::InvalidCombination)
        );
        assert_eq!(
            client.unmap_ipc_restore_permission(heap, 0x1000, MemoryState::STACK),
            Err(KernelError::InvalidCombination)
        );
    }

    #[test]
    fn borrowed_range_cannot_be_lent() {
        let fixture = Fixture::new();
        let client = &fixture.manager;
        let server = fixture.spawn();
        let heap = heap_pages(client, 2);
        client.borrow_ipc_buffer(heap, 0x2000).unwrap();

        assert_eq!(
            server.map_buffer_from_client_process(
                0x2000,
                heap,
                client,
                MemoryPermission::READ,
                MemoryState::IPC_BUFFER0,
                false
            ),
            Err(KernelError::InvalidMemState)
        );
        assert_eq!(client.query_memory(heap).ipc_ref_count, 0);
    }

    #[test]
    fn ipc_buffer_borrow_round_trip() {
        let fixture = Fixture::new();
        let manager = &fixture.manager;
        let heap = heap_pages(manager, 2);

        manager.borrow_ipc_buffer(heap, 0x2000).unwrap();
        let info = manager.query_memory(heap);
        assert_eq!(info.attribute, MemoryAttribute::BORROWED);
        assert_eq!(info.permission, MemoryPermission::READ_AND_WRITE);

        assert_eq!(
            manager.borrow_ipc_buffer(heap, 0x2000),
            Err(KernelError::InvalidMemState)
        );

        manager.unborrow_ipc_buffer(heap, 0x2000).unwrap();
        assert_eq!(manager.query_memory(heap).attribute, MemoryAttribute::NONE);
        assert_eq!(manager.block_count(), 3);
    }

    #[test]
    fn transfer_memory_requires_same_pages() {
        let fixture = Fixture::new();
        let manager = &fixture.manager;
        let heap = heap_pages(manager, 4);

        let pages = manager
            .borrow_transfer_memory(heap, 0x2000, MemoryPermission::READ)
            .unwrap();
        assert_eq!(pages.pages_count(), 2);
        assert_eq!(manager.query_memory(heap).permission, MemoryPermission::READ);

        let other = fixture.allocate(2);
        assert_eq!(
            manager.unborrow_transfer_memory(heap, 0x2000, &other),
            Err(KernelError::InvalidMemRange)
        );

        manager.unborrow_transfer_memory(heap, 0x2000, &pages).unwrap();
        let info = manager.query_memory(heap);
        assert_eq!(info.permission, MemoryPermission::READ_AND_WRITE);
        assert_eq!(info.attribute, MemoryAttribute::NONE);
    }
}
