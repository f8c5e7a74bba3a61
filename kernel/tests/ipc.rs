//! Cross-process buffer transfer scenarios

mod common;

use std::sync::Arc;

use common::Kernel;
use hle_kernel::KernelError;
use hle_kernel::memory::{
    AddressSpaceType, MemoryAttribute, MemoryPermission, MemoryState, PAGE_MASK, PAGE_SIZE,
    PageAllocator,
};
use hle_kernel::process::{SharedMemory, TransferMemory};

#[test]
fn request_buffer_round_trip() {
    let kernel = Kernel::new(1024);
    let client = kernel.process(AddressSpaceType::Bits39);
    let server = kernel.process(AddressSpaceType::Bits39);

    let heap = client.heap(8);
    let message: Vec<u8> = (0..0x3000u32).map(|i| (i * 7) as u8).collect();
    client.manager.write_memory(heap + 0x1200, &message).unwrap();

    let client_blocks = client.manager.blocks();
    let free_before = kernel.free_pages();

    let src = heap + 0x1200;
    let size = message.len() as u64;
    let dst = server
        .manager
        .map_buffer_from_client_process(
            size,
            src,
            &client.manager,
            MemoryPermission::READ_AND_WRITE,
            MemoryState::IPC_BUFFER0,
            true,
        )
        .unwrap();

    assert!(server.manager.is_inside_alias_region(dst, size));

    let mut received = vec![0u8; message.len()];
    server.manager.read_memory(dst, &mut received).unwrap();
    assert_eq!(received, message);

    // The server writes its reply into the shared interior page
    server.manager.write_memory(dst + 0xe00, b"reply").unwrap();
    let mut reply = [0u8; 5];
    client.manager.read_memory(src + 0xe00, &mut reply).unwrap();
    assert_eq!(&reply, b"reply");

    let interior = client.manager.query_memory(heap + 0x2000);
    assert_eq!(interior.permission, MemoryPermission::NONE);
    assert_eq!(interior.ipc_ref_count, 1);
    assert_eq!(
        client.table.entry(heap + 0x2000).map(|entry| entry.permission),
        Some(MemoryPermission::NONE)
    );

    server
        .manager
        .unmap_no_attribute_if_state_equals(dst, size, MemoryState::IPC_BUFFER0)
        .unwrap();
    client
        .manager
        .unmap_ipc_restore_permission(src, size, MemoryState::IPC_BUFFER0)
        .unwrap();

    assert_eq!(client.manager.blocks(), client_blocks);
    assert_eq!(server.manager.block_count(), 1);
    assert_eq!(server.table.mapped_pages_count(), 0);
    assert_eq!(kernel.free_pages(), free_before);
    assert_eq!(
        client.table.entry(heap + 0x2000).map(|entry| entry.permission),
        Some(MemoryPermission::READ_AND_WRITE)
    );
}

#[test]
fn server_unmap_checks_state() {
    let kernel = Kernel::new(1024);
    let client = kernel.process(AddressSpaceType::Bits39);
    let server = kernel.process(AddressSpaceType::Bits39);
    let heap = client.heap(2);

    let dst = server
        .manager
        .map_buffer_from_client_process(
            0x2000,
            heap,
            &client.manager,
            MemoryPermission::READ,
            MemoryState::IPC_BUFFER1,
            false,
        )
        .unwrap();

    assert_eq!(
        server
            .manager
            .unmap_no_attribute_if_state_equals(dst, 0x2000, MemoryState::IPC_BUFFER0),
        Err(KernelError::InvalidMemState)
    );
    server
        .manager
        .unmap_no_attribute_if_state_equals(dst, 0x2000, MemoryState::IPC_BUFFER1)
        .unwrap();
}

#[test]
fn partial_server_unmap_leaves_client_pages_alone() {
    let kernel = Kernel::new(1024);
    let client = kernel.process(AddressSpaceType::Bits39);
    let server = kernel.process(AddressSpaceType::Bits39);

    let heap = client.heap(4);
    client.manager.write_memory(heap + 0x1000, b"private").unwrap();
    let free_before = kernel.free_pages();

    let src = heap + 0x800;
    let dst = server
        .manager
        .map_buffer_from_client_process(
            0x2000,
            src,
            &client.manager,
            MemoryPermission::READ_AND_WRITE,
            MemoryState::IPC_BUFFER0,
            true,
        )
        .unwrap();
    let base = dst & !PAGE_MASK;

    assert_eq!(
        server
            .manager
            .unmap_no_attribute_if_state_equals(base + 0x1800, 0x800, MemoryState::IPC_BUFFER0),
        Err(KernelError::InvalidMemRange)
    );

    let client_page = client.manager.translate(heap + 0x1000).unwrap();
    let mut drained = Vec::new();
    while let Ok(pa) = kernel.allocator.allocate_single_page() {
        drained.push(pa);
    }
    assert!(!drained.contains(&client_page));
    for pa in drained {
        kernel.allocator.free_single_page(pa);
    }

    let mut buf = [0u8; 7];
    client.manager.read_memory(heap + 0x1000, &mut buf).unwrap();
    assert_eq!(&buf, b"private");

    server
        .manager
        .unmap_no_attribute_if_state_equals(dst, 0x2000, MemoryState::IPC_BUFFER0)
        .unwrap();
    client
        .manager
        .unmap_ipc_restore_permission(src, 0x2000, MemoryState::IPC_BUFFER0)
        .unwrap();
    assert_eq!(kernel.free_pages(), free_before);
}

#[test]
fn repeated_lend_cycles_return_every_page() {
    let kernel = Kernel::new(1024);
    let client = kernel.process(AddressSpaceType::Bits39);
    let server = kernel.process(AddressSpaceType::Bits39);

    let heap = client.heap(16);
    let client_blocks = client.manager.blocks();
    let free_before = kernel.free_pages();

    for (offset, size) in [(0x10, 0x20), (0x800, 0x2000), (0x1000, 0x3000), (0xfff, 0x5002)] {
        let src = heap + offset;
        let dst = server
            .manager
            .map_buffer_from_client_process(
                size,
                src,
                &client.manager,
                MemoryPermission::READ,
                MemoryState::IPC_BUFFER1,
                true,
            )
            .unwrap();
        server
            .manager
            .unmap_no_attribute_if_state_equals(dst, size, MemoryState::IPC_BUFFER1)
            .unwrap();
        client
            .manager
            .unmap_ipc_restore_permission(src, size, MemoryState::IPC_BUFFER1)
            .unwrap();

        assert_eq!(kernel.free_pages(), free_before, "buffer at {:#x}", offset);
    }

    assert_eq!(client.manager.blocks(), client_blocks);
    assert_eq!(server.manager.block_count(), 1);
    assert_eq!(server.table.mapped_pages_count(), 0);
}

#[test]
fn user_copies_check_client_blocks() {
    let kernel = Kernel::new(1024);
    let client = kernel.process(AddressSpaceType::Bits39);
    let server = kernel.process(AddressSpaceType::Bits39);

    let client_heap = client.heap(2);
    let server_heap = server.heap(2);
    client.manager.write_memory(client_heap + 0xff0, b"across a page").unwrap();

    client
        .manager
        .copy_data_to_current_process(
            &server.manager,
            server_heap,
            13,
            client_heap + 0xff0,
            MemoryState::MASK,
            MemoryState::HEAP,
            MemoryPermission::READ,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
        )
        .unwrap();

    let mut buf = [0u8; 13];
    server.manager.read_memory(server_heap, &mut buf).unwrap();
    assert_eq!(&buf, b"across a page");

    server.manager.write_memory(server_heap + 0x100, b"back").unwrap();
    client
        .manager
        .copy_data_from_current_process(
            &server.manager,
            client_heap + 0x1000,
            4,
            MemoryState::MASK,
            MemoryState::HEAP,
            MemoryPermission::READ_AND_WRITE,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
            server_heap + 0x100,
        )
        .unwrap();

    let mut back = [0u8; 4];
    client.manager.read_memory(client_heap + 0x1000, &mut back).unwrap();
    assert_eq!(&back, b"back");

    client
        .manager
        .set_memory_attribute(
            client_heap,
            PAGE_SIZE,
            MemoryAttribute::UNCACHED,
            MemoryAttribute::UNCACHED,
        )
        .unwrap();
    assert_eq!(
        client.manager.copy_data_to_current_process(
            &server.manager,
            server_heap,
            4,
            client_heap,
            MemoryState::MASK,
            MemoryState::HEAP,
            MemoryPermission::READ,
            MemoryAttribute::MASK,
            MemoryAttribute::NONE,
        ),
        Err(KernelError::InvalidMemState)
    );
}

#[test]
fn shared_and_transfer_memory_objects() {
    let kernel = Kernel::new(1024);
    let owner = kernel.process(AddressSpaceType::Bits39);
    let user = kernel.process(AddressSpaceType::Bits39);

    let shared = SharedMemory::new(
        Arc::clone(&kernel.context.page_allocator),
        3 * PAGE_SIZE,
        MemoryPermission::READ_AND_WRITE,
        MemoryPermission::READ,
    )
    .unwrap();

    let owner_address = owner.manager.stack_region().start;
    let user_address = user.manager.stack_region().start + 0x20_0000;
    shared
        .map_into_process(&owner.manager, owner_address, 3 * PAGE_SIZE, true, MemoryPermission::READ_AND_WRITE)
        .unwrap();
    shared
        .map_into_process(&user.manager, user_address, 3 * PAGE_SIZE, false, MemoryPermission::READ)
        .unwrap();
    assert_eq!(owner.manager.translate(owner_address), user.manager.translate(user_address));

    let heap = owner.heap(4);
    let mut transfer = TransferMemory::new();
    transfer
        .initialize(&owner.manager, heap, 2 * PAGE_SIZE, MemoryPermission::NONE)
        .unwrap();
    assert_eq!(
        owner.manager.borrow_ipc_buffer(heap, PAGE_SIZE),
        Err(KernelError::InvalidMemState)
    );
    transfer.reset(&owner.manager).unwrap();

    shared
        .unmap_from_process(&owner.manager, owner_address, 3 * PAGE_SIZE)
        .unwrap();
    shared
        .unmap_from_process(&user.manager, user_address, 3 * PAGE_SIZE)
        .unwrap();

    let free_before_drop = kernel.free_pages();
    drop(shared);
    assert_eq!(kernel.free_pages(), free_before_drop + 3);
}
