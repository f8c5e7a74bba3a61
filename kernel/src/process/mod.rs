//! Process Resources
//!
//! Kernel objects a guest process owns alongside its address space:
//!
//! - Resource limits, reserved by the memory manager before it allocates
//!   physical pages on the process's behalf
//! - Shared memory objects, whose pages can be mapped into several processes
//! - Transfer memory objects, which borrow a range of the owner's heap
//!
//! # Design Principles
//!
//! - Objects never touch the block list directly; they go through the
//!   [`MemoryManager`](crate::memory::MemoryManager) operations
//! - Every backing page an object allocates is returned when it drops

pub mod resource_limit;
pub mod shared_memory;
pub mod transfer_memory;

pub use resource_limit::{LimitableResource, ResourceLimit, ResourceLimiter};
pub use shared_memory::SharedMemory;
pub use transfer_memory::TransferMemory;
