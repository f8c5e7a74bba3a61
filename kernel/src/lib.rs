//! HLE Kernel Memory Manager
//!
//! Guest-process virtual memory management for a high-level emulated console
//! kernel. This library reproduces in software what the real kernel's VMM
//! does for one emulated process: it tracks which guest virtual addresses are
//! mapped, with what permission and what kind of backing memory, and enforces
//! the same legality rules the real kernel enforces.
//!
//! # Architecture
//!
//! - [`memory::MemoryManager`] owns an ordered partition of the guest address
//!   space into homogeneous [`memory::MemoryBlock`]s
//! - Every operation validates the current range signature, reserves the
//!   worst-case number of new blocks, mutates the host page table and only
//!   then commits the new partition shape
//! - Region layout and mapping placement honor ASLR
//! - IPC buffer lending never exposes sibling bytes of unaligned edge pages
//!
//! # Collaborators
//!
//! The manager talks to the outside world through three traits:
//! [`memory::HostMapper`], [`memory::PageAllocator`] and
//! [`process::ResourceLimiter`]. In-process implementations of each are
//! provided so the manager can run standalone.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]

#[macro_use]
pub mod macros;

pub mod memory;
pub mod process;

use thiserror::Error;

/// Result module identifier of the kernel
const KERNEL_MODULE: u32 = 1;

/// Core kernel error types
///
/// These are the guest-visible result codes of the memory syscalls. They are
/// always returned, never raised; programming errors go through [`fatal!`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Size argument is invalid for the object it refers to
    #[error("invalid size")]
    InvalidSize,
    /// Address could not be translated or lies outside physical memory
    #[error("invalid address")]
    InvalidAddress,
    /// Not enough memory blocks left for the worst-case split
    #[error("out of memory block resources")]
    OutOfResource,
    /// Physical memory or region space exhausted
    #[error("out of memory")]
    OutOfMemory,
    /// Range state does not satisfy the operation's precondition
    #[error("invalid memory state")]
    InvalidMemState,
    /// Permission argument is not allowed for this object
    #[error("invalid permission")]
    InvalidPermission,
    /// Supplied page list does not match the range's backing
    #[error("invalid memory range")]
    InvalidMemRange,
    /// Unsupported state passed to an IPC buffer operation
    #[error("invalid combination")]
    InvalidCombination,
    /// Object is in the wrong lifecycle state for the request
    #[error("invalid state")]
    InvalidState,
    /// Resource limiter refused the reservation
    #[error("resource limit exceeded")]
    ResLimitExceeded,
    /// No virtual address space left in the target region
    #[error("out of virtual address space")]
    OutOfVaSpace,
}

impl KernelError {
    /// Description number of the result code
    pub const fn description(self) -> u32 {
        match self {
            Self::InvalidSize => 101,
            Self::InvalidAddress => 102,
            Self::OutOfResource => 103,
            Self::OutOfMemory => 104,
            Self::InvalidMemState => 106,
            Self::InvalidPermission => 108,
            Self::InvalidMemRange => 110,
            Self::InvalidCombination => 116,
            Self::InvalidState => 125,
            Self::ResLimitExceeded => 132,
            Self::OutOfVaSpace => 259,
        }
    }

    /// Raw result code as seen by the guest
    pub const fn raw(self) -> u32 {
        KERNEL_MODULE | (self.description() << 9)
    }
}

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::KernelError;

    #[test]
    fn raw_codes_match_guest_values() {
        assert_eq!(KernelError::InvalidSize.raw(), 0xca01);
        assert_eq!(KernelError::OutOfResource.raw(), 0xce01);
        assert_eq!(KernelError::InvalidMemState.raw(), 0xd401);
        assert_eq!(KernelError::InvalidMemRange.raw(), 0xdc01);
        assert_eq!(KernelError::InvalidState.raw(), 0xfa01);
        assert_eq!(KernelError::ResLimitExceeded.raw(), 0x10801);
        assert_eq!(KernelError::OutOfVaSpace.raw(), 0x20601);
    }
}
