//! Memory State, Permission and Attribute Flags
//!
//! Bit-exact flag sets describing a block's signature. A [`MemoryState`]
//! value is both an identifier (low byte) and a capability set (upper bits
//! saying which operations the state allows); operations test capabilities
//! with `(state & mask) == expected` arithmetic, so the exact bit values
//! matter and must not be simplified.

use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Memory state of a block: low byte identifies the state, upper bits
    /// are the operations allowed on it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryState: u32 {
        /// Nothing mapped
        const UNMAPPED = 0x0000_0000;
        /// Memory-mapped IO
        const IO = 0x0000_2001;
        /// Normal kernel-provided memory
        const NORMAL = 0x0004_2002;
        /// Main executable code
        const CODE_STATIC = 0x00DC_7E03;
        /// Main executable data, or code made writable
        const CODE_MUTABLE = 0x03FE_BD04;
        /// Process heap
        const HEAP = 0x037E_BD05;
        /// Shared memory object mapping
        const SHARED_MEMORY = 0x0040_2006;
        /// Loaded module code
        const MOD_CODE_STATIC = 0x00DD_7E08;
        /// Loaded module data
        const MOD_CODE_MUTABLE = 0x03FF_BD09;
        /// IPC buffer mapped with send type 0
        const IPC_BUFFER0 = 0x005C_3C0A;
        /// Stack alias of another range
        const STACK = 0x005C_3C0B;
        /// Thread local storage
        const THREAD_LOCAL = 0x0040_200C;
        /// Transfer memory mapped without sharing
        const TRANSFER_MEMORY_ISOLATED = 0x015C_3C0D;
        /// Transfer memory mapping
        const TRANSFER_MEMORY = 0x005C_380E;
        /// Memory of another process mapped into this one
        const PROCESS_MEMORY = 0x0040_380F;
        /// Inaccessible, outside the address space
        const RESERVED = 0x0000_0010;
        /// IPC buffer mapped with send type 1
        const IPC_BUFFER1 = 0x005C_3811;
        /// IPC buffer mapped with send type 3
        const IPC_BUFFER3 = 0x004C_2812;
        /// Kernel thread stack
        const KERNEL_STACK = 0x0000_2013;
        /// Read-only code mapped by the loader
        const CODE_READ_ONLY = 0x0040_2214;
        /// Writable code mapped by the loader
        const CODE_WRITABLE = 0x0040_2015;

        /// State identifier bits
        const USER_MASK = 0xff;
        /// Every bit
        const MASK = 0xffff_ffff;

        /// Permission may be changed by the owner
        const PERMISSION_CHANGE_ALLOWED = 1 << 8;
        /// Debug syscalls may force read/write access
        const FORCE_READ_WRITABLE_BY_DEBUG_SYSCALLS = 1 << 9;
        /// May be sent as an IPC type 0 buffer
        const IPC_SEND_ALLOWED_TYPE0 = 1 << 10;
        /// May be sent as an IPC type 3 buffer
        const IPC_SEND_ALLOWED_TYPE3 = 1 << 11;
        /// May be sent as an IPC type 1 buffer
        const IPC_SEND_ALLOWED_TYPE1 = 1 << 12;
        /// Permission may be changed by the process loader
        const PROCESS_PERMISSION_CHANGE_ALLOWED = 1 << 14;
        /// May be aliased with map
        const MAP_ALLOWED = 1 << 15;
        /// Process code mapping may be torn down
        const UNMAP_PROCESS_CODE_MEMORY_ALLOWED = 1 << 16;
        /// May back transfer memory
        const TRANSFER_MEMORY_ALLOWED = 1 << 17;
        /// Physical address may be queried
        const QUERY_PHYSICAL_ADDRESS_ALLOWED = 1 << 18;
        /// May be mapped into a device address space
        const MAP_DEVICE_ALLOWED = 1 << 19;
        /// May be mapped into a device address space with alignment
        const MAP_DEVICE_ALIGNED_ALLOWED = 1 << 20;
        /// May be borrowed as an IPC buffer
        const IPC_BUFFER_ALLOWED = 1 << 21;
        /// Backed by pool-allocated pages
        const IS_POOL_ALLOCATED = 1 << 22;
        /// May be mapped into another process
        const MAP_PROCESS_ALLOWED = 1 << 23;
        /// Attributes may be changed
        const ATTRIBUTE_CHANGE_ALLOWED = 1 << 24;
        /// May back code memory
        const CODE_MEMORY_ALLOWED = 1 << 25;
    }
}

impl MemoryState {
    /// Name of the state identified by these bits, if it is a known state
    pub const fn name(self) -> Option<&'static str> {
        let name = match self.bits() {
            0x0000_0000 => "Unmapped",
            0x0000_2001 => "Io",
            0x0004_2002 => "Normal",
            0x00DC_7E03 => "CodeStatic",
            0x03FE_BD04 => "CodeMutable",
            0x037E_BD05 => "Heap",
            0x0040_2006 => "SharedMemory",
            0x00DD_7E08 => "ModCodeStatic",
            0x03FF_BD09 => "ModCodeMutable",
            0x005C_3C0A => "IpcBuffer0",
            0x005C_3C0B => "Stack",
            0x0040_200C => "ThreadLocal",
            0x015C_3C0D => "TransferMemoryIsolated",
            0x005C_380E => "TransferMemory",
            0x0040_380F => "ProcessMemory",
            0x0000_0010 => "Reserved",
            0x005C_3811 => "IpcBuffer1",
            0x004C_2812 => "IpcBuffer3",
            0x0000_2013 => "KernelStack",
            0x0040_2214 => "CodeReadOnly",
            0x0040_2015 => "CodeWritable",
            _ => return None,
        };
        Some(name)
    }

    /// Capability bit an IPC buffer state requires of the lent range
    pub const fn ipc_send_mask(self) -> Option<Self> {
        match self.bits() {
            0x005C_3C0A => Some(Self::IPC_SEND_ALLOWED_TYPE0),
            0x005C_3811 => Some(Self::IPC_SEND_ALLOWED_TYPE1),
            0x004C_2812 => Some(Self::IPC_SEND_ALLOWED_TYPE3),
            _ => None,
        }
    }

    /// Whether a mapping of this state owns its backing pages, so unmapping
    /// it for the kernel frees them
    pub const fn is_kernel_owned(self) -> bool {
        matches!(
            self.bits(),
            0x0004_2002 // Normal
                | 0x00DC_7E03 // CodeStatic
                | 0x03FE_BD04 // CodeMutable
                | 0x0040_200C // ThreadLocal
                | 0x0000_2013 // KernelStack
                | 0x0040_2214 // CodeReadOnly
                | 0x0040_2015 // CodeWritable
        )
    }
}

impl fmt::Display for MemoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#010x}", self.bits()),
        }
    }
}

bitflags! {
    /// Access permission of a block
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryPermission: u32 {
        /// No access
        const NONE = 0;
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXECUTE = 1 << 2;
        /// Readable and writable
        const READ_AND_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Readable and executable
        const READ_AND_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        /// Every bit
        const MASK = 0xffff_ffff;
    }
}

impl fmt::Display for MemoryPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Self::READ) { 'R' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'W' } else { '-' };
        let x = if self.contains(Self::EXECUTE) { 'X' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

bitflags! {
    /// Attribute bits of a block
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryAttribute: u32 {
        /// No attribute
        const NONE = 0;
        /// Range is borrowed by another mapping
        const BORROWED = 1 << 0;
        /// Range is lent through IPC
        const IPC_MAPPED = 1 << 1;
        /// Range is mapped into a device address space
        const DEVICE_MAPPED = 1 << 2;
        /// Range is uncached
        const UNCACHED = 1 << 3;

        /// Transient reference-counted bits
        const IPC_AND_DEVICE_MAPPED = Self::IPC_MAPPED.bits() | Self::DEVICE_MAPPED.bits();
        /// Borrowed or lent
        const BORROWED_AND_IPC_MAPPED = Self::BORROWED.bits() | Self::IPC_MAPPED.bits();
        /// Device mapped or uncached
        const DEVICE_MAPPED_AND_UNCACHED = Self::DEVICE_MAPPED.bits() | Self::UNCACHED.bits();
        /// Every attribute bit
        const MASK = 0xff;
    }
}
