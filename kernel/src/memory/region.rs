//! Address Space Layout
//!
//! Computes where the alias, heap, stack and TLS/IO regions of a guest
//! address space live, and which regions each memory state may be placed in.
//!
//! # Memory Layout
//!
//! The four map regions are carved out of whichever side of the code region
//! is larger. Each region may receive an independent 2 MiB aligned random
//! offset; regions are then ordered pairwise by offset so they never
//! overlap. Without ASLR the order is always alias, heap, stack, TLS/IO.

use rand_core::RngCore;

use super::flags::MemoryState;
use super::{REGION_ALIGNMENT, align_down, align_up};
use crate::{KernelError, KernelResult};

/// Shift turning a byte offset into a count of region-aligned slots
const REGION_ALIGNMENT_SHIFT: u32 = REGION_ALIGNMENT.trailing_zeros();

/// Guest address space flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpaceType {
    /// 32-bit space with an alias region
    Bits32,
    /// 36-bit space
    Bits36,
    /// 32-bit space without an alias region
    Bits32NoMap,
    /// 39-bit space
    Bits39,
}

impl AddressSpaceType {
    /// Address width in bits
    pub const fn width(self) -> u32 {
        match self {
            Self::Bits32 | Self::Bits32NoMap => 32,
            Self::Bits36 => 36,
            Self::Bits39 => 39,
        }
    }
}

/// A half-open virtual range with its ASLR offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    /// First address
    pub start: u64,
    /// One past the last address
    pub end: u64,
    /// Random offset applied before ordering
    pub aslr_offset: u64,
}

impl Region {
    fn sized(size: u64) -> Self {
        Self {
            start: 0,
            end: size,
            aslr_offset: 0,
        }
    }

    /// Size in bytes
    pub const fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Whether `[address, address + size)` is a non-empty range inside
    pub fn contains_range(&self, address: u64, size: u64) -> bool {
        let Some(end) = address.checked_add(size) else {
            return false;
        };
        self.start <= address && end > address && end - 1 <= self.end.wrapping_sub(1)
    }

    /// Whether `[address, address + size)` does not touch the region
    pub fn excludes_range(&self, address: u64, size: u64) -> bool {
        address.saturating_add(size) <= self.start || address >= self.end
    }

    fn place(&mut self, base: u64) {
        let size = self.size();
        self.start = base + self.aslr_offset;
        self.end = self.start + size;
    }

    fn shift(&mut self, delta: u64) {
        self.start += delta;
        self.end += delta;
    }
}

/// Order two regions by ASLR offset, pushing the later one past the earlier
fn sort_region(lhs: &mut Region, rhs: &mut Region) {
    if lhs.aslr_offset < rhs.aslr_offset {
        rhs.shift(lhs.size());
    } else {
        lhs.shift(rhs.size());
    }
}

/// Uniform random value in `[min, max]`
pub(crate) fn random_in_range(rng: &mut dyn RngCore, min: u64, max: u64) -> u64 {
    let span = max - min;
    if span == u64::MAX {
        return rng.next_u64();
    }
    min + rng.next_u64() % (span + 1)
}

/// Fully resolved region layout of one address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpaceLayout {
    space_type: AddressSpaceType,
    addr_space_start: u64,
    addr_space_end: u64,
    code: Region,
    alias: Region,
    heap: Region,
    stack: Region,
    tls_io: Region,
    aslr: Region,
}

impl AddressSpaceLayout {
    /// Compute the layout for a process whose main module occupies
    /// `[code_address, code_address + code_size)`.
    ///
    /// With an `rng`, every region gets a random 2 MiB aligned offset inside
    /// the available map area. Fails with `OutOfMemory` when the regions do
    /// not fit beside the code region.
    pub fn new(
        space_type: AddressSpaceType,
        code_address: u64,
        code_size: u64,
        rng: Option<&mut dyn RngCore>,
    ) -> KernelResult<Self> {
        let width = space_type.width();
        let addr_space_end = 1u64 << width;

        let code_end = code_address
            .checked_add(code_size)
            .filter(|end| *end <= addr_space_end)
            .ok_or(KernelError::InvalidMemRange)?;

        let (alias_size, heap_size, stack_size, tls_io_size);
        let (code_start, code_region_size, span_start, span_end, base_address);

        match space_type {
            AddressSpaceType::Bits32 => {
                alias_size = 0x4000_0000;
                heap_size = 0x4000_0000;
                stack_size = 0;
                tls_io_size = 0;
                code_start = 0x20_0000;
                code_region_size = 0x3fe0_0000;
                span_start = 0x20_0000;
                span_end = 0x4000_0000;
                base_address = 0x20_0000;
            }
            AddressSpaceType::Bits36 => {
                alias_size = 0x1_8000_0000;
                heap_size = 0x1_8000_0000;
                stack_size = 0;
                tls_io_size = 0;
                code_start = 0x800_0000;
                code_region_size = 0x7800_0000;
                span_start = 0x800_0000;
                span_end = 0x8000_0000;
                base_address = 0x800_0000;
            }
            AddressSpaceType::Bits32NoMap => {
                alias_size = 0;
                heap_size = 0x8000_0000;
                stack_size = 0;
                tls_io_size = 0;
                code_start = 0x20_0000;
                code_region_size = 0x3fe0_0000;
                span_start = 0x20_0000;
                span_end = 0x4000_0000;
                base_address = 0x20_0000;
            }
            AddressSpaceType::Bits39 => {
                alias_size = 0x10_0000_0000;
                heap_size = 0x1_8000_0000;
                stack_size = 0x8000_0000;
                tls_io_size = 0x10_0000_0000;
                code_start = align_down(code_address, REGION_ALIGNMENT);
                code_region_size = align_up(code_end, REGION_ALIGNMENT) - code_start;
                span_start = code_start;
                span_end = code_start + code_region_size;
                base_address = 0x800_0000;
            }
        }

        let code = Region {
            start: code_start,
            end: code_start + code_region_size,
            aslr_offset: 0,
        };

        let (map_base, map_available) =
            if code.start.saturating_sub(base_address) >= addr_space_end - code.end {
                (base_address, code.start.saturating_sub(base_address))
            } else {
                (code.end, addr_space_end - code.end)
            };

        let map_total = alias_size + heap_size + stack_size + tls_io_size;
        if map_available < map_total {
            debug_print!(
                DEBUG,
                "map regions need {:#x} bytes but only {:#x} are available",
                map_total,
                map_available
            );
            return Err(KernelError::OutOfMemory);
        }

        let mut alias = Region::sized(alias_size);
        let mut heap = Region::sized(heap_size);
        let mut stack = Region::sized(stack_size);
        let mut tls_io = Region::sized(tls_io_size);

        if let Some(rng) = rng {
            let max_slot = (map_available - map_total) >> REGION_ALIGNMENT_SHIFT;
            for region in [&mut alias, &mut heap, &mut stack, &mut tls_io] {
                region.aslr_offset =
                    random_in_range(rng, 0, max_slot) << REGION_ALIGNMENT_SHIFT;
            }
        }

        for region in [&mut alias, &mut heap, &mut stack, &mut tls_io] {
            region.place(map_base);
        }

        sort_region(&mut heap, &mut alias);

        if stack_size != 0 {
            sort_region(&mut stack, &mut alias);
            sort_region(&mut stack, &mut heap);
        } else {
            stack.start = span_start;
            stack.end = span_end;
        }

        if tls_io_size != 0 {
            sort_region(&mut tls_io, &mut alias);
            sort_region(&mut tls_io, &mut heap);
            sort_region(&mut tls_io, &mut stack);
        } else {
            tls_io.start = span_start;
            tls_io.end = span_end;
        }

        let layout = Self {
            space_type,
            addr_space_start: 0,
            addr_space_end,
            code,
            alias,
            heap,
            stack,
            tls_io,
            aslr: Region {
                start: map_base,
                end: map_base + map_available,
                aslr_offset: 0,
            },
        };

        debug_print!(
            DEBUG,
            "{}-bit layout: alias {:#x}..{:#x} heap {:#x}..{:#x} stack {:#x}..{:#x} tls/io {:#x}..{:#x}",
            width,
            layout.alias.start,
            layout.alias.end,
            layout.heap.start,
            layout.heap.end,
            layout.stack.start,
            layout.stack.end,
            layout.tls_io.start,
            layout.tls_io.end
        );

        Ok(layout)
    }

    /// Address space flavor
    pub const fn space_type(&self) -> AddressSpaceType {
        self.space_type
    }

    /// Address width in bits
    pub const fn addr_space_width(&self) -> u32 {
        self.space_type.width()
    }

    /// Whole address space
    pub const fn addr_space(&self) -> Region {
        Region {
            start: self.addr_space_start,
            end: self.addr_space_end,
            aslr_offset: 0,
        }
    }

    /// Code region
    pub const fn code_region(&self) -> Region {
        self.code
    }

    /// Alias region (IPC buffers)
    pub const fn alias_region(&self) -> Region {
        self.alias
    }

    /// Heap region
    pub const fn heap_region(&self) -> Region {
        self.heap
    }

    /// Stack region
    pub const fn stack_region(&self) -> Region {
        self.stack
    }

    /// TLS/IO region
    pub const fn tls_io_region(&self) -> Region {
        self.tls_io
    }

    /// Area the map regions were randomized within
    pub const fn aslr_region(&self) -> Region {
        self.aslr
    }

    /// Base of the range code-like states may live in
    pub const fn addr_space_base(&self) -> u64 {
        match self.space_type.width() {
            36 | 39 => 0x800_0000,
            _ => 0x20_0000,
        }
    }

    /// Size of the range code-like states may live in
    pub const fn addr_space_size(&self) -> u64 {
        match self.space_type.width() {
            36 => 0xf_f800_0000,
            39 => 0x7f_f800_0000,
            _ => 0xffe0_0000,
        }
    }

    /// Whether the range lies past the code-like range
    pub fn is_invalid_region(&self, address: u64, size: u64) -> bool {
        match address.checked_add(size) {
            Some(end) => end.wrapping_sub(1) > self.addr_space_base() + self.addr_space_size() - 1,
            None => true,
        }
    }

    /// Region a block of `state` must be placed in
    pub fn region_for_state(&self, state: MemoryState) -> Option<Region> {
        let region = match state {
            MemoryState::IO | MemoryState::NORMAL | MemoryState::THREAD_LOCAL => self.tls_io,
            MemoryState::CODE_STATIC
            | MemoryState::CODE_MUTABLE
            | MemoryState::SHARED_MEMORY
            | MemoryState::MOD_CODE_STATIC
            | MemoryState::MOD_CODE_MUTABLE
            | MemoryState::TRANSFER_MEMORY_ISOLATED
            | MemoryState::TRANSFER_MEMORY
            | MemoryState::PROCESS_MEMORY
            | MemoryState::CODE_READ_ONLY
            | MemoryState::CODE_WRITABLE => Region {
                start: self.addr_space_base(),
                end: self.addr_space_base() + self.addr_space_size(),
                aslr_offset: 0,
            },
            MemoryState::HEAP => self.heap,
            MemoryState::IPC_BUFFER0 | MemoryState::IPC_BUFFER1 | MemoryState::IPC_BUFFER3 => {
                self.alias
            }
            MemoryState::STACK => self.stack,
            MemoryState::KERNEL_STACK => self.addr_space(),
            _ => return None,
        };
        Some(region)
    }

    /// Whether a block of `state` may be placed at `[address, address + size)`
    pub fn can_contain(&self, address: u64, size: u64, state: MemoryState) -> bool {
        let Some(region) = self.region_for_state(state) else {
            return false;
        };

        let inside = region.contains_range(address, size);
        let outside_heap = self.heap.excludes_range(address, size);
        let outside_alias = self.alias.excludes_range(address, size);

        match state {
            MemoryState::HEAP => inside && outside_alias,
            MemoryState::IPC_BUFFER0 | MemoryState::IPC_BUFFER1 | MemoryState::IPC_BUFFER3 => {
                inside && outside_heap
            }
            MemoryState::KERNEL_STACK => inside,
            _ => inside && outside_heap && outside_alias,
        }
    }
}
