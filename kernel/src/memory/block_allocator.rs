//! Memory Block Budget
//!
//! The kernel carves memory block descriptors out of a fixed slab shared by
//! every process. Each block-list mutation must first check that the slab
//! can supply the worst-case number of new descriptors it could create, so
//! that exhaustion is always detected before anything is mutated.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-capacity budget of memory block descriptors
#[derive(Debug)]
pub struct MemoryBlockSlab {
    capacity: usize,
    count: AtomicUsize,
}

impl MemoryBlockSlab {
    /// Create a slab able to hold `capacity` blocks
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            count: AtomicUsize::new(0),
        }
    }

    /// Total number of blocks the slab can hold
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of blocks currently in use across every address space
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether `count` more blocks can be allocated right now
    pub fn can_allocate(&self, count: usize) -> bool {
        self.count().saturating_add(count) <= self.capacity
    }

    /// Account for a net change in the number of live blocks
    pub(crate) fn adjust(&self, delta: isize) {
        if delta >= 0 {
            self.count.fetch_add(delta.unsigned_abs(), Ordering::AcqRel);
        } else {
            self.count.fetch_sub(delta.unsigned_abs(), Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryBlockSlab;

    #[test]
    fn can_allocate_respects_capacity() {
        let slab = MemoryBlockSlab::new(4);
        assert!(slab.can_allocate(4));
        slab.adjust(3);
        assert!(slab.can_allocate(1));
        assert!(!slab.can_allocate(2));
        slab.adjust(-2);
        assert_eq!(slab.count(), 1);
        assert!(slab.can_allocate(3));
    }
}
