//! Resource Limits
//!
//! Per-process accounting of limited kernel resources. The memory manager
//! reserves physical memory here before allocating heap or donated pages,
//! and releases it when those pages are freed.

use spin::Mutex;

use crate::{KernelError, KernelResult};

/// Kinds of resources a process is limited on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum LimitableResource {
    /// Physical memory in bytes
    Memory = 0,
    /// Threads
    Thread = 1,
    /// Events
    Event = 2,
    /// Transfer memory objects
    TransferMemory = 3,
    /// IPC sessions
    Session = 4,
}

impl LimitableResource {
    /// Number of resource kinds
    pub const COUNT: usize = 5;
}

/// Reservation interface consumed by the memory manager
pub trait ResourceLimiter: Send + Sync {
    /// Reserve `amount` of `resource`; false when the limit would be exceeded
    fn reserve(&self, resource: LimitableResource, amount: u64) -> bool;

    /// Return a previous reservation
    fn release(&self, resource: LimitableResource, amount: u64);
}

#[derive(Debug, Clone, Copy, Default)]
struct ResourceEntry {
    limit: u64,
    current: u64,
    peak: u64,
}

/// Limit and usage of every [`LimitableResource`]
#[derive(Debug, Default)]
pub struct ResourceLimit {
    entries: Mutex<[ResourceEntry; LimitableResource::COUNT]>,
}

impl ResourceLimit {
    /// Create a limit set where every resource has a limit of zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit of `resource`; fails if it is already in use beyond it
    pub fn set_limit_value(&self, resource: LimitableResource, limit: u64) -> KernelResult<()> {
        let mut entries = self.entries.lock();
        let entry = &mut entries[resource as usize];

        if entry.current > limit {
            return Err(KernelError::InvalidState);
        }

        entry.limit = limit;
        Ok(())
    }

    /// Limit of `resource`
    pub fn limit_value(&self, resource: LimitableResource) -> u64 {
        self.entries.lock()[resource as usize].limit
    }

    /// Current usage of `resource`
    pub fn current_value(&self, resource: LimitableResource) -> u64 {
        self.entries.lock()[resource as usize].current
    }

    /// Highest usage of `resource` seen so far
    pub fn peak_value(&self, resource: LimitableResource) -> u64 {
        self.entries.lock()[resource as usize].peak
    }

    /// Amount of `resource` still available
    pub fn remaining_value(&self, resource: LimitableResource) -> u64 {
        let entries = self.entries.lock();
        let entry = &entries[resource as usize];
        entry.limit - entry.current
    }
}

impl ResourceLimiter for ResourceLimit {
    fn reserve(&self, resource: LimitableResource, amount: u64) -> bool {
        let mut entries = self.entries.lock();
        let entry = &mut entries[resource as usize];

        match entry.current.checked_add(amount) {
            Some(new_value) if new_value <= entry.limit => {
                entry.current = new_value;
                entry.peak = entry.peak.max(new_value);
                true
            }
            _ => {
                debug_print!(
                    DEBUG,
                    "{:?} reservation of {:#x} refused ({:#x}/{:#x} in use)",
                    resource,
                    amount,
                    entry.current,
                    entry.limit
                );
                false
            }
        }
    }

    fn release(&self, resource: LimitableResource, amount: u64) {
        let mut entries = self.entries.lock();
        let entry = &mut entries[resource as usize];

        if amount > entry.current {
            fatal!(
                "{:?} release of {:#x} exceeds current usage {:#x}",
                resource,
                amount,
                entry.current
            );
        }

        entry.current -= amount;
    }
}
