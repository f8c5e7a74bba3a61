//! Page Lists
//!
//! A page list is an ordered sequence of runs of physically contiguous pages.
//! It describes what backs a virtual range and doubles as an equality token:
//! unmapping with a page list only succeeds if the range is still backed by
//! exactly those pages, in that order.

use super::PAGE_SIZE;

/// One run of contiguous physical pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageNode {
    /// Physical address of the first page
    pub address: u64,
    /// Number of pages in the run
    pub pages_count: u64,
}

impl PageNode {
    /// Physical address one past the last page of the run
    pub const fn end_address(&self) -> u64 {
        self.address + self.pages_count * PAGE_SIZE
    }
}

/// Ordered runs of physical pages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageList {
    nodes: Vec<PageNode>,
}

impl PageList {
    /// Create an empty page list
    pub const fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Append a run, merging it into the last run when physically contiguous
    pub fn add_range(&mut self, address: u64, pages_count: u64) {
        if pages_count == 0 {
            return;
        }

        if let Some(last) = self.nodes.last_mut() {
            if last.end_address() == address {
                last.pages_count += pages_count;
                return;
            }
        }

        self.nodes.push(PageNode {
            address,
            pages_count,
        });
    }

    /// Total number of pages across all runs
    pub fn pages_count(&self) -> u64 {
        self.nodes.iter().map(|node| node.pages_count).sum()
    }

    /// Whether the list holds no pages
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Runs in order
    pub fn nodes(&self) -> &[PageNode] {
        &self.nodes
    }

    /// Iterate over runs in order
    pub fn iter(&self) -> impl Iterator<Item = &PageNode> {
        self.nodes.iter()
    }

    /// Iterate over the physical address of every page, in order
    pub fn page_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes
            .iter()
            .flat_map(|node| (0..node.pages_count).map(move |i| node.address + i * PAGE_SIZE))
    }
}

impl<'a> IntoIterator for &'a PageList {
    type Item = &'a PageNode;
    type IntoIter = core::slice::Iter<'a, PageNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
