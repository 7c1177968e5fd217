//! Per-page skip list for code space.
//!
//! The page is divided into fixed regions. For each region the list keeps the
//! lowest start address of an object overlapping it, so a lookup for an
//! interior address only walks objects from that start onwards.

use crate::value::{Address, WORD_SIZE};

/// log2 of the region size.
pub const REGION_SIZE_LOG2: u32 = 13;

/// Bytes per region (8KB).
pub const REGION_SIZE: usize = 1 << REGION_SIZE_LOG2;

/// Object starts per region of a page.
#[derive(Debug, Clone)]
pub struct SkipList {
    page_base: Address,
    starts: Box<[Option<Address>]>,
}

impl SkipList {
    /// Empty list for a page of `page_size` bytes at `page_base`.
    pub fn new(page_base: Address, page_size: usize) -> Self {
        Self {
            page_base,
            starts: vec![None; page_size.div_ceil(REGION_SIZE)].into_boxed_slice(),
        }
    }

    /// Forget every start.
    pub fn clear(&mut self) {
        self.starts.fill(None);
    }

    #[inline]
    fn region_number(&self, addr: Address) -> usize {
        (addr - self.page_base) >> REGION_SIZE_LOG2
    }

    /// Record an object of `size` bytes at `addr`.
    pub fn add_object(&mut self, addr: Address, size: usize) {
        let first = self.region_number(addr);
        let last = self.region_number(addr + size - WORD_SIZE);
        for start in &mut self.starts[first..=last] {
            match start {
                Some(existing) if *existing <= addr => {}
                _ => *start = Some(addr),
            }
        }
    }

    /// Start of the first object overlapping the region containing `addr`.
    pub fn start_for(&self, addr: Address) -> Option<Address> {
        self.starts.get(self.region_number(addr)).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_spanning_regions() {
        let base = Address::new(0x10_0000);
        let mut list = SkipList::new(base, 4 * REGION_SIZE);

        list.add_object(base + 64, 128);
        list.add_object(base + REGION_SIZE - 64, REGION_SIZE + 128);
        list.add_object(base + 2 * REGION_SIZE + 256, 64);

        assert_eq!(list.start_for(base + 100), Some(base + 64));
        assert_eq!(list.start_for(base + REGION_SIZE + 8), Some(base + REGION_SIZE - 64));
        assert_eq!(list.start_for(base + 2 * REGION_SIZE + 300), Some(base + REGION_SIZE - 64));
        assert_eq!(list.start_for(base + 3 * REGION_SIZE), None);
    }

    #[test]
    fn test_clear() {
        let base = Address::new(0x20_0000);
        let mut list = SkipList::new(base, REGION_SIZE);
        list.add_object(base, 64);
        list.clear();
        assert_eq!(list.start_for(base), None);
    }
}
