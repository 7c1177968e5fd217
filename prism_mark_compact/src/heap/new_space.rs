//! Semispace nursery.
//!
//! Two equally sized semispaces; objects are bump-allocated in the active
//! ("to") semispace. A full collection flips the semispaces and evacuates
//! survivors out of the inactive ("from") one, promoting those that were
//! already below the age mark, i.e. survived a previous cycle.
//!
//! ```text
//!   to-space   [ survivors | new objects ......... | free ]
//!                          ▲ age_mark              ▲ top
//! ```

use super::AllocationSpace;
use super::page::{ChunkMap, Page};
use crate::value::{Address, HeapObject};

/// The nursery.
#[derive(Debug)]
pub struct NewSpace {
    semispaces: [Address; 2],
    active: usize,
    capacity: usize,
    top: Address,
    age_mark: Address,
    from_top: Address,
}

impl NewSpace {
    /// Reserve two semispaces of `capacity` bytes each.
    pub(crate) fn new(chunks: &mut ChunkMap, capacity: usize, align: usize) -> Option<Self> {
        let first = chunks.insert(Page::allocate(capacity, align, AllocationSpace::New)?);
        let second = chunks.insert(Page::allocate(capacity, align, AllocationSpace::New)?);
        Some(Self {
            semispaces: [first, second],
            active: 0,
            capacity,
            top: first,
            age_mark: first,
            from_top: second,
        })
    }

    /// Size of one semispace in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start of the active semispace.
    #[inline]
    pub fn to_space_start(&self) -> Address {
        self.semispaces[self.active]
    }

    /// End of the active semispace.
    #[inline]
    pub fn to_space_end(&self) -> Address {
        self.to_space_start() + self.capacity
    }

    /// Start of the inactive semispace.
    #[inline]
    pub fn from_space_start(&self) -> Address {
        self.semispaces[1 - self.active]
    }

    /// Allocation top of the inactive semispace at the last flip.
    #[inline]
    pub fn from_space_top(&self) -> Address {
        self.from_top
    }

    /// Allocation top of the active semispace.
    #[inline]
    pub fn top(&self) -> Address {
        self.top
    }

    /// Objects below this address survived a previous cycle.
    #[inline]
    pub fn age_mark(&self) -> Address {
        self.age_mark
    }

    pub(crate) fn set_age_mark(&mut self, mark: Address) {
        self.age_mark = mark;
    }

    /// Bytes allocated in the active semispace.
    #[inline]
    pub fn size(&self) -> usize {
        self.top - self.to_space_start()
    }

    /// Whether `addr` lies in either semispace.
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        self.semispaces
            .iter()
            .any(|&start| addr >= start && addr < start + self.capacity)
    }

    /// Whether `addr` lies in the active semispace.
    #[inline]
    pub fn to_space_contains(&self, addr: Address) -> bool {
        addr >= self.to_space_start() && addr < self.to_space_end()
    }

    /// Bump-allocate `size` bytes.
    #[inline]
    pub(crate) fn allocate_raw(&mut self, size: usize) -> Option<Address> {
        if self.to_space_end() - self.top < size {
            return None;
        }
        let address = self.top;
        self.top = self.top + size;
        Some(address)
    }

    /// Swap the semispaces and reset the allocation top.
    pub(crate) fn flip(&mut self) {
        self.from_top = self.top;
        self.active = 1 - self.active;
        self.top = self.to_space_start();
    }

    /// Objects in the active semispace, in allocation order.
    pub fn objects(&self) -> impl Iterator<Item = HeapObject> {
        Page::objects_in(self.to_space_start(), self.top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::WORD_SIZE;

    const CAPACITY: usize = 16 * 1024;

    #[test]
    fn test_bump_until_full() {
        let mut chunks = ChunkMap::new();
        let mut space = NewSpace::new(&mut chunks, CAPACITY, CAPACITY).expect("semispaces");
        let first = space.allocate_raw(4 * WORD_SIZE).expect("room");
        assert_eq!(first, space.to_space_start());
        assert!(chunks.in_new_space(first));
        assert!(space.allocate_raw(CAPACITY).is_none());
        assert_eq!(space.size(), 4 * WORD_SIZE);
    }

    #[test]
    fn test_flip_swaps_semispaces() {
        let mut chunks = ChunkMap::new();
        let mut space = NewSpace::new(&mut chunks, CAPACITY, CAPACITY).expect("semispaces");
        let old_to = space.to_space_start();
        let object = space.allocate_raw(8 * WORD_SIZE).expect("room");

        space.flip();
        assert_eq!(space.from_space_start(), old_to);
        assert_eq!(space.from_space_top(), object + 8 * WORD_SIZE);
        assert_eq!(space.top(), space.to_space_start());
        assert!(space.contains(object));
        assert!(!space.to_space_contains(object));
    }
}
