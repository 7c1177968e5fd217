//! Bounded marking worklist.
//!
//! A power-of-two ring buffer used as a stack. When it is full, a newly
//! marked object is turned back to grey in the mark bitmap and the deque
//! records that it overflowed; a later heap scan finds such objects again.
//!
//! ```text
//!        bottom                 top
//!          │                     │
//!   ┌───┬──▼──┬─────┬─────┬─────▼───┬───┐
//!   │   │ obj │ obj │ obj │  (free) │   │   push/pop at top (LIFO)
//!   └───┴─────┴─────┴─────┴─────────┴───┘
//! ```

use crate::heap::ChunkMap;
use crate::value::HeapObject;

/// Grey-object worklist with an overflow flag.
#[derive(Debug)]
pub struct MarkingDeque {
    array: Box<[Option<HeapObject>]>,
    mask: usize,
    top: usize,
    bottom: usize,
    overflowed: bool,
}

impl MarkingDeque {
    /// Create a deque with room for `capacity - 1` objects.
    ///
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity >= 2);
        Self {
            array: vec![None; capacity].into_boxed_slice(),
            mask: capacity - 1,
            top: 0,
            bottom: 0,
            overflowed: false,
        }
    }

    /// A deque with no storage; every push overflows until
    /// [`initialize`](Self::initialize) sizes it.
    pub fn unallocated() -> Self {
        Self {
            array: Box::default(),
            mask: 0,
            top: 0,
            bottom: 0,
            overflowed: false,
        }
    }

    /// Entries the ring buffer holds, one of which always stays free.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.array.len()
    }

    /// Reset to an empty, non-overflowed deque of `capacity` entries.
    pub fn initialize(&mut self, capacity: usize) {
        if self.array.len() != capacity {
            *self = Self::new(capacity);
        } else {
            self.top = 0;
            self.bottom = 0;
            self.overflowed = false;
        }
    }

    /// Whether no object is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == self.bottom
    }

    /// Whether a push would overflow.
    #[inline]
    pub fn is_full(&self) -> bool {
        ((self.top + 1) & self.mask) == self.bottom
    }

    /// Number of queued objects.
    #[inline]
    pub fn len(&self) -> usize {
        (self.top.wrapping_sub(self.bottom)) & self.mask
    }

    /// Whether an object was dropped since the last refill.
    #[inline]
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Record that an object could not be queued.
    #[inline]
    pub fn set_overflowed(&mut self) {
        self.overflowed = true;
    }

    /// Clear the overflow flag once a heap scan found no more grey objects.
    #[inline]
    pub fn clear_overflowed(&mut self) {
        self.overflowed = false;
    }

    /// Push without touching mark bits. Returns `false` when full.
    #[inline]
    pub fn push(&mut self, object: HeapObject) -> bool {
        if self.is_full() {
            return false;
        }
        self.array[self.top] = Some(object);
        self.top = (self.top + 1) & self.mask;
        true
    }

    /// Push an object that the caller has just marked black.
    ///
    /// On overflow the object is turned grey again, its live bytes are
    /// taken back, and the deque is flagged as overflowed. Returns `false`
    /// in that case.
    #[inline]
    pub fn push_black(&mut self, chunks: &mut ChunkMap, object: HeapObject) -> bool {
        if self.push(object) {
            return true;
        }
        chunks.black_to_grey(object);
        self.overflowed = true;
        false
    }

    /// Push an object that is already grey in the bitmap.
    #[inline]
    pub fn push_grey(&mut self, object: HeapObject) {
        if !self.push(object) {
            self.overflowed = true;
        }
    }

    /// Pop the most recently pushed object.
    #[inline]
    pub fn pop(&mut self) -> Option<HeapObject> {
        if self.is_empty() {
            return None;
        }
        self.top = self.top.wrapping_sub(1) & self.mask;
        self.array[self.top].take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Address;

    fn object(n: usize) -> HeapObject {
        HeapObject::from_address(Address::new(0x1000 + n * 64))
    }

    #[test]
    fn test_lifo_order() {
        let mut deque = MarkingDeque::new(8);
        assert!(deque.is_empty());
        for n in 0..3 {
            assert!(deque.push(object(n)));
        }
        assert_eq!(deque.len(), 3);
        assert_eq!(deque.pop(), Some(object(2)));
        assert_eq!(deque.pop(), Some(object(1)));
        assert_eq!(deque.pop(), Some(object(0)));
        assert_eq!(deque.pop(), None);
    }

    #[test]
    fn test_capacity_and_overflow() {
        let mut deque = MarkingDeque::new(8);
        for n in 0..7 {
            assert!(deque.push(object(n)));
        }
        assert!(deque.is_full());
        deque.push_grey(object(7));
        assert!(deque.overflowed());
        assert_eq!(deque.len(), 7);

        deque.initialize(8);
        assert!(deque.is_empty());
        assert!(!deque.overflowed());
    }

    #[test]
    fn test_wraps_around() {
        let mut deque = MarkingDeque::new(4);
        for round in 0..10 {
            assert!(deque.push(object(round)));
            assert!(deque.push(object(round + 100)));
            assert_eq!(deque.pop(), Some(object(round + 100)));
            assert_eq!(deque.pop(), Some(object(round)));
        }
        assert!(deque.is_empty());
    }

    #[test]
    fn test_unallocated_deque_overflows_until_initialized() {
        let mut deque = MarkingDeque::unallocated();
        assert_eq!(deque.capacity(), 0);
        assert!(deque.is_empty());
        assert_eq!(deque.pop(), None);
        deque.push_grey(object(0));
        assert!(deque.overflowed());
        assert!(deque.is_empty());

        deque.initialize(4);
        assert_eq!(deque.capacity(), 4);
        assert!(!deque.overflowed());
        assert!(deque.push(object(1)));
        assert_eq!(deque.pop(), Some(object(1)));
    }

    #[test]
    fn test_initialize_resizes() {
        let mut deque = MarkingDeque::new(8);
        deque.initialize(16);
        for n in 0..15 {
            assert!(deque.push(object(n)));
        }
        assert!(deque.is_full());
    }
}
