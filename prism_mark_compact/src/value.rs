//! Raw addresses, tagged words and heap object references.
//!
//! Every slot in the managed heap holds one machine word. A slot either
//! contains a [`Tagged`] value (a heap pointer, a small integer or a
//! sentinel) or, for the few derived-pointer slots such as a function's
//! code entry, a raw [`Address`].
//!
//! ```text
//! ┌───────────────────────────────────────────────┬────┐
//! │ payload                                        │tag │
//! ├───────────────────────────────────────────────┼────┤
//! │ object address (word aligned)                 │ x1 │  heap pointer
//! │ signed integer                                │ 00 │  small integer
//! │ sentinel id                                   │ 10 │  NULL / HOLE
//! └───────────────────────────────────────────────┴────┘
//! ```

use std::fmt;
use std::ops::{Add, Sub};

/// Size of one heap word in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// log2 of [`WORD_SIZE`].
pub const WORD_SIZE_LOG2: u32 = WORD_SIZE.trailing_zeros();

// =============================================================================
// Address
// =============================================================================

/// A raw byte address inside (or just past) a heap chunk.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    /// Wrap a raw address.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw address value.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Whether this is the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `words` heap words after this one.
    #[inline]
    pub const fn add_words(self, words: usize) -> Self {
        Self(self.0 + words * WORD_SIZE)
    }

    /// Round down to a multiple of `align` (power of two).
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Whether the address is aligned to `align` (power of two).
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Load the word stored at this address.
    ///
    /// The address must lie inside a chunk owned by the heap.
    #[inline]
    pub(crate) fn load(self) -> usize {
        debug_assert!(self.is_aligned(WORD_SIZE));
        // SAFETY: crate-internal addresses always point into live chunk memory.
        unsafe { *(self.0 as *const usize) }
    }

    /// Store a word at this address.
    ///
    /// The address must lie inside a chunk owned by the heap.
    #[inline]
    pub(crate) fn store(self, value: usize) {
        debug_assert!(self.is_aligned(WORD_SIZE));
        // SAFETY: crate-internal addresses always point into live chunk memory.
        unsafe { *(self.0 as *mut usize) = value }
    }

    /// Load the tagged value stored at this address.
    #[inline]
    pub(crate) fn load_tagged(self) -> Tagged {
        Tagged(self.load())
    }

    /// Store a tagged value at this address.
    #[inline]
    pub(crate) fn store_tagged(self, value: Tagged) {
        self.store(value.0)
    }

    /// Copy `words` words from `src` to `self`. Ranges must not overlap.
    #[inline]
    pub(crate) fn copy_words_from(self, src: Address, words: usize) {
        // SAFETY: both ranges lie inside heap chunks and never overlap during
        // evacuation, because the target is freshly allocated.
        unsafe {
            std::ptr::copy_nonoverlapping(src.0 as *const usize, self.0 as *mut usize, words);
        }
    }
}

impl Add<usize> for Address {
    type Output = Address;

    #[inline]
    fn add(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }
}

impl Sub<Address> for Address {
    type Output = usize;

    #[inline]
    fn sub(self, other: Address) -> usize {
        debug_assert!(self.0 >= other.0);
        self.0 - other.0
    }
}

impl Sub<usize> for Address {
    type Output = Address;

    #[inline]
    fn sub(self, bytes: usize) -> Address {
        Address(self.0 - bytes)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Heap Object
// =============================================================================

/// A reference to an object in the managed heap, by its start address.
///
/// A `HeapObject` is only meaningful while the object it names is alive and
/// has not been relocated. Embedders should hold objects through handles,
/// which the collector updates when objects move.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HeapObject(Address);

impl HeapObject {
    #[inline]
    pub(crate) const fn from_address(address: Address) -> Self {
        Self(address)
    }

    /// Start address of the object.
    #[inline]
    pub const fn address(self) -> Address {
        self.0
    }

    /// Tagged pointer to this object.
    #[inline]
    pub const fn to_tagged(self) -> Tagged {
        Tagged::from_object(self)
    }

    /// Address of the word at `index` within the object.
    #[inline]
    pub const fn slot(self, index: usize) -> Address {
        self.0.add_words(index)
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapObject({:#x})", self.0.raw())
    }
}

// =============================================================================
// Tagged
// =============================================================================

/// A tagged heap word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Tagged(usize);

const HEAP_OBJECT_TAG: usize = 0b1;
const SMI_TAG_MASK: usize = 0b11;
const SENTINEL_TAG: usize = 0b10;

impl Tagged {
    /// The "not a pointer" sentinel. Zapped slots hold this value.
    pub const NULL: Tagged = Tagged(SENTINEL_TAG);

    /// Marks a deleted hash table entry.
    pub const HOLE: Tagged = Tagged((1 << 2) | SENTINEL_TAG);

    /// Tag a heap object pointer.
    #[inline]
    pub const fn from_object(object: HeapObject) -> Self {
        Self(object.0.raw() | HEAP_OBJECT_TAG)
    }

    /// Tag a small integer.
    #[inline]
    pub const fn from_smi(value: isize) -> Self {
        Self((value << 2) as usize)
    }

    #[inline]
    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw word.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Whether this word points at a heap object.
    #[inline]
    pub const fn is_heap_object(self) -> bool {
        self.0 & HEAP_OBJECT_TAG != 0
    }

    /// Whether this word is a small integer.
    #[inline]
    pub const fn is_smi(self) -> bool {
        self.0 & SMI_TAG_MASK == 0
    }

    /// Whether this is the NULL sentinel.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    /// Whether this is the hole sentinel.
    #[inline]
    pub const fn is_hole(self) -> bool {
        self.0 == Self::HOLE.0
    }

    /// The referenced heap object, if this is a pointer.
    #[inline]
    pub const fn to_object(self) -> Option<HeapObject> {
        if self.is_heap_object() {
            Some(HeapObject(Address(self.0 & !HEAP_OBJECT_TAG)))
        } else {
            None
        }
    }

    /// The small integer value, if this is one.
    #[inline]
    pub const fn to_smi(self) -> Option<isize> {
        if self.is_smi() {
            Some((self.0 as isize) >> 2)
        } else {
            None
        }
    }
}

impl From<HeapObject> for Tagged {
    fn from(object: HeapObject) -> Self {
        Tagged::from_object(object)
    }
}

impl fmt::Debug for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(object) = self.to_object() {
            write!(f, "{:?}", object)
        } else if let Some(smi) = self.to_smi() {
            write!(f, "Smi({})", smi)
        } else if self.is_hole() {
            write!(f, "Hole")
        } else {
            write!(f, "Null")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smi_round_trip() {
        for value in [0isize, 1, -1, 42, -4096, isize::MAX >> 3] {
            let tagged = Tagged::from_smi(value);
            assert!(tagged.is_smi());
            assert!(!tagged.is_heap_object());
            assert_eq!(tagged.to_smi(), Some(value));
        }
    }

    #[test]
    fn test_pointer_tagging() {
        let object = HeapObject::from_address(Address::new(0x1000));
        let tagged = object.to_tagged();
        assert!(tagged.is_heap_object());
        assert!(!tagged.is_smi());
        assert_eq!(tagged.to_object(), Some(object));
        assert_eq!(tagged.to_smi(), None);
    }

    #[test]
    fn test_sentinels_are_neither_pointers_nor_smis() {
        for sentinel in [Tagged::NULL, Tagged::HOLE] {
            assert!(!sentinel.is_heap_object());
            assert!(!sentinel.is_smi());
            assert_eq!(sentinel.to_object(), None);
        }
        assert_ne!(Tagged::NULL, Tagged::HOLE);
        assert!(Tagged::NULL.is_null());
        assert!(Tagged::HOLE.is_hole());
    }

    #[test]
    fn test_address_arithmetic() {
        let base = Address::new(0x4000);
        assert_eq!(base.add_words(2), Address::new(0x4000 + 2 * WORD_SIZE));
        assert_eq!(base.add_words(3) - base, 3 * WORD_SIZE);
        assert_eq!(Address::new(0x4123).align_down(0x1000), base);
        assert!(base.is_aligned(0x1000));
    }

    #[test]
    fn test_load_store_round_trip() {
        let mut words = [0usize; 4];
        let base = Address::new(words.as_mut_ptr() as usize);
        base.add_words(1).store(0xdead);
        base.add_words(2).store_tagged(Tagged::from_smi(-7));
        assert_eq!(base.add_words(1).load(), 0xdead);
        assert_eq!(base.add_words(2).load_tagged().to_smi(), Some(-7));
        assert_eq!(words[1], 0xdead);
    }
}
