//! Memory chunks and the address-ordered chunk map.
//!
//! A [`Page`] is one aligned allocation owned by exactly one space. Its
//! object area is the whole allocation; metadata (mark bitmap, live bytes,
//! flags, slots buffer, skip list) lives out of line so that object memory
//! stays densely iterable.
//!
//! ```text
//!   ChunkMap (BTreeMap by base address)
//!   ├── 0x7f..0000  Page  OldPointer  [bitmap | live_bytes | flags]
//!   ├── 0x7f..4000  Page  Code        [bitmap | live_bytes | flags | skip list]
//!   ├── 0x7f..8000  Page  New         (one semispace)
//!   └── 0x7f..c000  Page  Lo          (one large object)
//! ```

use super::AllocationSpace;
use super::bitmap::{Bitmap, MarkBit, ObjectColor};
use super::skip_list::SkipList;
use crate::collector::slots_buffer::SlotsBuffer;
use crate::objects::object_size;
use crate::value::{Address, HeapObject, WORD_SIZE, WORD_SIZE_LOG2};

use std::collections::BTreeMap;
use std::ptr::NonNull;

bitflags::bitflags! {
    /// Per-page state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u16 {
        /// Selected for evacuation in the current cycle.
        const EVACUATION_CANDIDATE = 1 << 0;
        /// Evicted candidate that must be rescanned for pointers into
        /// evacuated pages instead of relying on slot buffers.
        const RESCAN_ON_EVACUATION = 1 << 1;
        /// Swept precisely: every word belongs to an object or a filler.
        const WAS_SWEPT_PRECISELY = 1 << 2;
        /// Swept conservatively: free blocks are exact, live runs are not.
        const WAS_SWEPT_CONSERVATIVELY = 1 << 3;
        /// Semispace of the new space.
        const NEW_SPACE = 1 << 4;
        /// Holds a single large object.
        const LARGE_OBJECT = 1 << 5;
    }
}

// =============================================================================
// Page
// =============================================================================

/// One chunk of heap memory.
pub struct Page {
    memory: NonNull<u8>,
    size: usize,
    align: usize,
    owner: AllocationSpace,
    flags: PageFlags,
    live_bytes: isize,
    pub(crate) bitmap: Bitmap,
    pub(crate) slots_buffer: Option<SlotsBuffer>,
    pub(crate) skip_list: Option<SkipList>,
}

impl Page {
    /// Allocate a zeroed chunk of `size` bytes aligned to `align`.
    pub(crate) fn allocate(size: usize, align: usize, owner: AllocationSpace) -> Option<Self> {
        debug_assert!(size % WORD_SIZE == 0);
        let layout = std::alloc::Layout::from_size_align(size, align).ok()?;
        // SAFETY: the layout has a non-zero size.
        let memory = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;

        let mut flags = PageFlags::empty();
        match owner {
            AllocationSpace::New => flags |= PageFlags::NEW_SPACE,
            AllocationSpace::Lo => flags |= PageFlags::LARGE_OBJECT,
            _ => {}
        }

        Some(Self {
            memory,
            size,
            align,
            owner,
            flags,
            live_bytes: 0,
            bitmap: Bitmap::new(size),
            slots_buffer: None,
            skip_list: None,
        })
    }

    /// First byte of the chunk.
    #[inline]
    pub fn base(&self) -> Address {
        Address::new(self.memory.as_ptr() as usize)
    }

    /// First byte usable by objects.
    #[inline]
    pub fn area_start(&self) -> Address {
        self.base()
    }

    /// One past the last byte usable by objects.
    #[inline]
    pub fn area_end(&self) -> Address {
        self.base() + self.size
    }

    /// Size of the object area in bytes.
    #[inline]
    pub fn area_size(&self) -> usize {
        self.size
    }

    /// Owning space.
    #[inline]
    pub fn owner(&self) -> AllocationSpace {
        self.owner
    }

    /// Whether `addr` lies in this chunk.
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.area_start() && addr < self.area_end()
    }

    // =========================================================================
    // Flags
    // =========================================================================

    /// Current flags.
    #[inline]
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Whether all of `flags` are set.
    #[inline]
    pub fn is_flag_set(&self, flags: PageFlags) -> bool {
        self.flags.contains(flags)
    }

    #[inline]
    pub(crate) fn set_flag(&mut self, flags: PageFlags) {
        self.flags |= flags;
    }

    #[inline]
    pub(crate) fn clear_flag(&mut self, flags: PageFlags) {
        self.flags &= !flags;
    }

    /// Whether the page is an evacuation candidate.
    #[inline]
    pub fn is_evacuation_candidate(&self) -> bool {
        self.flags.contains(PageFlags::EVACUATION_CANDIDATE)
    }

    /// Slots on new-space and candidate pages are never recorded: those
    /// objects are revisited wholesale during evacuation.
    #[inline]
    pub fn should_skip_evacuation_slot_recording(&self) -> bool {
        self.flags
            .intersects(PageFlags::EVACUATION_CANDIDATE | PageFlags::NEW_SPACE)
    }

    /// Whether the page was swept in either mode since it was last marked.
    #[inline]
    pub fn was_swept(&self) -> bool {
        self.flags
            .intersects(PageFlags::WAS_SWEPT_PRECISELY | PageFlags::WAS_SWEPT_CONSERVATIVELY)
    }

    pub(crate) fn clear_swept_flags(&mut self) {
        self.clear_flag(PageFlags::WAS_SWEPT_PRECISELY | PageFlags::WAS_SWEPT_CONSERVATIVELY);
    }

    // =========================================================================
    // Marking
    // =========================================================================

    /// Bytes of objects marked on this page in the current cycle.
    #[inline]
    pub fn live_bytes(&self) -> isize {
        self.live_bytes
    }

    #[inline]
    pub(crate) fn increment_live_bytes(&mut self, delta: isize) {
        self.live_bytes += delta;
    }

    #[inline]
    pub(crate) fn reset_live_bytes(&mut self) {
        self.live_bytes = 0;
    }

    /// Mark bit of the object or word at `addr`.
    #[inline]
    pub fn mark_bit(&self, addr: Address) -> MarkBit {
        debug_assert!(self.contains(addr));
        MarkBit::new((addr - self.base()) >> WORD_SIZE_LOG2)
    }

    /// Address of the word whose first mark bit is `bit`.
    #[inline]
    pub fn address_of(&self, bit: MarkBit) -> Address {
        self.base().add_words(bit.index())
    }

    /// Reset marks and live bytes.
    pub(crate) fn clear_marks(&mut self) {
        self.bitmap.clear();
        self.live_bytes = 0;
    }

    /// Black objects on the page in address order.
    pub fn black_objects(&self) -> impl Iterator<Item = HeapObject> + '_ {
        self.bitmap
            .black_objects()
            .map(|bit| HeapObject::from_address(self.address_of(bit)))
    }

    /// Walk objects by their headers from `start` up to `end`.
    ///
    /// Only valid on memory that is fully covered by objects and fillers.
    pub fn objects_in(start: Address, end: Address) -> impl Iterator<Item = HeapObject> {
        let mut cursor = start;
        std::iter::from_fn(move || {
            if cursor >= end {
                return None;
            }
            let object = HeapObject::from_address(cursor);
            let size = object_size(object);
            if size == 0 {
                // Never-written memory reads as a zero header.
                cursor = end;
                return None;
            }
            cursor = cursor + size;
            Some(object)
        })
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, self.align) {
            // SAFETY: the chunk was allocated with this layout in `allocate`.
            unsafe {
                std::alloc::dealloc(self.memory.as_ptr(), layout);
            }
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("base", &self.base())
            .field("size", &self.size)
            .field("owner", &self.owner)
            .field("flags", &self.flags)
            .field("live_bytes", &self.live_bytes)
            .finish()
    }
}

// SAFETY: a page exclusively owns its memory.
unsafe impl Send for Page {}

// =============================================================================
// Chunk Map
// =============================================================================

/// Every chunk of the heap, ordered by base address.
#[derive(Debug, Default)]
pub struct ChunkMap {
    chunks: BTreeMap<usize, Page>,
}

impl ChunkMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chunk.
    pub(crate) fn insert(&mut self, page: Page) -> Address {
        let base = page.base();
        self.chunks.insert(base.raw(), page);
        base
    }

    /// Unregister a chunk, returning it so the caller decides when its memory
    /// is released.
    pub(crate) fn remove(&mut self, base: Address) -> Option<Page> {
        self.chunks.remove(&base.raw())
    }

    /// Chunk starting at `base`.
    #[inline]
    pub fn get(&self, base: Address) -> Option<&Page> {
        self.chunks.get(&base.raw())
    }

    /// Mutable chunk starting at `base`.
    #[inline]
    pub(crate) fn get_mut(&mut self, base: Address) -> Option<&mut Page> {
        self.chunks.get_mut(&base.raw())
    }

    /// Chunk containing `addr`.
    #[inline]
    pub fn containing(&self, addr: Address) -> Option<&Page> {
        self.chunks
            .range(..=addr.raw())
            .next_back()
            .map(|(_, page)| page)
            .filter(|page| page.contains(addr))
    }

    /// Mutable chunk containing `addr`.
    #[inline]
    pub(crate) fn containing_mut(&mut self, addr: Address) -> Option<&mut Page> {
        self.chunks
            .range_mut(..=addr.raw())
            .next_back()
            .map(|(_, page)| page)
            .filter(|page| page.contains(addr))
    }

    /// Number of chunks.
    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether no chunk is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// All chunks in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.chunks.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Page> {
        self.chunks.values_mut()
    }

    // =========================================================================
    // Space Queries
    // =========================================================================

    /// Space owning `addr`, if any.
    #[inline]
    pub fn space_of(&self, addr: Address) -> Option<AllocationSpace> {
        self.containing(addr).map(Page::owner)
    }

    /// Whether `addr` lies in a new-space semispace.
    #[inline]
    pub fn in_new_space(&self, addr: Address) -> bool {
        self.containing(addr)
            .is_some_and(|page| page.is_flag_set(PageFlags::NEW_SPACE))
    }

    /// Whether `addr` lies on an evacuation candidate.
    #[inline]
    pub fn on_evacuation_candidate(&self, addr: Address) -> bool {
        self.containing(addr)
            .is_some_and(Page::is_evacuation_candidate)
    }

    // =========================================================================
    // Tricolor Queries
    // =========================================================================

    /// Color of `object`. Objects outside the heap read as black.
    #[inline]
    pub fn color(&self, object: HeapObject) -> ObjectColor {
        match self.containing(object.address()) {
            Some(page) => page.bitmap.color(page.mark_bit(object.address())),
            None => ObjectColor::Black,
        }
    }

    /// Whether `object` has been reached in the current cycle.
    #[inline]
    pub fn is_marked(&self, object: HeapObject) -> bool {
        match self.containing(object.address()) {
            Some(page) => page.bitmap.get(page.mark_bit(object.address())),
            None => true,
        }
    }

    /// Mark a white object black and credit its page's live bytes.
    ///
    /// Returns `false` when the object was already marked.
    #[inline]
    pub(crate) fn set_mark(&mut self, object: HeapObject) -> bool {
        let Some(page) = self.containing_mut(object.address()) else {
            return false;
        };
        let bit = page.mark_bit(object.address());
        if page.bitmap.get(bit) {
            return false;
        }
        page.bitmap.white_to_black(bit);
        page.increment_live_bytes(object_size(object) as isize);
        true
    }

    /// Mark a white object grey. Live bytes are credited when it turns black.
    ///
    /// Returns `false` when the object was already marked.
    pub(crate) fn white_to_grey(&mut self, object: HeapObject) -> bool {
        let Some(page) = self.containing_mut(object.address()) else {
            return false;
        };
        let bit = page.mark_bit(object.address());
        if page.bitmap.get(bit) {
            return false;
        }
        page.bitmap.white_to_grey(bit);
        true
    }

    /// Turn a black object grey again and take back its live bytes, so that
    /// a later heap scan rediscovers it.
    pub(crate) fn black_to_grey(&mut self, object: HeapObject) {
        if let Some(page) = self.containing_mut(object.address()) {
            let bit = page.mark_bit(object.address());
            page.bitmap.black_to_grey(bit);
            page.increment_live_bytes(-(object_size(object) as isize));
        }
    }

    /// Turn a grey object black and credit its page's live bytes.
    pub(crate) fn grey_to_black(&mut self, object: HeapObject) {
        if let Some(page) = self.containing_mut(object.address()) {
            let bit = page.mark_bit(object.address());
            page.bitmap.grey_to_black(bit);
            page.increment_live_bytes(object_size(object) as isize);
        }
    }
}
