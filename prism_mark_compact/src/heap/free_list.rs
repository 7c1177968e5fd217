//! Segregated free list for the paged spaces.
//!
//! Freed blocks are sorted into four size classes. Blocks too small to be
//! worth reusing are only covered by a filler and counted as wasted. Every
//! block handed to the free list gets a filler header, so a precisely swept
//! page can still be walked object by object.

use crate::objects::{MIN_OBJECT_WORDS, write_filler};
use crate::value::{Address, WORD_SIZE};

use rustc_hash::FxHashMap;

/// Smallest block kept on a list, in words.
pub const SMALL_LIST_MIN_WORDS: usize = 2 * MIN_OBJECT_WORDS;
/// Largest block on the small list, in words.
pub const SMALL_LIST_MAX_WORDS: usize = 0xff;
/// Largest block on the medium list, in words.
pub const MEDIUM_LIST_MAX_WORDS: usize = 0x7ff;
/// Largest block on the large list, in words.
pub const LARGE_LIST_MAX_WORDS: usize = 0x3fff;

const SMALL: usize = 0;
const MEDIUM: usize = 1;
const LARGE: usize = 2;
const HUGE: usize = 3;

/// A free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// First byte.
    pub start: Address,
    /// Size in bytes.
    pub size: usize,
}

impl FreeBlock {
    /// One past the last byte.
    #[inline]
    pub fn end(&self) -> Address {
        self.start + self.size
    }
}

/// Free memory of one paged space.
#[derive(Debug)]
pub struct FreeList {
    classes: [Vec<FreeBlock>; 4],
    available: usize,
    wasted: usize,
    wasted_per_page: FxHashMap<Address, usize>,
    page_size: usize,
}

impl FreeList {
    /// Create an empty free list for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            classes: Default::default(),
            available: 0,
            wasted: 0,
            wasted_per_page: FxHashMap::default(),
            page_size,
        }
    }

    #[inline]
    fn class_for(size_in_words: usize) -> usize {
        if size_in_words <= SMALL_LIST_MAX_WORDS {
            SMALL
        } else if size_in_words <= MEDIUM_LIST_MAX_WORDS {
            MEDIUM
        } else if size_in_words <= LARGE_LIST_MAX_WORDS {
            LARGE
        } else {
            HUGE
        }
    }

    #[inline]
    fn page_of(&self, addr: Address) -> Address {
        addr.align_down(self.page_size)
    }

    /// Return `[start, start + size)` to the free list.
    ///
    /// Returns the number of bytes that were too small to keep.
    pub fn free(&mut self, start: Address, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        write_filler(start, size);
        let words = size / WORD_SIZE;
        if words < SMALL_LIST_MIN_WORDS {
            self.wasted += size;
            *self.wasted_per_page.entry(self.page_of(start)).or_insert(0) += size;
            return size;
        }
        self.classes[Self::class_for(words)].push(FreeBlock { start, size });
        self.available += size;
        0
    }

    /// Take a block of at least `size` bytes.
    ///
    /// The whole block is returned; callers use the remainder as their
    /// linear allocation area.
    pub fn allocate(&mut self, size: usize) -> Option<FreeBlock> {
        let first_class = Self::class_for(size / WORD_SIZE);
        for class in first_class..=HUGE {
            let list = &mut self.classes[class];
            if let Some(position) = list.iter().position(|block| block.size >= size) {
                let block = list.swap_remove(position);
                self.available -= block.size;
                return Some(block);
            }
        }
        None
    }

    /// Remove every block lying on the page at `page_base`.
    ///
    /// Returns the number of bytes removed.
    pub fn evict_page(&mut self, page_base: Address) -> usize {
        let page_end = page_base + self.page_size;
        let mut evicted = 0;
        for list in &mut self.classes {
            list.retain(|block| {
                let on_page = block.start >= page_base && block.start < page_end;
                if on_page {
                    evicted += block.size;
                }
                !on_page
            });
        }
        self.available -= evicted;
        if let Some(wasted) = self.wasted_per_page.remove(&page_base) {
            self.wasted -= wasted;
        }
        evicted
    }

    /// Forget every block.
    pub fn reset(&mut self) {
        for list in &mut self.classes {
            list.clear();
        }
        self.available = 0;
        self.wasted = 0;
        self.wasted_per_page.clear();
    }

    /// Bytes available for allocation.
    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    /// Bytes freed but too small to keep.
    #[inline]
    pub fn wasted(&self) -> usize {
        self.wasted
    }

    /// Bytes on free lists that lie on the page at `page_base`.
    pub fn free_bytes_on_page(&self, page_base: Address) -> usize {
        self.classes
            .iter()
            .flatten()
            .filter(|block| self.page_of(block.start) == page_base)
            .map(|block| block.size)
            .sum()
    }

    /// Wasted bytes on the page at `page_base`.
    pub fn wasted_bytes_on_page(&self, page_base: Address) -> usize {
        self.wasted_per_page.get(&page_base).copied().unwrap_or(0)
    }

    /// Whether `addr` lies in a block on the free list.
    pub fn covers(&self, addr: Address) -> bool {
        self.classes
            .iter()
            .flatten()
            .any(|block| addr >= block.start && addr < block.end())
    }

    /// Number of blocks on all lists.
    pub fn block_count(&self) -> usize {
        self.classes.iter().map(Vec::len).sum()
    }
}
