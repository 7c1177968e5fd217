//! Paged old-generation spaces.
//!
//! A paged space owns a list of equally sized pages and allocates from a
//! linear allocation area carved out of one free block at a time. The
//! unused tail of the area always carries a filler header, so pages stay
//! iterable by header walk between collections.
//!
//! Allocation slow path:
//!
//! ```text
//!   bump in [top, limit)
//!     └─ miss ─▶ free list (first fit by size class)
//!                  └─ miss ─▶ sweep one deferred page, retry free list
//!                               └─ miss ─▶ new page (if allowed to expand)
//! ```

use super::free_list::FreeList;
use super::page::{ChunkMap, Page, PageFlags};
use super::skip_list::SkipList;
use super::AllocationSpace;
use crate::collector::sweeper;
use crate::objects::write_filler;
use crate::value::Address;

use std::collections::VecDeque;

/// One of the old paged spaces.
#[derive(Debug)]
pub struct PagedSpace {
    identity: AllocationSpace,
    pages: Vec<Address>,
    pub(crate) free_list: FreeList,
    top: Address,
    limit: Address,
    page_size: usize,
    unswept: VecDeque<Address>,
}

impl PagedSpace {
    /// Create an empty space.
    pub fn new(identity: AllocationSpace, page_size: usize) -> Self {
        debug_assert!(identity.is_paged());
        Self {
            identity,
            pages: Vec::new(),
            free_list: FreeList::new(page_size),
            top: Address::NULL,
            limit: Address::NULL,
            page_size,
            unswept: VecDeque::new(),
        }
    }

    /// Which space this is.
    #[inline]
    pub fn identity(&self) -> AllocationSpace {
        self.identity
    }

    /// Base addresses of the pages, oldest first.
    #[inline]
    pub fn pages(&self) -> &[Address] {
        &self.pages
    }

    /// Number of pages.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Bytes reserved by the space.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.pages.len() * self.page_size
    }

    /// Pages whose sweeping was deferred.
    #[inline]
    pub fn unswept_count(&self) -> usize {
        self.unswept.len()
    }

    /// Current linear allocation area.
    #[inline]
    pub fn linear_area(&self) -> (Address, Address) {
        (self.top, self.limit)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes.
    ///
    /// Returns `None` when no free memory is left and the space may not grow.
    pub(crate) fn allocate_raw(
        &mut self,
        chunks: &mut ChunkMap,
        size: usize,
        can_expand: bool,
    ) -> Option<Address> {
        let address = match self.bump(size) {
            Some(address) => address,
            None => self.allocate_slow(chunks, size, can_expand)?,
        };
        if self.identity == AllocationSpace::Code {
            if let Some(page) = chunks.containing_mut(address) {
                let base = page.base();
                let page_size = page.area_size();
                page.skip_list
                    .get_or_insert_with(|| SkipList::new(base, page_size))
                    .add_object(address, size);
            }
        }
        Some(address)
    }

    #[inline]
    fn bump(&mut self, size: usize) -> Option<Address> {
        if self.top.is_null() || self.limit - self.top < size {
            return None;
        }
        let address = self.top;
        self.top = self.top + size;
        write_filler(self.top, self.limit - self.top);
        Some(address)
    }

    fn allocate_slow(&mut self, chunks: &mut ChunkMap, size: usize, can_expand: bool) -> Option<Address> {
        if self.refill_from_free_list(size) {
            return self.bump(size);
        }

        while let Some(base) = self.unswept.pop_front() {
            if let Some(page) = chunks.get_mut(base) {
                let freed = sweeper::sweep_conservatively(page, &mut self.free_list);
                log::trace!("lazily swept {:?} page {}: {} bytes", self.identity, base, freed);
            }
            if self.refill_from_free_list(size) {
                return self.bump(size);
            }
        }

        if !can_expand {
            return None;
        }
        let base = self.expand(chunks)?;
        self.set_linear_area(base, base + self.page_size);
        self.bump(size)
    }

    fn refill_from_free_list(&mut self, size: usize) -> bool {
        match self.free_list.allocate(size) {
            Some(block) => {
                self.close_linear_allocation_area();
                self.set_linear_area(block.start, block.end());
                true
            }
            None => false,
        }
    }

    fn set_linear_area(&mut self, top: Address, limit: Address) {
        self.top = top;
        self.limit = limit;
        write_filler(top, limit - top);
    }

    /// Return the unused part of the linear allocation area to the free list.
    pub(crate) fn close_linear_allocation_area(&mut self) {
        if !self.top.is_null() && self.top < self.limit {
            self.free_list.free(self.top, self.limit - self.top);
        }
        self.top = Address::NULL;
        self.limit = Address::NULL;
    }

    /// Add a fresh page and return its base.
    pub(crate) fn expand(&mut self, chunks: &mut ChunkMap) -> Option<Address> {
        let mut page = Page::allocate(self.page_size, self.page_size, self.identity)?;
        if self.identity == AllocationSpace::Code {
            page.skip_list = Some(SkipList::new(page.base(), self.page_size));
        }
        let base = chunks.insert(page);
        self.pages.push(base);
        log::trace!("{:?} expanded to {} pages", self.identity, self.pages.len());
        Some(base)
    }

    /// Unlink a page and return its memory.
    pub(crate) fn release_page(&mut self, chunks: &mut ChunkMap, base: Address) {
        self.free_list.evict_page(base);
        self.pages.retain(|&page| page != base);
        self.unswept.retain(|&page| page != base);
        if !self.top.is_null() && self.top.align_down(self.page_size) == base {
            self.top = Address::NULL;
            self.limit = Address::NULL;
        }
        drop(chunks.remove(base));
    }

    // =========================================================================
    // Collector Hooks
    // =========================================================================

    /// Reset allocation state before marking.
    ///
    /// Pages whose sweeping was deferred still carry last cycle's marks;
    /// those are cleared so the page is swept against fresh marks.
    pub(crate) fn prepare_for_mark_compact(&mut self, chunks: &mut ChunkMap) {
        self.close_linear_allocation_area();
        for base in self.unswept.drain(..) {
            if let Some(page) = chunks.get_mut(base) {
                page.clear_marks();
            }
        }
        self.free_list.reset();
    }

    /// Queue a page whose sweeping is deferred.
    pub(crate) fn push_unswept(&mut self, base: Address) {
        self.unswept.push_back(base);
    }

    /// Finish every deferred sweep.
    pub(crate) fn ensure_sweeping_completed(&mut self, chunks: &mut ChunkMap) {
        while let Some(base) = self.unswept.pop_front() {
            if let Some(page) = chunks.get_mut(base) {
                sweeper::sweep_conservatively(page, &mut self.free_list);
            }
        }
    }

    /// Free-list fragmentation of a page as a percentage of its area.
    ///
    /// Pages that were not swept since they were last marked report zero.
    pub(crate) fn fragmentation_of(&self, page: &Page) -> usize {
        if !page.was_swept() {
            return 0;
        }
        let free = self.free_list.free_bytes_on_page(page.base())
            + self.free_list.wasted_bytes_on_page(page.base());
        free * 100 / page.area_size()
    }

    /// Whether the page at `base` is queued for deferred sweeping.
    pub fn is_unswept(&self, base: Address) -> bool {
        self.unswept.contains(&base)
    }

    /// Pages carrying `flags`.
    pub(crate) fn pages_with<'a>(
        &'a self,
        chunks: &'a ChunkMap,
        flags: PageFlags,
    ) -> impl Iterator<Item = Address> + 'a {
        self.pages
            .iter()
            .copied()
            .filter(move |&base| chunks.get(base).is_some_and(|page| page.is_flag_set(flags)))
    }
}
