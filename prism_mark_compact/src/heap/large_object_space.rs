//! Large object space.
//!
//! Objects at or above the large object threshold get a chunk of their own,
//! rounded up to the page size. They are never moved; the collector frees
//! unmarked chunks wholesale after marking.

use super::AllocationSpace;
use super::page::{ChunkMap, Page};
use crate::value::{Address, HeapObject};

/// Space of individually allocated large objects.
#[derive(Debug)]
pub struct LargeObjectSpace {
    /// Base address of each chunk; the object starts at the base.
    objects: Vec<Address>,
    /// Total bytes reserved by chunks.
    size: usize,
    page_size: usize,
}

impl LargeObjectSpace {
    /// Create an empty space.
    pub fn new(page_size: usize) -> Self {
        Self {
            objects: Vec::new(),
            size: 0,
            page_size,
        }
    }

    /// Allocate a chunk for an object of `size` bytes.
    pub(crate) fn allocate_raw(&mut self, chunks: &mut ChunkMap, size: usize) -> Option<Address> {
        let chunk_size = size.div_ceil(self.page_size) * self.page_size;
        let page = Page::allocate(chunk_size, self.page_size, AllocationSpace::Lo)?;
        let base = chunks.insert(page);
        self.objects.push(base);
        self.size += chunk_size;
        Some(base)
    }

    /// Whether `addr` starts a large object.
    pub fn contains(&self, addr: Address) -> bool {
        self.objects.contains(&addr)
    }

    /// Bytes reserved by the space.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of large objects.
    #[inline]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// All large objects.
    pub fn objects(&self) -> impl Iterator<Item = HeapObject> + '_ {
        self.objects.iter().map(|&base| HeapObject::from_address(base))
    }

    /// Release every unmarked object and clear the marks of the rest.
    ///
    /// Returns `(bytes_freed, objects_freed)`.
    pub(crate) fn free_unmarked_objects(&mut self, chunks: &mut ChunkMap) -> (usize, usize) {
        let mut bytes_freed = 0;
        let mut objects_freed = 0;

        self.objects.retain(|&base| match chunks.get_mut(base) {
            Some(page) if page.bitmap.get(page.mark_bit(base)) => {
                page.clear_marks();
                true
            }
            Some(_) => {
                if let Some(page) = chunks.remove(base) {
                    bytes_freed += page.area_size();
                    objects_freed += 1;
                }
                false
            }
            None => false,
        });

        self.size -= bytes_freed;
        (bytes_freed, objects_freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{HeaderFlags, InstanceKind, ObjectHeader};
    use crate::value::WORD_SIZE;

    const PAGE: usize = 4096;

    fn allocate(space: &mut LargeObjectSpace, chunks: &mut ChunkMap, bytes: usize) -> HeapObject {
        let base = space.allocate_raw(chunks, bytes).expect("chunk");
        ObjectHeader::new(InstanceKind::FixedArray, HeaderFlags::empty(), bytes / WORD_SIZE).write_to(base);
        HeapObject::from_address(base)
    }

    #[test]
    fn test_chunks_are_rounded_to_pages() {
        let mut chunks = ChunkMap::new();
        let mut space = LargeObjectSpace::new(PAGE);
        let object = allocate(&mut space, &mut chunks, PAGE + 8);
        assert_eq!(space.size(), 2 * PAGE);
        assert!(space.contains(object.address()));
        assert_eq!(chunks.space_of(object.address() + PAGE), Some(AllocationSpace::Lo));
    }

    #[test]
    fn test_free_unmarked_objects() {
        let mut chunks = ChunkMap::new();
        let mut space = LargeObjectSpace::new(PAGE);
        let live = allocate(&mut space, &mut chunks, PAGE);
        let dead = allocate(&mut space, &mut chunks, 2 * PAGE);
        chunks.set_mark(live);

        let (bytes, count) = space.free_unmarked_objects(&mut chunks);
        assert_eq!((bytes, count), (2 * PAGE, 1));
        assert_eq!(space.object_count(), 1);
        assert!(chunks.get(dead.address()).is_none());
        assert!(!chunks.is_marked(live));
        assert_eq!(chunks.get(live.address()).expect("live chunk").live_bytes(), 0);
    }
}
