//! Page sweepers.
//!
//! Both sweepers walk the black objects of a page in address order and hand
//! the gaps between them to the owning space's free list. Afterwards the
//! page's marks and live bytes are reset.
//!
//! ```text
//!   page   [ live | dead dead | live | dead ............ ]
//!   precise       └─ free ──┘        └────── free ──────┘   every gap
//!   conservative  └─ kept ──┘        └────── free ──────┘   gaps >= 32 words
//! ```
//!
//! A conservatively swept page leaves short dead runs in place. They keep
//! valid headers, so the page stays walkable, but their fields may point
//! at freed memory and must never be traced.

use crate::heap::{FreeList, Page, PageFlags};
use crate::objects::{ObjectVisitor, iterate_body, object_end, object_size};
use crate::value::{HeapObject, WORD_SIZE};

/// Smallest dead run a conservative sweep returns to the free list.
pub const CONSERVATIVE_MIN_FREE: usize = 32 * WORD_SIZE;

/// Whether a precise sweep rebuilds the page's skip list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipListMode {
    Ignore,
    Rebuild,
}

/// Free dead runs of at least [`CONSERVATIVE_MIN_FREE`] bytes.
///
/// Returns the number of bytes made available for allocation.
pub(crate) fn sweep_conservatively(page: &mut Page, free_list: &mut FreeList) -> usize {
    debug_assert!(!page.is_evacuation_candidate());
    let live: Vec<HeapObject> = page.black_objects().collect();

    let mut freed = 0;
    let mut free_start = page.area_start();
    for object in live {
        let gap = object.address() - free_start;
        if gap >= CONSERVATIVE_MIN_FREE {
            freed += gap - free_list.free(free_start, gap);
        }
        free_start = free_start.max(object_end(object));
    }
    let tail = page.area_end() - free_start;
    freed += tail - free_list.free(free_start, tail);

    finish(page, PageFlags::WAS_SWEPT_CONSERVATIVELY);
    freed
}

/// Free every dead run, optionally visiting each surviving object.
///
/// Returns the number of bytes made available for allocation.
pub(crate) fn sweep_precisely(
    page: &mut Page,
    free_list: &mut FreeList,
    skip_list: SkipListMode,
    mut visitor: Option<&mut dyn ObjectVisitor>,
) -> usize {
    debug_assert!(!page.is_evacuation_candidate());
    let live: Vec<HeapObject> = page.black_objects().collect();

    if skip_list == SkipListMode::Rebuild {
        if let Some(list) = page.skip_list.as_mut() {
            list.clear();
        }
    }

    let mut freed = 0;
    let mut free_start = page.area_start();
    for object in live {
        if object.address() > free_start {
            let gap = object.address() - free_start;
            freed += gap - free_list.free(free_start, gap);
        }
        if let Some(visitor) = visitor.as_deref_mut() {
            iterate_body(object, visitor);
        }
        if skip_list == SkipListMode::Rebuild {
            if let Some(list) = page.skip_list.as_mut() {
                list.add_object(object.address(), object_size(object));
            }
        }
        free_start = object_end(object);
    }
    let tail = page.area_end() - free_start;
    freed += tail - free_list.free(free_start, tail);

    finish(page, PageFlags::WAS_SWEPT_PRECISELY);
    freed
}

fn finish(page: &mut Page, swept: PageFlags) {
    page.clear_marks();
    page.clear_swept_flags();
    page.set_flag(swept);
}
