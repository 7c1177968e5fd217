//! Evacuation: candidate selection, slot recording and object migration.
//!
//! ```text
//!   prepare        pick fragmented pages ──▶ EVACUATION_CANDIDATE + SlotsBuffer
//!   marking        slot → candidate     ──▶ page's SlotsBuffer (may evict page)
//!                  slot → nursery       ──▶ new_space_slots
//!   sweep phase    nursery survivors    ──▶ to-space, or promoted to old space
//!                  candidate survivors  ──▶ fresh memory in the same space
//!                  every move           ──▶ forwarding table
//! ```
//!
//! Slots of migrated objects are re-recorded as they land: a promoted
//! object may still point into the nursery or at other candidates, and
//! neither has been updated yet.

use super::slots_buffer::{AdditionMode, SlotEntry, SlotType, SlotsBuffer};
use super::{CollectorState, Forwarding};
use crate::heap::{AllocationSpace, Heap, Page, PageFlags};
use crate::objects::{InstanceKind, ObjectVisitor, code_from_entry, iterate_body, object_kind, object_size};
use crate::stats::GcStats;
use crate::value::{Address, HeapObject, WORD_SIZE};

// =============================================================================
// Slot Recording
// =============================================================================

/// Record that `entry` in `host` refers to `target`.
///
/// Slots pointing into the nursery always go to the collector's new-space
/// buffer. Slots pointing at a candidate go to that page's buffer; if the
/// buffer is full the page stops being a candidate.
pub(crate) fn record_slot(
    heap: &mut Heap,
    state: &mut CollectorState,
    host: HeapObject,
    entry: SlotEntry,
    target: HeapObject,
) {
    let chunks = &mut heap.chunks;
    match chunks.containing(host.address()) {
        Some(page) if !page.should_skip_evacuation_slot_recording() => {}
        _ => return,
    }
    if chunks.in_new_space(target.address()) {
        state.new_space_slots.add(entry, AdditionMode::IgnoreOverflow);
        return;
    }
    if !state.compacting {
        return;
    }
    let Some(page) = chunks.containing_mut(target.address()) else {
        return;
    };
    if !page.is_evacuation_candidate() {
        return;
    }
    let base = page.base();
    let chain_limit = heap.config.slots_buffer_chain_limit;
    let added = page
        .slots_buffer
        .get_or_insert_with(|| SlotsBuffer::new(chain_limit))
        .add(entry, AdditionMode::FailOnOverflow);
    if !added {
        evict_evacuation_candidate(heap, state, base);
    }
}

/// Stop evacuating the page at `base`.
///
/// Its recorded slots are dropped. Pages that can hold pointers are flagged
/// for a rescan, because slots in their objects were never recorded while
/// they were candidates.
pub(crate) fn evict_evacuation_candidate(heap: &mut Heap, state: &mut CollectorState, base: Address) {
    let Some(page) = heap.chunks.get_mut(base) else {
        return;
    };
    page.clear_flag(PageFlags::EVACUATION_CANDIDATE);
    page.slots_buffer = None;
    if page.owner() != AllocationSpace::OldData {
        page.set_flag(PageFlags::RESCAN_ON_EVACUATION);
    }
    let owner = page.owner();
    state.evacuation_candidates.retain(|&candidate| candidate != base);
    GcStats::bump(&heap.stats.candidates_evicted, 1);
    log::debug!("evicted {:?} evacuation candidate {}: slots buffer overflow", owner, base);
}

// =============================================================================
// Candidate Selection
// =============================================================================

/// Flag the most fragmented pages of the compactable spaces.
///
/// The first page of a space is never chosen. Pages that were not swept
/// since they were last marked report no fragmentation.
pub(crate) fn collect_evacuation_candidates(heap: &mut Heap, state: &mut CollectorState) {
    let stress = heap.config.stress_compaction;
    let threshold = heap.config.compaction_threshold;
    let max_candidates = heap.config.max_evacuation_candidates;
    let chain_limit = heap.config.slots_buffer_chain_limit;
    let trace = heap.config.trace_fragmentation;

    for identity in [AllocationSpace::OldPointer, AllocationSpace::OldData, AllocationSpace::Code] {
        let chunks = &mut heap.chunks;
        let Some(space) = heap.paged.iter_mut().find(|space| space.identity() == identity) else {
            continue;
        };
        space.close_linear_allocation_area();
        let pages = space.pages().to_vec();
        if pages.len() < 2 {
            continue;
        }
        let limit = if max_candidates > 0 {
            max_candidates
        } else {
            ((pages.len() / 2) as f64).sqrt() as usize + 1
        };

        let mut chosen: Vec<(usize, Address)> = Vec::new();
        for (position, &base) in pages.iter().enumerate().skip(1) {
            let Some(page) = chunks.get(base) else { continue };
            let fragmentation = space.fragmentation_of(page);
            if trace {
                log::debug!(
                    "{:?} page {}: {}% fragmented, {} live bytes",
                    identity,
                    base,
                    fragmentation,
                    page.live_bytes()
                );
            }
            if stress {
                if position % 2 == state.ms_count % 2 {
                    chosen.push((fragmentation, base));
                }
            } else if fragmentation >= usize::from(threshold) {
                chosen.push((fragmentation, base));
            }
        }
        chosen.sort_by(|a, b| b.0.cmp(&a.0));
        chosen.truncate(limit);

        for (_, base) in chosen {
            space.free_list.evict_page(base);
            if let Some(page) = chunks.get_mut(base) {
                page.set_flag(PageFlags::EVACUATION_CANDIDATE);
                page.slots_buffer = Some(SlotsBuffer::new(chain_limit));
            }
            state.evacuation_candidates.push(base);
        }
    }

    if !state.evacuation_candidates.is_empty() {
        log::debug!("selected {} evacuation candidates", state.evacuation_candidates.len());
    }
}

/// Unlink and free every candidate page once pointers are updated.
pub(crate) fn release_evacuation_candidates(heap: &mut Heap, state: &mut CollectorState) {
    let released = state.evacuation_candidates.len();
    for base in state.evacuation_candidates.drain(..) {
        let Some(owner) = heap.chunks.get(base).map(Page::owner) else {
            continue;
        };
        let chunks = &mut heap.chunks;
        if let Some(space) = heap.paged.iter_mut().find(|space| space.identity() == owner) {
            space.release_page(chunks, base);
        }
    }
    if released > 0 {
        GcStats::bump(&heap.stats.pages_evacuated, released as u64);
        log::debug!("released {} evacuated pages", released);
    }
}

// =============================================================================
// Migration
// =============================================================================

/// Records slots of a freshly migrated object that still point into the
/// nursery or at a candidate.
struct MigratedSlotRecorder<'a> {
    heap: &'a Heap,
    slots: &'a mut SlotsBuffer,
}

impl MigratedSlotRecorder<'_> {
    #[inline]
    fn needs_update(&self, target: HeapObject) -> bool {
        self.heap.chunks.in_new_space(target.address()) || self.heap.chunks.on_evacuation_candidate(target.address())
    }

    fn record_entry(&mut self, slot: Address, slot_type: SlotType) {
        let entry = Address::new(slot.load());
        if entry.is_null() {
            return;
        }
        if self.heap.chunks.on_evacuation_candidate(code_from_entry(entry).address()) {
            self.slots.add(SlotEntry::Typed(slot_type, slot), AdditionMode::IgnoreOverflow);
        }
    }
}

impl ObjectVisitor for MigratedSlotRecorder<'_> {
    fn visit_pointers(&mut self, _host: HeapObject, start: Address, end: Address) {
        let mut slot = start;
        while slot < end {
            if let Some(target) = slot.load_tagged().to_object() {
                if self.needs_update(target) {
                    self.slots.add(SlotEntry::Untyped(slot), AdditionMode::IgnoreOverflow);
                }
            }
            slot = slot.add_words(1);
        }
    }

    fn visit_embedded_pointer(&mut self, _host: HeapObject, slot: Address) {
        if let Some(target) = slot.load_tagged().to_object() {
            if self.needs_update(target) {
                self.slots
                    .add(SlotEntry::Typed(SlotType::EmbeddedObject, slot), AdditionMode::IgnoreOverflow);
            }
        }
    }

    fn visit_code_target(&mut self, _host: HeapObject, slot: Address) {
        self.record_entry(slot, SlotType::CodeTarget);
    }

    fn visit_code_entry(&mut self, _host: HeapObject, slot: Address) {
        self.record_entry(slot, SlotType::CodeEntry);
    }
}

/// Copy `source` to `destination` and leave a forwarding entry.
fn migrate_object(
    heap: &mut Heap,
    state: &mut CollectorState,
    destination: Address,
    source: HeapObject,
    size: usize,
    target_space: AllocationSpace,
) -> HeapObject {
    destination.copy_words_from(source.address(), size / WORD_SIZE);
    let moved = HeapObject::from_address(destination);

    if target_space != AllocationSpace::New {
        if object_kind(moved) == InstanceKind::Code {
            state.migration_slots.add(
                SlotEntry::Typed(SlotType::RelocatedCode, destination),
                AdditionMode::IgnoreOverflow,
            );
        } else {
            let mut recorder = MigratedSlotRecorder {
                heap,
                slots: &mut state.migration_slots,
            };
            iterate_body(moved, &mut recorder);
        }
    }

    state.forwarding.insert(source.address(), Forwarding::Moved(destination));
    GcStats::bump(&heap.stats.objects_moved, 1);
    moved
}

fn allocate_for_evacuation(heap: &mut Heap, space: AllocationSpace, size: usize) -> Address {
    match heap.allocate_raw(space, size) {
        Ok(address) => address,
        Err(error) => {
            log::error!("evacuation allocation failed: {}", error);
            heap.fatal_out_of_memory("evacuation")
        }
    }
}

/// Move every marked nursery object out of from-space.
///
/// Objects that already survived a cycle (below the age mark) are
/// promoted; the rest are copied to to-space unless it is full. Dead
/// objects are reported and forwarded to nothing, so any remaining slot
/// naming them is cleared.
pub(crate) fn evacuate_new_space(heap: &mut Heap, state: &mut CollectorState) {
    let age_mark = heap.new_space.age_mark();
    heap.new_space.flip();
    let from_start = heap.new_space.from_space_start();
    let from_top = heap.new_space.from_space_top();

    let mut survivors = 0;
    let mut promoted = 0;
    let mut dead = 0;
    let objects: Vec<HeapObject> = Page::objects_in(from_start, from_top).collect();
    for object in objects {
        if object_kind(object) == InstanceKind::FreeSpace {
            continue;
        }
        if !heap.chunks.is_marked(object) {
            state.forwarding.insert(object.address(), Forwarding::Dead);
            heap.live_objects.process_dead(object);
            dead += 1;
            continue;
        }
        let size = object_size(object);
        let copy = if object.address() < age_mark {
            None
        } else {
            heap.new_space.allocate_raw(size)
        };
        match copy {
            Some(destination) => {
                migrate_object(heap, state, destination, object, size, AllocationSpace::New);
                survivors += 1;
            }
            None => {
                let space = AllocationSpace::promotion_target(object_kind(object));
                let destination = allocate_for_evacuation(heap, space, size);
                migrate_object(heap, state, destination, object, size, space);
                heap.stats.record_promotion(size);
                promoted += 1;
            }
        }
    }

    let top = heap.new_space.top();
    heap.new_space.set_age_mark(top);
    for base in [from_start, heap.new_space.to_space_start()] {
        if let Some(page) = heap.chunks.get_mut(base) {
            page.clear_marks();
        }
    }
    log::debug!(
        "evacuated new space: {} copied, {} promoted, {} dead",
        survivors,
        promoted,
        dead
    );
}

/// Move the marked objects of every remaining candidate.
pub(crate) fn evacuate_live_objects_from_pages(heap: &mut Heap, state: &mut CollectorState) {
    for base in state.evacuation_candidates.clone() {
        let Some(page) = heap.chunks.get(base) else { continue };
        if !page.is_evacuation_candidate() {
            continue;
        }
        let space = page.owner();
        let live: Vec<HeapObject> = page.black_objects().collect();
        for object in live {
            let size = object_size(object);
            let destination = allocate_for_evacuation(heap, space, size);
            debug_assert!(!heap.chunks.on_evacuation_candidate(destination));
            migrate_object(heap, state, destination, object, size, space);
        }
        log::trace!("evacuated {:?} page {}", space, base);
    }
}
