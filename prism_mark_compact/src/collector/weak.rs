//! Weak edges: weak map ephemerons, map caches and map transitions.
//!
//! Marking keeps the backing stores of these structures alive without
//! tracing their entries. Once the strong graph is complete, entries whose
//! key (or cached map, or transition target) died are cleared and the
//! survivors' slots are recorded for compaction.

use super::CollectorState;
use super::evacuation::record_slot;
use super::slots_buffer::SlotEntry;
use super::visitor::MarkingVisitor;
use crate::heap::{AllocationSpace, Heap};
use crate::objects::{fixed_array, fixed_array_length, global_context, js_weak_map, map, read_field};
use crate::value::{Address, HeapObject, Tagged};

/// Slots of the `(key, value)` pair at `pair` in a weak map table.
#[inline]
fn pair_slots(table: HeapObject, pair: usize) -> (Address, Address) {
    let key = table.slot(fixed_array::FIRST_ELEMENT + 2 * pair);
    (key, key.add_words(1))
}

/// Mark the values of weak map entries whose keys are marked.
///
/// Returns whether any value was newly marked; the caller drains the deque
/// and repeats until no entry makes progress.
pub(crate) fn process_weak_maps(marker: &mut MarkingVisitor<'_>) -> bool {
    let mut progress = false;
    // Marking values can discover more weak maps, so index instead of iterating.
    let mut index = 0;
    while index < marker.state.encountered_weak_maps.len() {
        let weak_map = marker.state.encountered_weak_maps[index];
        index += 1;
        let Some(table) = read_field(weak_map, js_weak_map::TABLE).to_object() else {
            continue;
        };
        for pair in 0..fixed_array_length(table) / 2 {
            let (key_slot, value_slot) = pair_slots(table, pair);
            let Some(key) = key_slot.load_tagged().to_object() else { continue };
            if !marker.heap.chunks.is_marked(key) {
                continue;
            }
            if let Some(value) = value_slot.load_tagged().to_object() {
                if !marker.heap.chunks.is_marked(value) {
                    marker.mark_object(value);
                    progress = true;
                }
            }
        }
    }
    progress
}

/// Drop map cache entries whose map died and keep the caches themselves.
pub(crate) fn process_map_caches(marker: &mut MarkingVisitor<'_>) {
    let contexts: Vec<HeapObject> = marker.heap.global_contexts.clone();
    for context in contexts {
        if !marker.heap.chunks.is_marked(context) {
            continue;
        }
        let Some(cache) = read_field(context, global_context::MAP_CACHE).to_object() else {
            continue;
        };
        let pairs = fixed_array_length(cache).saturating_sub(1) / 2;
        let mut removed = 0;
        for pair in 0..pairs {
            let key_slot = cache.slot(fixed_array::FIRST_ELEMENT + 1 + 2 * pair);
            let map_slot = key_slot.add_words(1);
            let Some(cached_map) = map_slot.load_tagged().to_object() else { continue };
            if marker.heap.chunks.is_marked(cached_map) {
                marker.mark_pointer(cache, key_slot);
                record_slot(marker.heap, marker.state, cache, SlotEntry::Untyped(map_slot), cached_map);
            } else {
                key_slot.store_tagged(Tagged::HOLE);
                map_slot.store_tagged(Tagged::HOLE);
                removed += 1;
            }
        }
        if removed > 0 {
            let count_slot = cache.slot(fixed_array::FIRST_ELEMENT);
            let count = count_slot.load_tagged().to_smi().unwrap_or(0);
            count_slot.store_tagged(Tagged::from_smi((count - removed).max(0)));
            log::trace!("dropped {} map cache entries of {:?}", removed, context);
        }
        marker.mark_without_body(cache);
    }
}

/// Clear transitions to maps that did not survive marking.
pub(crate) fn clear_non_live_transitions(heap: &Heap) {
    let Some(map_space) = heap.paged_space(AllocationSpace::Map) else {
        return;
    };
    let mut cleared = 0;
    for &base in map_space.pages() {
        let Some(page) = heap.chunks.get(base) else { continue };
        for source in page.black_objects() {
            let Some(transitions) = read_field(source, map::TRANSITIONS).to_object() else {
                continue;
            };
            for index in 0..fixed_array_length(transitions) {
                let slot = transitions.slot(fixed_array::FIRST_ELEMENT + index);
                let Some(target) = slot.load_tagged().to_object() else { continue };
                if !heap.chunks.is_marked(target) {
                    slot.store_tagged(Tagged::NULL);
                    cleared += 1;
                }
            }
        }
    }
    if cleared > 0 {
        log::debug!("cleared {} dead map transitions", cleared);
    }
}

/// Remove weak map entries with dead keys and record the slots of the
/// survivors.
pub(crate) fn clear_weak_maps(heap: &mut Heap, state: &mut CollectorState) {
    let weak_maps = std::mem::take(&mut state.encountered_weak_maps);
    let mut removed = 0;
    for &weak_map in &weak_maps {
        let Some(table) = read_field(weak_map, js_weak_map::TABLE).to_object() else {
            continue;
        };
        for pair in 0..fixed_array_length(table) / 2 {
            let (key_slot, value_slot) = pair_slots(table, pair);
            let Some(key) = key_slot.load_tagged().to_object() else { continue };
            if heap.chunks.is_marked(key) {
                record_slot(heap, state, table, SlotEntry::Untyped(key_slot), key);
                if let Some(value) = value_slot.load_tagged().to_object() {
                    record_slot(heap, state, table, SlotEntry::Untyped(value_slot), value);
                }
            } else {
                key_slot.store_tagged(Tagged::HOLE);
                value_slot.store_tagged(Tagged::HOLE);
                removed += 1;
            }
        }
    }
    if removed > 0 {
        log::debug!("removed {} weak map entries from {} maps", removed, weak_maps.len());
    }
}
