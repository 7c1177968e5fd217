//! Rewrites every slot that may refer to a moved object.
//!
//! Sources of such slots, in the order they are processed:
//!
//! ```text
//!   to-space objects             full scan (survivors were just copied)
//!   roots, global handles        full scan
//!   new-space + migration slots  recorded during marking and migration
//!   candidate slots buffers      recorded during marking
//!   rescan pages                 full scan of evicted candidates
//!   invalidated code             full scan of its relocation slots
//!   cell space                   full scan of property cells
//!   symbol table                 entries were never traced
//!   external strings, contexts   weak lists, updated in place
//! ```
//!
//! A slot whose referent died in the nursery is cleared.

use super::slots_buffer::{SlotEntry, SlotType, SlotsBuffer};
use super::sweeper::{SkipListMode, sweep_precisely};
use super::{CollectorState, Forwarding};
use crate::heap::{AllocationSpace, Heap, Page, PageFlags};
use crate::objects::{
    InstanceKind, ObjectVisitor, code_entry, code_from_entry, iterate_body, iterate_code_body, object_end,
    object_kind, property_cell,
};
use crate::roots::RootVisitor;
use crate::stats::GcStats;
use crate::value::{Address, HeapObject, Tagged};

use rustc_hash::FxHashMap;

/// Rewrites slots through the forwarding table.
pub(crate) struct PointerUpdatingVisitor<'a> {
    forwarding: &'a FxHashMap<Address, Forwarding>,
}

impl<'a> PointerUpdatingVisitor<'a> {
    pub(crate) fn new(forwarding: &'a FxHashMap<Address, Forwarding>) -> Self {
        Self { forwarding }
    }

    /// Current location of `object`, or `None` if it died in the nursery.
    #[inline]
    pub(crate) fn relocate(&self, object: HeapObject) -> Option<HeapObject> {
        match self.forwarding.get(&object.address()) {
            Some(Forwarding::Moved(to)) => Some(HeapObject::from_address(*to)),
            Some(Forwarding::Dead) => None,
            None => Some(object),
        }
    }

    #[inline]
    fn update_tagged(&self, value: Tagged) -> Tagged {
        match value.to_object() {
            Some(object) => self.relocate(object).map_or(Tagged::NULL, HeapObject::to_tagged),
            None => value,
        }
    }

    #[inline]
    fn update_tagged_slot(&self, slot: Address) {
        let value = slot.load_tagged();
        let updated = self.update_tagged(value);
        if updated != value {
            slot.store_tagged(updated);
        }
    }

    fn update_entry_slot(&self, slot: Address) {
        let entry = Address::new(slot.load());
        if entry.is_null() {
            return;
        }
        if let Some(code) = self.relocate(code_from_entry(entry)) {
            slot.store(code_entry(code).raw());
        }
    }

    /// Update one recorded slot.
    fn update_slot(&mut self, entry: SlotEntry) {
        match entry {
            SlotEntry::Untyped(slot) | SlotEntry::Typed(SlotType::EmbeddedObject, slot) => {
                self.update_tagged_slot(slot)
            }
            SlotEntry::Typed(SlotType::CodeTarget | SlotType::CodeEntry, slot) => self.update_entry_slot(slot),
            SlotEntry::Typed(SlotType::RelocatedCode, code) => {
                iterate_code_body(HeapObject::from_address(code), self);
            }
        }
    }
}

impl ObjectVisitor for PointerUpdatingVisitor<'_> {
    fn visit_pointers(&mut self, _host: HeapObject, start: Address, end: Address) {
        let mut slot = start;
        while slot < end {
            self.update_tagged_slot(slot);
            slot = slot.add_words(1);
        }
    }

    fn visit_code_target(&mut self, _host: HeapObject, slot: Address) {
        self.update_entry_slot(slot);
    }

    fn visit_code_entry(&mut self, _host: HeapObject, slot: Address) {
        self.update_entry_slot(slot);
    }
}

impl RootVisitor for PointerUpdatingVisitor<'_> {
    fn visit_root(&mut self, slot: &mut Tagged) {
        *slot = self.update_tagged(*slot);
    }
}

/// Address ranges of code invalidated this cycle, sorted.
///
/// Slots recorded inside such code are ignored; the code is rescanned as
/// a whole instead.
struct InvalidatedRanges(Vec<(Address, Address)>);

impl InvalidatedRanges {
    fn new(code: &[HeapObject]) -> Self {
        let mut ranges: Vec<_> = code.iter().map(|&object| (object.address(), object_end(object))).collect();
        ranges.sort_unstable();
        Self(ranges)
    }

    fn contains(&self, slot: Address) -> bool {
        let index = self.0.partition_point(|&(start, _)| start <= slot);
        index > 0 && slot < self.0[index - 1].1
    }
}

fn update_recorded(updater: &mut PointerUpdatingVisitor<'_>, buffer: &SlotsBuffer, invalidated: &InvalidatedRanges) {
    for entry in buffer.iter() {
        if let SlotEntry::Typed(SlotType::RelocatedCode, _) = entry {
            updater.update_slot(entry);
        } else if !invalidated.contains(entry.address()) {
            updater.update_slot(entry);
        }
    }
}

/// Rewrite every slot referring to an evacuated object.
pub(crate) fn update_pointers(heap: &mut Heap, state: &mut CollectorState) {
    let mut updater = PointerUpdatingVisitor::new(&state.forwarding);
    let invalidated = InvalidatedRanges::new(&state.invalidated_code);

    for object in heap.new_space.objects() {
        iterate_body(object, &mut updater);
    }

    heap.roots.iterate_all(&mut updater);
    heap.global_handles.iterate_all_roots(&mut updater);
    heap.live_objects.update(|object| updater.relocate(object));

    update_recorded(&mut updater, &state.new_space_slots, &invalidated);
    update_recorded(&mut updater, &state.migration_slots, &invalidated);

    for &base in &state.evacuation_candidates {
        let Some(buffer) = heap.chunks.get_mut(base).and_then(|page| page.slots_buffer.take()) else {
            continue;
        };
        update_recorded(&mut updater, &buffer, &invalidated);
    }

    let mut rescanned = 0;
    let mut freed = 0;
    let chunks = &mut heap.chunks;
    for space in heap.paged.iter_mut() {
        let rescan: Vec<Address> = space.pages_with(chunks, PageFlags::RESCAN_ON_EVACUATION).collect();
        let skip_list = if space.identity() == AllocationSpace::Code {
            SkipListMode::Rebuild
        } else {
            SkipListMode::Ignore
        };
        for base in rescan {
            let Some(page) = chunks.get_mut(base) else { continue };
            page.clear_flag(PageFlags::RESCAN_ON_EVACUATION);
            let visitor: &mut dyn ObjectVisitor = &mut updater;
            freed += sweep_precisely(page, &mut space.free_list, skip_list, Some(visitor));
            rescanned += 1;
        }
    }
    if rescanned > 0 {
        GcStats::bump(&heap.stats.bytes_swept, freed as u64);
        log::debug!("rescanned {} evicted candidate pages", rescanned);
    }

    for &code in &state.invalidated_code {
        iterate_body(code, &mut updater);
    }

    if let Some(cell_space) = heap.paged_space(AllocationSpace::Cell) {
        for &base in cell_space.pages() {
            let Some(page) = heap.chunks.get(base) else { continue };
            for cell in Page::objects_in(page.area_start(), page.area_end()) {
                if object_kind(cell) == InstanceKind::PropertyCell {
                    updater.visit_pointer(cell, cell.slot(property_cell::VALUE));
                }
            }
        }
    }

    if let Some(table) = heap.symbol_table() {
        for slot in table.entry_slots() {
            updater.update_tagged_slot(slot);
        }
    }

    let chunks = &heap.chunks;
    heap.external_strings
        .update(|string| updater.relocate(string), |string| chunks.in_new_space(string.address()));
    for context in &mut heap.global_contexts {
        if let Some(current) = updater.relocate(*context) {
            *context = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidated_ranges() {
        let ranges = InvalidatedRanges(vec![
            (Address::new(0x1000), Address::new(0x1040)),
            (Address::new(0x2000), Address::new(0x2080)),
        ]);
        assert!(ranges.contains(Address::new(0x1000)));
        assert!(ranges.contains(Address::new(0x1038)));
        assert!(!ranges.contains(Address::new(0x1040)));
        assert!(!ranges.contains(Address::new(0x0ff8)));
        assert!(ranges.contains(Address::new(0x2078)));
        assert!(!ranges.contains(Address::new(0x3000)));
    }

    #[test]
    fn test_relocate_through_forwarding() {
        let mut forwarding = FxHashMap::default();
        let moved = HeapObject::from_address(Address::new(0x1000));
        let dead = HeapObject::from_address(Address::new(0x2000));
        let untouched = HeapObject::from_address(Address::new(0x3000));
        forwarding.insert(moved.address(), Forwarding::Moved(Address::new(0x5000)));
        forwarding.insert(dead.address(), Forwarding::Dead);

        let updater = PointerUpdatingVisitor::new(&forwarding);
        assert_eq!(updater.relocate(moved), Some(HeapObject::from_address(Address::new(0x5000))));
        assert_eq!(updater.relocate(dead), None);
        assert_eq!(updater.relocate(untouched), Some(untouched));
        assert_eq!(updater.update_tagged(dead.to_tagged()), Tagged::NULL);
        assert_eq!(updater.update_tagged(Tagged::from_smi(7)), Tagged::from_smi(7));
    }
}
