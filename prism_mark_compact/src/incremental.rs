//! Incremental marking.
//!
//! Marking can be spread over many small steps between mutator work. The
//! steps keep their own grey deque; the write barrier in
//! [`Heap::set_field`] greys any white object stored into a black one, so
//! no live object is hidden from the marker.
//!
//! ```text
//!   Stopped ──start──▶ Marking ──deque empty──▶ Complete
//!      ▲                                           │
//!      └──────────── full collection ◀─────────────┘
//! ```
//!
//! The next full collection picks up where the steps left off: grey
//! objects, encountered weak maps and recorded old-to-new slots are handed
//! to the collector, which finishes marking in one pause. A cycle that was
//! marked incrementally never compacts or flushes code.

use crate::collector::{AdditionMode, MarkingDeque, SlotEntry, SlotsBuffer};
use crate::heap::{ChunkMap, Heap, ObjectColor};
use crate::objects::{
    InstanceKind, ObjectVisitor, code_from_entry, iterate_map_and_body, js_weak_map, layout, object_kind, read_field,
};
use crate::roots::RootVisitor;
use crate::value::{Address, HeapObject, Tagged};

/// Progress of incremental marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementalState {
    /// Not marking.
    Stopped,
    /// Steps are in progress.
    Marking,
    /// The grey set is exhausted; a full collection should follow.
    Complete,
}

/// Work left for the final marking pause.
#[derive(Debug)]
pub(crate) struct IncrementalHandoff {
    pub(crate) grey: Vec<HeapObject>,
    pub(crate) overflowed: bool,
    pub(crate) weak_maps: Vec<HeapObject>,
    pub(crate) new_space_slots: SlotsBuffer,
}

/// Incremental marker state, owned by the heap.
#[derive(Debug)]
pub struct IncrementalMarking {
    state: IncrementalState,
    deque: MarkingDeque,
    weak_maps: Vec<HeapObject>,
    new_space_slots: SlotsBuffer,
    capacity: usize,
}

impl IncrementalMarking {
    /// Create a stopped marker whose deque holds `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: IncrementalState::Stopped,
            deque: MarkingDeque::new(capacity),
            weak_maps: Vec::new(),
            new_space_slots: SlotsBuffer::new(1),
            capacity,
        }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> IncrementalState {
        self.state
    }

    /// Whether marks set by steps are live, i.e. marking started and no
    /// full collection has consumed them yet.
    #[inline]
    pub fn is_marking(&self) -> bool {
        self.state != IncrementalState::Stopped
    }

    /// Whether every grey object has been visited.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state == IncrementalState::Complete
    }

    /// Objects waiting to be visited.
    pub fn pending(&self) -> usize {
        self.deque.len()
    }

    /// Write barrier: a store of `value` into `slot` of `host`.
    #[inline]
    pub(crate) fn record_write(&mut self, chunks: &mut ChunkMap, host: HeapObject, slot: Address, value: HeapObject) {
        if self.state == IncrementalState::Stopped || chunks.color(host) != ObjectColor::Black {
            return;
        }
        if chunks.white_to_grey(value) {
            self.deque.push_grey(value);
            // Marking has more to do.
            self.state = IncrementalState::Marking;
        }
        if !chunks.in_new_space(host.address()) && chunks.in_new_space(value.address()) {
            self.new_space_slots.add(SlotEntry::Untyped(slot), AdditionMode::IgnoreOverflow);
        }
    }

    /// Stop marking and hand the remaining work to the collector.
    pub(crate) fn finalize(&mut self) -> IncrementalHandoff {
        let mut grey = Vec::with_capacity(self.deque.len());
        while let Some(object) = self.deque.pop() {
            grey.push(object);
        }
        let handoff = IncrementalHandoff {
            grey,
            overflowed: self.deque.overflowed(),
            weak_maps: std::mem::take(&mut self.weak_maps),
            new_space_slots: std::mem::replace(&mut self.new_space_slots, SlotsBuffer::new(1)),
        };
        self.deque.initialize(self.capacity);
        self.state = IncrementalState::Stopped;
        handoff
    }
}

// =============================================================================
// Visitors
// =============================================================================

/// Greys the targets of visited slots and records old-to-new slots.
struct IncrementalVisitor<'a> {
    chunks: &'a mut ChunkMap,
    deque: &'a mut MarkingDeque,
    new_space_slots: &'a mut SlotsBuffer,
}

impl IncrementalVisitor<'_> {
    #[inline]
    fn grey(&mut self, object: HeapObject) {
        if self.chunks.white_to_grey(object) {
            self.deque.push_grey(object);
        }
    }

    fn grey_entry(&mut self, slot: Address) {
        let entry = Address::new(slot.load());
        if !entry.is_null() {
            self.grey(code_from_entry(entry));
        }
    }
}

impl ObjectVisitor for IncrementalVisitor<'_> {
    fn visit_pointers(&mut self, host: HeapObject, start: Address, end: Address) {
        let host_in_new_space = self.chunks.in_new_space(host.address());
        let mut slot = start;
        while slot < end {
            if let Some(target) = slot.load_tagged().to_object() {
                if !host_in_new_space && self.chunks.in_new_space(target.address()) {
                    self.new_space_slots.add(SlotEntry::Untyped(slot), AdditionMode::IgnoreOverflow);
                }
                self.grey(target);
            }
            slot = slot.add_words(1);
        }
    }

    fn visit_code_target(&mut self, _host: HeapObject, slot: Address) {
        self.grey_entry(slot);
    }

    fn visit_code_entry(&mut self, _host: HeapObject, slot: Address) {
        self.grey_entry(slot);
    }
}

impl RootVisitor for IncrementalVisitor<'_> {
    fn visit_root(&mut self, slot: &mut Tagged) {
        if let Some(object) = slot.to_object() {
            self.grey(object);
        }
    }
}

// =============================================================================
// Heap Entry Points
// =============================================================================

impl Heap {
    /// Begin incremental marking by greying the strong roots.
    ///
    /// Deferred sweeping is finished first so that every page starts with
    /// a clean bitmap.
    pub(crate) fn start_incremental_marking(&mut self) {
        if self.incremental.is_marking() {
            return;
        }
        let chunks = &mut self.chunks;
        for space in self.paged.iter_mut() {
            space.ensure_sweeping_completed(chunks);
        }
        // The table is kept; its entries are weak.
        if let Some(table) = self.symbol_table() {
            self.chunks.set_mark(table.object());
        }

        let marking = &mut self.incremental;
        marking.deque.initialize(marking.capacity);
        marking.state = IncrementalState::Marking;
        {
            let mut visitor = IncrementalVisitor {
                chunks: &mut self.chunks,
                deque: &mut marking.deque,
                new_space_slots: &mut marking.new_space_slots,
            };
            self.roots.iterate_strong_roots(&mut visitor);
            self.global_handles.iterate_strong_roots(&mut visitor);
        }
        log::debug!("incremental marking started: {} grey roots", marking.deque.len());
    }

    /// Visit up to `budget` grey objects. Returns the number visited.
    ///
    /// When the grey set runs dry the marker becomes
    /// [`IncrementalState::Complete`]; a deque overflow is left for the
    /// final pause to recover from the mark bits.
    pub fn incremental_marking_step(&mut self, budget: usize) -> usize {
        if self.incremental.state != IncrementalState::Marking {
            return 0;
        }
        let marking = &mut self.incremental;
        let mut visitor = IncrementalVisitor {
            chunks: &mut self.chunks,
            deque: &mut marking.deque,
            new_space_slots: &mut marking.new_space_slots,
        };

        let mut visited = 0;
        while visited < budget {
            let Some(object) = visitor.deque.pop() else { break };
            visitor.chunks.grey_to_black(object);
            visited += 1;

            if object_kind(object) != InstanceKind::JsWeakMap {
                iterate_map_and_body(object, &mut visitor);
                continue;
            }
            marking.weak_maps.push(object);
            visitor.visit_pointer(object, object.slot(layout::MAP));
            let Some(table) = read_field(object, js_weak_map::TABLE).to_object() else {
                continue;
            };
            if visitor.chunks.set_mark(table) {
                if let Some(table_map) = read_field(table, layout::MAP).to_object() {
                    visitor.grey(table_map);
                }
            }
            let host_in_new_space = visitor.chunks.in_new_space(object.address());
            if !host_in_new_space && visitor.chunks.in_new_space(table.address()) {
                visitor
                    .new_space_slots
                    .add(SlotEntry::Untyped(object.slot(js_weak_map::TABLE)), AdditionMode::IgnoreOverflow);
            }
        }

        if visitor.deque.is_empty() {
            marking.state = IncrementalState::Complete;
            log::debug!("incremental marking complete");
        }
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::objects::{Pretenure, fixed_array};

    fn heap() -> Heap {
        let _ = env_logger::builder().is_test(true).try_init();
        Heap::new(GcConfig::default()).expect("heap")
    }

    // =========================================================================
    // State Tests
    // =========================================================================

    #[test]
    fn test_starts_stopped() {
        let marking = IncrementalMarking::new(64);
        assert_eq!(marking.state(), IncrementalState::Stopped);
        assert!(!marking.is_marking());
        assert_eq!(marking.pending(), 0);
    }

    #[test]
    fn test_step_without_start_does_nothing() {
        let mut heap = heap();
        assert_eq!(heap.incremental_marking_step(100), 0);
        assert_eq!(heap.incremental().state(), IncrementalState::Stopped);
    }

    #[test]
    fn test_steps_reach_completion() {
        let mut heap = heap();
        let array = heap.allocate_fixed_array(3, Pretenure::Tenured).expect("array");
        heap.push_stack(array.to_tagged());

        heap.start_incremental_marking();
        assert!(heap.incremental().is_marking());
        while !heap.incremental().is_complete() {
            heap.incremental_marking_step(8);
        }
        assert_eq!(heap.chunks().color(array), ObjectColor::Black);
    }

    #[test]
    fn test_finalize_hands_off_grey_objects() {
        let mut heap = heap();
        let array = heap.allocate_fixed_array(1, Pretenure::Tenured).expect("array");
        heap.push_stack(array.to_tagged());

        heap.start_incremental_marking();
        let pending = heap.incremental().pending();
        assert!(pending > 0);
        let handoff = heap.incremental.finalize();
        assert_eq!(handoff.grey.len(), pending);
        assert!(!handoff.overflowed);
        assert_eq!(heap.incremental().state(), IncrementalState::Stopped);
    }

    // =========================================================================
    // Write Barrier Tests
    // =========================================================================

    #[test]
    fn test_barrier_greys_value_stored_into_black_host() {
        let mut heap = heap();
        let host = heap.allocate_fixed_array(1, Pretenure::Tenured).expect("host");
        heap.push_stack(host.to_tagged());
        heap.start_incremental_marking();
        while !heap.incremental().is_complete() {
            heap.incremental_marking_step(64);
        }
        assert_eq!(heap.chunks().color(host), ObjectColor::Black);

        let late = heap.allocate_fixed_array(0, Pretenure::Tenured).expect("late");
        assert!(!heap.chunks().is_marked(late));
        heap.set_field(host, fixed_array::FIRST_ELEMENT, late.to_tagged());
        assert!(heap.chunks().is_marked(late));
        assert_eq!(heap.incremental().state(), IncrementalState::Marking);
    }

    #[test]
    fn test_barrier_records_old_to_new_slots() {
        let mut heap = heap();
        let host = heap.allocate_fixed_array(1, Pretenure::Tenured).expect("host");
        heap.push_stack(host.to_tagged());
        heap.start_incremental_marking();
        while !heap.incremental().is_complete() {
            heap.incremental_marking_step(64);
        }

        let young = heap.allocate_fixed_array(0, Pretenure::NotTenured).expect("young");
        heap.set_field(host, fixed_array::FIRST_ELEMENT, young.to_tagged());
        let handoff = heap.incremental.finalize();
        assert!(
            handoff
                .new_space_slots
                .iter()
                .any(|entry| entry.address() == host.slot(fixed_array::FIRST_ELEMENT))
        );
    }
}
