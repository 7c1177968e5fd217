//! The marking phase.
//!
//! ```text
//!   finalize incremental ─▶ strong roots ─▶ symbol table (no body)
//!         │
//!         ▼
//!   drain deque ◀──┬── refill from grey bits on overflow
//!         │        └── weak map values whose keys are marked
//!         ▼
//!   object groups / implicit references  (fixed point)
//!         ▼
//!   weak handles ─▶ object groups again ─▶ after-marking cleanup
//! ```
//!
//! Deque overflow is never fatal: the object that did not fit stays grey
//! in the bitmap, and the heap is scanned for grey objects once the deque
//! drains.

use super::CollectorState;
use super::code_flusher;
use super::visitor::{MarkingVisitor, RootMarkingVisitor};
use super::weak;
use crate::heap::{ChunkMap, Heap, WeakObjectRetainer, verify};
use crate::objects::ObjectVisitor;
use crate::roots::{GlobalHandle, GlobalHandles};
use crate::stats::GcTimer;
use crate::value::{Address, HeapObject};

use std::sync::atomic::Ordering;

/// Answers liveness from the mark bits.
struct MarkedRetainer<'a> {
    chunks: &'a ChunkMap,
}

impl WeakObjectRetainer for MarkedRetainer<'_> {
    fn retain_as(&self, object: HeapObject) -> Option<HeapObject> {
        self.chunks.is_marked(object).then_some(object)
    }
}

/// Mark everything reachable and process weak structures.
pub(crate) fn mark_live_objects(heap: &mut Heap, state: &mut CollectorState) {
    let timer = GcTimer::start("mark");
    state.deque.initialize(heap.config.marking_deque_capacity);
    state.marked_count = 0;

    let mut marker = MarkingVisitor::new(heap, state);
    if marker.state.was_marked_incrementally {
        marker.finalize_incremental_marking();
    }
    marker.mark_roots();
    marker.mark_symbol_table();
    marker.process_marking_deque();
    marker.process_external_marking();
    marker.process_weak_handles();
    marker.process_external_marking();
    marker.after_marking();
    timer.stop();

    log::debug!("marked {} objects", state.marked_count);
    if heap.config.verify_heap {
        if let Err(error) = verify::verify_marking(heap) {
            log::error!("marking verification failed: {}", error);
            panic!("marking verification failed: {error}");
        }
    }
}

impl MarkingVisitor<'_> {
    // =========================================================================
    // Deque
    // =========================================================================

    /// Visit queued objects until the deque is empty. Overflowed objects
    /// remain grey in the bitmap.
    pub(crate) fn empty_marking_deque(&mut self) {
        while let Some(object) = self.state.deque.pop() {
            self.visit(object);
        }
    }

    /// Queue grey objects found by scanning every page's bitmap.
    ///
    /// Stops early when the deque fills up; the overflow flag is only
    /// cleared after a complete scan.
    fn refill_marking_deque(&mut self) {
        let mut bases: Vec<Address> = vec![
            self.heap.new_space.to_space_start(),
            self.heap.new_space.from_space_start(),
        ];
        for space in &self.heap.paged {
            bases.extend_from_slice(space.pages());
        }
        bases.extend(self.heap.lo_space.objects().map(HeapObject::address));

        for base in bases {
            if !self.scan_page_for_grey(base) {
                return;
            }
        }
        self.state.deque.clear_overflowed();
    }

    /// Returns `false` once the deque is full.
    fn scan_page_for_grey(&mut self, base: Address) -> bool {
        let mut from = 0;
        loop {
            if self.state.deque.is_full() {
                return false;
            }
            let Some(page) = self.heap.chunks.get(base) else {
                return true;
            };
            let Some(bit) = page.bitmap.next_grey(from) else {
                return true;
            };
            let object = HeapObject::from_address(page.address_of(bit));
            from = bit.index() + 2;
            self.heap.chunks.grey_to_black(object);
            self.state.deque.push(object);
        }
    }

    /// Drain the deque, refilling after overflow, and iterate weak maps to
    /// a fixed point.
    pub(crate) fn process_marking_deque(&mut self) {
        loop {
            self.empty_marking_deque();
            while self.state.deque.overflowed() {
                self.refill_marking_deque();
                self.empty_marking_deque();
            }
            if !weak::process_weak_maps(self) {
                break;
            }
        }
    }

    // =========================================================================
    // Roots
    // =========================================================================

    fn mark_roots(&mut self) {
        let mut roots = std::mem::take(&mut self.heap.roots);
        let mut handles = std::mem::take(&mut self.heap.global_handles);
        {
            let mut visitor = RootMarkingVisitor { marker: self };
            roots.iterate_strong_roots(&mut visitor);
            handles.iterate_strong_roots(&mut visitor);
        }
        self.heap.roots = roots;
        self.heap.global_handles = handles;
    }

    /// Keep the symbol table itself alive; its entries are weak.
    fn mark_symbol_table(&mut self) {
        let Some(table) = self.heap.symbol_table() else {
            return;
        };
        self.mark_without_body(table.object());
        let (start, end) = table.prefix_slots();
        self.visit_pointers(table.object(), start, end);
        self.process_marking_deque();
    }

    fn finalize_incremental_marking(&mut self) {
        let handoff = self.heap.incremental.finalize();
        log::debug!(
            "finalizing incremental marking: {} grey objects, {} weak maps",
            handoff.grey.len(),
            handoff.weak_maps.len()
        );
        for object in handoff.grey {
            self.heap.chunks.grey_to_black(object);
            self.state.deque.push_black(&mut self.heap.chunks, object);
        }
        if handoff.overflowed {
            self.state.deque.set_overflowed();
        }
        self.state.encountered_weak_maps.extend(handoff.weak_maps);
        let mut slots = handoff.new_space_slots;
        self.state.new_space_slots.append(&mut slots);
    }

    // =========================================================================
    // Embedder Groups
    // =========================================================================

    /// Mark object groups with a live member and the children of live
    /// implicit-reference parents until nothing changes.
    fn process_external_marking(&mut self) {
        loop {
            let before = self.state.marked_count;
            self.mark_object_groups();
            self.mark_implicit_references();
            self.process_marking_deque();
            if self.state.marked_count == before {
                break;
            }
        }
    }

    fn handle_object(handles: &GlobalHandles, handle: GlobalHandle) -> Option<HeapObject> {
        handles.get(handle).ok().and_then(|value| value.to_object())
    }

    fn mark_object_groups(&mut self) {
        let groups = self.heap.global_handles.take_object_groups();
        let mut pending = Vec::new();
        for group in groups {
            let members: Vec<HeapObject> = group
                .handles
                .iter()
                .filter_map(|&handle| Self::handle_object(&self.heap.global_handles, handle))
                .collect();
            if members.iter().any(|&member| self.heap.chunks.is_marked(member)) {
                for member in members {
                    self.mark_object(member);
                }
            } else {
                pending.push(group);
            }
        }
        self.heap.global_handles.restore_object_groups(pending);
    }

    fn mark_implicit_references(&mut self) {
        let groups = self.heap.global_handles.take_implicit_ref_groups();
        let mut pending = Vec::new();
        for group in groups {
            let parent_live = Self::handle_object(&self.heap.global_handles, group.parent)
                .is_some_and(|parent| self.heap.chunks.is_marked(parent));
            if !parent_live {
                pending.push(group);
                continue;
            }
            for &child in &group.children {
                if let Some(object) = Self::handle_object(&self.heap.global_handles, child) {
                    self.mark_object(object);
                }
            }
        }
        self.heap.global_handles.restore_implicit_ref_groups(pending);
    }

    /// Flag weak handles to unmarked objects as pending, then keep every
    /// weak referent alive for this cycle so callbacks can observe it.
    fn process_weak_handles(&mut self) {
        let chunks = &self.heap.chunks;
        self.heap
            .global_handles
            .identify_weak_handles(|object| !chunks.is_marked(object));

        let mut handles = std::mem::take(&mut self.heap.global_handles);
        handles.iterate_weak_roots(&mut RootMarkingVisitor { marker: self });
        self.heap.global_handles = handles;
        self.process_marking_deque();
    }

    // =========================================================================
    // After Marking
    // =========================================================================

    fn after_marking(&mut self) {
        weak::process_map_caches(self);
        self.process_marking_deque();

        if let Some(table) = self.heap.symbol_table() {
            let chunks = &self.heap.chunks;
            let released = table.prune(|symbol| chunks.is_marked(symbol));
            for id in released {
                self.heap.external_strings.release(id);
            }
        }

        let chunks = &self.heap.chunks;
        self.heap.external_strings.clean_dead(|string| chunks.is_marked(string));
        self.heap.global_contexts.retain(|&context| chunks.is_marked(context));

        if let Some(mut callback) = self.heap.weak_reference_callback.take() {
            callback.process_weak_references(&MarkedRetainer {
                chunks: &self.heap.chunks,
            });
            self.heap.weak_reference_callback = Some(callback);
        }

        // Nursery objects are reported when new space is evacuated.
        let dead: Vec<HeapObject> = self
            .heap
            .live_objects
            .iter()
            .filter(|object| !self.heap.chunks.in_new_space(object.address()))
            .filter(|&object| !self.heap.chunks.is_marked(object))
            .collect();
        for object in dead {
            self.heap.live_objects.process_dead(object);
        }

        self.heap.global_handles.remove_object_groups();
        self.heap.global_handles.remove_implicit_ref_groups();

        code_flusher::process_candidates(self.heap, self.state);
        self.heap
            .stats
            .objects_marked
            .store(self.state.marked_count as u64, Ordering::Relaxed);
    }
}
