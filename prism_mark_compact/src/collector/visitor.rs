//! Static dispatch table for the marking visitor.
//!
//! Every object carries a [`VisitorId`] derived from its header. The table
//! maps each id to the routine that marks the object's body:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     VisitorTable (OnceLock)                   │
//! ├──────────────────────┬────────────────────────────────────────┤
//! │ DataObject/FreeSpace │ visit_nothing                          │
//! │ ConsString           │ visit_pointers(first..second)          │
//! │ FixedArray           │ visit_pointers(elements)               │
//! │ JsObject3..9         │ visit_js_object::<N>                   │
//! │ JsObjectGeneric      │ visit_pointers(body)                   │
//! │ Map                  │ visit_map         (weak transitions)   │
//! │ Code                 │ iterate_code_body                      │
//! │ SharedFunctionInfo   │ visit_shared_function_info (flushing)  │
//! │ JsFunction           │ visit_js_function (code flushing)      │
//! │ JsWeakMap            │ visit_js_weak_map (ephemeron table)    │
//! │ PropertyCell         │ visit_property_cell                    │
//! │ GlobalContext        │ visit_global_context (weak map cache)  │
//! └──────────────────────┴────────────────────────────────────────┘
//! ```
//!
//! The table is filled once and then only read; dispatch is a single
//! indexed load.

use super::CollectorState;
use super::code_flusher::{is_flushable_function, is_flushable_shared_info};
use super::evacuation::record_slot;
use super::slots_buffer::{SlotEntry, SlotType};
use crate::heap::Heap;
use crate::objects::{
    InstanceKind, ObjectHeader, ObjectVisitor, VisitorId, code_from_entry, cons_string, fixed_array, global_context,
    iterate_code_body, js_function, js_weak_map, layout, map, object_end, object_kind, property_cell, read_field,
    shared_function_info,
};
use crate::roots::RootVisitor;
use crate::stats::GcStats;
use crate::value::{Address, HeapObject, Tagged};

use std::sync::OnceLock;

// =============================================================================
// Marking Visitor
// =============================================================================

/// Marks objects and records slots into evacuation candidates.
pub(crate) struct MarkingVisitor<'a> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) state: &'a mut CollectorState,
}

impl<'a> MarkingVisitor<'a> {
    pub(crate) fn new(heap: &'a mut Heap, state: &'a mut CollectorState) -> Self {
        Self { heap, state }
    }

    /// Mark `object` black and queue it for scanning.
    #[inline]
    pub(crate) fn mark_object(&mut self, object: HeapObject) {
        if self.heap.chunks.set_mark(object) {
            self.state.marked_count += 1;
            if !self.state.deque.push_black(&mut self.heap.chunks, object) {
                GcStats::bump(&self.heap.stats.deque_overflows, 1);
            }
        }
    }

    /// Mark `object` black without scanning its body; its map is marked
    /// normally. Returns whether the object was white.
    pub(crate) fn mark_without_body(&mut self, object: HeapObject) -> bool {
        if !self.heap.chunks.set_mark(object) {
            return false;
        }
        self.state.marked_count += 1;
        if let Some(object_map) = read_field(object, layout::MAP).to_object() {
            self.mark_object(object_map);
        }
        true
    }

    /// Mark the object a tagged slot of `host` refers to.
    #[inline]
    pub(crate) fn mark_pointer(&mut self, host: HeapObject, slot: Address) {
        let Some(mut target) = slot.load_tagged().to_object() else {
            return;
        };
        if self.state.cons_string_shortcut {
            target = self.short_circuit_cons_string(host, slot, target);
        }
        record_slot(self.heap, self.state, host, SlotEntry::Untyped(slot), target);
        self.mark_object(target);
    }

    /// Replace a pointer to a flat cons string `(first, "")` by `first`.
    fn short_circuit_cons_string(&mut self, host: HeapObject, slot: Address, object: HeapObject) -> HeapObject {
        if object_kind(object) != InstanceKind::ConsString || Heap::is_symbol(object) {
            return object;
        }
        if read_field(object, cons_string::SECOND) != self.state.empty_string {
            return object;
        }
        let Some(first) = read_field(object, cons_string::FIRST).to_object() else {
            return object;
        };
        let chunks = &self.heap.chunks;
        if !chunks.in_new_space(object.address()) && chunks.in_new_space(first.address()) {
            return object;
        }
        log::trace!("short-circuited cons string {:?} in {:?}", object, host);
        slot.store_tagged(first.to_tagged());
        first
    }

    /// Mark the map of `object`, then its body.
    #[inline]
    pub(crate) fn visit(&mut self, object: HeapObject) {
        let header = ObjectHeader::of(object);
        if let Some(object_map) = read_field(object, layout::MAP).to_object() {
            self.mark_object(object_map);
        }
        (visitor_table().get(VisitorId::of(header)))(self, object);
    }

    /// Mark the code object whose entry is stored in `slot`.
    fn mark_entry_slot(&mut self, host: HeapObject, slot: Address, slot_type: SlotType) {
        let entry = Address::new(slot.load());
        if entry.is_null() {
            return;
        }
        let target = code_from_entry(entry);
        record_slot(self.heap, self.state, host, SlotEntry::Typed(slot_type, slot), target);
        self.mark_object(target);
    }
}

impl ObjectVisitor for MarkingVisitor<'_> {
    #[inline]
    fn visit_pointers(&mut self, host: HeapObject, start: Address, end: Address) {
        let mut slot = start;
        while slot < end {
            self.mark_pointer(host, slot);
            slot = slot.add_words(1);
        }
    }

    fn visit_embedded_pointer(&mut self, host: HeapObject, slot: Address) {
        let Some(target) = slot.load_tagged().to_object() else {
            return;
        };
        record_slot(self.heap, self.state, host, SlotEntry::Typed(SlotType::EmbeddedObject, slot), target);
        self.mark_object(target);
    }

    fn visit_code_target(&mut self, host: HeapObject, slot: Address) {
        self.mark_entry_slot(host, slot, SlotType::CodeTarget);
    }

    fn visit_code_entry(&mut self, host: HeapObject, slot: Address) {
        self.mark_entry_slot(host, slot, SlotType::CodeEntry);
    }
}

/// Marks everything a root slot refers to, draining the deque after each
/// root.
pub(crate) struct RootMarkingVisitor<'v, 'a> {
    pub(crate) marker: &'v mut MarkingVisitor<'a>,
}

impl RootVisitor for RootMarkingVisitor<'_, '_> {
    fn visit_root(&mut self, slot: &mut Tagged) {
        let Some(mut object) = slot.to_object() else {
            return;
        };
        if self.marker.state.cons_string_shortcut
            && object_kind(object) == InstanceKind::ConsString
            && !Heap::is_symbol(object)
            && read_field(object, cons_string::SECOND) == self.marker.state.empty_string
        {
            if let Some(first) = read_field(object, cons_string::FIRST).to_object() {
                *slot = first.to_tagged();
                object = first;
            }
        }
        self.marker.mark_object(object);
        self.marker.empty_marking_deque();
    }
}

// =============================================================================
// Dispatch Table
// =============================================================================

/// Body-marking routine.
pub(crate) type VisitFn = fn(&mut MarkingVisitor<'_>, HeapObject);

/// Routines indexed by visitor id.
pub(crate) struct VisitorTable {
    entries: [VisitFn; VisitorId::COUNT],
}

impl VisitorTable {
    const fn new() -> Self {
        Self {
            entries: [visit_nothing as VisitFn; VisitorId::COUNT],
        }
    }

    fn register(&mut self, id: VisitorId, routine: VisitFn) {
        self.entries[id as usize] = routine;
    }

    #[inline(always)]
    pub(crate) fn get(&self, id: VisitorId) -> VisitFn {
        self.entries[id as usize]
    }
}

static VISITOR_TABLE: OnceLock<VisitorTable> = OnceLock::new();

/// The process-wide marking table.
#[inline]
pub(crate) fn visitor_table() -> &'static VisitorTable {
    VISITOR_TABLE.get_or_init(init_visitor_table)
}

fn init_visitor_table() -> VisitorTable {
    let mut table = VisitorTable::new();
    table.register(VisitorId::DataObject, visit_nothing);
    table.register(VisitorId::FreeSpace, visit_nothing);
    table.register(VisitorId::ConsString, visit_cons_string);
    table.register(VisitorId::FixedArray, visit_fixed_array);
    table.register(VisitorId::JsObject3, visit_js_object::<3>);
    table.register(VisitorId::JsObject4, visit_js_object::<4>);
    table.register(VisitorId::JsObject5, visit_js_object::<5>);
    table.register(VisitorId::JsObject6, visit_js_object::<6>);
    table.register(VisitorId::JsObject7, visit_js_object::<7>);
    table.register(VisitorId::JsObject8, visit_js_object::<8>);
    table.register(VisitorId::JsObject9, visit_js_object::<9>);
    table.register(VisitorId::JsObjectGeneric, visit_js_object_generic);
    table.register(VisitorId::Map, visit_map);
    table.register(VisitorId::Code, visit_code);
    table.register(VisitorId::SharedFunctionInfo, visit_shared_function_info);
    table.register(VisitorId::JsFunction, visit_js_function);
    table.register(VisitorId::JsWeakMap, visit_js_weak_map);
    table.register(VisitorId::PropertyCell, visit_property_cell);
    table.register(VisitorId::GlobalContext, visit_global_context);
    table
}

// =============================================================================
// Routines
// =============================================================================

fn visit_nothing(_visitor: &mut MarkingVisitor<'_>, _object: HeapObject) {}

fn visit_cons_string(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    visitor.visit_pointers(object, object.slot(cons_string::FIRST), object.slot(cons_string::SECOND + 1));
}

fn visit_fixed_array(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    visitor.visit_pointers(object, object.slot(fixed_array::FIRST_ELEMENT), object_end(object));
}

fn visit_js_object<const WORDS: usize>(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    debug_assert_eq!(ObjectHeader::of(object).size_in_words(), WORDS);
    visitor.visit_pointers(object, object.slot(layout::BODY), object.slot(WORDS));
}

fn visit_js_object_generic(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    visitor.visit_pointers(object, object.slot(layout::BODY), object_end(object));
}

/// Maps keep their transitions array alive but not its targets when dead
/// transitions are collected.
fn visit_map(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    visitor.mark_pointer(object, object.slot(map::PROTOTYPE));
    visitor.mark_pointer(object, object.slot(map::CODE_CACHE));

    let slot = object.slot(map::TRANSITIONS);
    if !visitor.state.collect_maps {
        visitor.mark_pointer(object, slot);
        return;
    }
    if let Some(transitions) = slot.load_tagged().to_object() {
        record_slot(visitor.heap, visitor.state, object, SlotEntry::Untyped(slot), transitions);
        visitor.mark_without_body(transitions);
    }
}

fn visit_code(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    iterate_code_body(object, visitor);
}

fn visit_shared_function_info(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    let code_slot = object.slot(shared_function_info::CODE);
    if visitor.state.flush_code {
        visitor.state.code_flusher.age_once(object);
        if is_flushable_shared_info(visitor.heap, object) {
            visitor.state.code_flusher.add_shared_candidate(object);
        } else {
            visitor.mark_pointer(object, code_slot);
        }
    } else {
        visitor.mark_pointer(object, code_slot);
    }
    visitor.mark_pointer(object, object.slot(shared_function_info::SOURCE));
}

fn visit_js_function(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    visitor.mark_pointer(object, object.slot(js_function::SHARED));
    visitor.mark_pointer(object, object.slot(js_function::CONTEXT));

    let entry_slot = object.slot(js_function::CODE_ENTRY);
    if visitor.state.flush_code {
        if let Some(shared) = read_field(object, js_function::SHARED).to_object() {
            visitor.state.code_flusher.age_once(shared);
        }
        if is_flushable_function(visitor.heap, object) {
            visitor.state.code_flusher.add_function_candidate(object);
            return;
        }
    }
    visitor.visit_code_entry(object, entry_slot);
}

/// The table is kept alive without tracing its entries; the ephemeron
/// fixed point decides which values survive.
fn visit_js_weak_map(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    visitor.state.encountered_weak_maps.push(object);
    let slot = object.slot(js_weak_map::TABLE);
    if let Some(table) = slot.load_tagged().to_object() {
        record_slot(visitor.heap, visitor.state, object, SlotEntry::Untyped(slot), table);
        visitor.mark_without_body(table);
    }
}

/// Cell values are found again by iterating cell space after evacuation,
/// so the slot is not recorded.
fn visit_property_cell(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    if let Some(value) = read_field(object, property_cell::VALUE).to_object() {
        visitor.mark_object(value);
    }
}

fn visit_global_context(visitor: &mut MarkingVisitor<'_>, object: HeapObject) {
    let cache_slot = object.slot(global_context::MAP_CACHE);
    if let Some(cache) = cache_slot.load_tagged().to_object() {
        record_slot(visitor.heap, visitor.state, object, SlotEntry::Untyped(cache_slot), cache);
    }
    visitor.visit_pointers(
        object,
        object.slot(global_context::GLOBAL_OBJECT),
        object.slot(global_context::SIZE_WORDS),
    );
}
