//! Generic body iteration.
//!
//! [`iterate_body`] walks every pointer-holding slot of an object and
//! reports it to an [`ObjectVisitor`]. The pointer-update pass, slot
//! recording for migrated objects, heap verification and the incremental
//! marker all use it. The full collector's marker has its own dispatch table
//! (see `collector::visitor`) because several kinds need non-generic
//! treatment while marking.
//!
//! ```text
//! ┌──────────────┐   iterate_body   ┌───────────────────────────┐
//! │  HeapObject  │ ───────────────▶ │ ObjectVisitor             │
//! │  (header     │                  │   visit_pointers          │
//! │   decides    │                  │   visit_embedded_pointer  │
//! │   layout)    │                  │   visit_code_target       │
//! └──────────────┘                  │   visit_code_entry        │
//!                                   └───────────────────────────┘
//! ```

use super::{
    ObjectHeader, VisitorId, code, cons_string, fixed_array, global_context, js_function, js_weak_map,
    layout, map, property_cell, read_smi_field, shared_function_info,
};
use crate::value::{Address, HeapObject};

/// Callback interface for walking the slots of an object.
pub trait ObjectVisitor {
    /// Visit the tagged slots in `[start, end)` of `host`.
    fn visit_pointers(&mut self, host: HeapObject, start: Address, end: Address);

    /// Visit a single tagged slot.
    #[inline]
    fn visit_pointer(&mut self, host: HeapObject, slot: Address) {
        self.visit_pointers(host, slot, slot.add_words(1));
    }

    /// Visit an object pointer embedded in code.
    #[inline]
    fn visit_embedded_pointer(&mut self, host: HeapObject, slot: Address) {
        self.visit_pointer(host, slot);
    }

    /// Visit a call target in code. The slot holds an entry address.
    fn visit_code_target(&mut self, host: HeapObject, slot: Address);

    /// Visit a function's code entry. The slot holds an entry address.
    fn visit_code_entry(&mut self, host: HeapObject, slot: Address);
}

/// Visit every pointer slot of `object` except its map.
pub fn iterate_body<V: ObjectVisitor + ?Sized>(object: HeapObject, visitor: &mut V) {
    let header = ObjectHeader::of(object);
    let end = object.address() + header.size();
    match VisitorId::of(header) {
        VisitorId::DataObject | VisitorId::FreeSpace => {}
        VisitorId::ConsString => {
            visitor.visit_pointers(
                object,
                object.slot(cons_string::FIRST),
                object.slot(cons_string::SECOND + 1),
            );
        }
        VisitorId::FixedArray => {
            visitor.visit_pointers(object, object.slot(fixed_array::FIRST_ELEMENT), end);
        }
        VisitorId::JsObject3
        | VisitorId::JsObject4
        | VisitorId::JsObject5
        | VisitorId::JsObject6
        | VisitorId::JsObject7
        | VisitorId::JsObject8
        | VisitorId::JsObject9
        | VisitorId::JsObjectGeneric => {
            visitor.visit_pointers(object, object.slot(layout::BODY), end);
        }
        VisitorId::Map => {
            visitor.visit_pointers(object, object.slot(map::PROTOTYPE), object.slot(map::SIZE_WORDS));
        }
        VisitorId::Code => iterate_code_body(object, visitor),
        VisitorId::SharedFunctionInfo => {
            visitor.visit_pointers(
                object,
                object.slot(shared_function_info::CODE),
                object.slot(shared_function_info::SOURCE + 1),
            );
        }
        VisitorId::JsFunction => {
            visitor.visit_pointer(object, object.slot(js_function::SHARED));
            visitor.visit_code_entry(object, object.slot(js_function::CODE_ENTRY));
            visitor.visit_pointer(object, object.slot(js_function::CONTEXT));
        }
        VisitorId::JsWeakMap => {
            visitor.visit_pointer(object, object.slot(js_weak_map::TABLE));
        }
        VisitorId::PropertyCell => {
            visitor.visit_pointer(object, object.slot(property_cell::VALUE));
        }
        VisitorId::GlobalContext => {
            visitor.visit_pointers(
                object,
                object.slot(global_context::MAP_CACHE),
                object.slot(global_context::SIZE_WORDS),
            );
        }
    }
}

/// Visit the map slot and then the body of `object`.
pub fn iterate_map_and_body<V: ObjectVisitor + ?Sized>(object: HeapObject, visitor: &mut V) {
    if ObjectHeader::of(object).size_in_words() > layout::MAP {
        visitor.visit_pointer(object, object.slot(layout::MAP));
    }
    iterate_body(object, visitor);
}

/// Visit the relocation slots of a code object.
pub fn iterate_code_body<V: ObjectVisitor + ?Sized>(object: HeapObject, visitor: &mut V) {
    let embedded = read_smi_field(object, code::EMBEDDED_COUNT).max(0) as usize;
    let targets = read_smi_field(object, code::TARGET_COUNT).max(0) as usize;
    let first_embedded = code::HEADER_WORDS;
    for i in 0..embedded {
        visitor.visit_embedded_pointer(object, object.slot(first_embedded + i));
    }
    let first_target = first_embedded + embedded;
    for i in 0..targets {
        visitor.visit_code_target(object, object.slot(first_target + i));
    }
}
