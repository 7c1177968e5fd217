//! Flushing of unused unoptimized code.
//!
//! While marking, a shared info whose code has not run for
//! `code_age_threshold` cycles does not mark that code. Instead the shared
//! info (and every function still running the same code) is queued here.
//! Once marking is complete the queue is processed:
//!
//! - code that was marked through some other path stays, and its age is
//!   reset;
//! - code that was not marked is replaced by the lazy-compile stub.
//!
//! Either way the slot now holding the surviving code is recorded for
//! compaction.

use super::CollectorState;
use super::evacuation::record_slot;
use super::slots_buffer::{SlotEntry, SlotType};
use crate::heap::Heap;
use crate::objects::{
    CodeKind, FunctionFlags, code_entry, code_from_entry, code_kind, js_function, read_field, read_smi_field,
    shared_function_info, write_field,
};
use crate::stats::GcStats;
use crate::value::{Address, HeapObject, Tagged};

use rustc_hash::FxHashSet;

/// Shared infos and functions whose code may be flushed this cycle.
#[derive(Debug, Default)]
pub(crate) struct CodeFlusher {
    shared_candidates: Vec<HeapObject>,
    function_candidates: Vec<HeapObject>,
    aged: FxHashSet<HeapObject>,
}

impl CodeFlusher {
    /// Bump the code age of `shared`, at most once per cycle.
    pub(crate) fn age_once(&mut self, shared: HeapObject) {
        if !self.aged.insert(shared) {
            return;
        }
        let age = read_smi_field(shared, shared_function_info::CODE_AGE).clamp(0, u8::MAX as isize - 1);
        write_field(shared, shared_function_info::CODE_AGE, Tagged::from_smi(age + 1));
    }

    pub(crate) fn add_shared_candidate(&mut self, shared: HeapObject) {
        self.shared_candidates.push(shared);
    }

    pub(crate) fn add_function_candidate(&mut self, function: HeapObject) {
        self.function_candidates.push(function);
    }

    /// Number of queued candidates.
    pub(crate) fn candidate_count(&self) -> usize {
        self.shared_candidates.len() + self.function_candidates.len()
    }

    /// Drop the queue and the per-cycle aging record.
    pub(crate) fn clear(&mut self) {
        self.shared_candidates.clear();
        self.function_candidates.clear();
        self.aged.clear();
    }
}

/// Whether the code of `shared` may be left unmarked.
pub(crate) fn is_flushable_shared_info(heap: &Heap, shared: HeapObject) -> bool {
    let Some(code) = read_field(shared, shared_function_info::CODE).to_object() else {
        return false;
    };
    if heap.chunks.is_marked(code) || code_kind(code) != CodeKind::Function {
        return false;
    }
    // Without source the code could not be compiled again.
    if !read_field(shared, shared_function_info::SOURCE).is_heap_object() {
        return false;
    }
    let flags = heap.shared_flags(shared);
    if flags.intersects(
        FunctionFlags::NATIVE
            | FunctionFlags::API_FUNCTION
            | FunctionFlags::TOPLEVEL
            | FunctionFlags::NO_LAZY_COMPILATION,
    ) {
        return false;
    }
    heap.shared_code_age(shared) >= heap.config.code_age_threshold
}

/// Whether the code entry of `function` may be left unmarked.
///
/// Only functions running their shared info's unoptimized code qualify.
pub(crate) fn is_flushable_function(heap: &Heap, function: HeapObject) -> bool {
    let entry = Address::new(function.slot(js_function::CODE_ENTRY).load());
    if entry.is_null() {
        return false;
    }
    let code = code_from_entry(entry);
    if heap.chunks.is_marked(code) {
        return false;
    }
    let Some(shared) = read_field(function, js_function::SHARED).to_object() else {
        return false;
    };
    if read_field(shared, shared_function_info::CODE) != code.to_tagged() {
        return false;
    }
    is_flushable_shared_info(heap, shared)
}

/// Flush or keep the code of every queued candidate.
pub(crate) fn process_candidates(heap: &mut Heap, state: &mut CollectorState) {
    let mut flusher = std::mem::take(&mut state.code_flusher);
    if flusher.candidate_count() == 0 {
        flusher.clear();
        state.code_flusher = flusher;
        return;
    }
    let Some(stub) = heap.lazy_compile_stub() else {
        flusher.clear();
        state.code_flusher = flusher;
        return;
    };

    let mut flushed = 0;
    for &shared in &flusher.shared_candidates {
        let code_slot = shared.slot(shared_function_info::CODE);
        let Some(code) = code_slot.load_tagged().to_object() else { continue };
        let kept = if heap.chunks.is_marked(code) {
            write_field(shared, shared_function_info::CODE_AGE, Tagged::from_smi(0));
            code
        } else {
            code_slot.store_tagged(stub.to_tagged());
            flushed += 1;
            stub
        };
        record_slot(heap, state, shared, SlotEntry::Untyped(code_slot), kept);
    }

    for &function in &flusher.function_candidates {
        let entry_slot = function.slot(js_function::CODE_ENTRY);
        let code = code_from_entry(Address::new(entry_slot.load()));
        let kept = if heap.chunks.is_marked(code) {
            code
        } else {
            if let Some(shared) = read_field(function, js_function::SHARED).to_object() {
                let code_slot = shared.slot(shared_function_info::CODE);
                if code_slot.load_tagged() == code.to_tagged() {
                    code_slot.store_tagged(stub.to_tagged());
                    flushed += 1;
                }
            }
            stub
        };
        entry_slot.store(code_entry(kept).raw());
        record_slot(heap, state, function, SlotEntry::Typed(SlotType::CodeEntry, entry_slot), kept);
    }

    if flushed > 0 {
        log::debug!("flushed code of {} shared function infos", flushed);
        GcStats::bump(&heap.stats.code_flushed, flushed);
    }
    flusher.clear();
    state.code_flusher = flusher;
}
