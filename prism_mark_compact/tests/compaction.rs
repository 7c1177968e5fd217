//! Evacuation corner cases driven through the collector's phases.
//!
//! Coverage:
//! - Aborting compaction after marking keeps old-to-new slots on the former candidates
//! - Invalidated code is rescanned whole after evacuation
//! - Slots the mutator records between marking and sweeping follow moved objects

use prism_mark_compact::objects::{code, js_function};
use prism_mark_compact::{
    CodeKind, FunctionFlags, GcConfig, GlobalHandle, Heap, HeapObject, MarkCompactCollector, Pretenure, Tagged,
};

fn heap_with(config: GcConfig) -> Heap {
    let _ = env_logger::builder().is_test(true).try_init();
    Heap::new(config).expect("heap")
}

fn stress() -> GcConfig {
    GcConfig {
        stress_compaction: true,
        verify_heap: true,
        ..GcConfig::default()
    }
}

fn object(heap: &Heap, handle: GlobalHandle) -> HeapObject {
    heap.handle_object(handle)
        .expect("live handle")
        .expect("handle holds an object")
}

/// Four pages of 512-byte tenured arrays tagged with their index, each
/// held by a handle.
fn tagged_arrays(heap: &mut Heap) -> Vec<(HeapObject, GlobalHandle)> {
    let count = 4 * heap.config().page_size / 512;
    (0..count)
        .map(|index| {
            let array = heap.allocate_fixed_array(61, Pretenure::Tenured).expect("array");
            heap.fixed_array_set(array, 0, Tagged::from_smi(index as isize));
            (array, heap.create_handle(array.to_tagged()))
        })
        .collect()
}

// =============================================================================
// Abort
// =============================================================================

#[test]
fn test_abort_after_marking_keeps_old_to_new_slots() {
    let mut heap = heap_with(stress());
    let mut holders = Vec::new();
    for index in 0..128 {
        let holder = heap.allocate_fixed_array(1, Pretenure::Tenured).expect("holder");
        let young = heap.allocate_fixed_array(1, Pretenure::NotTenured).expect("young");
        heap.fixed_array_set(young, 0, Tagged::from_smi(index));
        heap.fixed_array_set(holder, 0, young.to_tagged());
        holders.push((heap.create_handle(holder.to_tagged()), young));
        // Garbage spreads the holders over several pages.
        heap.allocate_fixed_array(61, Pretenure::Tenured).expect("padding");
    }

    let mut collector = MarkCompactCollector::new();
    collector.prepare(&mut heap);
    assert!(collector.is_compacting());
    let candidates = collector.evacuation_candidates().to_vec();
    let on_candidates = holders
        .iter()
        .filter(|(handle, _)| collector.is_on_evacuation_candidate(&heap, object(&heap, *handle)))
        .count();
    assert!(on_candidates > 0);

    collector.mark_live_objects(&mut heap);
    collector.abort_compaction(&mut heap);
    collector.finish_collection(&mut heap);

    for base in candidates {
        assert!(heap.chunks().get(base).is_some());
    }
    for (index, (handle, young)) in holders.into_iter().enumerate() {
        let holder = object(&heap, handle);
        let moved = collector.forwarding_address(young).expect("nursery survivor moved");
        assert_eq!(heap.fixed_array_get(holder, 0), moved.to_tagged(), "holder {index}");
        assert_eq!(heap.fixed_array_get(moved, 0), Tagged::from_smi(index as isize));
    }
}

// =============================================================================
// Invalidated Code
// =============================================================================

#[test]
fn test_invalidated_code_is_rescanned_after_evacuation() {
    let mut heap = heap_with(stress());
    let arrays = tagged_arrays(&mut heap);
    let embedded: Vec<HeapObject> = arrays.iter().map(|&(array, _)| array).collect();
    let host = heap.allocate_code(CodeKind::Optimized, &embedded, &[], 0).expect("code");
    let host_handle = heap.create_handle(host.to_tagged());

    let mut collector = MarkCompactCollector::new();
    collector.prepare(&mut heap);
    assert!(collector.invalidate_code(&heap, host));
    assert!(collector.invalidate_code(&heap, host));
    collector.mark_live_objects(&mut heap);

    // Patched after marking without recording the slot.
    let (late, _) = arrays
        .iter()
        .copied()
        .find(|&(array, _)| collector.is_on_evacuation_candidate(&heap, array))
        .expect("array on a candidate");
    let late_index = arrays.iter().position(|&(array, _)| array == late).expect("index");
    heap.set_field(host, code::HEADER_WORDS, late.to_tagged());
    collector.finish_collection(&mut heap);

    let host = object(&heap, host_handle);
    let mut moved = 0;
    for (index, &(array, handle)) in arrays.iter().enumerate().skip(1) {
        let current = object(&heap, handle);
        assert_eq!(heap.code_embedded_object(host, index), current.to_tagged());
        assert_eq!(heap.fixed_array_get(current, 0), Tagged::from_smi(index as isize));
        if current != array {
            moved += 1;
        }
    }
    assert!(moved > 0);
    assert_eq!(
        heap.code_embedded_object(host, 0),
        object(&heap, arrays[late_index].1).to_tagged()
    );
}

// =============================================================================
// Recorded Slots
// =============================================================================

#[test]
fn test_code_entry_recorded_after_marking_follows_moved_code() {
    let mut heap = heap_with(stress());
    // Enough code to span several pages of code space.
    let count = 4 * heap.config().page_size / 4096;
    let codes: Vec<(HeapObject, GlobalHandle)> = (0..count)
        .map(|_| {
            let code = heap.allocate_code(CodeKind::Optimized, &[], &[], 500).expect("code");
            (code, heap.create_handle(code.to_tagged()))
        })
        .collect();
    let unoptimized = heap.allocate_code(CodeKind::Function, &[], &[], 4).expect("code");
    let shared = heap
        .allocate_shared_function_info(unoptimized, Tagged::NULL, FunctionFlags::empty())
        .expect("shared");
    let function = heap.allocate_function(shared, Tagged::NULL, Pretenure::Tenured).expect("function");
    let function_handle = heap.create_handle(function.to_tagged());

    let mut collector = MarkCompactCollector::new();
    collector.prepare(&mut heap);
    collector.mark_live_objects(&mut heap);

    let (optimized, optimized_handle) = codes
        .iter()
        .copied()
        .find(|&(code, _)| collector.is_on_evacuation_candidate(&heap, code))
        .expect("code on a candidate");
    let function = object(&heap, function_handle);
    heap.set_function_code(function, optimized);
    collector.record_code_entry_slot(&mut heap, function, function.slot(js_function::CODE_ENTRY), optimized);
    collector.finish_collection(&mut heap);

    let function = object(&heap, function_handle);
    let moved = object(&heap, optimized_handle);
    assert_ne!(moved, optimized);
    assert_eq!(heap.function_code(function), moved);
}
