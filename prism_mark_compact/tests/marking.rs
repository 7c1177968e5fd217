//! Marking under pressure and in increments.
//!
//! Coverage:
//! - Wide and deep graphs marked completely through a tiny deque
//! - Incremental steps followed by a finishing pause
//! - Write barrier keeping stores into black objects alive
//! - No compaction in a cycle fed by incremental marking

use prism_mark_compact::{
    GcConfig, GcStats, Heap, HeapObject, IncrementalState, MarkCompactCollector, Pretenure, Tagged,
};

fn heap_with(config: GcConfig) -> Heap {
    let _ = env_logger::builder().is_test(true).try_init();
    Heap::new(config).expect("heap")
}

fn tiny_deque() -> GcConfig {
    GcConfig {
        marking_deque_capacity: 8,
        ..GcConfig::default()
    }
}

/// An array with `width` one-element children.
fn wide(heap: &mut Heap, width: usize) -> (HeapObject, Vec<HeapObject>) {
    let parent = heap.allocate_fixed_array(width, Pretenure::Tenured).expect("parent");
    let children: Vec<HeapObject> = (0..width)
        .map(|index| {
            let child = heap.allocate_fixed_array(1, Pretenure::Tenured).expect("child");
            heap.fixed_array_set(child, 0, Tagged::from_smi(index as isize));
            heap.fixed_array_set(parent, index, child.to_tagged());
            child
        })
        .collect();
    (parent, children)
}

/// A linked list of `length` cells, head first.
fn list(heap: &mut Heap, length: usize) -> Vec<HeapObject> {
    let mut cells = Vec::with_capacity(length);
    let mut next = Tagged::NULL;
    for _ in 0..length {
        let cell = heap.allocate_fixed_array(1, Pretenure::Tenured).expect("cell");
        heap.fixed_array_set(cell, 0, next);
        next = cell.to_tagged();
        cells.push(cell);
    }
    cells.reverse();
    cells
}

// =============================================================================
// Overflow
// =============================================================================

#[test]
fn test_wide_graph_survives_deque_overflow() {
    let mut heap = heap_with(tiny_deque());
    let (parent, children) = wide(&mut heap, 200);
    heap.push_stack(parent.to_tagged());

    let mut collector = MarkCompactCollector::new();
    collector.prepare(&mut heap);
    collector.mark_live_objects(&mut heap);
    assert!(collector.is_marked(&heap, parent));
    for &child in &children {
        assert!(collector.is_marked(&heap, child));
    }
    assert!(GcStats::get(&heap.stats().deque_overflows) > 0);
    collector.finish_collection(&mut heap);
}

#[test]
fn test_deep_list_survives_deque_overflow() {
    let mut heap = heap_with(tiny_deque());
    let cells = list(&mut heap, 500);
    let head = heap.create_handle(cells[0].to_tagged());

    MarkCompactCollector::new().collect_garbage(&mut heap);

    let mut length = 0;
    let mut cursor = heap.handle_value(head).expect("head");
    while let Some(cell) = cursor.to_object() {
        length += 1;
        cursor = heap.fixed_array_get(cell, 0);
    }
    assert_eq!(length, 500);
}

#[test]
fn test_overflow_marks_the_same_set_as_a_large_deque() {
    let marked_with = |config: GcConfig| {
        let mut heap = heap_with(config);
        let (parent, children) = wide(&mut heap, 120);
        let cells = list(&mut heap, 120);
        heap.fixed_array_set(children[7], 0, cells[0].to_tagged());
        // Garbage between the live objects.
        wide(&mut heap, 50);
        heap.push_stack(parent.to_tagged());

        let mut collector = MarkCompactCollector::new();
        collector.prepare(&mut heap);
        collector.mark_live_objects(&mut heap);
        let marked = children
            .iter()
            .chain(&cells)
            .filter(|&&object| collector.is_marked(&heap, object))
            .count();
        collector.finish_collection(&mut heap);
        marked
    };

    assert_eq!(marked_with(tiny_deque()), 240);
    assert_eq!(marked_with(GcConfig::default()), 240);
}

// =============================================================================
// Incremental
// =============================================================================

#[test]
fn test_incremental_steps_then_full_collection() {
    let mut heap = heap_with(GcConfig::default());
    let (parent, _) = wide(&mut heap, 64);
    let handle = heap.create_handle(parent.to_tagged());

    let mut collector = MarkCompactCollector::new();
    collector.start_incremental_marking(&mut heap);
    assert_eq!(heap.incremental().state(), IncrementalState::Marking);
    let mut steps = 0;
    while !heap.incremental().is_complete() {
        assert!(heap.incremental_marking_step(8) > 0);
        steps += 1;
    }
    assert!(steps > 1);

    collector.collect_garbage(&mut heap);
    assert_eq!(heap.incremental().state(), IncrementalState::Stopped);
    let parent = heap.handle_object(handle).expect("handle").expect("parent");
    for index in 0..64 {
        let child = heap.fixed_array_get(parent, index).to_object().expect("child");
        assert_eq!(heap.fixed_array_get(child, 0), Tagged::from_smi(index as isize));
    }
}

#[test]
fn test_write_barrier_keeps_store_into_black_object() {
    let mut heap = heap_with(GcConfig::default());
    let holder = heap.allocate_fixed_array(1, Pretenure::Tenured).expect("holder");
    let handle = heap.create_handle(holder.to_tagged());

    let mut collector = MarkCompactCollector::new();
    collector.start_incremental_marking(&mut heap);
    while !heap.incremental().is_complete() {
        heap.incremental_marking_step(16);
    }

    // Allocated after the holder was scanned.
    let late = heap.allocate_fixed_array(1, Pretenure::Tenured).expect("late");
    heap.fixed_array_set(late, 0, Tagged::from_smi(99));
    heap.fixed_array_set(holder, 0, late.to_tagged());

    collector.collect_garbage(&mut heap);
    let holder = heap.handle_object(handle).expect("handle").expect("holder");
    let late = heap.fixed_array_get(holder, 0).to_object().expect("late survives");
    assert_eq!(heap.fixed_array_get(late, 0), Tagged::from_smi(99));
}

#[test]
fn test_incremental_cycle_does_not_compact() {
    let mut heap = heap_with(GcConfig {
        stress_compaction: true,
        ..GcConfig::default()
    });
    for _ in 0..4 * heap.config().page_size / 512 {
        heap.allocate_fixed_array(61, Pretenure::Tenured).expect("array");
    }

    let mut collector = MarkCompactCollector::new();
    collector.start_incremental_marking(&mut heap);
    while !heap.incremental().is_complete() {
        heap.incremental_marking_step(64);
    }
    collector.prepare(&mut heap);
    assert!(!collector.is_compacting());
    assert!(collector.evacuation_candidates().is_empty());
    collector.mark_live_objects(&mut heap);
    collector.finish_collection(&mut heap);
}
