//! Flushing of unused function code.
//!
//! Coverage:
//! - Code that goes unused for enough cycles is replaced by the lazy-compile stub
//! - Invocations reset the code age
//! - Native functions and disabled flushing keep their code

use prism_mark_compact::{
    CodeKind, FunctionFlags, GcConfig, GcStats, GlobalHandle, Heap, HeapObject, MarkCompactCollector, Pretenure,
    Tagged,
};

fn heap_with(config: GcConfig) -> Heap {
    let _ = env_logger::builder().is_test(true).try_init();
    Heap::new(config).expect("heap")
}

/// A tenured closure over fresh unoptimized code, held by a handle.
fn function(heap: &mut Heap, flags: FunctionFlags) -> GlobalHandle {
    let source = heap.allocate_seq_string(b"function f() {}", Pretenure::Tenured).expect("source");
    let code = heap.allocate_code(CodeKind::Function, &[], &[], 4).expect("code");
    let shared = heap
        .allocate_shared_function_info(code, source.to_tagged(), flags)
        .expect("shared");
    let function = heap.allocate_function(shared, Tagged::NULL, Pretenure::Tenured).expect("function");
    heap.create_handle(function.to_tagged())
}

fn function_object(heap: &Heap, handle: GlobalHandle) -> HeapObject {
    heap.handle_object(handle).expect("handle").expect("function")
}

#[test]
fn test_unused_code_is_flushed() {
    let mut heap = heap_with(GcConfig::default());
    let handle = function(&mut heap, FunctionFlags::empty());
    let threshold = heap.config().code_age_threshold;
    let stub = heap.lazy_compile_stub().expect("stub");
    let mut collector = MarkCompactCollector::new();

    for _ in 1..threshold {
        collector.collect_garbage(&mut heap);
        let f = function_object(&heap, handle);
        assert_ne!(heap.function_code(f), stub);
    }

    collector.collect_garbage(&mut heap);
    let f = function_object(&heap, handle);
    let shared = heap.function_shared(f).expect("shared");
    assert_eq!(heap.function_code(f), stub);
    assert_eq!(heap.shared_code(shared), Some(stub));
    assert_eq!(GcStats::get(&heap.stats().code_flushed), 1);
}

#[test]
fn test_invoked_code_is_kept() {
    let mut heap = heap_with(GcConfig::default());
    let handle = function(&mut heap, FunctionFlags::empty());
    let stub = heap.lazy_compile_stub().expect("stub");
    let mut collector = MarkCompactCollector::new();

    let threshold = heap.config().code_age_threshold;
    for _ in 0..2 * threshold {
        let f = function_object(&heap, handle);
        let shared = heap.function_shared(f).expect("shared");
        heap.record_invocation(f);
        assert_eq!(heap.shared_code_age(shared), 0);
        collector.collect_garbage(&mut heap);
        let f = function_object(&heap, handle);
        assert!(heap.shared_code_age(heap.function_shared(f).expect("shared")) < threshold);
    }

    let f = function_object(&heap, handle);
    assert_ne!(heap.function_code(f), stub);
    assert!(heap.shared_code_age(heap.function_shared(f).expect("shared")) <= 1);
}

#[test]
fn test_native_code_is_never_flushed() {
    let mut heap = heap_with(GcConfig::default());
    let handle = function(&mut heap, FunctionFlags::NATIVE);
    let stub = heap.lazy_compile_stub().expect("stub");
    let mut collector = MarkCompactCollector::new();

    for _ in 0..2 * heap.config().code_age_threshold {
        collector.collect_garbage(&mut heap);
    }

    let f = function_object(&heap, handle);
    assert_ne!(heap.function_code(f), stub);
    assert_eq!(GcStats::get(&heap.stats().code_flushed), 0);
}

#[test]
fn test_flushing_disabled_keeps_code() {
    let mut heap = heap_with(GcConfig {
        flush_code: false,
        ..GcConfig::default()
    });
    let handle = function(&mut heap, FunctionFlags::empty());
    let stub = heap.lazy_compile_stub().expect("stub");
    let mut collector = MarkCompactCollector::new();

    for _ in 0..2 * heap.config().code_age_threshold {
        collector.collect_garbage(&mut heap);
    }

    let f = function_object(&heap, handle);
    assert_ne!(heap.function_code(f), stub);
}
