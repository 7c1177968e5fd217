//! Prism Mark-Compact Collector
//!
//! A tracing, full-heap mark-compact garbage collector for a managed
//! runtime heap of tagged objects.
//!
//! # Architecture
//!
//! The heap is split into a semispace nursery, five paged old spaces and a
//! large object space (see [`heap`]). A full collection runs in three
//! steps driven by [`MarkCompactCollector`]:
//!
//! - **Prepare**: choose fragmented pages as evacuation candidates and
//!   close allocation areas.
//!
//! - **Mark**: trace from the roots with a bounded marking deque. Mark bits
//!   live in per-page bitmaps; a deque overflow leaves objects grey and the
//!   heap is rescanned for them. Weak structures (map transitions, weak
//!   maps, map caches, the symbol table, weak handles) are resolved once
//!   the strong graph is complete, and unused code is flushed.
//!
//! - **Sweep and evacuate**: old spaces are swept precisely or
//!   conservatively, live nursery objects are copied or promoted, candidate
//!   pages are evacuated, and every recorded slot is updated before the
//!   emptied pages are released.
//!
//! # Incremental Marking
//!
//! Marking can also proceed in bounded steps between mutator work
//! ([`Heap::incremental_marking_step`]). The write barrier in
//! [`Heap::set_field`] keeps the marker sound, and the next full
//! collection finishes the remaining work in one pause.
//!
//! # Usage
//!
//! ```ignore
//! use prism_mark_compact::{GcConfig, Heap, MarkCompactCollector, Pretenure};
//!
//! let mut heap = Heap::new(GcConfig::default())?;
//! let mut collector = MarkCompactCollector::new();
//!
//! let array = heap.allocate_fixed_array(8, Pretenure::NotTenured)?;
//! let handle = heap.create_handle(array.to_tagged());
//!
//! collector.collect_garbage(&mut heap);
//! let moved = heap.handle_object(handle)?;
//! ```
//!
//! # Safety
//!
//! [`HeapObject`] values are raw addresses. Only values held in roots,
//! handles or heap slots are updated when objects move; any other copy is
//! stale after a collection.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod config;
pub mod error;
pub mod heap;
pub mod incremental;
pub mod objects;
pub mod roots;
pub mod value;

mod stats;

// Re-exports for convenient access
pub use collector::{CollectorPhase, Forwarding, MarkCompactCollector, SlotType};
pub use config::GcConfig;
pub use error::{GcError, GcResult};
pub use heap::verify::VerifyError;
pub use heap::{AllocationSpace, Heap, ObjectColor, WeakObjectRetainer, WeakReferenceCallback};
pub use incremental::IncrementalState;
pub use objects::{CodeKind, FunctionFlags, InstanceKind, Pretenure};
pub use roots::{GlobalHandle, HandleScope, LocalHandle, RootIndex};
pub use stats::{GcStats, GcTimer};
pub use value::{Address, HeapObject, Tagged};
