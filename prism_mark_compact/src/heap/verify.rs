//! Heap consistency checks, enabled by [`GcConfig::verify_heap`].
//!
//! [`verify_marking`] runs once marking is complete and checks the
//! tricolor invariant: every root is marked, no grey object is left, and
//! no black object points at a white one through a strong edge.
//! [`verify_heap`] runs after a collection and checks that everything
//! reachable lives on a page that survived it.
//!
//! [`GcConfig::verify_heap`]: crate::config::GcConfig::verify_heap

use super::{ChunkMap, Heap};
use crate::objects::{
    InstanceKind, ObjectVisitor, code_from_entry, iterate_map_and_body, js_weak_map, map, object_kind, read_field,
};
use crate::roots::RootVisitor;
use crate::value::{Address, HeapObject, Tagged};

use rustc_hash::FxHashSet;
use thiserror::Error;

/// A violated heap invariant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// A root refers to an object that was not marked.
    #[error("root refers to unmarked {0:?}")]
    UnmarkedRoot(HeapObject),

    /// A grey object survived the marking phase.
    #[error("{0:?} is still grey after marking")]
    GreyAfterMarking(HeapObject),

    /// A black object points at a white one.
    #[error("slot {slot} of black {host:?} refers to unmarked {target:?}")]
    BlackToWhite {
        /// Object holding the slot.
        host: HeapObject,
        /// The slot.
        slot: Address,
        /// The unmarked referent.
        target: HeapObject,
    },

    /// A slot refers to memory no page owns.
    #[error("slot {slot} of {host:?} refers to {target:?} outside the heap")]
    Dangling {
        /// Object holding the slot.
        host: HeapObject,
        /// The slot.
        slot: Address,
        /// The stale referent.
        target: HeapObject,
    },

    /// A slot still refers into an evacuated page.
    #[error("slot {slot} of {host:?} refers to {target:?} on an evacuation candidate")]
    OnEvacuationCandidate {
        /// Object holding the slot.
        host: HeapObject,
        /// The slot.
        slot: Address,
        /// The stale referent.
        target: HeapObject,
    },

    /// A slot refers into from-space or free memory.
    #[error("slot {slot} of {host:?} refers to dead memory at {target:?}")]
    DeadReferent {
        /// Object holding the slot.
        host: HeapObject,
        /// The slot.
        slot: Address,
        /// The stale referent.
        target: HeapObject,
    },
}

/// Gathers root values.
#[derive(Default)]
struct RootCollector(Vec<HeapObject>);

impl RootVisitor for RootCollector {
    fn visit_root(&mut self, slot: &mut Tagged) {
        if let Some(object) = slot.to_object() {
            self.0.push(object);
        }
    }
}

fn collect_roots(heap: &mut Heap) -> Vec<HeapObject> {
    let mut roots = RootCollector::default();
    heap.roots.iterate_all(&mut roots);
    heap.global_handles.iterate_all_roots(&mut roots);
    roots.0
}

// =============================================================================
// Marking
// =============================================================================

/// Checks every slot of a black object against the mark bits.
struct MarkingChecker<'a> {
    chunks: &'a ChunkMap,
    error: Option<VerifyError>,
}

impl MarkingChecker<'_> {
    fn check(&mut self, host: HeapObject, slot: Address, target: HeapObject) {
        if self.error.is_none() && !self.chunks.is_marked(target) {
            self.error = Some(VerifyError::BlackToWhite { host, slot, target });
        }
    }

    fn check_entry(&mut self, host: HeapObject, slot: Address) {
        let entry = Address::new(slot.load());
        if !entry.is_null() {
            self.check(host, slot, code_from_entry(entry));
        }
    }
}

impl ObjectVisitor for MarkingChecker<'_> {
    fn visit_pointers(&mut self, host: HeapObject, start: Address, end: Address) {
        let mut slot = start;
        while slot < end {
            if let Some(target) = slot.load_tagged().to_object() {
                self.check(host, slot, target);
            }
            slot = slot.add_words(1);
        }
    }

    fn visit_code_target(&mut self, host: HeapObject, slot: Address) {
        self.check_entry(host, slot);
    }

    fn visit_code_entry(&mut self, host: HeapObject, slot: Address) {
        self.check_entry(host, slot);
    }
}

/// Check the tricolor invariant once marking is complete.
///
/// Transition arrays and weak map tables are kept alive without their
/// entries, so their bodies are not checked.
pub fn verify_marking(heap: &mut Heap) -> Result<(), VerifyError> {
    for root in collect_roots(heap) {
        if !heap.chunks.is_marked(root) {
            return Err(VerifyError::UnmarkedRoot(root));
        }
    }

    let black: Vec<HeapObject> = heap.chunks.iter().flat_map(|page| page.black_objects()).collect();
    for page in heap.chunks.iter() {
        if let Some(bit) = page.bitmap.next_grey(0) {
            return Err(VerifyError::GreyAfterMarking(HeapObject::from_address(page.address_of(bit))));
        }
    }

    let mut weak_containers = FxHashSet::default();
    for &object in &black {
        let container = match object_kind(object) {
            InstanceKind::Map if heap.config.collect_maps => read_field(object, map::TRANSITIONS),
            InstanceKind::JsWeakMap => read_field(object, js_weak_map::TABLE),
            _ => continue,
        };
        if let Some(container) = container.to_object() {
            weak_containers.insert(container);
        }
    }

    let mut checker = MarkingChecker {
        chunks: &heap.chunks,
        error: None,
    };
    for object in black {
        if weak_containers.contains(&object) {
            continue;
        }
        iterate_map_and_body(object, &mut checker);
        if let Some(error) = checker.error.take() {
            return Err(error);
        }
    }
    log::trace!("marking verified");
    Ok(())
}

// =============================================================================
// Heap
// =============================================================================

/// Checks every slot of a reachable object against the surviving pages.
struct HeapChecker<'a> {
    heap: &'a Heap,
    pending: Vec<HeapObject>,
    seen: FxHashSet<HeapObject>,
    error: Option<VerifyError>,
}

impl HeapChecker<'_> {
    fn check(&mut self, host: HeapObject, slot: Address, target: HeapObject) {
        if self.error.is_some() {
            return;
        }
        let chunks = &self.heap.chunks;
        let Some(page) = chunks.containing(target.address()) else {
            self.error = Some(VerifyError::Dangling { host, slot, target });
            return;
        };
        if page.is_evacuation_candidate() {
            self.error = Some(VerifyError::OnEvacuationCandidate { host, slot, target });
            return;
        }
        let in_from_space =
            chunks.in_new_space(target.address()) && !self.heap.new_space.to_space_contains(target.address());
        if in_from_space || object_kind(target) == InstanceKind::FreeSpace {
            self.error = Some(VerifyError::DeadReferent { host, slot, target });
            return;
        }
        if self.seen.insert(target) {
            self.pending.push(target);
        }
    }

    fn check_entry(&mut self, host: HeapObject, slot: Address) {
        let entry = Address::new(slot.load());
        if !entry.is_null() {
            self.check(host, slot, code_from_entry(entry));
        }
    }
}

impl ObjectVisitor for HeapChecker<'_> {
    fn visit_pointers(&mut self, host: HeapObject, start: Address, end: Address) {
        let mut slot = start;
        while slot < end {
            if let Some(target) = slot.load_tagged().to_object() {
                self.check(host, slot, target);
            }
            slot = slot.add_words(1);
        }
    }

    fn visit_code_target(&mut self, host: HeapObject, slot: Address) {
        self.check_entry(host, slot);
    }

    fn visit_code_entry(&mut self, host: HeapObject, slot: Address) {
        self.check_entry(host, slot);
    }
}

/// Check that everything reachable from the roots lives on a surviving
/// page, outside from-space and free memory.
pub fn verify_heap(heap: &mut Heap) -> Result<(), VerifyError> {
    let roots = collect_roots(heap);
    let mut checker = HeapChecker {
        heap,
        pending: Vec::new(),
        seen: FxHashSet::default(),
        error: None,
    };
    // Roots have no host; report them as their own.
    for root in roots {
        checker.check(root, root.address(), root);
    }
    while let Some(object) = checker.pending.pop() {
        iterate_map_and_body(object, &mut checker);
        if let Some(error) = checker.error.take() {
            return Err(error);
        }
    }
    if let Some(error) = checker.error {
        return Err(error);
    }
    log::trace!("heap verified: {} reachable objects", checker.seen.len());
    Ok(())
}
