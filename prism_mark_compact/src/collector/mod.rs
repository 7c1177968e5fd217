//! The mark-compact collector.
//!
//! One full cycle moves through four phases:
//!
//! ```text
//! ┌────────┐ prepare ┌────────────┐ mark_live_objects ┌───────────────────┐
//! │  Idle  │────────▶│ PrepareGc  │──────────────────▶│ MarkLiveObjects   │
//! └────────┘         └────────────┘                   └─────────┬─────────┘
//!      ▲                                                        │ finish_collection
//!      │            ┌───────────────────────────────────┐       │
//!      └────────────│ SweepSpaces                       │◀──────┘
//!                   │  sweep old spaces, code, cells    │
//!                   │  evacuate nursery and candidates  │
//!                   │  update pointers, release pages   │
//!                   │  sweep maps, large objects        │
//!                   └───────────────────────────────────┘
//! ```
//!
//! All per-cycle state lives in [`CollectorState`], owned by the
//! [`MarkCompactCollector`] and passed by reference to each phase.

mod code_flusher;
pub mod deque;
mod evacuation;
mod marking;
mod pointer_update;
pub mod slots_buffer;
pub mod sweeper;
mod visitor;
mod weak;

pub use deque::MarkingDeque;
pub use slots_buffer::{AdditionMode, SlotEntry, SlotType, SlotsBuffer};

use crate::heap::{AllocationSpace, Heap, PageFlags, verify};
use crate::objects::code_from_entry;
use crate::stats::{GcStats, GcTimer, format_bytes};
use crate::value::{Address, HeapObject, Tagged};
use code_flusher::CodeFlusher;
use sweeper::{SkipListMode, sweep_conservatively, sweep_precisely};

use rustc_hash::FxHashMap;

// =============================================================================
// State
// =============================================================================

/// Phase of the current collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorPhase {
    /// No collection in progress.
    Idle,
    /// Candidates chosen, allocation areas closed.
    PrepareGc,
    /// Marking and weak processing done; marks are final.
    MarkLiveObjects,
    /// Sweeping, evacuation and pointer updating.
    SweepSpaces,
}

/// Where an object went during evacuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarding {
    /// Copied to the given address.
    Moved(Address),
    /// Died in the nursery; slots still naming it are cleared.
    Dead,
}

/// Per-cycle collector state.
#[derive(Debug)]
pub(crate) struct CollectorState {
    pub(crate) phase: CollectorPhase,
    pub(crate) compacting: bool,
    pub(crate) collect_maps: bool,
    pub(crate) flush_code: bool,
    pub(crate) cons_string_shortcut: bool,
    pub(crate) sweep_precisely: bool,
    pub(crate) was_marked_incrementally: bool,
    /// Cached at prepare; roots are moved out of the heap while marked.
    pub(crate) empty_string: Tagged,

    pub(crate) deque: MarkingDeque,
    pub(crate) marked_count: usize,
    pub(crate) encountered_weak_maps: Vec<HeapObject>,
    pub(crate) code_flusher: CodeFlusher,

    pub(crate) evacuation_candidates: Vec<Address>,
    pub(crate) invalidated_code: Vec<HeapObject>,
    pub(crate) migration_slots: SlotsBuffer,
    pub(crate) new_space_slots: SlotsBuffer,
    pub(crate) forwarding: FxHashMap<Address, Forwarding>,

    /// Completed full collections.
    pub(crate) ms_count: usize,
}

impl Default for CollectorState {
    fn default() -> Self {
        Self {
            phase: CollectorPhase::Idle,
            compacting: false,
            collect_maps: true,
            flush_code: true,
            cons_string_shortcut: true,
            sweep_precisely: false,
            was_marked_incrementally: false,
            empty_string: Tagged::NULL,
            deque: MarkingDeque::unallocated(),
            marked_count: 0,
            encountered_weak_maps: Vec::new(),
            code_flusher: CodeFlusher::default(),
            evacuation_candidates: Vec::new(),
            invalidated_code: Vec::new(),
            migration_slots: SlotsBuffer::new(1),
            new_space_slots: SlotsBuffer::new(1),
            forwarding: FxHashMap::default(),
            ms_count: 0,
        }
    }
}

// =============================================================================
// Collector
// =============================================================================

/// Full-heap mark-compact collector.
///
/// # Example
///
/// ```ignore
/// use prism_mark_compact::{Heap, MarkCompactCollector, Pretenure};
///
/// let mut heap = Heap::with_defaults()?;
/// let mut collector = MarkCompactCollector::new();
/// let array = heap.allocate_fixed_array(4, Pretenure::Tenured)?;
/// heap.push_stack(array.to_tagged());
/// collector.collect_garbage(&mut heap);
/// ```
#[derive(Debug, Default)]
pub struct MarkCompactCollector {
    state: CollectorState,
}

impl MarkCompactCollector {
    /// Create an idle collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    #[inline]
    pub fn phase(&self) -> CollectorPhase {
        self.state.phase
    }

    /// Whether this cycle evacuates pages.
    #[inline]
    pub fn is_compacting(&self) -> bool {
        self.state.compacting
    }

    /// Pages chosen for evacuation this cycle.
    pub fn evacuation_candidates(&self) -> &[Address] {
        &self.state.evacuation_candidates
    }

    /// Number of completed full collections.
    pub fn collection_count(&self) -> usize {
        self.state.ms_count
    }

    // =========================================================================
    // Driver
    // =========================================================================

    /// Run one complete cycle. Always runs to completion.
    pub fn collect_garbage(&mut self, heap: &mut Heap) {
        let timer = GcTimer::start("mark-compact");
        let size_before = heap.old_generation_size() + heap.new_space.size();
        let evacuated_before = GcStats::get(&heap.stats.pages_evacuated);

        self.prepare(heap);
        self.mark_live_objects(heap);
        self.finish_collection(heap);

        let pause = timer.stop();
        heap.stats.record_full_gc(pause);
        let size_after = heap.old_generation_size() + heap.new_space.size();
        let evacuated = GcStats::get(&heap.stats.pages_evacuated) - evacuated_before;
        if heap.config.trace_gc {
            log::info!(
                "mark-compact #{}: {} -> {} in {:?}, {} pages evacuated",
                self.state.ms_count,
                format_bytes(size_before as u64),
                format_bytes(size_after as u64),
                pause,
                evacuated
            );
        }
    }

    /// Choose evacuation candidates and close allocation areas.
    pub fn prepare(&mut self, heap: &mut Heap) {
        debug_assert_eq!(self.state.phase, CollectorPhase::Idle);
        let state = &mut self.state;
        state.phase = CollectorPhase::PrepareGc;
        state.ms_count += 1;
        state.forwarding.clear();

        state.was_marked_incrementally = heap.incremental.is_marking();
        state.collect_maps = heap.config.collect_maps;
        state.flush_code =
            heap.config.flush_code && !state.was_marked_incrementally && heap.lazy_compile_stub().is_some();
        state.cons_string_shortcut = heap.config.cons_string_shortcut;
        state.sweep_precisely = heap.config.sweep_precisely;
        state.empty_string = heap.empty_string();

        if heap.config.compact && !state.was_marked_incrementally && !state.compacting {
            evacuation::collect_evacuation_candidates(heap, state);
        }
        state.compacting = !state.evacuation_candidates.is_empty();

        let chunks = &mut heap.chunks;
        for space in heap.paged.iter_mut() {
            space.prepare_for_mark_compact(chunks);
        }
        log::debug!(
            "prepared cycle {}: {} candidates, incremental: {}",
            state.ms_count,
            state.evacuation_candidates.len(),
            state.was_marked_incrementally
        );
    }

    /// Mark everything reachable and process weak structures.
    pub fn mark_live_objects(&mut self, heap: &mut Heap) {
        debug_assert_eq!(self.state.phase, CollectorPhase::PrepareGc);
        marking::mark_live_objects(heap, &mut self.state);
        self.state.phase = CollectorPhase::MarkLiveObjects;
    }

    /// Clear dead weak edges, sweep, evacuate and return to idle.
    pub fn finish_collection(&mut self, heap: &mut Heap) {
        debug_assert_eq!(self.state.phase, CollectorPhase::MarkLiveObjects);
        let state = &mut self.state;
        if state.collect_maps {
            weak::clear_non_live_transitions(heap);
        }
        weak::clear_weak_maps(heap, state);

        state.phase = CollectorPhase::SweepSpaces;
        let timer = GcTimer::start("sweep");
        sweep_spaces(heap, state);
        timer.stop();
        finish(heap, state);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether `object` is marked. Objects outside the heap count as marked.
    #[inline]
    pub fn is_marked(&self, heap: &Heap, object: HeapObject) -> bool {
        heap.chunks.is_marked(object)
    }

    /// Whether `object` lies on a page chosen for evacuation.
    #[inline]
    pub fn is_on_evacuation_candidate(&self, heap: &Heap, object: HeapObject) -> bool {
        heap.chunks.on_evacuation_candidate(object.address())
    }

    /// Where `object` was moved by the last cycle, if it was.
    pub fn forwarding_address(&self, object: HeapObject) -> Option<HeapObject> {
        match self.state.forwarding.get(&object.address()) {
            Some(Forwarding::Moved(to)) => Some(HeapObject::from_address(*to)),
            _ => None,
        }
    }

    // =========================================================================
    // Slot Recording
    // =========================================================================

    /// Whether slots written by the mutator must be recorded: only between
    /// `prepare` and `finish_collection`.
    fn is_recording(&self) -> bool {
        matches!(
            self.state.phase,
            CollectorPhase::PrepareGc | CollectorPhase::MarkLiveObjects
        )
    }

    /// Record a relocation slot of `host` that was just written.
    ///
    /// Embedded objects are tagged pointers; code targets hold entry
    /// addresses. Outside a collection this does nothing.
    pub fn record_reloc_slot(&mut self, heap: &mut Heap, host: HeapObject, slot: Address, slot_type: SlotType) {
        if !self.is_recording() {
            return;
        }
        let target = match slot_type {
            SlotType::EmbeddedObject => slot.load_tagged().to_object(),
            SlotType::CodeTarget | SlotType::CodeEntry => {
                let entry = Address::new(slot.load());
                (!entry.is_null()).then(|| code_from_entry(entry))
            }
            SlotType::RelocatedCode => None,
        };
        if let Some(target) = target {
            evacuation::record_slot(heap, &mut self.state, host, SlotEntry::Typed(slot_type, slot), target);
        }
    }

    /// Record the code-entry slot of `function` now pointing at `code`.
    /// Outside a collection this does nothing.
    pub fn record_code_entry_slot(&mut self, heap: &mut Heap, function: HeapObject, slot: Address, code: HeapObject) {
        if !self.is_recording() {
            return;
        }
        evacuation::record_slot(
            heap,
            &mut self.state,
            function,
            SlotEntry::Typed(SlotType::CodeEntry, slot),
            code,
        );
    }

    /// Note that `code`'s relocation slots will be rewritten wholesale.
    ///
    /// Returns `false` when nothing needs recording: the cycle is not
    /// compacting or the code is itself being evacuated.
    pub fn invalidate_code(&mut self, heap: &Heap, code: HeapObject) -> bool {
        if !self.state.compacting || heap.chunks.on_evacuation_candidate(code.address()) {
            return false;
        }
        if !self.state.invalidated_code.contains(&code) {
            self.state.invalidated_code.push(code);
        }
        true
    }

    // =========================================================================
    // Compaction Control
    // =========================================================================

    /// Give up evacuating this cycle's candidates.
    ///
    /// Once marking has run, slots in objects on the candidates were never
    /// recorded, so those pages are rescanned like evicted candidates.
    pub fn abort_compaction(&mut self, heap: &mut Heap) {
        if !self.state.compacting {
            return;
        }
        let marked = self.state.phase == CollectorPhase::MarkLiveObjects;
        for &base in &self.state.evacuation_candidates {
            if let Some(page) = heap.chunks.get_mut(base) {
                page.slots_buffer = None;
                page.clear_flag(PageFlags::EVACUATION_CANDIDATE);
                if marked && page.owner() != AllocationSpace::OldData {
                    page.set_flag(PageFlags::RESCAN_ON_EVACUATION);
                }
            }
        }
        if !marked {
            for page in heap.chunks.iter_mut() {
                page.clear_flag(PageFlags::RESCAN_ON_EVACUATION);
            }
        }
        log::debug!(
            "aborted compaction of {} candidates",
            self.state.evacuation_candidates.len()
        );
        self.state.evacuation_candidates.clear();
        self.state.invalidated_code.clear();
        self.state.compacting = false;
    }

    /// Begin incremental marking; compaction is off for the cycle it feeds.
    pub fn start_incremental_marking(&mut self, heap: &mut Heap) {
        self.abort_compaction(heap);
        heap.start_incremental_marking();
    }
}

// =============================================================================
// Sweeping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepMode {
    Conservative,
    LazyConservative,
    Precise,
}

/// Sweep every page of `identity` that is not being evacuated.
///
/// All but one page without live objects are released. Returns the number
/// of bytes freed.
fn sweep_space(heap: &mut Heap, identity: AllocationSpace, mode: SweepMode) -> usize {
    let lazy_limit = heap.config.nursery_size;
    let chunks = &mut heap.chunks;
    let Some(space) = heap.paged.iter_mut().find(|space| space.identity() == identity) else {
        return 0;
    };
    let skip_list = if identity == AllocationSpace::Code {
        SkipListMode::Rebuild
    } else {
        SkipListMode::Ignore
    };

    let mut freed = 0;
    let mut released = 0;
    let mut deferred = 0;
    let mut kept_empty_page = false;
    for base in space.pages().to_vec() {
        let Some(page) = chunks.get_mut(base) else { continue };
        if page
            .flags()
            .intersects(PageFlags::EVACUATION_CANDIDATE | PageFlags::RESCAN_ON_EVACUATION)
        {
            continue;
        }
        if page.live_bytes() == 0 {
            if kept_empty_page {
                space.release_page(chunks, base);
                released += 1;
                continue;
            }
            kept_empty_page = true;
        }
        match mode {
            SweepMode::Precise => freed += sweep_precisely(page, &mut space.free_list, skip_list, None),
            SweepMode::Conservative => freed += sweep_conservatively(page, &mut space.free_list),
            SweepMode::LazyConservative if freed >= lazy_limit => {
                page.clear_swept_flags();
                space.push_unswept(base);
                deferred += 1;
            }
            SweepMode::LazyConservative => freed += sweep_conservatively(page, &mut space.free_list),
        }
    }

    GcStats::bump(&heap.stats.bytes_swept, freed as u64);
    log::debug!(
        "swept {:?} ({:?}): {} freed, {} pages released, {} deferred",
        identity,
        mode,
        format_bytes(freed as u64),
        released,
        deferred
    );
    freed
}

/// Drop invalidated code that did not survive marking.
fn remove_dead_invalidated_code(heap: &Heap, state: &mut CollectorState) {
    state.invalidated_code.retain(|&code| heap.chunks.is_marked(code));
}

/// Forget recorded slots on pages that sweeping released. Their hosts are
/// dead, and evacuation may map a new page at the same address.
fn drop_slots_on_released_pages(heap: &mut Heap, state: &mut CollectorState) {
    let mut dropped = state
        .new_space_slots
        .retain(|entry| heap.chunks.containing(entry.address()).is_some());
    for &base in &state.evacuation_candidates {
        let Some(mut buffer) = heap.chunks.get_mut(base).and_then(|page| page.slots_buffer.take()) else {
            continue;
        };
        dropped += buffer.retain(|entry| heap.chunks.containing(entry.address()).is_some());
        if let Some(page) = heap.chunks.get_mut(base) {
            page.slots_buffer = Some(buffer);
        }
    }
    if dropped > 0 {
        log::debug!("dropped {} recorded slots on released pages", dropped);
    }
}

fn sweep_spaces(heap: &mut Heap, state: &mut CollectorState) {
    let old_mode = if state.sweep_precisely {
        SweepMode::Precise
    } else if heap.config.lazy_sweeping {
        SweepMode::LazyConservative
    } else {
        SweepMode::Conservative
    };
    sweep_space(heap, AllocationSpace::OldPointer, old_mode);
    sweep_space(heap, AllocationSpace::OldData, old_mode);

    remove_dead_invalidated_code(heap, state);
    sweep_space(heap, AllocationSpace::Code, SweepMode::Precise);
    sweep_space(heap, AllocationSpace::Cell, SweepMode::Precise);
    drop_slots_on_released_pages(heap, state);

    heap.with_always_allocate(|heap| {
        let timer = GcTimer::start("evacuate");
        evacuation::evacuate_new_space(heap, state);
        evacuation::evacuate_live_objects_from_pages(heap, state);
        timer.stop();
    });

    let timer = GcTimer::start("update-pointers");
    pointer_update::update_pointers(heap, state);
    timer.stop();
    evacuation::release_evacuation_candidates(heap, state);

    // Maps never move, and the pointer update needed them walkable.
    sweep_space(heap, AllocationSpace::Map, SweepMode::Precise);

    let (bytes, objects) = heap.lo_space.free_unmarked_objects(&mut heap.chunks);
    if objects > 0 {
        GcStats::bump(&heap.stats.bytes_swept, bytes as u64);
        log::debug!("freed {} large objects ({})", objects, format_bytes(bytes as u64));
    }
}

fn finish(heap: &mut Heap, state: &mut CollectorState) {
    state.compacting = false;
    state.was_marked_incrementally = false;
    state.invalidated_code.clear();
    state.encountered_weak_maps.clear();
    state.migration_slots.clear();
    state.new_space_slots.clear();
    state.code_flusher.clear();

    let callbacks = heap.global_handles.post_garbage_collection_processing();
    if callbacks > 0 {
        log::debug!("ran {} weak handle callbacks", callbacks);
    }

    if heap.config.verify_heap {
        if let Err(error) = verify::verify_heap(heap) {
            log::error!("heap verification failed: {}", error);
            panic!("heap verification failed: {error}");
        }
    }
    state.phase = CollectorPhase::Idle;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::objects::{CodeKind, Pretenure, code};

    fn heap() -> Heap {
        let _ = env_logger::builder().is_test(true).try_init();
        Heap::new(GcConfig::default()).expect("heap")
    }

    // =========================================================================
    // Phase Tests
    // =========================================================================

    #[test]
    fn test_phases_advance_in_order() {
        let mut heap = heap();
        let mut collector = MarkCompactCollector::new();
        assert_eq!(collector.phase(), CollectorPhase::Idle);

        collector.prepare(&mut heap);
        assert_eq!(collector.phase(), CollectorPhase::PrepareGc);
        collector.mark_live_objects(&mut heap);
        assert_eq!(collector.phase(), CollectorPhase::MarkLiveObjects);
        collector.finish_collection(&mut heap);
        assert_eq!(collector.phase(), CollectorPhase::Idle);
        assert_eq!(collector.collection_count(), 1);
    }

    #[test]
    fn test_is_marked_is_stable_between_mark_and_sweep() {
        let mut heap = heap();
        let live = heap.allocate_fixed_array(2, Pretenure::Tenured).expect("live");
        let dead = heap.allocate_fixed_array(2, Pretenure::Tenured).expect("dead");
        heap.push_stack(live.to_tagged());

        let mut collector = MarkCompactCollector::new();
        collector.prepare(&mut heap);
        collector.mark_live_objects(&mut heap);
        for _ in 0..3 {
            assert!(collector.is_marked(&heap, live));
            assert!(!collector.is_marked(&heap, dead));
        }
        collector.finish_collection(&mut heap);
    }

    #[test]
    fn test_marking_deque_is_sized_from_config() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut heap = Heap::new(GcConfig {
            marking_deque_capacity: 64,
            ..GcConfig::default()
        })
        .expect("heap");
        let mut collector = MarkCompactCollector::new();
        assert_eq!(collector.state.deque.capacity(), 0);

        collector.prepare(&mut heap);
        collector.mark_live_objects(&mut heap);
        assert_eq!(collector.state.deque.capacity(), 64);
        assert!(collector.state.deque.is_empty());
        collector.finish_collection(&mut heap);
    }

    #[test]
    fn test_stats_count_collections() {
        let mut heap = heap();
        let mut collector = MarkCompactCollector::new();
        collector.collect_garbage(&mut heap);
        collector.collect_garbage(&mut heap);
        assert_eq!(GcStats::get(&heap.stats().full_collections), 2);
        assert!(GcStats::get(&heap.stats().objects_marked) > 0);
    }

    // =========================================================================
    // Compaction Control Tests
    // =========================================================================

    #[test]
    fn test_invalidate_code_requires_compaction() {
        let mut heap = heap();
        let code = heap
            .allocate_code(CodeKind::Function, &[], &[], 4)
            .expect("code");
        let mut collector = MarkCompactCollector::new();
        assert!(!collector.invalidate_code(&heap, code));
    }

    #[test]
    fn test_abort_compaction_clears_candidates() {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = GcConfig {
            stress_compaction: true,
            ..GcConfig::default()
        };
        let mut heap = Heap::new(config).expect("heap");
        let page_words = heap.config().page_size_in_words();
        // Four pages of tenured arrays, so stress mode has pages to pick.
        for _ in 0..4 * page_words / 64 {
            heap.allocate_fixed_array(61, Pretenure::Tenured).expect("array");
        }

        let mut collector = MarkCompactCollector::new();
        collector.prepare(&mut heap);
        let candidates = collector.evacuation_candidates().to_vec();
        assert!(collector.is_compacting());
        assert!(!candidates.is_empty());

        collector.abort_compaction(&mut heap);
        assert!(!collector.is_compacting());
        assert!(collector.evacuation_candidates().is_empty());
        for base in candidates {
            let page = heap.chunks().get(base).expect("page");
            assert!(!page.is_evacuation_candidate());
            assert!(page.slots_buffer.is_none());
        }

        collector.mark_live_objects(&mut heap);
        collector.finish_collection(&mut heap);
        assert_eq!(GcStats::get(&heap.stats().pages_evacuated), 0);
    }

    #[test]
    fn test_full_slots_buffer_evicts_candidate() {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = GcConfig {
            stress_compaction: true,
            slots_buffer_chain_limit: 1,
            ..GcConfig::default()
        };
        let mut heap = Heap::new(config).expect("heap");
        let page_words = heap.config().page_size_in_words();
        let arrays: Vec<HeapObject> = (0..4 * page_words / 64)
            .map(|_| heap.allocate_fixed_array(61, Pretenure::Tenured).expect("array"))
            .collect();
        let host = heap.allocate_map(crate::objects::InstanceKind::JsObject).expect("host");

        let mut collector = MarkCompactCollector::new();
        collector.prepare(&mut heap);
        let target = arrays
            .iter()
            .copied()
            .find(|array| heap.chunks().on_evacuation_candidate(array.address()))
            .expect("array on a candidate");
        let base = heap.chunks().containing(target.address()).expect("page").base();

        let slot = host.slot(crate::objects::layout::MAP);
        for _ in 0..slots_buffer::BLOCK_CAPACITY {
            evacuation::record_slot(&mut heap, &mut collector.state, host, SlotEntry::Untyped(slot), target);
        }
        assert!(collector.evacuation_candidates().contains(&base));

        evacuation::record_slot(&mut heap, &mut collector.state, host, SlotEntry::Untyped(slot), target);
        assert!(!collector.evacuation_candidates().contains(&base));
        let page = heap.chunks().get(base).expect("page");
        assert!(!page.is_evacuation_candidate());
        assert!(page.is_flag_set(crate::heap::PageFlags::RESCAN_ON_EVACUATION));
        assert_eq!(GcStats::get(&heap.stats().candidates_evicted), 1);

        collector.mark_live_objects(&mut heap);
        collector.finish_collection(&mut heap);
        assert!(heap.chunks().get(base).is_some());
    }

    // =========================================================================
    // Slot Recording Tests
    // =========================================================================

    #[test]
    fn test_recording_outside_a_collection_is_ignored() {
        let mut heap = heap();
        let young = heap.allocate_fixed_array(1, Pretenure::NotTenured).expect("young");
        let host = heap.allocate_code(CodeKind::Function, &[young], &[], 0).expect("host");
        heap.push_stack(host.to_tagged());
        let slot = host.slot(code::HEADER_WORDS);
        let mut collector = MarkCompactCollector::new();

        collector.record_reloc_slot(&mut heap, host, slot, SlotType::EmbeddedObject);
        collector.record_code_entry_slot(&mut heap, host, slot, young);
        assert!(collector.state.new_space_slots.is_empty());

        collector.prepare(&mut heap);
        collector.record_reloc_slot(&mut heap, host, slot, SlotType::EmbeddedObject);
        assert_eq!(collector.state.new_space_slots.len(), 1);
        collector.mark_live_objects(&mut heap);
        collector.finish_collection(&mut heap);

        collector.record_reloc_slot(&mut heap, host, slot, SlotType::EmbeddedObject);
        assert!(collector.state.new_space_slots.is_empty());
    }

    #[test]
    fn test_slots_of_dead_hosts_are_dropped_with_their_page() {
        let mut heap = heap();
        let page_words = heap.config().page_size_in_words();
        let garbage: Vec<HeapObject> = (0..4 * page_words / 64)
            .map(|_| heap.allocate_fixed_array(61, Pretenure::Tenured).expect("garbage"))
            .collect();
        let host = *garbage.last().expect("host");
        let young = heap.allocate_fixed_array(1, Pretenure::NotTenured).expect("young");
        heap.push_stack(young.to_tagged());

        let mut collector = MarkCompactCollector::new();
        collector.prepare(&mut heap);
        heap.fixed_array_set(host, 0, young.to_tagged());
        let slot = host.slot(crate::objects::fixed_array::FIRST_ELEMENT);
        collector.record_reloc_slot(&mut heap, host, slot, SlotType::EmbeddedObject);
        assert_eq!(collector.state.new_space_slots.len(), 1);
        collector.mark_live_objects(&mut heap);

        sweep_space(&mut heap, AllocationSpace::OldPointer, SweepMode::Conservative);
        assert!(heap.chunks().containing(host.address()).is_none());
        drop_slots_on_released_pages(&mut heap, &mut collector.state);
        assert!(collector.state.new_space_slots.is_empty());
    }

    #[test]
    fn test_slot_recorded_after_marking_follows_evacuated_object() {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = GcConfig {
            stress_compaction: true,
            ..GcConfig::default()
        };
        let mut heap = Heap::new(config).expect("heap");
        let page_words = heap.config().page_size_in_words();
        let arrays: Vec<(HeapObject, crate::roots::GlobalHandle)> = (0..4 * page_words / 64)
            .map(|index| {
                let array = heap.allocate_fixed_array(61, Pretenure::Tenured).expect("array");
                heap.fixed_array_set(array, 0, Tagged::from_smi(index as isize));
                (array, heap.create_handle(array.to_tagged()))
            })
            .collect();
        let host = heap.allocate_code(CodeKind::Function, &[arrays[0].0], &[], 0).expect("host");
        let host_handle = heap.create_handle(host.to_tagged());

        let mut collector = MarkCompactCollector::new();
        collector.prepare(&mut heap);
        assert!(!collector.is_on_evacuation_candidate(&heap, host));
        collector.mark_live_objects(&mut heap);

        let &(target, target_handle) = arrays
            .iter()
            .find(|(array, _)| collector.is_on_evacuation_candidate(&heap, *array))
            .expect("array on a candidate");
        let slot = host.slot(code::HEADER_WORDS);
        slot.store_tagged(target.to_tagged());
        collector.record_reloc_slot(&mut heap, host, slot, SlotType::EmbeddedObject);
        collector.finish_collection(&mut heap);

        let host = heap.handle_object(host_handle).expect("handle").expect("host");
        let moved = heap.handle_value(target_handle).expect("handle");
        assert_ne!(moved, target.to_tagged());
        assert_eq!(heap.code_embedded_object(host, 0), moved);
    }
}
