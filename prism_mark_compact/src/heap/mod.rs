//! Heap memory management.
//!
//! The heap is divided into seven spaces:
//! - New: semispace nursery with bump-pointer allocation
//! - Old pointer / old data: tenured objects with and without pointers
//! - Code: generated code, with a skip list per page
//! - Map and cell: type descriptors and global property cells
//! - Large object: one chunk per object
//!
//! Every chunk of every space is registered in one address-ordered
//! [`ChunkMap`], which answers "which page holds this address" for the
//! collector, the write barrier and the verifier alike.

pub mod bitmap;
pub mod external_string_table;
pub mod free_list;
pub mod large_object_space;
pub mod live_object_list;
pub mod new_space;
pub mod page;
pub mod paged_space;
pub mod skip_list;
pub mod verify;

pub use bitmap::{Bitmap, MarkBit, ObjectColor};
pub use external_string_table::ExternalStringTable;
pub use free_list::FreeList;
pub use large_object_space::LargeObjectSpace;
pub use live_object_list::LiveObjectList;
pub use new_space::NewSpace;
pub use page::{ChunkMap, Page, PageFlags};
pub use paged_space::PagedSpace;
pub use skip_list::SkipList;

use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::incremental::IncrementalMarking;
use crate::objects::{InstanceKind, MAX_OBJECT_WORDS, code_from_entry, object_end, object_kind, read_field, write_field};
use crate::roots::{GlobalHandle, GlobalHandles, HandleScope, LocalHandle, RootIndex, RootSet};
use crate::stats::GcStats;
use crate::value::{Address, HeapObject, Tagged, WORD_SIZE};

// =============================================================================
// Spaces
// =============================================================================

/// Identity of a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocationSpace {
    /// Semispace nursery.
    New,
    /// Tenured objects that may contain pointers.
    OldPointer,
    /// Tenured objects without pointers.
    OldData,
    /// Generated code.
    Code,
    /// Maps.
    Map,
    /// Property cells.
    Cell,
    /// Large objects.
    Lo,
}

impl AllocationSpace {
    /// The paged spaces, in sweeping order.
    pub const PAGED: [AllocationSpace; 5] = [
        AllocationSpace::OldPointer,
        AllocationSpace::OldData,
        AllocationSpace::Code,
        AllocationSpace::Map,
        AllocationSpace::Cell,
    ];

    /// Whether the space is made of equally sized pages.
    #[inline]
    pub const fn is_paged(self) -> bool {
        !matches!(self, AllocationSpace::New | AllocationSpace::Lo)
    }

    /// Whether pages of this space may be evacuated.
    #[inline]
    pub const fn is_compactable(self) -> bool {
        matches!(
            self,
            AllocationSpace::OldPointer | AllocationSpace::OldData | AllocationSpace::Code
        )
    }

    /// Whether the space is always swept precisely.
    #[inline]
    pub const fn is_precisely_swept(self) -> bool {
        matches!(self, AllocationSpace::Code | AllocationSpace::Map | AllocationSpace::Cell)
    }

    /// Old space that receives a promoted object of `kind`.
    #[inline]
    pub const fn promotion_target(kind: InstanceKind) -> AllocationSpace {
        if kind.is_data_only() {
            AllocationSpace::OldData
        } else {
            AllocationSpace::OldPointer
        }
    }
}

// =============================================================================
// Weak Reference Processing
// =============================================================================

/// Answers liveness queries while weak references are processed.
pub trait WeakObjectRetainer {
    /// The object to keep referencing in place of `object`, or `None` when
    /// `object` is dead.
    fn retain_as(&self, object: HeapObject) -> Option<HeapObject>;
}

/// Embedder hook run once marking is complete.
pub trait WeakReferenceCallback {
    /// Drop or keep weakly held references using `retainer`.
    fn process_weak_references(&mut self, retainer: &dyn WeakObjectRetainer);
}

impl<F: FnMut(&dyn WeakObjectRetainer)> WeakReferenceCallback for F {
    fn process_weak_references(&mut self, retainer: &dyn WeakObjectRetainer) {
        self(retainer)
    }
}

// =============================================================================
// Heap
// =============================================================================

/// Main heap structure managing all memory spaces.
pub struct Heap {
    /// Configuration parameters.
    pub(crate) config: GcConfig,
    /// Every chunk of every space.
    pub(crate) chunks: ChunkMap,
    pub(crate) new_space: NewSpace,
    /// Paged spaces, in [`AllocationSpace::PAGED`] order.
    pub(crate) paged: [PagedSpace; 5],
    pub(crate) lo_space: LargeObjectSpace,
    pub(crate) roots: RootSet,
    pub(crate) global_handles: GlobalHandles,
    pub(crate) external_strings: ExternalStringTable,
    pub(crate) live_objects: LiveObjectList,
    /// Weak list of global contexts.
    pub(crate) global_contexts: Vec<HeapObject>,
    pub(crate) incremental: IncrementalMarking,
    /// GC statistics.
    pub(crate) stats: GcStats,
    always_allocate_depth: usize,
    pub(crate) weak_reference_callback: Option<Box<dyn WeakReferenceCallback>>,
}

impl Heap {
    /// Create a heap and allocate its canonical objects.
    pub fn new(config: GcConfig) -> GcResult<Self> {
        config.validate()?;

        let mut chunks = ChunkMap::new();
        let new_space = NewSpace::new(&mut chunks, config.nursery_size, config.page_size).ok_or(
            GcError::OutOfMemory {
                space: AllocationSpace::New,
                requested: 2 * config.nursery_size,
            },
        )?;
        let paged = AllocationSpace::PAGED.map(|space| PagedSpace::new(space, config.page_size));

        let mut heap = Self {
            chunks,
            new_space,
            paged,
            lo_space: LargeObjectSpace::new(config.page_size),
            roots: RootSet::new(),
            global_handles: GlobalHandles::new(),
            external_strings: ExternalStringTable::new(),
            live_objects: LiveObjectList::new(),
            global_contexts: Vec::new(),
            incremental: IncrementalMarking::new(config.marking_deque_capacity),
            stats: GcStats::new(),
            always_allocate_depth: 0,
            weak_reference_callback: None,
            config,
        };
        heap.create_initial_objects()?;
        log::debug!(
            "heap initialized: page size {}, nursery {} x 2",
            heap.config.page_size,
            heap.config.nursery_size
        );
        Ok(heap)
    }

    /// Create a heap with default configuration.
    pub fn with_defaults() -> GcResult<Self> {
        Self::new(GcConfig::default())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configuration in use.
    #[inline]
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Every chunk of the heap.
    #[inline]
    pub fn chunks(&self) -> &ChunkMap {
        &self.chunks
    }

    /// The nursery.
    #[inline]
    pub fn new_space(&self) -> &NewSpace {
        &self.new_space
    }

    /// A paged space, or `None` for `New` and `Lo`.
    pub fn paged_space(&self, space: AllocationSpace) -> Option<&PagedSpace> {
        self.paged.iter().find(|paged| paged.identity() == space)
    }

    pub(crate) fn paged_space_mut(&mut self, space: AllocationSpace) -> Option<&mut PagedSpace> {
        self.paged.iter_mut().find(|paged| paged.identity() == space)
    }

    /// The large object space.
    #[inline]
    pub fn lo_space(&self) -> &LargeObjectSpace {
        &self.lo_space
    }

    /// Number of chunks owned by a space.
    pub fn page_count(&self, space: AllocationSpace) -> usize {
        match space {
            AllocationSpace::New => 2,
            AllocationSpace::Lo => self.lo_space.object_count(),
            paged => self.paged_space(paged).map_or(0, PagedSpace::page_count),
        }
    }

    /// Fixed roots, handle scopes and stack slots.
    #[inline]
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    /// Mutable roots.
    #[inline]
    pub fn roots_mut(&mut self) -> &mut RootSet {
        &mut self.roots
    }

    /// A fixed root.
    #[inline]
    pub fn root(&self, index: RootIndex) -> Tagged {
        self.roots.get(index)
    }

    /// A fixed root that holds a heap object.
    #[inline]
    pub fn root_object(&self, index: RootIndex) -> Option<HeapObject> {
        self.roots.get(index).to_object()
    }

    /// Global handle registry.
    #[inline]
    pub fn global_handles(&self) -> &GlobalHandles {
        &self.global_handles
    }

    /// Mutable global handle registry.
    #[inline]
    pub fn global_handles_mut(&mut self) -> &mut GlobalHandles {
        &mut self.global_handles
    }

    /// Off-heap string resources.
    #[inline]
    pub fn external_strings(&self) -> &ExternalStringTable {
        &self.external_strings
    }

    /// Externally tracked objects.
    #[inline]
    pub fn live_objects(&self) -> &LiveObjectList {
        &self.live_objects
    }

    /// Mutable externally tracked objects.
    #[inline]
    pub fn live_objects_mut(&mut self) -> &mut LiveObjectList {
        &mut self.live_objects
    }

    /// Live global contexts.
    #[inline]
    pub fn global_contexts(&self) -> &[HeapObject] {
        &self.global_contexts
    }

    /// Incremental marker.
    #[inline]
    pub fn incremental(&self) -> &IncrementalMarking {
        &self.incremental
    }

    /// GC statistics.
    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Install the embedder's weak-reference hook.
    pub fn set_weak_reference_callback(&mut self, callback: impl WeakReferenceCallback + 'static) {
        self.weak_reference_callback = Some(Box::new(callback));
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes in `space`.
    ///
    /// Requests at or above the large object threshold go to the large
    /// object space, except for the nursery which refuses them. The returned
    /// memory is unformatted.
    pub fn allocate_raw(&mut self, space: AllocationSpace, size: usize) -> GcResult<Address> {
        debug_assert!(size % WORD_SIZE == 0);
        if size / WORD_SIZE > MAX_OBJECT_WORDS {
            return Err(GcError::ObjectTooLarge { size });
        }
        let oom = GcError::OutOfMemory { space, requested: size };

        let address = match space {
            AllocationSpace::New => self.new_space.allocate_raw(size),
            AllocationSpace::Lo => self.allocate_large(size),
            _ if size >= self.config.large_object_threshold => self.allocate_large(size),
            paged => {
                let can_expand = self.can_expand_old_generation(self.config.page_size);
                let chunks = &mut self.chunks;
                self.paged
                    .iter_mut()
                    .find(|candidate| candidate.identity() == paged)
                    .and_then(|space| space.allocate_raw(chunks, size, can_expand))
            }
        }
        .ok_or(oom)?;

        self.stats.record_allocation(size);
        Ok(address)
    }

    fn allocate_large(&mut self, size: usize) -> Option<Address> {
        if !self.can_expand_old_generation(size) {
            return None;
        }
        self.lo_space.allocate_raw(&mut self.chunks, size)
    }

    /// Bytes reserved by the old generation.
    pub fn old_generation_size(&self) -> usize {
        self.paged.iter().map(PagedSpace::capacity).sum::<usize>() + self.lo_space.size()
    }

    fn can_expand_old_generation(&self, bytes: usize) -> bool {
        self.always_allocate()
            || self.config.max_old_space_size == 0
            || self.old_generation_size() + bytes <= self.config.max_old_space_size
    }

    /// Whether allocation currently ignores the old-generation limit.
    #[inline]
    pub fn always_allocate(&self) -> bool {
        self.always_allocate_depth > 0
    }

    /// Run `f` with the old-generation limit lifted.
    pub fn with_always_allocate<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.always_allocate_depth += 1;
        let result = f(self);
        self.always_allocate_depth -= 1;
        result
    }

    /// Abort on an allocation failure the heap cannot recover from.
    pub fn fatal_out_of_memory(&self, location: &str) -> ! {
        log::error!(
            "fatal out of memory in {}: old generation {} bytes, {} chunks",
            location,
            self.old_generation_size(),
            self.chunks.len()
        );
        panic!("fatal out of memory: {location}");
    }

    // =========================================================================
    // Object Access
    // =========================================================================

    /// Read a tagged field.
    #[inline]
    pub fn get_field(&self, object: HeapObject, index: usize) -> Tagged {
        debug_assert!(object.slot(index) < object_end(object));
        read_field(object, index)
    }

    /// Write a tagged field through the write barrier.
    #[inline]
    pub fn set_field(&mut self, object: HeapObject, index: usize, value: Tagged) {
        debug_assert!(object.slot(index) < object_end(object));
        write_field(object, index, value);
        if let Some(target) = value.to_object() {
            self.incremental
                .record_write(&mut self.chunks, object, object.slot(index), target);
        }
    }

    /// Space holding `object`.
    #[inline]
    pub fn space_of(&self, object: HeapObject) -> Option<AllocationSpace> {
        self.chunks.space_of(object.address())
    }

    /// Whether `object` lies in the nursery.
    #[inline]
    pub fn in_new_space(&self, object: HeapObject) -> bool {
        self.chunks.in_new_space(object.address())
    }

    /// Code object containing `pc`, found through the code-space skip list.
    pub fn find_code_for_pc(&self, pc: Address) -> Option<HeapObject> {
        let page = self.chunks.containing(pc)?;
        if page.owner() != AllocationSpace::Code {
            return None;
        }
        let start = page
            .skip_list
            .as_ref()
            .and_then(|list| list.start_for(pc))
            .filter(|&start| start <= pc)
            .unwrap_or(page.area_start());
        Page::objects_in(start, page.area_end())
            .take_while(|object| object.address() <= pc)
            .find(|&object| pc < object_end(object))
            .filter(|&object| object_kind(object) == InstanceKind::Code)
    }

    /// Code object whose entry address is `entry`.
    #[inline]
    pub fn code_at_entry(&self, entry: Address) -> HeapObject {
        code_from_entry(entry)
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Create a strong global handle.
    pub fn create_handle(&mut self, value: Tagged) -> GlobalHandle {
        self.global_handles.create(value)
    }

    /// Current value of a global handle.
    pub fn handle_value(&self, handle: GlobalHandle) -> GcResult<Tagged> {
        self.global_handles.get(handle)
    }

    /// Current object of a global handle.
    pub fn handle_object(&self, handle: GlobalHandle) -> GcResult<Option<HeapObject>> {
        self.global_handles.get(handle).map(Tagged::to_object)
    }

    /// Dispose a global handle.
    pub fn destroy_handle(&mut self, handle: GlobalHandle) -> GcResult<()> {
        self.global_handles.destroy(handle)
    }

    /// Make a global handle weak.
    pub fn make_weak(&mut self, handle: GlobalHandle, callback: impl FnOnce(GlobalHandle) + 'static) -> GcResult<()> {
        self.global_handles.make_weak(handle, callback)
    }

    /// Declare an object group for the next collection.
    pub fn add_object_group(&mut self, handles: &[GlobalHandle]) {
        self.global_handles.add_object_group(handles);
    }

    /// Declare implicit references for the next collection.
    pub fn add_implicit_references(&mut self, parent: GlobalHandle, children: &[GlobalHandle]) {
        self.global_handles.add_implicit_references(parent, children);
    }

    /// Open a local handle scope.
    pub fn open_handle_scope(&mut self) -> HandleScope {
        self.roots.handles_mut().open()
    }

    /// Close the innermost local handle scope.
    pub fn close_handle_scope(&mut self, scope: HandleScope) {
        self.roots.handles_mut().close(scope);
    }

    /// Create a local handle in the innermost scope.
    pub fn create_local(&mut self, value: Tagged) -> LocalHandle {
        self.roots.handles_mut().create(value)
    }

    /// Current value of a local handle.
    pub fn local_value(&self, handle: LocalHandle) -> Option<Tagged> {
        self.roots.handles().get(handle)
    }

    /// Push a value onto the simulated stack.
    pub fn push_stack(&mut self, value: Tagged) -> usize {
        self.roots.push_stack(value)
    }

    /// Pop the top stack value.
    pub fn pop_stack(&mut self) -> Option<Tagged> {
        self.roots.pop_stack()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("chunks", &self.chunks.len())
            .field("new_space_size", &self.new_space.size())
            .field("old_generation_size", &self.old_generation_size())
            .field("global_handles", &self.global_handles.len())
            .finish()
    }
}
