//! Root tracking and handle management.
//!
//! GC roots are the starting points for tracing:
//! - The fixed root list (maps, canonical objects, the symbol table)
//! - Local handles in handle scopes
//! - Stack slots of the running program
//! - Global handles (strong or weak, see [`global_handles`])
//!
//! The symbol table is a root, but a weak one: the marker keeps only the
//! table itself alive and prunes unreachable entries afterwards.

pub mod global_handles;
mod handles;

pub use global_handles::{GlobalHandle, GlobalHandles, ImplicitRefGroup, NodeState, ObjectGroup};
pub use handles::{HandleScope, HandleScopeStack, LocalHandle};

use crate::objects::InstanceKind;
use crate::value::Tagged;

/// Receives root slots.
///
/// Visitors may rewrite the slot, which is how the pointer-update pass
/// relocates roots.
pub trait RootVisitor {
    /// Visit one root slot.
    fn visit_root(&mut self, slot: &mut Tagged);

    /// Visit a run of root slots.
    fn visit_roots(&mut self, slots: &mut [Tagged]) {
        for slot in slots {
            self.visit_root(slot);
        }
    }
}

// =============================================================================
// Root Indices
// =============================================================================

/// Entries of the fixed root list.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootIndex {
    /// Map of maps.
    MetaMap = 0,
    /// Map of sequential strings.
    SeqStringMap,
    /// Map of cons strings.
    ConsStringMap,
    /// Map of external strings.
    ExternalStringMap,
    /// Map of fixed arrays.
    FixedArrayMap,
    /// Default map of plain objects.
    JsObjectMap,
    /// Map of code objects.
    CodeMap,
    /// Map of shared function infos.
    SharedFunctionInfoMap,
    /// Map of functions.
    JsFunctionMap,
    /// Map of weak maps.
    JsWeakMapMap,
    /// Map of property cells.
    PropertyCellMap,
    /// Map of global contexts.
    GlobalContextMap,
    /// The empty string.
    EmptyString,
    /// The empty fixed array.
    EmptyFixedArray,
    /// Lazy-compile builtin installed by code flushing.
    LazyCompileStub,
    /// The symbol table. Must stay last: it is the only weak root.
    SymbolTable,
}

impl RootIndex {
    /// Number of roots.
    pub const COUNT: usize = RootIndex::SymbolTable as usize + 1;

    /// Root holding the map for objects of `kind`.
    pub const fn map_for(kind: InstanceKind) -> Option<RootIndex> {
        Some(match kind {
            InstanceKind::FreeSpace => return None,
            InstanceKind::SeqString => RootIndex::SeqStringMap,
            InstanceKind::ConsString => RootIndex::ConsStringMap,
            InstanceKind::ExternalString => RootIndex::ExternalStringMap,
            InstanceKind::FixedArray => RootIndex::FixedArrayMap,
            InstanceKind::JsObject => RootIndex::JsObjectMap,
            InstanceKind::Map => RootIndex::MetaMap,
            InstanceKind::Code => RootIndex::CodeMap,
            InstanceKind::SharedFunctionInfo => RootIndex::SharedFunctionInfoMap,
            InstanceKind::JsFunction => RootIndex::JsFunctionMap,
            InstanceKind::JsWeakMap => RootIndex::JsWeakMapMap,
            InstanceKind::PropertyCell => RootIndex::PropertyCellMap,
            InstanceKind::GlobalContext => RootIndex::GlobalContextMap,
        })
    }
}

// =============================================================================
// Root Set
// =============================================================================

/// Root set for garbage collection.
///
/// Collects all roots except global handles, which live in their own
/// registry because of their weak states.
#[derive(Debug)]
pub struct RootSet {
    roots: [Tagged; RootIndex::COUNT],
    handles: HandleScopeStack,
    stack: Vec<Tagged>,
}

impl RootSet {
    /// Create a root set with every root NULL.
    pub fn new() -> Self {
        Self {
            roots: [Tagged::NULL; RootIndex::COUNT],
            handles: HandleScopeStack::new(),
            stack: Vec::new(),
        }
    }

    /// Value of a fixed root.
    #[inline]
    pub fn get(&self, index: RootIndex) -> Tagged {
        self.roots[index as usize]
    }

    #[inline]
    pub(crate) fn set(&mut self, index: RootIndex, value: Tagged) {
        self.roots[index as usize] = value;
    }

    /// Local handle scopes.
    #[inline]
    pub fn handles(&self) -> &HandleScopeStack {
        &self.handles
    }

    #[inline]
    pub(crate) fn handles_mut(&mut self) -> &mut HandleScopeStack {
        &mut self.handles
    }

    // =========================================================================
    // Stack
    // =========================================================================

    /// Push a value onto the simulated stack.
    pub fn push_stack(&mut self, value: Tagged) -> usize {
        self.stack.push(value);
        self.stack.len() - 1
    }

    /// Pop the top stack value.
    pub fn pop_stack(&mut self) -> Option<Tagged> {
        self.stack.pop()
    }

    /// Stack value at `index`.
    pub fn stack_slot(&self, index: usize) -> Option<Tagged> {
        self.stack.get(index).copied()
    }

    /// Stack depth.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Visit every strong root: the root list minus the symbol table, local
    /// handles and stack slots.
    pub fn iterate_strong_roots(&mut self, visitor: &mut dyn RootVisitor) {
        visitor.visit_roots(&mut self.roots[..RootIndex::SymbolTable as usize]);
        self.handles.iterate(visitor);
        visitor.visit_roots(&mut self.stack);
    }

    /// Visit the weak roots (the symbol table slot).
    pub fn iterate_weak_roots(&mut self, visitor: &mut dyn RootVisitor) {
        visitor.visit_root(&mut self.roots[RootIndex::SymbolTable as usize]);
    }

    /// Visit every root slot.
    pub fn iterate_all(&mut self, visitor: &mut dyn RootVisitor) {
        self.iterate_strong_roots(visitor);
        self.iterate_weak_roots(visitor);
    }
}

impl Default for RootSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Address, HeapObject};

    /// Counts heap-object roots and rewrites them to NULL when asked.
    #[derive(Default)]
    struct CountingVisitor {
        count: usize,
        clear: bool,
    }

    impl RootVisitor for CountingVisitor {
        fn visit_root(&mut self, slot: &mut Tagged) {
            if slot.is_heap_object() {
                self.count += 1;
                if self.clear {
                    *slot = Tagged::NULL;
                }
            }
        }
    }

    fn value(n: usize) -> Tagged {
        Tagged::from_object(HeapObject::from_address(Address::new(0x1000 * n)))
    }

    #[test]
    fn test_symbol_table_is_weak() {
        let mut roots = RootSet::new();
        roots.set(RootIndex::EmptyString, value(1));
        roots.set(RootIndex::SymbolTable, value(2));

        let mut strong = CountingVisitor::default();
        roots.iterate_strong_roots(&mut strong);
        assert_eq!(strong.count, 1);

        let mut all = CountingVisitor::default();
        roots.iterate_all(&mut all);
        assert_eq!(all.count, 2);
    }

    #[test]
    fn test_stack_roots() {
        let mut roots = RootSet::new();
        assert_eq!(roots.push_stack(value(3)), 0);
        roots.push_stack(Tagged::from_smi(7));
        assert_eq!(roots.stack_len(), 2);

        let mut visitor = CountingVisitor { clear: true, ..Default::default() };
        roots.iterate_strong_roots(&mut visitor);
        assert_eq!(visitor.count, 1);
        assert_eq!(roots.stack_slot(0), Some(Tagged::NULL));
        assert_eq!(roots.pop_stack(), Some(Tagged::from_smi(7)));
    }

    #[test]
    fn test_every_kind_but_filler_has_a_map_root() {
        for raw in 0..InstanceKind::COUNT as u8 {
            let kind = InstanceKind::from_u8(raw).expect("kind");
            assert_eq!(RootIndex::map_for(kind).is_none(), kind == InstanceKind::FreeSpace);
        }
    }
}
