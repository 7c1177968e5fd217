//! Local handles and handle scopes.
//!
//! Local handles are used when Rust code needs to hold references to heap
//! objects across potential collection points. They live on a stack; closing
//! a scope releases every handle created since it was opened.
//!
//! # Example
//!
//! ```ignore
//! let scope = heap.open_handle_scope();
//! let local = heap.create_local(object.into());
//! heap.collect_garbage(&mut collector);
//! let moved = heap.local_value(local);   // updated if the object moved
//! heap.close_handle_scope(scope);
//! ```

use super::RootVisitor;
use crate::value::Tagged;

/// Index of a local handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalHandle(usize);

impl LocalHandle {
    /// Position on the handle stack.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Token for an open handle scope.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a handle scope must be closed"]
pub struct HandleScope {
    start: usize,
    depth: usize,
}

/// Stack of local handles partitioned into scopes.
#[derive(Debug, Default)]
pub struct HandleScopeStack {
    slots: Vec<Tagged>,
    scope_starts: Vec<usize>,
}

impl HandleScopeStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a scope.
    pub fn open(&mut self) -> HandleScope {
        self.scope_starts.push(self.slots.len());
        HandleScope {
            start: self.slots.len(),
            depth: self.scope_starts.len(),
        }
    }

    /// Close the innermost scope, releasing its handles.
    pub fn close(&mut self, scope: HandleScope) {
        debug_assert_eq!(scope.depth, self.scope_starts.len(), "handle scopes must nest");
        self.scope_starts.pop();
        self.slots.truncate(scope.start);
    }

    /// Create a local handle in the innermost scope.
    pub fn create(&mut self, value: Tagged) -> LocalHandle {
        self.slots.push(value);
        LocalHandle(self.slots.len() - 1)
    }

    /// Current value of a local handle.
    #[inline]
    pub fn get(&self, handle: LocalHandle) -> Option<Tagged> {
        self.slots.get(handle.0).copied()
    }

    /// Number of live local handles.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no local handle is live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of open scopes.
    #[inline]
    pub fn depth(&self) -> usize {
        self.scope_starts.len()
    }

    /// Visit every live handle slot.
    pub fn iterate(&mut self, visitor: &mut dyn RootVisitor) {
        visitor.visit_roots(&mut self.slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_releases_handles() {
        let mut stack = HandleScopeStack::new();
        let outer = stack.open();
        let a = stack.create(Tagged::from_smi(1));

        let inner = stack.open();
        let b = stack.create(Tagged::from_smi(2));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.get(b), Some(Tagged::from_smi(2)));
        stack.close(inner);

        assert_eq!(stack.len(), 1);
        assert_eq!(stack.get(a), Some(Tagged::from_smi(1)));
        assert_eq!(stack.get(b), None);

        stack.close(outer);
        assert!(stack.is_empty());
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_iterate_rewrites_slots() {
        struct Zap;
        impl RootVisitor for Zap {
            fn visit_root(&mut self, slot: &mut Tagged) {
                *slot = Tagged::NULL;
            }
        }

        let mut stack = HandleScopeStack::new();
        let scope = stack.open();
        let handle = stack.create(Tagged::from_smi(5));
        stack.iterate(&mut Zap);
        assert_eq!(stack.get(handle), Some(Tagged::NULL));
        stack.close(scope);
    }
}
