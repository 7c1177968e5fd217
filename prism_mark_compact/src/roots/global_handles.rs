//! Global handles.
//!
//! A global handle is an embedder-owned root that outlives handle scopes.
//! It can be made weak with a callback: once the collector finds the
//! referent reachable only through weak handles, the handle becomes
//! pending, the referent is kept alive for one more cycle, and the callback
//! runs after the collection. The handle is disposed afterwards.
//!
//! ```text
//!   Normal ──make_weak──▶ Weak ──referent unmarked──▶ Pending
//!     ▲                    │                            │
//!     └──clear_weakness────┘                 post-GC callback
//!                                                       ▼
//!                                             NearDeath ──▶ Free
//! ```
//!
//! Object groups and implicit-reference groups are declared per cycle in
//! terms of global handles and dropped once marking is done.

use super::RootVisitor;
use crate::error::{GcError, GcResult};
use crate::value::{HeapObject, Tagged};

use smallvec::SmallVec;

/// Identifier of a global handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalHandle(u32);

impl GlobalHandle {
    /// Position in the handle registry.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Callback invoked after a collection found a weak referent unreachable.
pub type WeakCallback = Box<dyn FnOnce(GlobalHandle)>;

/// Life-cycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Unused slot.
    Free,
    /// Strong root.
    Normal,
    /// Weak root with a callback.
    Weak,
    /// Weak root whose referent was found unreachable this cycle.
    Pending,
    /// Callback is running.
    NearDeath,
}

struct Node {
    object: Tagged,
    state: NodeState,
    callback: Option<WeakCallback>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("object", &self.object)
            .field("state", &self.state)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Handles that live or die together.
#[derive(Debug, Clone, Default)]
pub struct ObjectGroup {
    /// Members of the group.
    pub handles: SmallVec<[GlobalHandle; 4]>,
}

/// Children kept alive by a parent.
#[derive(Debug, Clone)]
pub struct ImplicitRefGroup {
    /// Parent handle.
    pub parent: GlobalHandle,
    /// Handles reachable whenever the parent is.
    pub children: SmallVec<[GlobalHandle; 4]>,
}

/// Registry of global handles and embedder groups.
#[derive(Debug, Default)]
pub struct GlobalHandles {
    nodes: Vec<Node>,
    free: Vec<u32>,
    object_groups: Vec<ObjectGroup>,
    implicit_ref_groups: Vec<ImplicitRefGroup>,
}

impl GlobalHandles {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a strong handle to `value`.
    pub fn create(&mut self, value: Tagged) -> GlobalHandle {
        let node = Node {
            object: value,
            state: NodeState::Normal,
            callback: None,
        };
        match self.free.pop() {
            Some(index) => {
                self.nodes[index as usize] = node;
                GlobalHandle(index)
            }
            None => {
                self.nodes.push(node);
                GlobalHandle(self.nodes.len() as u32 - 1)
            }
        }
    }

    fn node(&self, handle: GlobalHandle) -> GcResult<&Node> {
        self.nodes
            .get(handle.0 as usize)
            .filter(|node| node.state != NodeState::Free)
            .ok_or(GcError::InvalidHandle(handle.0))
    }

    fn node_mut(&mut self, handle: GlobalHandle) -> GcResult<&mut Node> {
        self.nodes
            .get_mut(handle.0 as usize)
            .filter(|node| node.state != NodeState::Free)
            .ok_or(GcError::InvalidHandle(handle.0))
    }

    /// Dispose a handle.
    pub fn destroy(&mut self, handle: GlobalHandle) -> GcResult<()> {
        let node = self.node_mut(handle)?;
        node.state = NodeState::Free;
        node.object = Tagged::NULL;
        node.callback = None;
        self.free.push(handle.0);
        Ok(())
    }

    /// Current value of a handle.
    pub fn get(&self, handle: GlobalHandle) -> GcResult<Tagged> {
        self.node(handle).map(|node| node.object)
    }

    /// State of a handle.
    pub fn state(&self, handle: GlobalHandle) -> GcResult<NodeState> {
        self.node(handle).map(|node| node.state)
    }

    /// Make a handle weak.
    pub fn make_weak(&mut self, handle: GlobalHandle, callback: impl FnOnce(GlobalHandle) + 'static) -> GcResult<()> {
        let node = self.node_mut(handle)?;
        node.state = NodeState::Weak;
        node.callback = Some(Box::new(callback));
        Ok(())
    }

    /// Make a weak handle strong again.
    pub fn clear_weakness(&mut self, handle: GlobalHandle) -> GcResult<()> {
        let node = self.node_mut(handle)?;
        node.state = NodeState::Normal;
        node.callback = None;
        Ok(())
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Whether no handle is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Root Iteration
    // =========================================================================

    /// Visit strong handles.
    pub fn iterate_strong_roots(&mut self, visitor: &mut dyn RootVisitor) {
        for node in &mut self.nodes {
            if node.state == NodeState::Normal {
                visitor.visit_root(&mut node.object);
            }
        }
    }

    /// Mark weak handles whose referent `is_unreachable` as pending.
    pub fn identify_weak_handles(&mut self, mut is_unreachable: impl FnMut(HeapObject) -> bool) {
        for node in &mut self.nodes {
            if node.state != NodeState::Weak {
                continue;
            }
            if node.object.to_object().is_some_and(&mut is_unreachable) {
                node.state = NodeState::Pending;
            }
        }
    }

    /// Visit weak and pending handles.
    pub fn iterate_weak_roots(&mut self, visitor: &mut dyn RootVisitor) {
        for node in &mut self.nodes {
            if matches!(node.state, NodeState::Weak | NodeState::Pending) {
                visitor.visit_root(&mut node.object);
            }
        }
    }

    /// Visit every live handle.
    pub fn iterate_all_roots(&mut self, visitor: &mut dyn RootVisitor) {
        for node in &mut self.nodes {
            if node.state != NodeState::Free {
                visitor.visit_root(&mut node.object);
            }
        }
    }

    /// Run the callbacks of pending handles and dispose them.
    ///
    /// Returns the number of callbacks run.
    pub fn post_garbage_collection_processing(&mut self) -> usize {
        let mut processed = 0;
        for index in 0..self.nodes.len() {
            if self.nodes[index].state != NodeState::Pending {
                continue;
            }
            let handle = GlobalHandle(index as u32);
            self.nodes[index].state = NodeState::NearDeath;
            if let Some(callback) = self.nodes[index].callback.take() {
                callback(handle);
                processed += 1;
            }
            // Disposal is unconditional; the referent dies next cycle.
            let _ = self.destroy(handle);
        }
        processed
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Declare that `handles` live or die together this cycle.
    pub fn add_object_group(&mut self, handles: &[GlobalHandle]) {
        if handles.len() > 1 {
            self.object_groups.push(ObjectGroup {
                handles: handles.iter().copied().collect(),
            });
        }
    }

    /// Declare that `children` are reachable whenever `parent` is.
    pub fn add_implicit_references(&mut self, parent: GlobalHandle, children: &[GlobalHandle]) {
        if !children.is_empty() {
            self.implicit_ref_groups.push(ImplicitRefGroup {
                parent,
                children: children.iter().copied().collect(),
            });
        }
    }

    /// Declared object groups.
    pub fn object_groups(&self) -> &[ObjectGroup] {
        &self.object_groups
    }

    /// Declared implicit-reference groups.
    pub fn implicit_ref_groups(&self) -> &[ImplicitRefGroup] {
        &self.implicit_ref_groups
    }

    pub(crate) fn take_object_groups(&mut self) -> Vec<ObjectGroup> {
        std::mem::take(&mut self.object_groups)
    }

    pub(crate) fn restore_object_groups(&mut self, groups: Vec<ObjectGroup>) {
        self.object_groups = groups;
    }

    pub(crate) fn take_implicit_ref_groups(&mut self) -> Vec<ImplicitRefGroup> {
        std::mem::take(&mut self.implicit_ref_groups)
    }

    pub(crate) fn restore_implicit_ref_groups(&mut self, groups: Vec<ImplicitRefGroup>) {
        self.implicit_ref_groups = groups;
    }

    /// Drop every object group.
    pub fn remove_object_groups(&mut self) {
        self.object_groups.clear();
    }

    /// Drop every implicit-reference group.
    pub fn remove_implicit_ref_groups(&mut self) {
        self.implicit_ref_groups.clear();
    }
}
