//! Externally tracked objects.
//!
//! A debugger-style listener registers objects it wants to follow across
//! collections. Entries are dropped when their object dies and rewritten
//! when it moves.

use crate::value::HeapObject;

/// Objects tracked on behalf of a listener.
#[derive(Debug, Default)]
pub struct LiveObjectList {
    objects: Vec<HeapObject>,
    reported_dead: usize,
}

impl LiveObjectList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `object`.
    pub fn add(&mut self, object: HeapObject) {
        if !self.objects.contains(&object) {
            self.objects.push(object);
        }
    }

    /// Whether `object` is tracked.
    pub fn contains(&self, object: HeapObject) -> bool {
        self.objects.contains(&object)
    }

    /// Tracked objects.
    pub fn iter(&self) -> impl Iterator<Item = HeapObject> + '_ {
        self.objects.iter().copied()
    }

    /// Number of tracked objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of tracked objects reported dead so far.
    pub fn reported_dead(&self) -> usize {
        self.reported_dead
    }

    /// Report that `object` died.
    pub(crate) fn process_dead(&mut self, object: HeapObject) {
        if let Some(index) = self.objects.iter().position(|&tracked| tracked == object) {
            self.objects.swap_remove(index);
            self.reported_dead += 1;
        }
    }

    /// Rewrite every entry; entries mapped to `None` are dropped.
    pub(crate) fn update(&mut self, mut relocate: impl FnMut(HeapObject) -> Option<HeapObject>) {
        self.objects.retain_mut(|object| match relocate(*object) {
            Some(current) => {
                *object = current;
                true
            }
            None => false,
        });
    }
}
