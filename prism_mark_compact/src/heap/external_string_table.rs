//! Registry of strings whose characters live off-heap.
//!
//! The heap owns the off-heap resources, keyed by a small id stored in the
//! string's `RESOURCE` field. A resource is released exactly once: when its
//! string dies, whether that is noticed by the symbol table or by this table.

use crate::objects::{external_string, read_smi_field};
use crate::value::HeapObject;

use rustc_hash::FxHashMap;

/// Off-heap string resources and the strings that own them.
#[derive(Debug, Default)]
pub struct ExternalStringTable {
    resources: FxHashMap<u32, Vec<u8>>,
    next_id: u32,
    new_space_strings: Vec<HeapObject>,
    old_space_strings: Vec<HeapObject>,
    released: usize,
}

impl ExternalStringTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `bytes` and return its resource id.
    pub(crate) fn register_resource(&mut self, bytes: Vec<u8>) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.resources.insert(id, bytes);
        id
    }

    /// Characters of a live resource.
    pub fn resource(&self, id: u32) -> Option<&[u8]> {
        self.resources.get(&id).map(Vec::as_slice)
    }

    /// Resource id stored in an external string.
    pub fn resource_id(string: HeapObject) -> u32 {
        read_smi_field(string, external_string::RESOURCE).max(0) as u32
    }

    /// Release a resource. Releasing twice is a no-op.
    pub(crate) fn release(&mut self, id: u32) -> bool {
        let released = self.resources.remove(&id).is_some();
        if released {
            self.released += 1;
        }
        released
    }

    /// Number of resources released so far.
    pub fn released_count(&self) -> usize {
        self.released
    }

    /// Number of live resources.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Track a freshly allocated external string.
    pub(crate) fn add_string(&mut self, string: HeapObject, in_new_space: bool) {
        if in_new_space {
            self.new_space_strings.push(string);
        } else {
            self.old_space_strings.push(string);
        }
    }

    /// Tracked strings, new space first.
    pub fn strings(&self) -> impl Iterator<Item = HeapObject> + '_ {
        self.new_space_strings
            .iter()
            .chain(self.old_space_strings.iter())
            .copied()
    }

    /// Drop every string `is_live` rejects and release its resource.
    pub(crate) fn clean_dead(&mut self, mut is_live: impl FnMut(HeapObject) -> bool) {
        let mut dead = Vec::new();
        for list in [&mut self.new_space_strings, &mut self.old_space_strings] {
            list.retain(|&string| {
                let live = is_live(string);
                if !live {
                    dead.push(Self::resource_id(string));
                }
                live
            });
        }
        for id in dead {
            self.release(id);
        }
    }

    /// Rewrite moved strings and re-file them by space.
    ///
    /// `relocate` returns the current location, or `None` for a dead string.
    pub(crate) fn update(
        &mut self,
        mut relocate: impl FnMut(HeapObject) -> Option<HeapObject>,
        in_new_space: impl Fn(HeapObject) -> bool,
    ) {
        let mut all: Vec<HeapObject> = self.new_space_strings.drain(..).collect();
        all.append(&mut self.old_space_strings);
        for string in all {
            if let Some(current) = relocate(string) {
                self.add_string(current, in_new_space(current));
            }
        }
    }
}
