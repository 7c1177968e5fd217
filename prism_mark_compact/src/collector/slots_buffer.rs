//! Recorded slots pointing into evacuation candidates.
//!
//! Each candidate page owns a chain of fixed-size blocks. Untyped entries
//! are tagged slots; typed entries live in code or function objects and
//! hold entry addresses or embedded pointers that need their own update
//! rule.
//!
//! ```text
//!   Page ──▶ SlotsBuffer
//!             ├─ block 0  [slot | slot | (Code, slot) | ... ]   1024 entries
//!             ├─ block 1  [ ... ]
//!             └─ block n            n < chain limit, else the page is evicted
//! ```

use crate::value::Address;

/// Entries per block.
pub const BLOCK_CAPACITY: usize = 1024;

/// How a typed slot is interpreted when it is updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    /// A tagged object pointer embedded in code.
    EmbeddedObject,
    /// A code object that was migrated as a whole; the address is the new
    /// location and every relocation slot in it must be revisited.
    RelocatedCode,
    /// A call target in code, holding an entry address.
    CodeTarget,
    /// A function's code entry, holding an entry address.
    CodeEntry,
}

/// One recorded slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEntry {
    /// A plain tagged slot.
    Untyped(Address),
    /// A slot that needs type-specific updating.
    Typed(SlotType, Address),
}

impl SlotEntry {
    /// Address of the slot (or of the relocated code object).
    #[inline]
    pub fn address(self) -> Address {
        match self {
            SlotEntry::Untyped(slot) | SlotEntry::Typed(_, slot) => slot,
        }
    }
}

/// Whether adding may fail once the chain limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdditionMode {
    /// Refuse the entry when the chain is at its limit.
    FailOnOverflow,
    /// Grow without bound.
    IgnoreOverflow,
}

/// Chain of slot blocks.
#[derive(Debug)]
pub struct SlotsBuffer {
    blocks: Vec<Vec<SlotEntry>>,
    chain_limit: usize,
}

impl SlotsBuffer {
    /// Create an empty buffer that fails additions beyond `chain_limit`
    /// blocks.
    pub fn new(chain_limit: usize) -> Self {
        Self {
            blocks: Vec::new(),
            chain_limit: chain_limit.max(1),
        }
    }

    /// Record `entry`. Returns `false` if the chain limit was hit in
    /// [`AdditionMode::FailOnOverflow`].
    pub fn add(&mut self, entry: SlotEntry, mode: AdditionMode) -> bool {
        let needs_block = self.blocks.last().is_none_or(|block| block.len() == BLOCK_CAPACITY);
        if needs_block {
            if mode == AdditionMode::FailOnOverflow && self.blocks.len() >= self.chain_limit {
                return false;
            }
            self.blocks.push(Vec::with_capacity(BLOCK_CAPACITY));
        }
        if let Some(block) = self.blocks.last_mut() {
            block.push(entry);
        }
        true
    }

    /// Number of blocks in the chain.
    #[inline]
    pub fn chain_length(&self) -> usize {
        self.blocks.len()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// Whether nothing was recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = SlotEntry> + '_ {
        self.blocks.iter().flatten().copied()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Keep only entries for which `keep` holds. Returns how many were
    /// dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(SlotEntry) -> bool) -> usize {
        let before = self.len();
        for block in &mut self.blocks {
            block.retain(|&entry| keep(entry));
        }
        self.blocks.retain(|block| !block.is_empty());
        before - self.len()
    }

    /// Move every entry of `other` into this buffer, ignoring the limit.
    pub fn append(&mut self, other: &mut SlotsBuffer) {
        for entry in other.iter() {
            self.add(entry, AdditionMode::IgnoreOverflow);
        }
        other.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(n: usize) -> SlotEntry {
        SlotEntry::Untyped(Address::new(0x1000 + n * 8))
    }

    #[test]
    fn test_add_and_iterate() {
        let mut buffer = SlotsBuffer::new(4);
        assert!(buffer.is_empty());
        assert!(buffer.add(slot(0), AdditionMode::FailOnOverflow));
        assert!(buffer.add(
            SlotEntry::Typed(SlotType::CodeEntry, Address::new(0x2000)),
            AdditionMode::FailOnOverflow
        ));
        let entries: Vec<_> = buffer.iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].address(), Address::new(0x2000));
    }

    #[test]
    fn test_chain_limit() {
        let mut buffer = SlotsBuffer::new(2);
        for n in 0..2 * BLOCK_CAPACITY {
            assert!(buffer.add(slot(n), AdditionMode::FailOnOverflow));
        }
        assert_eq!(buffer.chain_length(), 2);
        assert!(!buffer.add(slot(0), AdditionMode::FailOnOverflow));
        assert!(buffer.add(slot(0), AdditionMode::IgnoreOverflow));
        assert_eq!(buffer.chain_length(), 3);
        assert_eq!(buffer.len(), 2 * BLOCK_CAPACITY + 1);
    }

    #[test]
    fn test_retain_drops_emptied_blocks() {
        let mut buffer = SlotsBuffer::new(1);
        for n in 0..BLOCK_CAPACITY + 2 {
            buffer.add(slot(n), AdditionMode::IgnoreOverflow);
        }
        assert_eq!(buffer.chain_length(), 2);

        let dropped = buffer.retain(|entry| entry.address() >= slot(BLOCK_CAPACITY).address());
        assert_eq!(dropped, BLOCK_CAPACITY);
        assert_eq!(buffer.chain_length(), 1);
        assert_eq!(buffer.len(), 2);
        assert!(buffer.add(slot(0), AdditionMode::FailOnOverflow));
    }

    #[test]
    fn test_append_drains_other() {
        let mut a = SlotsBuffer::new(1);
        let mut b = SlotsBuffer::new(1);
        b.add(slot(1), AdditionMode::IgnoreOverflow);
        b.add(slot(2), AdditionMode::IgnoreOverflow);
        a.append(&mut b);
        assert_eq!(a.len(), 2);
        assert!(b.is_empty());
    }
}
