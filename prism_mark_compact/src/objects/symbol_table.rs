//! The intern table.
//!
//! An open-addressing hash set of symbols stored in a fixed array:
//!
//! ```text
//! element 0        live entry count (Smi)
//! element 1        deleted entry count (Smi)
//! element 2..      entries: symbol, NULL (never used) or the hole (deleted)
//! ```
//!
//! The table is a weak root. The marker keeps the table object alive but
//! never its entries; entries whose symbol was not reached elsewhere are
//! replaced by the hole after marking.

use super::factory::string_hash;
use super::{HeaderFlags, ObjectHeader, fixed_array, fixed_array_length, object_kind, read_field, write_field};
use super::{InstanceKind, Pretenure};
use crate::error::GcResult;
use crate::heap::{ExternalStringTable, Heap};
use crate::roots::RootIndex;
use crate::value::{Address, HeapObject, Tagged};

/// Number of prefix elements before the entries.
pub const PREFIX_SIZE: usize = 2;

const ELEMENT_COUNT: usize = 0;
const DELETED_COUNT: usize = 1;

/// Entry capacity of a fresh table.
pub const INITIAL_CAPACITY: usize = 64;

/// View of the fixed array backing the intern table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTable(HeapObject);

impl SymbolTable {
    /// Wrap a table object.
    #[inline]
    pub fn new(table: HeapObject) -> Self {
        Self(table)
    }

    /// The backing array.
    #[inline]
    pub fn object(self) -> HeapObject {
        self.0
    }

    /// Number of entry slots.
    #[inline]
    pub fn capacity(self) -> usize {
        fixed_array_length(self.0) - PREFIX_SIZE
    }

    #[inline]
    fn prefix(self, index: usize) -> usize {
        read_field(self.0, fixed_array::FIRST_ELEMENT + index).to_smi().unwrap_or(0).max(0) as usize
    }

    #[inline]
    fn set_prefix(self, index: usize, value: usize) {
        write_field(self.0, fixed_array::FIRST_ELEMENT + index, Tagged::from_smi(value as isize));
    }

    /// Number of live entries.
    pub fn element_count(self) -> usize {
        self.prefix(ELEMENT_COUNT)
    }

    /// Number of deleted entries.
    pub fn deleted_count(self) -> usize {
        self.prefix(DELETED_COUNT)
    }

    /// Address of the prefix slots, which the marker visits strongly.
    pub fn prefix_slots(self) -> (Address, Address) {
        let start = self.0.slot(fixed_array::FIRST_ELEMENT);
        (start, start.add_words(PREFIX_SIZE))
    }

    /// Address of entry slot `index`.
    #[inline]
    pub fn entry_slot(self, index: usize) -> Address {
        self.0.slot(fixed_array::FIRST_ELEMENT + PREFIX_SIZE + index)
    }

    /// Entry `index`.
    #[inline]
    pub fn entry(self, index: usize) -> Tagged {
        self.entry_slot(index).load_tagged()
    }

    /// Addresses of every entry slot.
    pub fn entry_slots(self) -> impl Iterator<Item = Address> {
        (0..self.capacity()).map(move |index| self.entry_slot(index))
    }

    /// Live symbols.
    pub fn symbols(self) -> impl Iterator<Item = HeapObject> {
        (0..self.capacity()).filter_map(move |index| self.entry(index).to_object())
    }

    #[inline]
    fn probe(self, hash: isize, attempt: usize) -> usize {
        (hash as usize).wrapping_add(attempt * (attempt + 1) / 2) & (self.capacity() - 1)
    }

    /// Replace every entry `is_live` rejects with the hole.
    ///
    /// Returns the resource ids of dead external symbols, which the caller
    /// must release.
    pub(crate) fn prune(self, mut is_live: impl FnMut(HeapObject) -> bool) -> Vec<u32> {
        let mut released = Vec::new();
        let mut removed = 0;
        for index in 0..self.capacity() {
            let Some(symbol) = self.entry(index).to_object() else { continue };
            if is_live(symbol) {
                continue;
            }
            if object_kind(symbol) == InstanceKind::ExternalString {
                released.push(ExternalStringTable::resource_id(symbol));
            }
            self.entry_slot(index).store_tagged(Tagged::HOLE);
            removed += 1;
        }
        if removed > 0 {
            self.set_prefix(ELEMENT_COUNT, self.element_count() - removed);
            self.set_prefix(DELETED_COUNT, self.deleted_count() + removed);
        }
        released
    }
}

impl Heap {
    /// The intern table.
    pub fn symbol_table(&self) -> Option<SymbolTable> {
        self.roots.get(RootIndex::SymbolTable).to_object().map(SymbolTable::new)
    }

    pub(crate) fn create_symbol_table(&mut self) -> GcResult<()> {
        let table = self.allocate_table(INITIAL_CAPACITY)?;
        self.roots.set(RootIndex::SymbolTable, table.object().to_tagged());
        Ok(())
    }

    fn allocate_table(&mut self, capacity: usize) -> GcResult<SymbolTable> {
        debug_assert!(capacity.is_power_of_two());
        let array = self.allocate_fixed_array(PREFIX_SIZE + capacity, Pretenure::Tenured)?;
        let table = SymbolTable::new(array);
        table.set_prefix(ELEMENT_COUNT, 0);
        table.set_prefix(DELETED_COUNT, 0);
        Ok(table)
    }

    /// Return the symbol for `bytes`, creating it on first use.
    pub fn intern(&mut self, bytes: &[u8]) -> GcResult<HeapObject> {
        if let Some(symbol) = self.lookup_symbol(bytes) {
            return Ok(symbol);
        }
        let symbol = self.allocate_seq_string(bytes, Pretenure::Tenured)?;
        Self::mark_as_symbol(symbol);
        self.insert_symbol(symbol)?;
        Ok(symbol)
    }

    /// Intern `bytes` as an external string.
    pub fn intern_external(&mut self, bytes: &[u8]) -> GcResult<HeapObject> {
        if let Some(symbol) = self.lookup_symbol(bytes) {
            return Ok(symbol);
        }
        let symbol = self.allocate_external_string(bytes, Pretenure::Tenured)?;
        Self::mark_as_symbol(symbol);
        self.insert_symbol(symbol)?;
        Ok(symbol)
    }

    /// Existing symbol for `bytes`.
    pub fn lookup_symbol(&self, bytes: &[u8]) -> Option<HeapObject> {
        let table = self.symbol_table()?;
        let hash = string_hash(bytes);
        for attempt in 0..table.capacity() {
            let entry = table.entry(table.probe(hash, attempt));
            if entry.is_null() {
                return None;
            }
            if let Some(symbol) = entry.to_object() {
                if self.string_hash_of(symbol) == hash && self.string_bytes(symbol) == bytes {
                    return Some(symbol);
                }
            }
        }
        None
    }

    /// Whether `string` carries the symbol flag.
    pub fn is_symbol(string: HeapObject) -> bool {
        ObjectHeader::of(string).flags().contains(HeaderFlags::IS_SYMBOL)
    }

    pub(crate) fn insert_symbol(&mut self, symbol: HeapObject) -> GcResult<()> {
        debug_assert!(Self::is_symbol(symbol));
        let Some(mut table) = self.symbol_table() else {
            return Ok(());
        };
        let used = table.element_count() + table.deleted_count() + 1;
        if used * 4 > table.capacity() * 3 {
            table = self.rehash_symbol_table(table)?;
        }
        let hash = self.string_hash_of(symbol);
        for attempt in 0..table.capacity() {
            let index = table.probe(hash, attempt);
            let entry = table.entry(index);
            if entry.is_null() || entry.is_hole() {
                if entry.is_hole() {
                    table.set_prefix(DELETED_COUNT, table.deleted_count() - 1);
                }
                self.set_field(table.object(), fixed_array::FIRST_ELEMENT + PREFIX_SIZE + index, symbol.to_tagged());
                table.set_prefix(ELEMENT_COUNT, table.element_count() + 1);
                return Ok(());
            }
        }
        debug_assert!(false, "symbol table full after rehash");
        Ok(())
    }

    /// Copy live entries into a table sized for them and install it.
    fn rehash_symbol_table(&mut self, old: SymbolTable) -> GcResult<SymbolTable> {
        let live = old.element_count() + 1;
        let mut capacity = old.capacity();
        while live * 2 > capacity {
            capacity *= 2;
        }
        let table = self.allocate_table(capacity)?;
        for symbol in old.symbols().collect::<Vec<_>>() {
            let hash = self.string_hash_of(symbol);
            let index = (0..capacity)
                .map(|attempt| table.probe(hash, attempt))
                .find(|&index| table.entry(index).is_null());
            if let Some(index) = index {
                table.entry_slot(index).store_tagged(symbol.to_tagged());
                table.set_prefix(ELEMENT_COUNT, table.element_count() + 1);
            }
        }
        self.roots.set(RootIndex::SymbolTable, table.object().to_tagged());
        log::debug!("symbol table rehashed: {} -> {} entries", old.capacity(), capacity);
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;

    fn heap() -> Heap {
        let _ = env_logger::builder().is_test(true).try_init();
        Heap::new(GcConfig::default()).expect("heap")
    }

    #[test]
    fn test_intern_is_idempotent() {
        let mut heap = heap();
        let a = heap.intern(b"length").expect("a");
        let b = heap.intern(b"length").expect("b");
        let c = heap.intern(b"prototype").expect("c");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Heap::is_symbol(a));
        assert_eq!(heap.lookup_symbol(b"prototype"), Some(c));
        assert_eq!(heap.lookup_symbol(b"missing"), None);
    }

    #[test]
    fn test_empty_string_is_interned() {
        let heap = heap();
        let empty = heap.empty_string().to_object().expect("empty string");
        assert_eq!(heap.lookup_symbol(b""), Some(empty));
    }

    #[test]
    fn test_table_grows() {
        let mut heap = heap();
        let before = heap.symbol_table().expect("table");
        let symbols: Vec<_> = (0..200)
            .map(|n| heap.intern(format!("symbol{n}").as_bytes()).expect("intern"))
            .collect();
        let after = heap.symbol_table().expect("table");
        assert_ne!(before, after);
        assert!(after.capacity() > INITIAL_CAPACITY);
        assert_eq!(after.element_count(), 201);
        for (n, &symbol) in symbols.iter().enumerate() {
            assert_eq!(heap.lookup_symbol(format!("symbol{n}").as_bytes()), Some(symbol));
        }
    }

    #[test]
    fn test_prune_holes_dead_entries() {
        let mut heap = heap();
        let keep = heap.intern(b"keep").expect("keep");
        let drop = heap.intern_external(b"drop").expect("drop");
        let id = ExternalStringTable::resource_id(drop);

        let table = heap.symbol_table().expect("table");
        let count = table.element_count();
        let released = table.prune(|symbol| symbol != drop);
        assert_eq!(released, vec![id]);
        assert_eq!(table.element_count(), count - 1);
        assert_eq!(table.deleted_count(), 1);
        assert_eq!(heap.lookup_symbol(b"keep"), Some(keep));
        assert_eq!(heap.lookup_symbol(b"drop"), None);

        // Reinsertion reuses a hole or a fresh slot.
        heap.intern(b"drop").expect("again");
        assert_eq!(heap.symbol_table().expect("table").element_count(), count);
    }
}
