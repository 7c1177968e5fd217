//! Typed allocation.
//!
//! Every constructor allocates raw memory through [`Heap::allocate_raw`],
//! writes the header and map, and fills the body before returning, so no
//! caller ever observes a partially initialized object.

use super::{
    CodeKind, FunctionFlags, HeaderFlags, InstanceKind, ObjectHeader, code, code_entry, code_from_entry,
    cons_string, external_string, fixed_array, fixed_array_length, global_context, js_function, js_weak_map,
    layout, map, object_kind, property_cell, read_field, read_smi_field, seq_string, shared_function_info,
    write_field,
};
use crate::error::GcResult;
use crate::heap::{AllocationSpace, ExternalStringTable, Heap};
use crate::roots::RootIndex;
use crate::value::{Address, HeapObject, Tagged, WORD_SIZE};

/// Where a new object should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pretenure {
    /// Allocate in the nursery when the object fits.
    NotTenured,
    /// Allocate directly in the matching old space.
    Tenured,
}

/// Initial number of `(key, value)` pairs in a weak map table.
const WEAK_MAP_INITIAL_PAIRS: usize = 4;

/// Initial number of `(key, map)` pairs in a map cache.
const MAP_CACHE_INITIAL_PAIRS: usize = 4;

/// String hash stored in the `HASH` field, kept small enough to be a Smi.
pub fn string_hash(bytes: &[u8]) -> isize {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash & 0x3fff_ffff) as isize
}

impl Heap {
    // =========================================================================
    // Raw Helpers
    // =========================================================================

    fn allocate_in(&mut self, tenured_space: AllocationSpace, pretenure: Pretenure, size: usize) -> GcResult<Address> {
        if pretenure == Pretenure::NotTenured && size < self.config.large_object_threshold {
            if let Ok(address) = self.allocate_raw(AllocationSpace::New, size) {
                return Ok(address);
            }
        }
        self.allocate_raw(tenured_space, size)
    }

    /// Write the header and map, and NULL out the body.
    fn initialize_object(address: Address, kind: InstanceKind, words: usize, map: Tagged) -> HeapObject {
        ObjectHeader::new(kind, HeaderFlags::empty(), words).write_to(address);
        let object = HeapObject::from_address(address);
        write_field(object, layout::MAP, map);
        for index in layout::BODY..words {
            write_field(object, index, Tagged::NULL);
        }
        object
    }

    fn map_of_kind(&self, kind: InstanceKind) -> Tagged {
        RootIndex::map_for(kind).map_or(Tagged::NULL, |index| self.roots.get(index))
    }

    fn allocate_object(&mut self, kind: InstanceKind, words: usize, pretenure: Pretenure) -> GcResult<HeapObject> {
        let space = AllocationSpace::promotion_target(kind);
        let address = self.allocate_in(space, pretenure, words * WORD_SIZE)?;
        Ok(Self::initialize_object(address, kind, words, self.map_of_kind(kind)))
    }

    // =========================================================================
    // Bootstrapping
    // =========================================================================

    pub(crate) fn create_initial_objects(&mut self) -> GcResult<()> {
        let address = self.allocate_raw(AllocationSpace::Map, map::SIZE_WORDS * WORD_SIZE)?;
        let meta = Self::initialize_object(address, InstanceKind::Map, map::SIZE_WORDS, Tagged::NULL);
        write_field(meta, layout::MAP, meta.to_tagged());
        write_field(meta, map::INSTANCE_KIND, Tagged::from_smi(InstanceKind::Map as isize));
        self.roots.set(RootIndex::MetaMap, meta.to_tagged());

        for raw in 0..InstanceKind::COUNT as u8 {
            let Some(kind) = InstanceKind::from_u8(raw) else { continue };
            if kind == InstanceKind::Map {
                continue;
            }
            if let Some(index) = RootIndex::map_for(kind) {
                let kind_map = self.allocate_map(kind)?;
                self.roots.set(index, kind_map.to_tagged());
            }
        }

        let empty_array = self.allocate_fixed_array(0, Pretenure::Tenured)?;
        self.roots.set(RootIndex::EmptyFixedArray, empty_array.to_tagged());

        let empty_string = self.allocate_seq_string(b"", Pretenure::Tenured)?;
        Self::mark_as_symbol(empty_string);
        self.roots.set(RootIndex::EmptyString, empty_string.to_tagged());

        self.create_symbol_table()?;
        self.insert_symbol(empty_string)?;

        let stub = self.allocate_code(CodeKind::Builtin, &[], &[], 2)?;
        self.roots.set(RootIndex::LazyCompileStub, stub.to_tagged());
        Ok(())
    }

    /// The empty string.
    pub fn empty_string(&self) -> Tagged {
        self.roots.get(RootIndex::EmptyString)
    }

    /// The builtin installed in place of flushed code.
    pub fn lazy_compile_stub(&self) -> Option<HeapObject> {
        self.roots.get(RootIndex::LazyCompileStub).to_object()
    }

    // =========================================================================
    // Arrays and Objects
    // =========================================================================

    /// Allocate a fixed array of `length` NULL elements.
    pub fn allocate_fixed_array(&mut self, length: usize, pretenure: Pretenure) -> GcResult<HeapObject> {
        let array = self.allocate_object(
            InstanceKind::FixedArray,
            fixed_array::HEADER_WORDS + length,
            pretenure,
        )?;
        write_field(array, fixed_array::LENGTH, Tagged::from_smi(length as isize));
        Ok(array)
    }

    /// Read element `index` of a fixed array.
    pub fn fixed_array_get(&self, array: HeapObject, index: usize) -> Tagged {
        debug_assert!(index < fixed_array_length(array));
        self.get_field(array, fixed_array::FIRST_ELEMENT + index)
    }

    /// Write element `index` of a fixed array.
    pub fn fixed_array_set(&mut self, array: HeapObject, index: usize, value: Tagged) {
        debug_assert!(index < fixed_array_length(array));
        self.set_field(array, fixed_array::FIRST_ELEMENT + index, value);
    }

    /// Allocate a plain object with `fields` NULL fields and the default map.
    pub fn allocate_js_object(&mut self, fields: usize, pretenure: Pretenure) -> GcResult<HeapObject> {
        self.allocate_object(InstanceKind::JsObject, layout::BODY + fields, pretenure)
    }

    /// Allocate a plain object described by `object_map`.
    pub fn allocate_js_object_with_map(
        &mut self,
        object_map: HeapObject,
        fields: usize,
        pretenure: Pretenure,
    ) -> GcResult<HeapObject> {
        let object = self.allocate_js_object(fields, pretenure)?;
        write_field(object, layout::MAP, object_map.to_tagged());
        Ok(object)
    }

    /// Allocate a map for objects of `kind`.
    pub fn allocate_map(&mut self, kind: InstanceKind) -> GcResult<HeapObject> {
        let address = self.allocate_raw(AllocationSpace::Map, map::SIZE_WORDS * WORD_SIZE)?;
        let meta = self.roots.get(RootIndex::MetaMap);
        let new_map = Self::initialize_object(address, InstanceKind::Map, map::SIZE_WORDS, meta);
        write_field(new_map, map::INSTANCE_KIND, Tagged::from_smi(kind as isize));
        Ok(new_map)
    }

    /// Add `target` to the transitions of `source`.
    pub fn add_transition(&mut self, source: HeapObject, target: HeapObject) -> GcResult<()> {
        debug_assert_eq!(object_kind(source), InstanceKind::Map);
        let old = read_field(source, map::TRANSITIONS).to_object();
        let old_length = old.map_or(0, fixed_array_length);
        let transitions = self.allocate_fixed_array(old_length + 1, Pretenure::Tenured)?;
        if let Some(old) = old {
            for index in 0..old_length {
                let value = read_field(old, fixed_array::FIRST_ELEMENT + index);
                write_field(transitions, fixed_array::FIRST_ELEMENT + index, value);
            }
        }
        write_field(transitions, fixed_array::FIRST_ELEMENT + old_length, target.to_tagged());
        self.set_field(source, map::TRANSITIONS, transitions.to_tagged());
        Ok(())
    }

    /// Live transition targets of a map.
    pub fn transitions(&self, source: HeapObject) -> Vec<HeapObject> {
        let Some(array) = read_field(source, map::TRANSITIONS).to_object() else {
            return Vec::new();
        };
        (0..fixed_array_length(array))
            .filter_map(|index| read_field(array, fixed_array::FIRST_ELEMENT + index).to_object())
            .collect()
    }

    /// Allocate a property cell holding `value`.
    pub fn allocate_property_cell(&mut self, value: Tagged) -> GcResult<HeapObject> {
        let address = self.allocate_raw(AllocationSpace::Cell, property_cell::SIZE_WORDS * WORD_SIZE)?;
        let cell = Self::initialize_object(
            address,
            InstanceKind::PropertyCell,
            property_cell::SIZE_WORDS,
            self.map_of_kind(InstanceKind::PropertyCell),
        );
        write_field(cell, property_cell::VALUE, value);
        Ok(cell)
    }

    // =========================================================================
    // Strings
    // =========================================================================

    /// Allocate a flat string holding `bytes`.
    pub fn allocate_seq_string(&mut self, bytes: &[u8], pretenure: Pretenure) -> GcResult<HeapObject> {
        let data_words = bytes.len().div_ceil(WORD_SIZE);
        let string = self.allocate_object(InstanceKind::SeqString, seq_string::DATA + data_words, pretenure)?;
        write_field(string, seq_string::LENGTH, Tagged::from_smi(bytes.len() as isize));
        write_field(string, seq_string::HASH, Tagged::from_smi(string_hash(bytes)));
        for (index, chunk) in bytes.chunks(WORD_SIZE).enumerate() {
            let mut word = [0u8; WORD_SIZE];
            word[..chunk.len()].copy_from_slice(chunk);
            string.slot(seq_string::DATA + index).store(usize::from_le_bytes(word));
        }
        Ok(string)
    }

    /// Allocate a lazy concatenation of two strings.
    pub fn allocate_cons_string(
        &mut self,
        first: HeapObject,
        second: HeapObject,
        pretenure: Pretenure,
    ) -> GcResult<HeapObject> {
        let length = self.string_length(first) + self.string_length(second);
        let string = self.allocate_object(InstanceKind::ConsString, cons_string::SIZE_WORDS, pretenure)?;
        write_field(string, cons_string::FIRST, first.to_tagged());
        write_field(string, cons_string::SECOND, second.to_tagged());
        write_field(string, cons_string::LENGTH, Tagged::from_smi(length as isize));
        Ok(string)
    }

    /// Allocate a string whose characters are kept off-heap.
    pub fn allocate_external_string(&mut self, bytes: &[u8], pretenure: Pretenure) -> GcResult<HeapObject> {
        let string = self.allocate_object(InstanceKind::ExternalString, external_string::SIZE_WORDS, pretenure)?;
        let id = self.external_strings.register_resource(bytes.to_vec());
        write_field(string, external_string::LENGTH, Tagged::from_smi(bytes.len() as isize));
        write_field(string, external_string::HASH, Tagged::from_smi(string_hash(bytes)));
        write_field(string, external_string::RESOURCE, Tagged::from_smi(id as isize));
        let in_new_space = self.in_new_space(string);
        self.external_strings.add_string(string, in_new_space);
        Ok(string)
    }

    /// Length of a string in bytes.
    pub fn string_length(&self, string: HeapObject) -> usize {
        let index = match object_kind(string) {
            InstanceKind::SeqString => seq_string::LENGTH,
            InstanceKind::ConsString => cons_string::LENGTH,
            InstanceKind::ExternalString => external_string::LENGTH,
            _ => return 0,
        };
        read_smi_field(string, index).max(0) as usize
    }

    /// Characters of a string, flattening cons strings.
    pub fn string_bytes(&self, string: HeapObject) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.string_length(string));
        let mut pending = vec![string];
        while let Some(part) = pending.pop() {
            match object_kind(part) {
                InstanceKind::SeqString => {
                    let length = self.string_length(part);
                    for index in 0..length.div_ceil(WORD_SIZE) {
                        let word = part.slot(seq_string::DATA + index).load().to_le_bytes();
                        let take = (length - index * WORD_SIZE).min(WORD_SIZE);
                        out.extend_from_slice(&word[..take]);
                    }
                }
                InstanceKind::ExternalString => {
                    let id = ExternalStringTable::resource_id(part);
                    if let Some(resource) = self.external_strings.resource(id) {
                        out.extend_from_slice(resource);
                    }
                }
                InstanceKind::ConsString => {
                    // Second is pushed first so that first is emitted first.
                    if let Some(second) = read_field(part, cons_string::SECOND).to_object() {
                        pending.push(second);
                    }
                    if let Some(first) = read_field(part, cons_string::FIRST).to_object() {
                        pending.push(first);
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Hash stored in a flat or external string.
    pub fn string_hash_of(&self, string: HeapObject) -> isize {
        match object_kind(string) {
            InstanceKind::SeqString => read_smi_field(string, seq_string::HASH),
            InstanceKind::ExternalString => read_smi_field(string, external_string::HASH),
            _ => string_hash(&self.string_bytes(string)),
        }
    }

    pub(crate) fn mark_as_symbol(string: HeapObject) {
        let header = ObjectHeader::of(string);
        header.with_flags(HeaderFlags::IS_SYMBOL).write_to(string.address());
    }

    // =========================================================================
    // Code and Functions
    // =========================================================================

    /// Allocate a code object.
    ///
    /// `embedded` objects become embedded pointers and `targets` become call
    /// targets (stored as entry addresses), followed by `data_words` words of
    /// opaque instructions.
    pub fn allocate_code(
        &mut self,
        kind: CodeKind,
        embedded: &[HeapObject],
        targets: &[HeapObject],
        data_words: usize,
    ) -> GcResult<HeapObject> {
        let words = code::HEADER_WORDS + embedded.len() + targets.len() + data_words;
        let address = self.allocate_raw(AllocationSpace::Code, words * WORD_SIZE)?;
        let code_object =
            Self::initialize_object(address, InstanceKind::Code, words, self.map_of_kind(InstanceKind::Code));
        write_field(code_object, code::KIND, Tagged::from_smi(kind as isize));
        write_field(code_object, code::EMBEDDED_COUNT, Tagged::from_smi(embedded.len() as isize));
        write_field(code_object, code::TARGET_COUNT, Tagged::from_smi(targets.len() as isize));

        let mut slot = code::HEADER_WORDS;
        for object in embedded {
            write_field(code_object, slot, object.to_tagged());
            slot += 1;
        }
        for target in targets {
            debug_assert_eq!(object_kind(*target), InstanceKind::Code);
            code_object.slot(slot).store(code_entry(*target).raw());
            slot += 1;
        }
        for index in slot..words {
            code_object.slot(index).store(0);
        }
        Ok(code_object)
    }

    /// Embedded object `index` of a code object.
    pub fn code_embedded_object(&self, code_object: HeapObject, index: usize) -> Tagged {
        debug_assert!(index < read_smi_field(code_object, code::EMBEDDED_COUNT) as usize);
        read_field(code_object, code::HEADER_WORDS + index)
    }

    /// Call target `index` of a code object.
    pub fn code_target(&self, code_object: HeapObject, index: usize) -> HeapObject {
        let embedded = read_smi_field(code_object, code::EMBEDDED_COUNT).max(0) as usize;
        code_from_entry(Address::new(code_object.slot(code::HEADER_WORDS + embedded + index).load()))
    }

    /// Allocate metadata shared by the closures of one function.
    pub fn allocate_shared_function_info(
        &mut self,
        function_code: HeapObject,
        source: Tagged,
        flags: FunctionFlags,
    ) -> GcResult<HeapObject> {
        let address = self.allocate_raw(
            AllocationSpace::OldPointer,
            shared_function_info::SIZE_WORDS * WORD_SIZE,
        )?;
        let shared = Self::initialize_object(
            address,
            InstanceKind::SharedFunctionInfo,
            shared_function_info::SIZE_WORDS,
            self.map_of_kind(InstanceKind::SharedFunctionInfo),
        );
        write_field(shared, shared_function_info::CODE, function_code.to_tagged());
        write_field(shared, shared_function_info::SOURCE, source);
        write_field(shared, shared_function_info::FLAGS, Tagged::from_smi(flags.bits() as isize));
        write_field(shared, shared_function_info::CODE_AGE, Tagged::from_smi(0));
        Ok(shared)
    }

    /// Allocate a closure running the shared info's current code.
    pub fn allocate_function(
        &mut self,
        shared: HeapObject,
        context: Tagged,
        pretenure: Pretenure,
    ) -> GcResult<HeapObject> {
        let function = self.allocate_object(InstanceKind::JsFunction, js_function::SIZE_WORDS, pretenure)?;
        write_field(function, js_function::SHARED, shared.to_tagged());
        write_field(function, js_function::CONTEXT, context);
        let entry = self.shared_code(shared).map_or(Address::NULL, code_entry);
        function.slot(js_function::CODE_ENTRY).store(entry.raw());
        Ok(function)
    }

    /// Shared info of a function.
    pub fn function_shared(&self, function: HeapObject) -> Option<HeapObject> {
        read_field(function, js_function::SHARED).to_object()
    }

    /// Code a function currently runs.
    pub fn function_code(&self, function: HeapObject) -> HeapObject {
        code_from_entry(Address::new(function.slot(js_function::CODE_ENTRY).load()))
    }

    /// Point a function at different code.
    pub fn set_function_code(&mut self, function: HeapObject, new_code: HeapObject) {
        let slot = function.slot(js_function::CODE_ENTRY);
        slot.store(code_entry(new_code).raw());
        self.incremental.record_write(&mut self.chunks, function, slot, new_code);
    }

    /// Current code of a shared info.
    pub fn shared_code(&self, shared: HeapObject) -> Option<HeapObject> {
        read_field(shared, shared_function_info::CODE).to_object()
    }

    /// Install new code on a shared info and make it young again.
    pub fn set_shared_code(&mut self, shared: HeapObject, new_code: HeapObject) {
        self.set_field(shared, shared_function_info::CODE, new_code.to_tagged());
        write_field(shared, shared_function_info::CODE_AGE, Tagged::from_smi(0));
    }

    /// Number of cycles the shared info's code went unused.
    pub fn shared_code_age(&self, shared: HeapObject) -> u8 {
        read_smi_field(shared, shared_function_info::CODE_AGE).clamp(0, u8::MAX as isize) as u8
    }

    /// Note that a function ran, resetting its code age.
    pub fn record_invocation(&mut self, function: HeapObject) {
        if let Some(shared) = self.function_shared(function) {
            write_field(shared, shared_function_info::CODE_AGE, Tagged::from_smi(0));
        }
    }

    /// Flags of a shared info.
    pub fn shared_flags(&self, shared: HeapObject) -> FunctionFlags {
        FunctionFlags::from_bits_truncate(read_smi_field(shared, shared_function_info::FLAGS).max(0) as u32)
    }

    // =========================================================================
    // Weak Maps
    // =========================================================================

    /// Allocate an empty weak map.
    pub fn allocate_weak_map(&mut self, pretenure: Pretenure) -> GcResult<HeapObject> {
        let table = self.allocate_fixed_array(2 * WEAK_MAP_INITIAL_PAIRS, pretenure)?;
        let weak_map = self.allocate_object(InstanceKind::JsWeakMap, js_weak_map::SIZE_WORDS, pretenure)?;
        write_field(weak_map, js_weak_map::TABLE, table.to_tagged());
        Ok(weak_map)
    }

    /// Backing table of a weak map.
    pub fn weak_map_table(&self, weak_map: HeapObject) -> Option<HeapObject> {
        read_field(weak_map, js_weak_map::TABLE).to_object()
    }

    /// Associate `value` with `key`.
    pub fn weak_map_set(&mut self, weak_map: HeapObject, key: HeapObject, value: Tagged) -> GcResult<()> {
        let Some(mut table) = self.weak_map_table(weak_map) else {
            return Ok(());
        };
        let mut free = None;
        for pair in 0..fixed_array_length(table) / 2 {
            let current = self.fixed_array_get(table, 2 * pair);
            if current == key.to_tagged() {
                self.fixed_array_set(table, 2 * pair + 1, value);
                return Ok(());
            }
            if free.is_none() && (current.is_null() || current.is_hole()) {
                free = Some(pair);
            }
        }

        let pair = match free {
            Some(pair) => pair,
            None => {
                let pairs = fixed_array_length(table) / 2;
                let grown = self.allocate_fixed_array(4 * pairs.max(1), Pretenure::NotTenured)?;
                for index in 0..2 * pairs {
                    write_field(grown, fixed_array::FIRST_ELEMENT + index, self.fixed_array_get(table, index));
                }
                self.set_field(weak_map, js_weak_map::TABLE, grown.to_tagged());
                table = grown;
                pairs
            }
        };
        self.fixed_array_set(table, 2 * pair, key.to_tagged());
        self.fixed_array_set(table, 2 * pair + 1, value);
        Ok(())
    }

    /// Value associated with `key`.
    pub fn weak_map_get(&self, weak_map: HeapObject, key: HeapObject) -> Option<Tagged> {
        let table = self.weak_map_table(weak_map)?;
        (0..fixed_array_length(table) / 2)
            .find(|&pair| self.fixed_array_get(table, 2 * pair) == key.to_tagged())
            .map(|pair| self.fixed_array_get(table, 2 * pair + 1))
    }

    /// Number of live entries of a weak map.
    pub fn weak_map_len(&self, weak_map: HeapObject) -> usize {
        let Some(table) = self.weak_map_table(weak_map) else {
            return 0;
        };
        (0..fixed_array_length(table) / 2)
            .filter(|&pair| self.fixed_array_get(table, 2 * pair).is_heap_object())
            .count()
    }

    // =========================================================================
    // Global Contexts
    // =========================================================================

    /// Allocate a global context and link it into the context list.
    pub fn allocate_global_context(&mut self, global_object: Tagged, extension: Tagged) -> GcResult<HeapObject> {
        let context = self.allocate_object(
            InstanceKind::GlobalContext,
            global_context::SIZE_WORDS,
            Pretenure::Tenured,
        )?;
        write_field(context, global_context::GLOBAL_OBJECT, global_object);
        write_field(context, global_context::EXTENSION, extension);
        self.global_contexts.push(context);
        Ok(context)
    }

    /// Cache `cached_map` under `key` in the context's map cache.
    ///
    /// The cache is `[count, (key, map)...]`; removed entries hold the hole.
    pub fn add_to_map_cache(&mut self, context: HeapObject, key: Tagged, cached_map: HeapObject) -> GcResult<()> {
        let cache = match read_field(context, global_context::MAP_CACHE).to_object() {
            Some(cache) => cache,
            None => {
                let cache = self.allocate_fixed_array(1 + 2 * MAP_CACHE_INITIAL_PAIRS, Pretenure::Tenured)?;
                write_field(cache, fixed_array::FIRST_ELEMENT, Tagged::from_smi(0));
                self.set_field(context, global_context::MAP_CACHE, cache.to_tagged());
                cache
            }
        };
        let pairs = (fixed_array_length(cache) - 1) / 2;
        let free = (0..pairs).find(|&pair| {
            let current = self.fixed_array_get(cache, 1 + 2 * pair);
            current.is_null() || current.is_hole() || current == key
        });

        let (cache, pair) = match free {
            Some(pair) => (cache, pair),
            None => {
                let grown = self.allocate_fixed_array(1 + 4 * pairs, Pretenure::Tenured)?;
                for index in 0..1 + 2 * pairs {
                    write_field(grown, fixed_array::FIRST_ELEMENT + index, self.fixed_array_get(cache, index));
                }
                self.set_field(context, global_context::MAP_CACHE, grown.to_tagged());
                (grown, pairs)
            }
        };
        if self.fixed_array_get(cache, 1 + 2 * pair) != key {
            let count = self.fixed_array_get(cache, 0).to_smi().unwrap_or(0);
            self.fixed_array_set(cache, 0, Tagged::from_smi(count + 1));
        }
        self.fixed_array_set(cache, 1 + 2 * pair, key);
        self.fixed_array_set(cache, 2 + 2 * pair, cached_map.to_tagged());
        Ok(())
    }

    /// Map cached under `key`.
    pub fn map_cache_lookup(&self, context: HeapObject, key: Tagged) -> Option<HeapObject> {
        let cache = read_field(context, global_context::MAP_CACHE).to_object()?;
        let pairs = (fixed_array_length(cache) - 1) / 2;
        (0..pairs)
            .find(|&pair| self.fixed_array_get(cache, 1 + 2 * pair) == key)
            .and_then(|pair| self.fixed_array_get(cache, 2 + 2 * pair).to_object())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::objects::object_size;

    fn heap() -> Heap {
        let _ = env_logger::builder().is_test(true).try_init();
        Heap::new(GcConfig::default()).expect("heap")
    }

    // =========================================================================
    // Placement
    // =========================================================================

    #[test]
    fn test_pretenure_selects_space() {
        let mut heap = heap();
        let young = heap.allocate_fixed_array(4, Pretenure::NotTenured).expect("young");
        let old = heap.allocate_fixed_array(4, Pretenure::Tenured).expect("old");
        let string = heap.allocate_seq_string(b"abc", Pretenure::Tenured).expect("string");
        assert_eq!(heap.space_of(young), Some(AllocationSpace::New));
        assert_eq!(heap.space_of(old), Some(AllocationSpace::OldPointer));
        assert_eq!(heap.space_of(string), Some(AllocationSpace::OldData));
        assert_eq!(object_size(young), (fixed_array::HEADER_WORDS + 4) * WORD_SIZE);
    }

    #[test]
    fn test_maps_and_cells_have_their_own_spaces() {
        let mut heap = heap();
        let object_map = heap.allocate_map(InstanceKind::JsObject).expect("map");
        let cell = heap.allocate_property_cell(Tagged::from_smi(3)).expect("cell");
        assert_eq!(heap.space_of(object_map), Some(AllocationSpace::Map));
        assert_eq!(heap.space_of(cell), Some(AllocationSpace::Cell));

        let object = heap
            .allocate_js_object_with_map(object_map, 2, Pretenure::NotTenured)
            .expect("object");
        assert_eq!(heap.get_field(object, layout::MAP), object_map.to_tagged());
    }

    // =========================================================================
    // Strings
    // =========================================================================

    #[test]
    fn test_string_contents() {
        let mut heap = heap();
        let left = heap.allocate_seq_string(b"hello, ", Pretenure::NotTenured).expect("left");
        let right = heap.allocate_external_string(b"external world", Pretenure::Tenured).expect("right");
        let cons = heap.allocate_cons_string(left, right, Pretenure::NotTenured).expect("cons");

        assert_eq!(heap.string_bytes(left), b"hello, ");
        assert_eq!(heap.string_bytes(right), b"external world");
        assert_eq!(heap.string_bytes(cons), b"hello, external world");
        assert_eq!(heap.string_length(cons), 21);
        assert_eq!(heap.string_hash_of(right), string_hash(b"external world"));
        assert_eq!(heap.external_strings().strings().count(), 1);
    }

    // =========================================================================
    // Code
    // =========================================================================

    #[test]
    fn test_function_code_entry() {
        let mut heap = heap();
        let callee = heap.allocate_code(CodeKind::Stub, &[], &[], 1).expect("callee");
        let literal = heap.allocate_fixed_array(0, Pretenure::Tenured).expect("literal");
        let code_object = heap
            .allocate_code(CodeKind::Function, &[literal], &[callee], 4)
            .expect("code");
        assert_eq!(heap.code_embedded_object(code_object, 0), literal.to_tagged());
        assert_eq!(heap.code_target(code_object, 0), callee);

        let source = heap.allocate_seq_string(b"function f() {}", Pretenure::Tenured).expect("source");
        let shared = heap
            .allocate_shared_function_info(code_object, source.to_tagged(), FunctionFlags::empty())
            .expect("shared");
        let function = heap
            .allocate_function(shared, Tagged::NULL, Pretenure::NotTenured)
            .expect("function");
        assert_eq!(heap.function_code(function), code_object);
        assert_eq!(heap.function_shared(function), Some(shared));
        assert_eq!(heap.shared_code_age(shared), 0);
    }

    // =========================================================================
    // Weak Maps and Map Caches
    // =========================================================================

    #[test]
    fn test_weak_map_grows() {
        let mut heap = heap();
        let weak_map = heap.allocate_weak_map(Pretenure::NotTenured).expect("weak map");
        let mut keys = Vec::new();
        for n in 0..10 {
            let key = heap.allocate_js_object(0, Pretenure::NotTenured).expect("key");
            heap.weak_map_set(weak_map, key, Tagged::from_smi(n)).expect("set");
            keys.push(key);
        }
        assert_eq!(heap.weak_map_len(weak_map), 10);
        assert_eq!(heap.weak_map_get(weak_map, keys[7]), Some(Tagged::from_smi(7)));

        heap.weak_map_set(weak_map, keys[7], Tagged::from_smi(70)).expect("overwrite");
        assert_eq!(heap.weak_map_get(weak_map, keys[7]), Some(Tagged::from_smi(70)));
        assert_eq!(heap.weak_map_len(weak_map), 10);
    }

    #[test]
    fn test_map_cache() {
        let mut heap = heap();
        let context = heap
            .allocate_global_context(Tagged::NULL, Tagged::NULL)
            .expect("context");
        let maps: Vec<_> = (0..6)
            .map(|_| heap.allocate_map(InstanceKind::JsObject).expect("map"))
            .collect();
        for (n, &cached) in maps.iter().enumerate() {
            heap.add_to_map_cache(context, Tagged::from_smi(n as isize), cached).expect("cache");
        }
        assert_eq!(heap.map_cache_lookup(context, Tagged::from_smi(5)), Some(maps[5]));
        assert_eq!(heap.map_cache_lookup(context, Tagged::from_smi(9)), None);
        assert_eq!(heap.global_contexts(), &[context]);
    }

    #[test]
    fn test_transitions() {
        let mut heap = heap();
        let source = heap.allocate_map(InstanceKind::JsObject).expect("source");
        let a = heap.allocate_map(InstanceKind::JsObject).expect("a");
        let b = heap.allocate_map(InstanceKind::JsObject).expect("b");
        heap.add_transition(source, a).expect("a");
        heap.add_transition(source, b).expect("b");
        assert_eq!(heap.transitions(source), vec![a, b]);
    }
}
