//! Heap object model.
//!
//! Every object starts with a raw header word followed by its map (type
//! descriptor) slot:
//!
//! ```text
//! word 0   header   kind:8 | flags:8 | size in words:48   (never a tagged value)
//! word 1   map      Tagged pointer to a Map, or NULL
//! word 2.. body     kind specific, see the layout modules below
//! ```
//!
//! The header makes every object self-describing, so sizes and body layouts
//! are known without consulting the map. Objects are at least two words, so
//! the two mark bits of one object never overlap the first bit of the next.

pub mod body;
pub mod factory;
pub mod symbol_table;

use crate::value::{Address, HeapObject, Tagged, WORD_SIZE};

pub use body::{ObjectVisitor, iterate_body, iterate_code_body, iterate_map_and_body};
pub use factory::Pretenure;
pub use symbol_table::SymbolTable;

/// Minimum object size in words.
pub const MIN_OBJECT_WORDS: usize = 2;

/// Largest size in words the header can encode.
pub const MAX_OBJECT_WORDS: usize = (1 << 48) - 1;

// =============================================================================
// Instance Kinds
// =============================================================================

/// Concrete object kind, stored in the header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    /// Free memory written by the sweeper or the free list.
    FreeSpace = 0,
    /// Flat string with inline character data.
    SeqString = 1,
    /// Lazy concatenation of two strings.
    ConsString = 2,
    /// String whose characters live off-heap.
    ExternalString = 3,
    /// Length-prefixed array of tagged values.
    FixedArray = 4,
    /// Plain object with a fixed number of tagged fields.
    JsObject = 5,
    /// Type descriptor.
    Map = 6,
    /// Generated code.
    Code = 7,
    /// Per-function metadata shared between closures.
    SharedFunctionInfo = 8,
    /// Closure.
    JsFunction = 9,
    /// Weak-keyed hash map.
    JsWeakMap = 10,
    /// Global property cell.
    PropertyCell = 11,
    /// Top-level context of a script realm.
    GlobalContext = 12,
}

impl InstanceKind {
    /// Number of instance kinds.
    pub const COUNT: usize = 13;

    /// Decode a kind byte.
    #[inline]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::FreeSpace,
            1 => Self::SeqString,
            2 => Self::ConsString,
            3 => Self::ExternalString,
            4 => Self::FixedArray,
            5 => Self::JsObject,
            6 => Self::Map,
            7 => Self::Code,
            8 => Self::SharedFunctionInfo,
            9 => Self::JsFunction,
            10 => Self::JsWeakMap,
            11 => Self::PropertyCell,
            12 => Self::GlobalContext,
            _ => return None,
        })
    }

    /// Whether the kind is a string.
    #[inline]
    pub const fn is_string(self) -> bool {
        matches!(self, Self::SeqString | Self::ConsString | Self::ExternalString)
    }

    /// Whether objects of this kind contain no tagged body fields.
    #[inline]
    pub const fn is_data_only(self) -> bool {
        matches!(self, Self::SeqString | Self::ExternalString | Self::FreeSpace)
    }

    /// Whether maps of this kind may carry transitions.
    #[inline]
    pub const fn is_js_receiver(self) -> bool {
        matches!(self, Self::JsObject | Self::JsFunction | Self::JsWeakMap)
    }
}

bitflags::bitflags! {
    /// Per-object header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u8 {
        /// The string is interned in the symbol table.
        const IS_SYMBOL = 1 << 0;
    }
}

// =============================================================================
// Object Header
// =============================================================================

/// Decoded header word.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ObjectHeader(usize);

impl ObjectHeader {
    const KIND_BITS: u32 = 8;
    const FLAG_BITS: u32 = 8;
    const SIZE_SHIFT: u32 = Self::KIND_BITS + Self::FLAG_BITS;

    /// Encode a header.
    #[inline]
    pub const fn new(kind: InstanceKind, flags: HeaderFlags, size_in_words: usize) -> Self {
        Self((kind as usize) | ((flags.bits() as usize) << Self::KIND_BITS) | (size_in_words << Self::SIZE_SHIFT))
    }

    /// Read the header of an object.
    #[inline]
    pub fn of(object: HeapObject) -> Self {
        Self(object.address().load())
    }

    /// Write this header at `address`.
    #[inline]
    pub(crate) fn write_to(self, address: Address) {
        address.store(self.0)
    }

    /// The instance kind.
    #[inline]
    pub fn kind(self) -> InstanceKind {
        let raw = (self.0 & 0xff) as u8;
        match InstanceKind::from_u8(raw) {
            Some(kind) => kind,
            None => {
                debug_assert!(false, "corrupt object header {:#x}", self.0);
                InstanceKind::FreeSpace
            }
        }
    }

    /// Header flags.
    #[inline]
    pub fn flags(self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(((self.0 >> Self::KIND_BITS) & 0xff) as u8)
    }

    /// Copy of this header with `flags` set.
    #[inline]
    pub fn with_flags(self, flags: HeaderFlags) -> Self {
        Self::new(self.kind(), self.flags() | flags, self.size_in_words())
    }

    /// Object size in words.
    #[inline]
    pub const fn size_in_words(self) -> usize {
        self.0 >> Self::SIZE_SHIFT
    }

    /// Object size in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        self.size_in_words() * WORD_SIZE
    }

    /// The raw word.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}

impl std::fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("kind", &self.kind())
            .field("flags", &self.flags())
            .field("words", &self.size_in_words())
            .finish()
    }
}

/// Size of an object in bytes.
#[inline]
pub fn object_size(object: HeapObject) -> usize {
    ObjectHeader::of(object).size()
}

/// Kind of an object.
#[inline]
pub fn object_kind(object: HeapObject) -> InstanceKind {
    ObjectHeader::of(object).kind()
}

/// Address one past the end of an object.
#[inline]
pub fn object_end(object: HeapObject) -> Address {
    object.address() + object_size(object)
}

/// Read a tagged field.
#[inline]
pub(crate) fn read_field(object: HeapObject, index: usize) -> Tagged {
    object.slot(index).load_tagged()
}

/// Write a tagged field without any barrier.
#[inline]
pub(crate) fn write_field(object: HeapObject, index: usize, value: Tagged) {
    object.slot(index).store_tagged(value)
}

/// Read a small-integer field, treating anything else as zero.
#[inline]
pub(crate) fn read_smi_field(object: HeapObject, index: usize) -> isize {
    read_field(object, index).to_smi().unwrap_or(0)
}

/// Write a filler object covering `[start, start + size)`.
pub(crate) fn write_filler(start: Address, size: usize) {
    debug_assert!(size % WORD_SIZE == 0);
    if size == 0 {
        return;
    }
    ObjectHeader::new(InstanceKind::FreeSpace, HeaderFlags::empty(), size / WORD_SIZE).write_to(start);
    if size >= 2 * WORD_SIZE {
        start.add_words(1).store_tagged(Tagged::NULL);
    }
}

// =============================================================================
// Visitor Ids
// =============================================================================

/// Small integer selecting the body-marking routine for an object.
///
/// Fixed-size plain objects are split into size buckets so that each bucket
/// gets a routine with a compile-time field count.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisitorId {
    /// Objects with no tagged body (strings, fillers).
    DataObject = 0,
    /// Cons string.
    ConsString,
    /// Fixed array.
    FixedArray,
    /// Plain object of 3 words.
    JsObject3,
    /// Plain object of 4 words.
    JsObject4,
    /// Plain object of 5 words.
    JsObject5,
    /// Plain object of 6 words.
    JsObject6,
    /// Plain object of 7 words.
    JsObject7,
    /// Plain object of 8 words.
    JsObject8,
    /// Plain object of 9 words.
    JsObject9,
    /// Plain object of any other size.
    JsObjectGeneric,
    /// Map.
    Map,
    /// Code.
    Code,
    /// Shared function info.
    SharedFunctionInfo,
    /// Function.
    JsFunction,
    /// Weak map.
    JsWeakMap,
    /// Property cell.
    PropertyCell,
    /// Global context.
    GlobalContext,
    /// Free space. Never reachable.
    FreeSpace,
}

impl VisitorId {
    /// Number of visitor ids.
    pub const COUNT: usize = 19;

    /// Visitor id for an object with the given header.
    #[inline]
    pub fn of(header: ObjectHeader) -> Self {
        match header.kind() {
            InstanceKind::SeqString | InstanceKind::ExternalString => VisitorId::DataObject,
            InstanceKind::ConsString => VisitorId::ConsString,
            InstanceKind::FixedArray => VisitorId::FixedArray,
            InstanceKind::JsObject => match header.size_in_words() {
                3 => VisitorId::JsObject3,
                4 => VisitorId::JsObject4,
                5 => VisitorId::JsObject5,
                6 => VisitorId::JsObject6,
                7 => VisitorId::JsObject7,
                8 => VisitorId::JsObject8,
                9 => VisitorId::JsObject9,
                _ => VisitorId::JsObjectGeneric,
            },
            InstanceKind::Map => VisitorId::Map,
            InstanceKind::Code => VisitorId::Code,
            InstanceKind::SharedFunctionInfo => VisitorId::SharedFunctionInfo,
            InstanceKind::JsFunction => VisitorId::JsFunction,
            InstanceKind::JsWeakMap => VisitorId::JsWeakMap,
            InstanceKind::PropertyCell => VisitorId::PropertyCell,
            InstanceKind::GlobalContext => VisitorId::GlobalContext,
            InstanceKind::FreeSpace => VisitorId::FreeSpace,
        }
    }
}

// =============================================================================
// Layouts
// =============================================================================

/// Word indices shared by every object.
pub mod layout {
    /// Header word.
    pub const HEADER: usize = 0;
    /// Map slot.
    pub const MAP: usize = 1;
    /// First body word.
    pub const BODY: usize = 2;
}

/// Fixed array layout: `[header, map, length, elements...]`.
pub mod fixed_array {
    /// Length (Smi).
    pub const LENGTH: usize = 2;
    /// First element.
    pub const FIRST_ELEMENT: usize = 3;
    /// Header words before the elements.
    pub const HEADER_WORDS: usize = 3;
}

/// Sequential string layout: `[header, map, length, hash, bytes...]`.
pub mod seq_string {
    /// Length in bytes (Smi).
    pub const LENGTH: usize = 2;
    /// Hash (Smi).
    pub const HASH: usize = 3;
    /// First word of character data.
    pub const DATA: usize = 4;
}

/// Cons string layout.
pub mod cons_string {
    /// Left part.
    pub const FIRST: usize = 2;
    /// Right part.
    pub const SECOND: usize = 3;
    /// Combined length (Smi).
    pub const LENGTH: usize = 4;
    /// Object size in words.
    pub const SIZE_WORDS: usize = 5;
}

/// External string layout.
pub mod external_string {
    /// Length in bytes (Smi).
    pub const LENGTH: usize = 2;
    /// Hash (Smi).
    pub const HASH: usize = 3;
    /// Off-heap resource id (Smi).
    pub const RESOURCE: usize = 4;
    /// Object size in words.
    pub const SIZE_WORDS: usize = 5;
}

/// Map layout.
pub mod map {
    /// Instance kind described by the map (Smi).
    pub const INSTANCE_KIND: usize = 2;
    /// Prototype object.
    pub const PROTOTYPE: usize = 3;
    /// Transitions: fixed array of target maps, or NULL.
    pub const TRANSITIONS: usize = 4;
    /// Code cache.
    pub const CODE_CACHE: usize = 5;
    /// Object size in words.
    pub const SIZE_WORDS: usize = 6;
}

/// Code layout.
///
/// The instruction area starts at a fixed offset. Its first words are the
/// embedded object pointers, then the entry addresses of call targets, then
/// opaque instruction data.
pub mod code {
    /// Code kind (Smi).
    pub const KIND: usize = 2;
    /// Number of embedded object pointers (Smi).
    pub const EMBEDDED_COUNT: usize = 3;
    /// Number of call targets (Smi).
    pub const TARGET_COUNT: usize = 4;
    /// Words before the instruction area.
    pub const HEADER_WORDS: usize = 5;
    /// Byte offset from the object start to its entry address.
    pub const HEADER_SIZE: usize = HEADER_WORDS * crate::value::WORD_SIZE;
}

/// Shared function info layout.
pub mod shared_function_info {
    /// Current code.
    pub const CODE: usize = 2;
    /// Source, or NULL when unavailable.
    pub const SOURCE: usize = 3;
    /// Flags (Smi).
    pub const FLAGS: usize = 4;
    /// Code age (Smi).
    pub const CODE_AGE: usize = 5;
    /// Object size in words.
    pub const SIZE_WORDS: usize = 6;
}

/// Function layout.
pub mod js_function {
    /// Shared function info.
    pub const SHARED: usize = 2;
    /// Raw entry address of the current code.
    pub const CODE_ENTRY: usize = 3;
    /// Context.
    pub const CONTEXT: usize = 4;
    /// Object size in words.
    pub const SIZE_WORDS: usize = 5;
}

/// Weak map layout.
pub mod js_weak_map {
    /// Backing table: fixed array of `(key, value)` pairs.
    pub const TABLE: usize = 2;
    /// Object size in words.
    pub const SIZE_WORDS: usize = 3;
}

/// Property cell layout.
pub mod property_cell {
    /// Cell value.
    pub const VALUE: usize = 2;
    /// Object size in words.
    pub const SIZE_WORDS: usize = 3;
}

/// Global context layout.
pub mod global_context {
    /// Map cache: fixed array `[count, (key, map)...]`, or NULL. Weak.
    pub const MAP_CACHE: usize = 2;
    /// Global object.
    pub const GLOBAL_OBJECT: usize = 3;
    /// Extension object.
    pub const EXTENSION: usize = 4;
    /// Object size in words.
    pub const SIZE_WORDS: usize = 5;
}

// =============================================================================
// Code Kinds and Function Flags
// =============================================================================

/// Kind of generated code.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// Unoptimized function code. The only flushable kind.
    Function = 0,
    /// Optimized function code.
    Optimized = 1,
    /// Code stub.
    Stub = 2,
    /// Builtin, such as the lazy-compile stub.
    Builtin = 3,
}

impl CodeKind {
    /// Decode a code kind.
    pub const fn from_smi(raw: isize) -> Self {
        match raw {
            0 => Self::Function,
            1 => Self::Optimized,
            2 => Self::Stub,
            _ => Self::Builtin,
        }
    }
}

bitflags::bitflags! {
    /// Shared function info flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FunctionFlags: u32 {
        /// Implemented natively by the runtime.
        const NATIVE = 1 << 0;
        /// Backed by an embedder API template.
        const API_FUNCTION = 1 << 1;
        /// The whole script wrapped in a function.
        const TOPLEVEL = 1 << 2;
        /// Cannot be compiled lazily.
        const NO_LAZY_COMPILATION = 1 << 3;
    }
}

/// Entry address of a code object.
#[inline]
pub fn code_entry(code: HeapObject) -> Address {
    code.address() + code::HEADER_SIZE
}

/// Code object owning an entry address.
#[inline]
pub fn code_from_entry(entry: Address) -> HeapObject {
    HeapObject::from_address(entry - code::HEADER_SIZE)
}

/// Kind of a code object.
#[inline]
pub fn code_kind(code: HeapObject) -> CodeKind {
    CodeKind::from_smi(read_smi_field(code, code::KIND))
}

/// Number of tagged elements in a fixed array.
#[inline]
pub fn fixed_array_length(array: HeapObject) -> usize {
    read_smi_field(array, fixed_array::LENGTH).max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = ObjectHeader::new(InstanceKind::FixedArray, HeaderFlags::empty(), 17);
        assert_eq!(header.kind(), InstanceKind::FixedArray);
        assert_eq!(header.size_in_words(), 17);
        assert_eq!(header.size(), 17 * WORD_SIZE);
        assert!(header.flags().is_empty());

        let symbol = ObjectHeader::new(InstanceKind::SeqString, HeaderFlags::empty(), 5)
            .with_flags(HeaderFlags::IS_SYMBOL);
        assert_eq!(symbol.kind(), InstanceKind::SeqString);
        assert!(symbol.flags().contains(HeaderFlags::IS_SYMBOL));
        assert_eq!(symbol.size_in_words(), 5);
    }

    #[test]
    fn test_kind_decoding() {
        for raw in 0..InstanceKind::COUNT as u8 {
            let kind = InstanceKind::from_u8(raw).expect("valid kind");
            assert_eq!(kind as u8, raw);
        }
        assert_eq!(InstanceKind::from_u8(InstanceKind::COUNT as u8), None);
    }

    #[test]
    fn test_visitor_id_buckets() {
        let id = |words| VisitorId::of(ObjectHeader::new(InstanceKind::JsObject, HeaderFlags::empty(), words));
        assert_eq!(id(3), VisitorId::JsObject3);
        assert_eq!(id(9), VisitorId::JsObject9);
        assert_eq!(id(2), VisitorId::JsObjectGeneric);
        assert_eq!(id(32), VisitorId::JsObjectGeneric);
        assert_eq!(
            VisitorId::of(ObjectHeader::new(InstanceKind::SeqString, HeaderFlags::empty(), 4)),
            VisitorId::DataObject
        );
        assert_eq!(VisitorId::FreeSpace as usize + 1, VisitorId::COUNT);
    }

    #[test]
    fn test_code_entry_round_trip() {
        let code_object = HeapObject::from_address(Address::new(0x8000));
        let entry = code_entry(code_object);
        assert_eq!(entry - code_object.address(), code::HEADER_SIZE);
        assert_eq!(code_from_entry(entry), code_object);
    }

    #[test]
    fn test_filler_header() {
        let mut words = [0usize; 4];
        let start = Address::new(words.as_mut_ptr() as usize);
        write_filler(start, 4 * WORD_SIZE);
        let header = ObjectHeader::of(HeapObject::from_address(start));
        assert_eq!(header.kind(), InstanceKind::FreeSpace);
        assert_eq!(header.size_in_words(), 4);
    }
}
