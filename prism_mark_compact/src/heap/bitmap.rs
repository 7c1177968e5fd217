//! Side mark bitmap with two-bit object colors.
//!
//! Every word of a chunk has one bit. An object's color is read from the
//! bit of its first word and the bit of the word after it:
//!
//! ```text
//!  first  next
//!    0     0    white       not reached
//!    1     0    black       reached (and, outside overflow, scanned)
//!    1     1    grey        reached, body not yet scanned
//!    0     1    impossible  never produced by a valid transition
//! ```
//!
//! Objects are at least two words long, so the second bit of one object is
//! never the first bit of another. The bitmap carries one spare cell so the
//! second bit of an object ending at the chunk limit is always addressable.

use std::fmt;

/// Bits in one bitmap cell.
pub const BITS_PER_CELL: usize = 32;

const CELL_SHIFT: u32 = BITS_PER_CELL.trailing_zeros();
const CELL_MASK: usize = BITS_PER_CELL - 1;

// =============================================================================
// Mark Bit
// =============================================================================

/// Position of the first mark bit of an object, as a word index into the
/// owning chunk.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkBit(usize);

impl MarkBit {
    /// Mark bit for the word at `index`.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Word index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Bit of the following word.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[inline]
    const fn cell(self) -> usize {
        self.0 >> CELL_SHIFT
    }

    #[inline]
    const fn mask(self) -> u32 {
        1 << (self.0 & CELL_MASK)
    }
}

impl fmt::Debug for MarkBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MarkBit({}:{})", self.cell(), self.0 & CELL_MASK)
    }
}

/// Tricolor state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectColor {
    /// Unreached.
    White,
    /// Reached and scanned.
    Black,
    /// Reached, body pending.
    Grey,
    /// Invalid bit pattern.
    Impossible,
}

// =============================================================================
// Bitmap
// =============================================================================

/// Mark bitmap of one chunk.
pub struct Bitmap {
    cells: Box<[u32]>,
}

impl Bitmap {
    /// Create a cleared bitmap covering `chunk_size` bytes.
    pub fn new(chunk_size: usize) -> Self {
        let words = chunk_size / crate::value::WORD_SIZE;
        let cells = words.div_ceil(BITS_PER_CELL) + 1;
        Self {
            cells: vec![0u32; cells].into_boxed_slice(),
        }
    }

    /// Number of cells, including the spare one.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Raw cells.
    #[inline]
    pub fn cells(&self) -> &[u32] {
        &self.cells
    }

    /// Read one bit.
    #[inline]
    pub fn get(&self, bit: MarkBit) -> bool {
        self.cells[bit.cell()] & bit.mask() != 0
    }

    /// Set one bit.
    #[inline]
    pub fn set(&mut self, bit: MarkBit) {
        self.cells[bit.cell()] |= bit.mask();
    }

    /// Clear one bit.
    #[inline]
    pub fn unset(&mut self, bit: MarkBit) {
        self.cells[bit.cell()] &= !bit.mask();
    }

    /// Color of the object whose first bit is `bit`.
    #[inline]
    pub fn color(&self, bit: MarkBit) -> ObjectColor {
        match (self.get(bit), self.get(bit.next())) {
            (false, false) => ObjectColor::White,
            (true, false) => ObjectColor::Black,
            (true, true) => ObjectColor::Grey,
            (false, true) => ObjectColor::Impossible,
        }
    }

    /// Whether the object is white.
    #[inline]
    pub fn is_white(&self, bit: MarkBit) -> bool {
        !self.get(bit)
    }

    /// Whether the object is grey.
    #[inline]
    pub fn is_grey(&self, bit: MarkBit) -> bool {
        self.get(bit) && self.get(bit.next())
    }

    /// Whether the object is black.
    #[inline]
    pub fn is_black(&self, bit: MarkBit) -> bool {
        self.get(bit) && !self.get(bit.next())
    }

    /// White to grey.
    #[inline]
    pub fn white_to_grey(&mut self, bit: MarkBit) {
        debug_assert_eq!(self.color(bit), ObjectColor::White);
        self.set(bit);
        self.set(bit.next());
    }

    /// Grey to black.
    #[inline]
    pub fn grey_to_black(&mut self, bit: MarkBit) {
        debug_assert_eq!(self.color(bit), ObjectColor::Grey);
        self.unset(bit.next());
    }

    /// White to black, skipping grey.
    #[inline]
    pub fn white_to_black(&mut self, bit: MarkBit) {
        debug_assert_eq!(self.color(bit), ObjectColor::White);
        self.set(bit);
    }

    /// Black back to grey, used when the marking deque overflows.
    #[inline]
    pub fn black_to_grey(&mut self, bit: MarkBit) {
        debug_assert_eq!(self.color(bit), ObjectColor::Black);
        self.set(bit.next());
    }

    /// Reset both bits of an object to white.
    #[inline]
    pub fn clear_object(&mut self, bit: MarkBit) {
        self.unset(bit);
        self.unset(bit.next());
    }

    /// Clear every bit.
    pub fn clear(&mut self) {
        self.cells.fill(0);
    }

    /// Clear the bits of words `[start, end)`.
    pub fn clear_range(&mut self, start: usize, end: usize) {
        for index in start..end {
            self.unset(MarkBit::new(index));
        }
    }

    /// Whether no bit is set.
    pub fn is_clean(&self) -> bool {
        self.cells.iter().all(|&cell| cell == 0)
    }

    /// First grey object at or after word `from`.
    ///
    /// The search is exact as long as callers resume at least two words past
    /// a previously returned grey object that they have blackened.
    pub fn next_grey(&self, from: usize) -> Option<MarkBit> {
        let mut cell_index = from >> CELL_SHIFT;
        let mut skip_mask = !0u32 << (from & CELL_MASK);
        while cell_index + 1 < self.cells.len() {
            let current = self.cells[cell_index];
            if current != 0 {
                let next = self.cells[cell_index + 1];
                let grey = current & ((current >> 1) | (next << (BITS_PER_CELL - 1))) & skip_mask;
                if grey != 0 {
                    let offset = grey.trailing_zeros() as usize;
                    return Some(MarkBit::new((cell_index << CELL_SHIFT) + offset));
                }
            }
            cell_index += 1;
            skip_mask = !0;
        }
        None
    }

    /// Iterate the first bits of black objects in address order.
    ///
    /// Only valid once no grey object remains.
    pub fn black_objects(&self) -> BlackObjects<'_> {
        BlackObjects {
            cells: &self.cells,
            cell: 0,
            starts: [0; BITS_PER_CELL],
            count: 0,
            next: 0,
        }
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: u32 = self.cells.iter().map(|cell| cell.count_ones()).sum();
        f.debug_struct("Bitmap")
            .field("cells", &self.cells.len())
            .field("bits_set", &set)
            .finish()
    }
}

/// Iterator returned by [`Bitmap::black_objects`].
pub struct BlackObjects<'a> {
    cells: &'a [u32],
    cell: usize,
    starts: [u8; BITS_PER_CELL],
    count: usize,
    next: usize,
}

impl Iterator for BlackObjects<'_> {
    type Item = MarkBit;

    fn next(&mut self) -> Option<MarkBit> {
        loop {
            if self.next < self.count {
                let offset = self.starts[self.next] as usize;
                self.next += 1;
                return Some(MarkBit::new(((self.cell - 1) << CELL_SHIFT) + offset));
            }
            let cell = *self.cells.get(self.cell)?;
            self.cell += 1;
            self.next = 0;
            self.count = if cell == 0 {
                0
            } else {
                mark_word_to_object_starts(cell, &mut self.starts)
            };
        }
    }
}

// =============================================================================
// Object Start Table
// =============================================================================

/// For every byte value: the number of set bits, then their positions.
static START_TABLE: [[u8; 9]; 256] = build_start_table();

const fn build_start_table() -> [[u8; 9]; 256] {
    let mut table = [[0u8; 9]; 256];
    let mut byte = 0;
    while byte < 256 {
        let mut count = 0;
        let mut bit = 0;
        while bit < 8 {
            if byte & (1 << bit) != 0 {
                table[byte][1 + count] = bit as u8;
                count += 1;
            }
            bit += 1;
        }
        table[byte][0] = count as u8;
        byte += 1;
    }
    table
}

/// Decode a cell of black-only mark bits into object start offsets.
///
/// Writes the word offsets of object starts within the cell to `starts`
/// and returns how many there are.
pub fn mark_word_to_object_starts(cell: u32, starts: &mut [u8; BITS_PER_CELL]) -> usize {
    debug_assert_eq!(cell & (cell >> 1), 0, "grey object in a black-only cell");
    let mut objects = 0;
    let mut bits = cell;
    let mut offset = 0u8;
    while bits != 0 {
        let byte = (bits & 0xff) as usize;
        bits >>= 8;
        if byte != 0 {
            let line = &START_TABLE[byte];
            for &position in &line[1..=line[0] as usize] {
                starts[objects] = offset + position;
                objects += 1;
            }
        }
        offset += 8;
    }
    objects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::WORD_SIZE;

    // =========================================================================
    // Colors
    // =========================================================================

    #[test]
    fn test_color_transitions() {
        let mut bitmap = Bitmap::new(64 * WORD_SIZE);
        let bit = MarkBit::new(10);

        assert_eq!(bitmap.color(bit), ObjectColor::White);
        bitmap.white_to_grey(bit);
        assert_eq!(bitmap.color(bit), ObjectColor::Grey);
        bitmap.grey_to_black(bit);
        assert_eq!(bitmap.color(bit), ObjectColor::Black);
        bitmap.black_to_grey(bit);
        assert!(bitmap.is_grey(bit));
        bitmap.clear_object(bit);
        assert!(bitmap.is_white(bit));
        assert!(bitmap.is_clean());
    }

    #[test]
    fn test_impossible_pattern() {
        let mut bitmap = Bitmap::new(64 * WORD_SIZE);
        bitmap.set(MarkBit::new(5));
        assert_eq!(bitmap.color(MarkBit::new(4)), ObjectColor::Impossible);
    }

    #[test]
    fn test_second_bit_crosses_cell() {
        let mut bitmap = Bitmap::new(64 * WORD_SIZE);
        let bit = MarkBit::new(31);
        bitmap.white_to_grey(bit);
        assert_eq!(bitmap.cells()[0], 1 << 31);
        assert_eq!(bitmap.cells()[1], 1);
        bitmap.grey_to_black(bit);
        assert_eq!(bitmap.cells()[1], 0);
    }

    #[test]
    fn test_spare_cell_covers_last_word() {
        let words = 64;
        let mut bitmap = Bitmap::new(words * WORD_SIZE);
        assert_eq!(bitmap.cell_count(), 3);
        bitmap.white_to_grey(MarkBit::new(words - 1));
        assert!(bitmap.is_grey(MarkBit::new(words - 1)));
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    #[test]
    fn test_next_grey_skips_black() {
        let mut bitmap = Bitmap::new(128 * WORD_SIZE);
        bitmap.white_to_black(MarkBit::new(2));
        bitmap.white_to_grey(MarkBit::new(4));
        bitmap.white_to_grey(MarkBit::new(31));
        bitmap.white_to_grey(MarkBit::new(70));

        let first = bitmap.next_grey(0).expect("grey at 4");
        assert_eq!(first.index(), 4);
        bitmap.grey_to_black(first);

        let second = bitmap.next_grey(first.index() + 2).expect("grey at 31");
        assert_eq!(second.index(), 31);
        bitmap.grey_to_black(second);

        let third = bitmap.next_grey(second.index() + 2).expect("grey at 70");
        assert_eq!(third.index(), 70);
        bitmap.grey_to_black(third);

        assert_eq!(bitmap.next_grey(0), None);
    }

    #[test]
    fn test_black_objects_in_order() {
        let mut bitmap = Bitmap::new(128 * WORD_SIZE);
        for index in [0, 3, 30, 33, 64, 126] {
            bitmap.white_to_black(MarkBit::new(index));
        }
        let found: Vec<usize> = bitmap.black_objects().map(MarkBit::index).collect();
        assert_eq!(found, vec![0, 3, 30, 33, 64, 126]);
    }

    #[test]
    fn test_start_table_decoding() {
        let mut starts = [0u8; BITS_PER_CELL];
        let count = mark_word_to_object_starts(0b1000_0101 | (1 << 20) | (1 << 31), &mut starts);
        assert_eq!(&starts[..count], &[0, 2, 7, 20, 31]);
        assert_eq!(mark_word_to_object_starts(0, &mut starts), 0);
    }

    #[test]
    fn test_clear_range() {
        let mut bitmap = Bitmap::new(64 * WORD_SIZE);
        bitmap.white_to_black(MarkBit::new(8));
        bitmap.white_to_black(MarkBit::new(40));
        bitmap.clear_range(0, 32);
        assert!(bitmap.is_white(MarkBit::new(8)));
        assert!(bitmap.is_black(MarkBit::new(40)));
    }
}
