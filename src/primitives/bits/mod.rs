#![forbid(unsafe_code)]
//! Bit-field access over little-endian bit streams.
//!
//! Element `i` of a stream with field width `w` occupies bits
//! `[i * w, (i + 1) * w)` counted from bit 0 of byte 0. The `*_fields`
//! functions compare every field of a 64-bit word against a populated search
//! vector at once and return a word with the most significant bit of each
//! matching field set.

/// Range length from which scans switch to the sub-word parallel path.
pub const PARALLEL_THRESHOLD: usize = 20;

/// Mask of the low `width` bits.
pub const fn lower_bits(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Reads `width` (at most 64) bits starting at `bit_off`.
///
/// Bytes past the end of `data` read as zero.
pub fn read_bits(data: &[u8], bit_off: usize, width: usize) -> u64 {
    if width == 0 {
        return 0;
    }
    let byte = bit_off / 8;
    let shift = bit_off % 8;
    let mut raw = [0u8; 9];
    let avail = data.len().saturating_sub(byte).min(raw.len());
    if avail > 0 {
        raw[..avail].copy_from_slice(&data[byte..byte + avail]);
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&raw[..8]);
    let mut value = u64::from_le_bytes(low) >> shift;
    if shift > 0 && shift + width > 64 {
        value |= u64::from(raw[8]) << (64 - shift);
    }
    value & lower_bits(width)
}

/// Writes the low `width` bits of `value` starting at `bit_off`.
pub fn write_bits(data: &mut [u8], bit_off: usize, width: usize, value: u64) {
    let mut remaining = width;
    let mut pos = bit_off;
    let mut v = value & lower_bits(width);
    while remaining > 0 {
        let byte = pos / 8;
        let shift = pos % 8;
        let take = (8 - shift).min(remaining);
        let mask = (((1u16 << take) - 1) as u8) << shift;
        data[byte] = (data[byte] & !mask) | (((v as u8) << shift) & mask);
        v = v.checked_shr(take as u32).unwrap_or(0);
        pos += take;
        remaining -= take;
    }
}

/// Sign-extends the low `width` bits of `value`.
pub const fn sign_extend(value: u64, width: usize) -> i64 {
    if width == 0 {
        return 0;
    }
    if width >= 64 {
        return value as i64;
    }
    let v = value & lower_bits(width);
    let sign = 1u64 << (width - 1);
    (v | 0u64.wrapping_sub(v & sign)) as i64
}

/// Bits needed to store `v` as an unsigned field (0 needs 0 bits).
pub const fn unsigned_bits_needed(v: u64) -> usize {
    64 - v.leading_zeros() as usize
}

/// Bits needed to store `v` as a two's complement field.
pub const fn signed_bits_needed(v: i64) -> usize {
    let magnitude = if v < 0 { !v } else { v } as u64;
    unsigned_bits_needed(magnitude) + 1
}

/// Smallest and largest value a signed field of `width` bits can hold.
pub const fn signed_bounds(width: usize) -> (i64, i64) {
    match width {
        0 => (0, 0),
        w if w >= 64 => (i64::MIN, i64::MAX),
        w => {
            let half = 1i64 << (w - 1);
            (-half, half - 1)
        }
    }
}

/// Repeats the low `width` bits of `value` in every whole field of a word.
pub fn populate(width: usize, value: u64) -> u64 {
    if width == 0 || width >= 64 {
        return value;
    }
    let v = value & lower_bits(width);
    (0..64 / width).fold(0, |acc, i| acc | (v << (i * width)))
}

/// Word with the most significant bit of each whole field set.
pub fn field_msbs(width: usize) -> u64 {
    if width == 0 {
        return 0;
    }
    populate(width, 1u64 << (width - 1))
}

/// Index of the lowest field marked in a comparison result.
pub const fn first_field_marked(width: usize, vector: u64) -> usize {
    vector.trailing_zeros() as usize / width
}

/// Per-field unsigned `a < b`.
pub fn unsigned_lt_fields(msbs: u64, a: u64, b: u64) -> u64 {
    let ai = a | msbs;
    let bi = b & !msbs;
    let borrows = !ai.wrapping_sub(bi);
    let overflows = (!a & b) | (!a & borrows) | (a & b & borrows);
    overflows & msbs
}

/// Per-field `a != b`.
pub fn ne_fields(msbs: u64, a: u64, b: u64) -> u64 {
    unsigned_lt_fields(msbs, 0, a ^ b)
}

/// Per-field `a == b`.
pub fn eq_fields(msbs: u64, a: u64, b: u64) -> u64 {
    msbs & !ne_fields(msbs, a, b)
}

/// Per-field unsigned `a <= b`.
pub fn unsigned_le_fields(msbs: u64, a: u64, b: u64) -> u64 {
    msbs & !unsigned_lt_fields(msbs, b, a)
}

/// Per-field unsigned `a > b`.
pub fn unsigned_gt_fields(msbs: u64, a: u64, b: u64) -> u64 {
    unsigned_lt_fields(msbs, b, a)
}

/// Per-field unsigned `a >= b`.
pub fn unsigned_ge_fields(msbs: u64, a: u64, b: u64) -> u64 {
    msbs & !unsigned_lt_fields(msbs, a, b)
}

/// Per-field signed `a < b`.
pub fn signed_lt_fields(msbs: u64, a: u64, b: u64) -> u64 {
    unsigned_lt_fields(msbs, a ^ msbs, b ^ msbs)
}

/// Per-field signed `a <= b`.
pub fn signed_le_fields(msbs: u64, a: u64, b: u64) -> u64 {
    unsigned_le_fields(msbs, a ^ msbs, b ^ msbs)
}

/// Per-field signed `a > b`.
pub fn signed_gt_fields(msbs: u64, a: u64, b: u64) -> u64 {
    unsigned_gt_fields(msbs, a ^ msbs, b ^ msbs)
}

/// Per-field signed `a >= b`.
pub fn signed_ge_fields(msbs: u64, a: u64, b: u64) -> u64 {
    unsigned_ge_fields(msbs, a ^ msbs, b ^ msbs)
}

/// Signature shared by the per-field comparisons.
pub type FieldCompare = fn(u64, u64, u64) -> u64;

/// Scans fields `[start, end)` of a bit stream a word at a time.
///
/// `compare(msbs, word, search_vector)` marks matching fields. `on_match`
/// receives each matching index in ascending order and returns false to stop
/// the scan, in which case this returns false. `width` must be in `1..64`.
pub fn parallel_subword_find(
    data: &[u8],
    bit_offset: usize,
    width: usize,
    start: usize,
    end: usize,
    search: u64,
    compare: FieldCompare,
    mut on_match: impl FnMut(usize) -> bool,
) -> bool {
    debug_assert!(width > 0 && width < 64);
    let fields = 64 / width;
    let msbs = field_msbs(width);
    let vector = populate(width, search);
    let mut ndx = start;
    while ndx < end {
        let count = (end - ndx).min(fields);
        let word = read_bits(data, bit_offset + ndx * width, count * width);
        let mut found = compare(msbs, word, vector);
        if count < fields {
            found &= lower_bits(count * width);
        }
        while found != 0 {
            if !on_match(ndx + first_field_marked(width, found)) {
                return false;
            }
            found &= found - 1;
        }
        ndx += count;
    }
    true
}

/// Iterator over consecutive fields of a bit stream.
#[derive(Clone, Debug)]
pub struct FieldIter<'a> {
    data: &'a [u8],
    bit_offset: usize,
    width: usize,
    ndx: usize,
    end: usize,
}

impl<'a> FieldIter<'a> {
    /// Iterates fields `[start, end)` of `width` bits beginning at `bit_offset`.
    pub fn new(data: &'a [u8], bit_offset: usize, width: usize, start: usize, end: usize) -> Self {
        Self {
            data,
            bit_offset,
            width,
            ndx: start,
            end,
        }
    }
}

impl Iterator for FieldIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.ndx >= self.end {
            return None;
        }
        let value = read_bits(self.data, self.bit_offset + self.ndx * self.width, self.width);
        self.ndx += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.end.saturating_sub(self.ndx);
        (left, Some(left))
    }
}

impl ExactSizeIterator for FieldIter<'_> {}
