#![forbid(unsafe_code)]
//! Compressed integer encodings.
//!
//! Each compressed node starts with the regular node header, followed by an
//! encoding-specific sub-header and a little-endian bit stream. All methods
//! take the payload that follows the node header.

mod delta;
mod flex;
mod packed;

pub use delta::Delta;
pub use flex::Flex;
pub use packed::Packed;

use crate::storage::node::find::{Condition, QueryState};
use crate::storage::node::header::{align8, calc_aligned_byte_size, Encoding, HEADER_SIZE};
use crate::types::{Result, StrataError};

/// Contract shared by the compressed encodings.
pub trait IntegerCompressor {
    /// Encoding tag written to the node header.
    fn encoding(&self) -> Encoding;

    /// Payload bytes needed for `size` elements, sub-header included.
    fn payload_len(&self, size: usize) -> usize;

    /// Decodes element `ndx`.
    fn get(&self, data: &[u8], ndx: usize) -> i64;

    /// Decodes `[begin, end)`.
    fn get_all(&self, data: &[u8], begin: usize, end: usize) -> Vec<i64> {
        let mut out = Vec::with_capacity(end.saturating_sub(begin));
        out.extend((begin..end).map(|ndx| self.get(data, ndx)));
        out
    }

    /// Decodes up to eight elements starting at `ndx`, zero-filling past `size`.
    fn get_chunk(&self, data: &[u8], ndx: usize, size: usize, out: &mut [i64; 8]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = if ndx + i < size {
                self.get(data, ndx + i)
            } else {
                0
            };
        }
    }

    /// Whether `value` can be stored without re-encoding.
    fn fits(&self, data: &[u8], value: i64) -> bool;

    /// Overwrites element `ndx`; fails when `value` does not fit.
    fn set(&self, data: &mut [u8], ndx: usize, value: i64) -> Result<()>;

    /// Smallest and largest value any element can hold.
    fn bounds(&self, data: &[u8]) -> (i64, i64);

    /// Reports matches in `[begin, end)` as `base + ndx`. Returns false if
    /// `state` asked to stop.
    #[allow(clippy::too_many_arguments)]
    fn find_all(
        &self,
        data: &[u8],
        cond: Condition,
        value: i64,
        begin: usize,
        end: usize,
        base: usize,
        state: &mut QueryState,
    ) -> bool;
}

/// The compressor backing a node, selected from its header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Compressor {
    /// See [`Packed`].
    Packed(Packed),
    /// See [`Flex`].
    Flex(Flex),
    /// See [`Delta`].
    Delta(Delta),
}

impl Compressor {
    /// Reads the sub-header of a node with the given encoding.
    pub fn decode(encoding: Encoding, payload: &[u8]) -> Result<Self> {
        match encoding {
            Encoding::Packed => Packed::decode(payload).map(Compressor::Packed),
            Encoding::Flex => Flex::decode(payload).map(Compressor::Flex),
            Encoding::Delta => Delta::decode(payload).map(Compressor::Delta),
            _ => Err(StrataError::Invalid("encoding is not compressed")),
        }
    }

    /// Builds the compressor that stores `values` in `encoding`.
    pub fn for_values(encoding: Encoding, values: &[i64]) -> Result<Self> {
        match encoding {
            Encoding::Packed => Ok(Compressor::Packed(Packed::for_values(values))),
            Encoding::Flex => Flex::for_values(values).map(Compressor::Flex),
            Encoding::Delta => Ok(Compressor::Delta(Delta::for_values(values))),
            _ => Err(StrataError::Invalid("encoding is not compressed")),
        }
    }

    /// Writes sub-header and elements into a zeroed payload of
    /// `payload_len(values.len())` bytes.
    pub fn encode_into(&self, values: &[i64], payload: &mut [u8]) -> Result<()> {
        if payload.len() < self.payload_len(values.len()) {
            return Err(StrataError::Invalid("payload buffer too small"));
        }
        match self {
            Compressor::Packed(c) => c.encode_into(values, payload),
            Compressor::Flex(c) => c.encode_into(values, payload),
            Compressor::Delta(c) => c.encode_into(values, payload),
        }
    }

    /// Aligned node size for `size` elements.
    pub fn node_byte_size(&self, size: usize) -> usize {
        HEADER_SIZE + align8(self.payload_len(size))
    }

    fn inner(&self) -> &dyn IntegerCompressor {
        match self {
            Compressor::Packed(c) => c,
            Compressor::Flex(c) => c,
            Compressor::Delta(c) => c,
        }
    }
}

impl IntegerCompressor for Compressor {
    fn encoding(&self) -> Encoding {
        self.inner().encoding()
    }

    fn payload_len(&self, size: usize) -> usize {
        self.inner().payload_len(size)
    }

    fn get(&self, data: &[u8], ndx: usize) -> i64 {
        self.inner().get(data, ndx)
    }

    fn get_all(&self, data: &[u8], begin: usize, end: usize) -> Vec<i64> {
        self.inner().get_all(data, begin, end)
    }

    fn fits(&self, data: &[u8], value: i64) -> bool {
        self.inner().fits(data, value)
    }

    fn set(&self, data: &mut [u8], ndx: usize, value: i64) -> Result<()> {
        self.inner().set(data, ndx, value)
    }

    fn bounds(&self, data: &[u8]) -> (i64, i64) {
        self.inner().bounds(data)
    }

    fn find_all(
        &self,
        data: &[u8],
        cond: Condition,
        value: i64,
        begin: usize,
        end: usize,
        base: usize,
        state: &mut QueryState,
    ) -> bool {
        self.inner()
            .find_all(data, cond, value, begin, end, base, state)
    }
}

/// Width the plain encoding would use for `values`.
pub fn plain_width(values: &[i64]) -> u8 {
    values
        .iter()
        .map(|&v| crate::storage::node::array::bit_width(v))
        .max()
        .unwrap_or(0)
}

/// Picks the encoding that shrinks `values` the most, if any pays off.
///
/// Packed must save at least 12.5 %, Flex at least 25 %, and Delta at
/// least 12.5 % while also beating whichever was chosen before it.
pub fn choose_encoding(values: &[i64]) -> Option<Encoding> {
    if values.is_empty() {
        return None;
    }
    let plain = calc_aligned_byte_size(Encoding::Bits, values.len(), plain_width(values));
    let mut best = None;
    let mut best_size = plain;

    let packed = Compressor::Packed(Packed::for_values(values)).node_byte_size(values.len());
    if packed * 8 <= plain * 7 {
        best = Some(Encoding::Packed);
        best_size = packed;
    }
    if let Ok(flex) = Flex::for_values(values) {
        let flex = Compressor::Flex(flex).node_byte_size(values.len());
        if flex * 4 <= plain * 3 && flex < best_size {
            best = Some(Encoding::Flex);
            best_size = flex;
        }
    }
    let delta = Compressor::Delta(Delta::for_values(values)).node_byte_size(values.len());
    if delta * 8 <= plain * 7 && delta < best_size {
        best = Some(Encoding::Delta);
    }
    best
}
