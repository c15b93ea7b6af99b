use crate::primitives::bits::{lower_bits, read_bits, unsigned_bits_needed, write_bits, FieldIter};
use crate::primitives::bytes::fixed;
use crate::storage::node::find::{Condition, FieldScan, QueryState};
use crate::storage::node::header::Encoding;
use crate::types::{Result, StrataError};

use super::IntegerCompressor;

const SUB_HEADER: usize = 16;
const DATA_BIT: usize = SUB_HEADER * 8;

/// The minimum value plus an unsigned offset per element.
///
/// Sub-header: `[v_width][0; 7][base: i64 LE]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Delta {
    v_width: usize,
    base: i64,
}

impl Delta {
    /// Layout covering `[min(values), max(values)]`.
    pub fn for_values(values: &[i64]) -> Self {
        let base = values.iter().copied().min().unwrap_or(0);
        let max = values.iter().copied().max().unwrap_or(0);
        let span = max.wrapping_sub(base) as u64;
        Self {
            v_width: unsigned_bits_needed(span).max(1),
            base,
        }
    }

    pub(super) fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < SUB_HEADER {
            return Err(StrataError::Corruption("delta sub-header truncated"));
        }
        let v_width = usize::from(payload[0]);
        if !(1..=64).contains(&v_width) {
            return Err(StrataError::Corruption("delta width out of range"));
        }
        Ok(Self {
            v_width,
            base: fixed::get_i64_le(&payload[8..])?,
        })
    }

    /// Offset field width in bits.
    pub fn v_width(&self) -> usize {
        self.v_width
    }

    /// Value every offset is added to.
    pub fn base(&self) -> i64 {
        self.base
    }

    fn max_offset(&self) -> u64 {
        lower_bits(self.v_width)
    }

    fn upper(&self) -> i64 {
        (i128::from(self.base) + i128::from(self.max_offset())).min(i128::from(i64::MAX)) as i64
    }

    fn offset_of(&self, value: i64) -> Option<u64> {
        let off = i128::from(value) - i128::from(self.base);
        (0..=i128::from(self.max_offset()))
            .contains(&off)
            .then_some(off as u64)
    }

    pub(super) fn encode_into(&self, values: &[i64], payload: &mut [u8]) -> Result<()> {
        payload[..SUB_HEADER].fill(0);
        payload[0] = self.v_width as u8;
        payload[8..16].copy_from_slice(&self.base.to_le_bytes());
        for (ndx, &v) in values.iter().enumerate() {
            let off = self
                .offset_of(v)
                .ok_or(StrataError::Invalid("value outside delta range"))?;
            write_bits(payload, DATA_BIT + ndx * self.v_width, self.v_width, off);
        }
        Ok(())
    }
}

impl IntegerCompressor for Delta {
    fn encoding(&self) -> Encoding {
        Encoding::Delta
    }

    fn payload_len(&self, size: usize) -> usize {
        SUB_HEADER + (size * self.v_width).div_ceil(8)
    }

    fn get(&self, data: &[u8], ndx: usize) -> i64 {
        let off = read_bits(data, DATA_BIT + ndx * self.v_width, self.v_width);
        self.base.wrapping_add(off as i64)
    }

    fn get_all(&self, data: &[u8], begin: usize, end: usize) -> Vec<i64> {
        let mut out = Vec::with_capacity(end.saturating_sub(begin));
        out.extend(
            FieldIter::new(data, DATA_BIT, self.v_width, begin, end)
                .map(|off| self.base.wrapping_add(off as i64)),
        );
        out
    }

    fn fits(&self, _data: &[u8], value: i64) -> bool {
        self.offset_of(value).is_some()
    }

    fn set(&self, data: &mut [u8], ndx: usize, value: i64) -> Result<()> {
        let off = self
            .offset_of(value)
            .ok_or(StrataError::Unsupported("value outside delta range"))?;
        write_bits(data, DATA_BIT + ndx * self.v_width, self.v_width, off);
        Ok(())
    }

    fn bounds(&self, _data: &[u8]) -> (i64, i64) {
        (self.base, self.upper())
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
        let (lbound, ubound) = (self.base, self.upper());
        if begin >= end || !cond.can_match(value, lbound, ubound) {
            return true;
        }
        if cond.will_match(value, lbound, ubound) {
            return (begin..end).all(|ndx| state.record(base + ndx));
        }
        // Inside the bounds, so the key has a representable offset.
        if self.v_width < 63 {
            let key = value.wrapping_sub(self.base);
            let scan = FieldScan {
                bit_offset: DATA_BIT,
                width: self.v_width,
                signed: false,
                lbound: 0,
                ubound: self.max_offset() as i64,
            };
            return scan.find_all(data, cond, key, begin, end, base, state);
        }
        for ndx in begin..end {
            if cond.eval(self.get(data, ndx), value) && !state.record(base + ndx) {
                return false;
            }
        }
        true
    }
}
