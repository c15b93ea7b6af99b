use crate::primitives::bits::{
    read_bits, sign_extend, signed_bits_needed, unsigned_bits_needed, write_bits, FieldIter,
};
use crate::primitives::bytes::fixed;
use crate::storage::node::find::{Condition, FieldScan, QueryState};
use crate::storage::node::header::Encoding;
use crate::types::{Result, StrataError};

use super::IntegerCompressor;

const SUB_HEADER: usize = 8;
const DATA_BIT: usize = SUB_HEADER * 8;

/// Sorted distinct values followed by one index per element.
///
/// Sub-header: `[v_width][ndx_width][0; 2][v_size: u32 LE]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Flex {
    v_width: usize,
    ndx_width: usize,
    v_size: usize,
}

impl Flex {
    /// Layout for the distinct values of `values`.
    pub fn for_values(values: &[i64]) -> Result<Self> {
        let distinct = distinct_sorted(values);
        Self::for_distinct(&distinct)
    }

    fn for_distinct(distinct: &[i64]) -> Result<Self> {
        let v_size = distinct.len();
        if v_size > u32::MAX as usize {
            return Err(StrataError::Invalid("too many distinct values"));
        }
        let v_width = distinct
            .iter()
            .map(|&v| signed_bits_needed(v))
            .max()
            .unwrap_or(1);
        let ndx_width = unsigned_bits_needed(v_size.saturating_sub(1) as u64).max(1);
        Ok(Self {
            v_width,
            ndx_width,
            v_size,
        })
    }

    pub(super) fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < SUB_HEADER {
            return Err(StrataError::Corruption("flex sub-header truncated"));
        }
        let v_width = usize::from(payload[0]);
        let ndx_width = usize::from(payload[1]);
        if !(1..=64).contains(&v_width) || !(1..=32).contains(&ndx_width) {
            return Err(StrataError::Corruption("flex width out of range"));
        }
        let v_size = fixed::get_u32_le(&payload[4..])? as usize;
        Ok(Self {
            v_width,
            ndx_width,
            v_size,
        })
    }

    /// Width of the value table fields.
    pub fn v_width(&self) -> usize {
        self.v_width
    }

    /// Width of the index fields.
    pub fn ndx_width(&self) -> usize {
        self.ndx_width
    }

    /// Number of distinct values.
    pub fn v_size(&self) -> usize {
        self.v_size
    }

    fn index_bit(&self) -> usize {
        DATA_BIT + self.v_size * self.v_width
    }

    fn value(&self, data: &[u8], k: usize) -> i64 {
        sign_extend(
            read_bits(data, DATA_BIT + k * self.v_width, self.v_width),
            self.v_width,
        )
    }

    fn index(&self, data: &[u8], ndx: usize) -> usize {
        read_bits(data, self.index_bit() + ndx * self.ndx_width, self.ndx_width) as usize
    }

    /// First table position whose value is not less than `key`.
    fn lower_bound(&self, data: &[u8], key: i64) -> usize {
        let (mut lo, mut hi) = (0, self.v_size);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.value(data, mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// First table position whose value is greater than `key`.
    fn upper_bound(&self, data: &[u8], key: i64) -> usize {
        let (mut lo, mut hi) = (0, self.v_size);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.value(data, mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn position_of(&self, data: &[u8], value: i64) -> Option<usize> {
        let pos = self.lower_bound(data, value);
        (pos < self.v_size && self.value(data, pos) == value).then_some(pos)
    }

    pub(super) fn encode_into(&self, values: &[i64], payload: &mut [u8]) -> Result<()> {
        let distinct = distinct_sorted(values);
        if distinct.len() != self.v_size {
            return Err(StrataError::Invalid("flex layout built for other values"));
        }
        payload[..SUB_HEADER].fill(0);
        payload[0] = self.v_width as u8;
        payload[1] = self.ndx_width as u8;
        payload[4..8].copy_from_slice(&(self.v_size as u32).to_le_bytes());
        for (k, &v) in distinct.iter().enumerate() {
            write_bits(payload, DATA_BIT + k * self.v_width, self.v_width, v as u64);
        }
        let index_bit = self.index_bit();
        for (ndx, &v) in values.iter().enumerate() {
            let k = distinct
                .binary_search(&v)
                .map_err(|_| StrataError::Invalid("value missing from flex table"))?;
            write_bits(payload, index_bit + ndx * self.ndx_width, self.ndx_width, k as u64);
        }
        Ok(())
    }

    fn index_scan(&self) -> FieldScan {
        FieldScan {
            bit_offset: self.index_bit(),
            width: self.ndx_width,
            signed: false,
            lbound: 0,
            ubound: self.v_size.saturating_sub(1) as i64,
        }
    }
}

fn distinct_sorted(values: &[i64]) -> Vec<i64> {
    let mut distinct = values.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    distinct
}

impl IntegerCompressor for Flex {
    fn encoding(&self) -> Encoding {
        Encoding::Flex
    }

    fn payload_len(&self, size: usize) -> usize {
        SUB_HEADER + (self.v_size * self.v_width + size * self.ndx_width).div_ceil(8)
    }

    fn get(&self, data: &[u8], ndx: usize) -> i64 {
        self.value(data, self.index(data, ndx))
    }

    fn get_all(&self, data: &[u8], begin: usize, end: usize) -> Vec<i64> {
        let mut out = Vec::with_capacity(end.saturating_sub(begin));
        out.extend(
            FieldIter::new(data, self.index_bit(), self.ndx_width, begin, end)
                .map(|k| self.value(data, k as usize)),
        );
        out
    }

    fn fits(&self, data: &[u8], value: i64) -> bool {
        self.position_of(data, value).is_some()
    }

    fn set(&self, data: &mut [u8], ndx: usize, value: i64) -> Result<()> {
        let k = self
            .position_of(data, value)
            .ok_or(StrataError::Unsupported("value not present in flex table"))?;
        write_bits(data, self.index_bit() + ndx * self.ndx_width, self.ndx_width, k as u64);
        Ok(())
    }

    fn bounds(&self, data: &[u8]) -> (i64, i64) {
        if self.v_size == 0 {
            return (0, 0);
        }
        (self.value(data, 0), self.value(data, self.v_size - 1))
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
        // Values are sorted, so a condition on values is a condition on indices.
        let lower = self.lower_bound(data, value);
        let upper = self.upper_bound(data, value);
        let (ndx_cond, pos) = match cond {
            Condition::Equal | Condition::NotEqual if lower == upper => {
                if cond == Condition::Equal {
                    return true;
                }
                return (begin..end).all(|ndx| state.record(base + ndx));
            }
            Condition::Equal | Condition::NotEqual => (cond, lower),
            Condition::Less => (Condition::Less, lower),
            Condition::LessEqual => (Condition::Less, upper),
            Condition::Greater => (Condition::GreaterEqual, upper),
            Condition::GreaterEqual => (Condition::GreaterEqual, lower),
        };
        self.index_scan()
            .find_all(data, ndx_cond, pos as i64, begin, end, base, state)
    }
}
