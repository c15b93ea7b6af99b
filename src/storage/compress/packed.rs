use crate::primitives::bits::{self, read_bits, sign_extend, signed_bits_needed, write_bits, FieldIter};
use crate::storage::node::find::{Condition, FieldScan, QueryState};
use crate::storage::node::header::Encoding;
use crate::types::{Result, StrataError};

use super::IntegerCompressor;

const SUB_HEADER: usize = 8;
const DATA_BIT: usize = SUB_HEADER * 8;

/// Every element stored as a two's complement field of `v_width` bits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packed {
    v_width: usize,
}

impl Packed {
    /// Narrowest layout that holds every value.
    pub fn for_values(values: &[i64]) -> Self {
        let v_width = values
            .iter()
            .map(|&v| signed_bits_needed(v))
            .max()
            .unwrap_or(1);
        Self { v_width }
    }

    pub(super) fn decode(payload: &[u8]) -> Result<Self> {
        let v_width = usize::from(
            *payload
                .first()
                .ok_or(StrataError::Corruption("packed sub-header truncated"))?,
        );
        if !(1..=64).contains(&v_width) {
            return Err(StrataError::Corruption("packed width out of range"));
        }
        Ok(Self { v_width })
    }

    /// Field width in bits.
    pub fn v_width(&self) -> usize {
        self.v_width
    }

    pub(super) fn encode_into(&self, values: &[i64], payload: &mut [u8]) -> Result<()> {
        payload[..SUB_HEADER].fill(0);
        payload[0] = self.v_width as u8;
        for (ndx, &v) in values.iter().enumerate() {
            if !self.fits(payload, v) {
                return Err(StrataError::Invalid("value wider than packed field"));
            }
            write_bits(payload, DATA_BIT + ndx * self.v_width, self.v_width, v as u64);
        }
        Ok(())
    }

    fn scan(&self) -> FieldScan {
        let (lbound, ubound) = bits::signed_bounds(self.v_width);
        FieldScan {
            bit_offset: DATA_BIT,
            width: self.v_width,
            signed: true,
            lbound,
            ubound,
        }
    }
}

impl IntegerCompressor for Packed {
    fn encoding(&self) -> Encoding {
        Encoding::Packed
    }

    fn payload_len(&self, size: usize) -> usize {
        SUB_HEADER + (size * self.v_width).div_ceil(8)
    }

    fn get(&self, data: &[u8], ndx: usize) -> i64 {
        sign_extend(
            read_bits(data, DATA_BIT + ndx * self.v_width, self.v_width),
            self.v_width,
        )
    }

    fn get_all(&self, data: &[u8], begin: usize, end: usize) -> Vec<i64> {
        let mut out = Vec::with_capacity(end.saturating_sub(begin));
        out.extend(
            FieldIter::new(data, DATA_BIT, self.v_width, begin, end)
                .map(|raw| sign_extend(raw, self.v_width)),
        );
        out
    }

    fn fits(&self, _data: &[u8], value: i64) -> bool {
        let (lb, ub) = bits::signed_bounds(self.v_width);
        lb <= value && value <= ub
    }

    fn set(&self, data: &mut [u8], ndx: usize, value: i64) -> Result<()> {
        if !self.fits(data, value) {
            return Err(StrataError::Unsupported("value does not fit packed width"));
        }
        write_bits(data, DATA_BIT + ndx * self.v_width, self.v_width, value as u64);
        Ok(())
    }

    fn bounds(&self, _data: &[u8]) -> (i64, i64) {
        bits::signed_bounds(self.v_width)
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
        self.scan()
            .find_all(data, cond, value, begin, end, base, state)
    }
}
