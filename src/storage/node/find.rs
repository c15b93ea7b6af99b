#![forbid(unsafe_code)]
//! Search conditions and match collection shared by every encoding.

use crate::primitives::bits::{self, FieldCompare, PARALLEL_THRESHOLD};

/// Comparison applied as `element <op> key`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Condition {
    /// `element == key`
    Equal,
    /// `element != key`
    NotEqual,
    /// `element < key`
    Less,
    /// `element > key`
    Greater,
    /// `element <= key`
    LessEqual,
    /// `element >= key`
    GreaterEqual,
}

impl Condition {
    /// Every condition, for exhaustive tests and dispatch tables.
    pub const ALL: [Condition; 6] = [
        Condition::Equal,
        Condition::NotEqual,
        Condition::Less,
        Condition::Greater,
        Condition::LessEqual,
        Condition::GreaterEqual,
    ];

    /// Evaluates the condition on one pair.
    pub fn eval<T: PartialOrd>(self, element: T, key: T) -> bool {
        match self {
            Condition::Equal => element == key,
            Condition::NotEqual => element != key,
            Condition::Less => element < key,
            Condition::Greater => element > key,
            Condition::LessEqual => element <= key,
            Condition::GreaterEqual => element >= key,
        }
    }

    /// False when no element in `[lbound, ubound]` can satisfy the condition.
    pub fn can_match(self, key: i64, lbound: i64, ubound: i64) -> bool {
        match self {
            Condition::Equal => lbound <= key && key <= ubound,
            Condition::NotEqual => !(lbound == key && ubound == key),
            Condition::Less => key > lbound,
            Condition::Greater => key < ubound,
            Condition::LessEqual => key >= lbound,
            Condition::GreaterEqual => key <= ubound,
        }
    }

    /// True when every element in `[lbound, ubound]` satisfies the condition.
    pub fn will_match(self, key: i64, lbound: i64, ubound: i64) -> bool {
        match self {
            Condition::Equal => lbound == key && ubound == key,
            Condition::NotEqual => key < lbound || key > ubound,
            Condition::Less => key > ubound,
            Condition::Greater => key < lbound,
            Condition::LessEqual => key >= ubound,
            Condition::GreaterEqual => key <= lbound,
        }
    }

    /// Per-field comparison for the sub-word scan.
    pub fn field_compare(self, signed: bool) -> FieldCompare {
        match (self, signed) {
            (Condition::Equal, _) => bits::eq_fields,
            (Condition::NotEqual, _) => bits::ne_fields,
            (Condition::Less, false) => bits::unsigned_lt_fields,
            (Condition::Greater, false) => bits::unsigned_gt_fields,
            (Condition::LessEqual, false) => bits::unsigned_le_fields,
            (Condition::GreaterEqual, false) => bits::unsigned_ge_fields,
            (Condition::Less, true) => bits::signed_lt_fields,
            (Condition::Greater, true) => bits::signed_gt_fields,
            (Condition::LessEqual, true) => bits::signed_le_fields,
            (Condition::GreaterEqual, true) => bits::signed_ge_fields,
        }
    }

    /// Whether a scan of `range` fields of `width` bits should go word-parallel.
    pub fn use_parallel(self, width: usize, range: usize) -> bool {
        if range < PARALLEL_THRESHOLD || width == 0 {
            return false;
        }
        match self {
            Condition::Equal | Condition::NotEqual => width < 32,
            _ => width <= 16,
        }
    }
}

/// Collects match indices, optionally stopping after a limit.
#[derive(Clone, Debug, Default)]
pub struct QueryState {
    matches: Vec<usize>,
    limit: Option<usize>,
}

impl QueryState {
    /// Collects every match.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops once `limit` matches are recorded.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            matches: Vec::new(),
            limit: Some(limit.max(1)),
        }
    }

    /// Records a match; returns false once the limit is reached.
    pub fn record(&mut self, ndx: usize) -> bool {
        self.matches.push(ndx);
        self.limit.map_or(true, |limit| self.matches.len() < limit)
    }

    /// Matches recorded so far.
    pub fn matches(&self) -> &[usize] {
        &self.matches
    }

    /// Consumes the state, returning its matches.
    pub fn into_matches(self) -> Vec<usize> {
        self.matches
    }

    /// Number of matches recorded.
    pub fn match_count(&self) -> usize {
        self.matches.len()
    }
}

/// Parameters of a scan over one bit-packed field run.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FieldScan {
    /// Bit position of field 0.
    pub bit_offset: usize,
    /// Field width in bits.
    pub width: usize,
    /// Fields are two's complement.
    pub signed: bool,
    /// Smallest value any field can decode to.
    pub lbound: i64,
    /// Largest value any field can decode to.
    pub ubound: i64,
}

impl FieldScan {
    fn decode(&self, raw: u64) -> i64 {
        if self.signed {
            bits::sign_extend(raw, self.width)
        } else {
            raw as i64
        }
    }

    /// Reports every field in `[begin, end)` matching `cond` against `key`.
    ///
    /// `key` is compared in the decoded domain. Returns false if `state`
    /// asked to stop.
    #[allow(clippy::too_many_arguments)]
    pub fn find_all(
        &self,
        data: &[u8],
        cond: Condition,
        key: i64,
        begin: usize,
        end: usize,
        base: usize,
        state: &mut QueryState,
    ) -> bool {
        if begin >= end || !cond.can_match(key, self.lbound, self.ubound) {
            return true;
        }
        if cond.will_match(key, self.lbound, self.ubound) {
            return (begin..end).all(|ndx| state.record(base + ndx));
        }
        if cond.use_parallel(self.width, end - begin) {
            let search = (key as u64) & bits::lower_bits(self.width);
            return bits::parallel_subword_find(
                data,
                self.bit_offset,
                self.width,
                begin,
                end,
                search,
                cond.field_compare(self.signed),
                |ndx| state.record(base + ndx),
            );
        }
        for ndx in begin..end {
            let raw = bits::read_bits(data, self.bit_offset + ndx * self.width, self.width);
            if cond.eval(self.decode(raw), key) && !state.record(base + ndx) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_shortcuts_agree_with_eval() {
        let (lb, ub) = (-4i64, 9i64);
        for cond in Condition::ALL {
            for key in -7..12 {
                let results: Vec<bool> = (lb..=ub).map(|v| cond.eval(v, key)).collect();
                if !cond.can_match(key, lb, ub) {
                    assert!(results.iter().all(|r| !r), "{cond:?} {key}");
                }
                if cond.will_match(key, lb, ub) {
                    assert!(results.iter().all(|r| *r), "{cond:?} {key}");
                }
            }
        }
    }

    #[test]
    fn query_state_limit_stops_collection() {
        let mut state = QueryState::with_limit(2);
        assert!(state.record(4));
        assert!(!state.record(9));
        assert_eq!(state.matches(), &[4, 9]);
        let mut open = QueryState::new();
        assert!((0..100).all(|i| open.record(i)));
        assert_eq!(open.match_count(), 100);
    }

    #[test]
    fn field_scan_matches_naive_scan_across_threshold() {
        let width = 5usize;
        for len in [0usize, 1, 19, 20, 21, 64] {
            let values: Vec<i64> = (0..len as i64).map(|i| (i * 7) % 31 - 15).collect();
            let mut data = vec![0u8; (len * width).div_ceil(8) + 8];
            for (i, v) in values.iter().enumerate() {
                bits::write_bits(&mut data, i * width, width, *v as u64);
            }
            let scan = FieldScan {
                bit_offset: 0,
                width,
                signed: true,
                lbound: -16,
                ubound: 15,
            };
            for cond in Condition::ALL {
                for key in [-16, -3, 0, 6, 15] {
                    let mut state = QueryState::new();
                    assert!(scan.find_all(&data, cond, key, 0, len, 100, &mut state));
                    let expected: Vec<usize> = values
                        .iter()
                        .enumerate()
                        .filter(|(_, v)| cond.eval(**v, key))
                        .map(|(i, _)| i + 100)
                        .collect();
                    assert_eq!(state.into_matches(), expected, "{cond:?} {key} len {len}");
                }
            }
        }
    }
}
