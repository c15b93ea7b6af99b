use core::fmt;

use crate::primitives::slab::Allocator;
use crate::storage::node::{Array, Condition, NodeType, ParentSlot, QueryState};
use crate::types::{Ref, Result, StrataError};

use super::ArrayIntNull;

const NANOS_PER_SEC: i32 = 1_000_000_000;
const SECONDS: usize = 0;
const NANOS: usize = 1;

/// A point in time as seconds and nanoseconds since the epoch.
///
/// Both parts carry the same sign. Ordering compares seconds, then nanos.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp {
    seconds: i64,
    nanos: i32,
}

impl Timestamp {
    /// Builds a timestamp, rejecting out-of-range nanos and mixed signs.
    pub fn new(seconds: i64, nanos: i32) -> Result<Self> {
        if nanos.abs() >= NANOS_PER_SEC {
            return Err(StrataError::Invalid("nanoseconds out of range"));
        }
        if (seconds > 0 && nanos < 0) || (seconds < 0 && nanos > 0) {
            return Err(StrataError::Invalid("seconds and nanoseconds differ in sign"));
        }
        Ok(Self { seconds, nanos })
    }

    /// Whole seconds.
    pub fn seconds(self) -> i64 {
        self.seconds
    }

    /// Sub-second part.
    pub fn nanos(self) -> i32 {
        self.nanos
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}:{}", self.seconds, self.nanos)
    }
}

/// Evaluates `element <cond> key` where either side may be null.
///
/// Two nulls are equal, so they satisfy `Equal`, `LessEqual` and
/// `GreaterEqual`. A null against a value only satisfies `NotEqual`.
pub fn eval_nullable(cond: Condition, element: Option<Timestamp>, key: Option<Timestamp>) -> bool {
    match (element, key) {
        (Some(e), Some(k)) => cond.eval(e, k),
        (None, None) => matches!(
            cond,
            Condition::Equal | Condition::LessEqual | Condition::GreaterEqual
        ),
        _ => cond == Condition::NotEqual,
    }
}

/// Timestamps split into a nullable seconds leaf and a nanoseconds leaf.
///
/// The top node holds both refs; its context flag marks the column
/// nullable. A null element has null seconds and zero nanos.
#[derive(Debug)]
pub struct ArrayTimestamp {
    top: Array,
}

impl ArrayTimestamp {
    /// Allocates an empty leaf.
    pub fn create(alloc: &mut dyn Allocator, nullable: bool) -> Result<Self> {
        let seconds = ArrayIntNull::create(alloc)?;
        let nanos = match Array::create_empty(alloc, NodeType::Normal, false) {
            Ok(nanos) => nanos,
            Err(err) => {
                seconds.destroy(alloc)?;
                return Err(err);
            }
        };
        let refs = [seconds.ref_().to_value(), nanos.ref_().to_value()];
        let mut top = match Array::create_from(alloc, NodeType::HasRefs, &refs) {
            Ok(top) => top,
            Err(err) => {
                seconds.destroy(alloc)?;
                nanos.destroy(alloc)?;
                return Err(err);
            }
        };
        top.set_context_flag(alloc, nullable)?;
        Ok(Self { top })
    }

    /// Attaches to the leaf at `ref_`.
    pub fn from_ref(alloc: &dyn Allocator, ref_: Ref) -> Result<Self> {
        let top = Array::from_ref(alloc, ref_)?;
        if !top.has_refs() || top.len() != 2 {
            return Err(StrataError::Corruption("timestamp leaf must hold two refs"));
        }
        Ok(Self { top })
    }

    /// Sets the slot this leaf's ref is stored in.
    pub fn with_parent(mut self, slot: ParentSlot) -> Self {
        self.top.set_parent(Some(slot));
        self
    }

    /// Ref of the top node.
    pub fn ref_(&self) -> Ref {
        self.top.ref_()
    }

    /// Whether the column accepts nulls.
    pub fn is_nullable(&self) -> bool {
        self.top.context_flag()
    }

    fn seconds(&self, alloc: &dyn Allocator) -> Result<ArrayIntNull> {
        let ref_ = self.top.get_as_ref(alloc, SECONDS)?;
        Ok(ArrayIntNull::from_ref(alloc, ref_)?.with_parent(ParentSlot::new(self.top.ref_(), SECONDS)))
    }

    fn nanos(&self, alloc: &dyn Allocator) -> Result<Array> {
        self.top.child(alloc, NANOS)
    }

    /// Number of elements.
    pub fn len(&self, alloc: &dyn Allocator) -> Result<usize> {
        Ok(self.seconds(alloc)?.len())
    }

    /// Returns true when the leaf holds no elements.
    pub fn is_empty(&self, alloc: &dyn Allocator) -> Result<bool> {
        Ok(self.len(alloc)? == 0)
    }

    /// Whether element `ndx` is null.
    pub fn is_null(&self, alloc: &dyn Allocator, ndx: usize) -> Result<bool> {
        self.seconds(alloc)?.is_null(alloc, ndx)
    }

    /// Element `ndx`, or `None` for null.
    pub fn get(&self, alloc: &dyn Allocator, ndx: usize) -> Result<Option<Timestamp>> {
        let Some(seconds) = self.seconds(alloc)?.get(alloc, ndx)? else {
            return Ok(None);
        };
        let nanos = self.nanos(alloc)?.get(alloc, ndx)?;
        let nanos = i32::try_from(nanos).map_err(|_| StrataError::Corruption("nanoseconds out of range"))?;
        Ok(Some(Timestamp { seconds, nanos }))
    }

    fn check_null(&self, value: Option<Timestamp>) -> Result<()> {
        if value.is_none() && !self.is_nullable() {
            return Err(StrataError::NotNullable);
        }
        Ok(())
    }

    /// Overwrites element `ndx`.
    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<Timestamp>) -> Result<()> {
        self.check_null(value)?;
        self.top.copy_on_write(alloc)?;
        self.seconds(alloc)?.set(alloc, ndx, value.map(Timestamp::seconds))?;
        self.nanos(alloc)?
            .set(alloc, ndx, value.map_or(0, |ts| i64::from(ts.nanos)))
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<Timestamp>) -> Result<()> {
        self.check_null(value)?;
        self.top.copy_on_write(alloc)?;
        self.seconds(alloc)?.insert(alloc, ndx, value.map(Timestamp::seconds))?;
        self.nanos(alloc)?
            .insert(alloc, ndx, value.map_or(0, |ts| i64::from(ts.nanos)))
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut dyn Allocator, value: Option<Timestamp>) -> Result<()> {
        let len = self.len(alloc)?;
        self.insert(alloc, len, value)
    }

    /// Removes element `ndx`.
    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        self.top.copy_on_write(alloc)?;
        self.seconds(alloc)?.erase(alloc, ndx)?;
        self.nanos(alloc)?.erase(alloc, ndx)
    }

    /// Drops every element from `new_size` on.
    pub fn truncate(&mut self, alloc: &mut dyn Allocator, new_size: usize) -> Result<()> {
        self.top.copy_on_write(alloc)?;
        self.seconds(alloc)?.truncate(alloc, new_size)?;
        self.nanos(alloc)?.truncate(alloc, new_size)
    }

    /// Reports elements in `[begin, end)` matching `cond` as `base + ndx`.
    ///
    /// Non-null keys are first narrowed on the seconds leaf, then checked
    /// in full. Nulls follow [`eval_nullable`].
    #[allow(clippy::too_many_arguments)]
    pub fn find_all(
        &self,
        alloc: &dyn Allocator,
        cond: Condition,
        value: Option<Timestamp>,
        begin: usize,
        end: usize,
        base: usize,
        state: &mut QueryState,
    ) -> Result<bool> {
        let seconds = self.seconds(alloc)?;
        if begin > end || end > seconds.len() {
            return Err(StrataError::Invalid("range out of bounds"));
        }
        let narrowed = match (value, cond) {
            (Some(key), Condition::Equal | Condition::Less | Condition::LessEqual) => Some((
                if cond == Condition::Equal {
                    Condition::Equal
                } else {
                    Condition::LessEqual
                },
                key,
            )),
            (Some(key), Condition::Greater | Condition::GreaterEqual) => {
                Some((Condition::GreaterEqual, key))
            }
            _ => None,
        };
        let candidates: Vec<usize> = match narrowed {
            Some((wide, key)) => {
                let mut hits = QueryState::new();
                seconds.find_all(alloc, wide, Some(key.seconds), begin, end, 0, &mut hits)?;
                hits.into_matches()
            }
            None => (begin..end).collect(),
        };
        for ndx in candidates {
            if eval_nullable(cond, self.get(alloc, ndx)?, value) && !state.record(base + ndx) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Position of the first element in `[begin, end)` matching `cond`.
    pub fn find_first(
        &self,
        alloc: &dyn Allocator,
        cond: Condition,
        value: Option<Timestamp>,
        begin: usize,
        end: usize,
    ) -> Result<Option<usize>> {
        let mut state = QueryState::with_limit(1);
        self.find_all(alloc, cond, value, begin, end, 0, &mut state)?;
        Ok(state.matches().first().copied())
    }

    /// Frees the top node and both leaves.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> Result<()> {
        self.top.destroy_deep(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StorageOptions;
    use crate::primitives::slab::SlabAlloc;

    fn ts(seconds: i64, nanos: i32) -> Option<Timestamp> {
        Timestamp::new(seconds, nanos).ok()
    }

    #[test]
    fn rejects_bad_parts() {
        assert!(Timestamp::new(1, -1).is_err());
        assert!(Timestamp::new(0, NANOS_PER_SEC).is_err());
        assert!(Timestamp::new(-1, -5).is_ok());
    }

    #[test]
    fn non_nullable_rejects_null() -> Result<()> {
        let mut alloc = SlabAlloc::new(StorageOptions::default().track_allocations(true))?;
        let mut leaf = ArrayTimestamp::create(&mut alloc, false)?;
        leaf.add(&mut alloc, ts(5, 0))?;
        assert!(matches!(leaf.set(&mut alloc, 0, None), Err(StrataError::NotNullable)));
        leaf.destroy(&mut alloc)?;
        assert!(alloc.is_all_free());
        Ok(())
    }

    #[test]
    fn predicates_narrow_by_seconds() -> Result<()> {
        let mut alloc = SlabAlloc::new(StorageOptions::default())?;
        let mut leaf = ArrayTimestamp::create(&mut alloc, true)?;
        let values = [ts(10, 5), None, ts(10, 9), ts(3, 0), ts(-2, -1), None];
        for v in values {
            leaf.add(&mut alloc, v)?;
        }
        let key = ts(10, 5);
        let run = |cond| -> Result<Vec<usize>> {
            let mut state = QueryState::new();
            leaf.find_all(&alloc, cond, key, 0, 6, 0, &mut state)?;
            Ok(state.into_matches())
        };
        assert_eq!(run(Condition::Equal)?, vec![0]);
        assert_eq!(run(Condition::NotEqual)?, vec![1, 2, 3, 4, 5]);
        assert_eq!(run(Condition::Less)?, vec![3, 4]);
        assert_eq!(run(Condition::LessEqual)?, vec![0, 3, 4]);
        assert_eq!(run(Condition::Greater)?, vec![2]);
        assert_eq!(run(Condition::GreaterEqual)?, vec![0, 2]);

        assert_eq!(leaf.find_first(&alloc, Condition::Equal, None, 0, 6)?, Some(1));
        assert_eq!(leaf.find_first(&alloc, Condition::GreaterEqual, None, 2, 6)?, Some(5));
        assert_eq!(leaf.find_first(&alloc, Condition::Less, None, 0, 6)?, None);

        leaf.erase(&mut alloc, 1)?;
        leaf.set(&mut alloc, 0, None)?;
        assert_eq!(leaf.get(&alloc, 0)?, None);
        assert_eq!(leaf.get(&alloc, 3)?, ts(-2, -1));
        leaf.truncate(&mut alloc, 1)?;
        assert_eq!(leaf.len(&alloc)?, 1);
        Ok(())
    }
}
