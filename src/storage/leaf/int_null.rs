use tracing::debug;

use crate::primitives::slab::Allocator;
use crate::storage::node::{bit_width, width_bounds, Array, Condition, NodeType, ParentSlot, QueryState};
use crate::types::{Ref, Result, StrataError};

/// Nullable integers on a plain node whose slot 0 holds the null sentinel.
///
/// Element `i` lives in slot `i + 1`. The sentinel is the upper bound of the
/// node's width while that is below 64 bits; at 64 bits it is any value no
/// element holds. Storing a value that collides with the sentinel picks a
/// new one and rewrites every null.
#[derive(Debug)]
pub struct ArrayIntNull {
    arr: Array,
}

impl ArrayIntNull {
    /// Allocates an empty leaf.
    pub fn create(alloc: &mut dyn Allocator) -> Result<Self> {
        Ok(Self {
            arr: Array::create_from(alloc, NodeType::Normal, &[0])?,
        })
    }

    /// Attaches to the leaf at `ref_`.
    pub fn from_ref(alloc: &dyn Allocator, ref_: Ref) -> Result<Self> {
        let arr = Array::from_ref(alloc, ref_)?;
        if arr.is_empty() || arr.has_refs() {
            return Err(StrataError::Corruption("nullable integer leaf lacks its sentinel"));
        }
        Ok(Self { arr })
    }

    /// Sets the slot this leaf's ref is stored in.
    pub fn with_parent(mut self, slot: ParentSlot) -> Self {
        self.arr.set_parent(Some(slot));
        self
    }

    /// Ref of the leaf node.
    pub fn ref_(&self) -> Ref {
        self.arr.ref_()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.arr.len() - 1
    }

    /// Returns true when the leaf holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current null sentinel.
    pub fn null_value(&self, alloc: &dyn Allocator) -> Result<i64> {
        self.arr.get(alloc, 0)
    }

    /// Whether element `ndx` is null.
    pub fn is_null(&self, alloc: &dyn Allocator, ndx: usize) -> Result<bool> {
        Ok(self.get(alloc, ndx)?.is_none())
    }

    /// Element `ndx`, or `None` for null.
    pub fn get(&self, alloc: &dyn Allocator, ndx: usize) -> Result<Option<i64>> {
        let v = self.arr.get(alloc, ndx + 1)?;
        Ok((v != self.null_value(alloc)?).then_some(v))
    }

    /// Overwrites element `ndx`.
    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<i64>) -> Result<()> {
        if ndx >= self.len() {
            return Err(StrataError::Invalid("index out of range"));
        }
        let stored = self.prepare(alloc, value)?;
        self.arr.set(alloc, ndx + 1, stored)
    }

    /// Marks element `ndx` null.
    pub fn set_null(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        self.set(alloc, ndx, None)
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<i64>) -> Result<()> {
        if ndx > self.len() {
            return Err(StrataError::Invalid("insert position out of range"));
        }
        let stored = self.prepare(alloc, value)?;
        self.arr.insert(alloc, ndx + 1, stored)
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut dyn Allocator, value: Option<i64>) -> Result<()> {
        self.insert(alloc, self.len(), value)
    }

    /// Removes element `ndx`.
    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        if ndx >= self.len() {
            return Err(StrataError::Invalid("index out of range"));
        }
        self.arr.erase(alloc, ndx + 1)
    }

    /// Drops every element from `new_size` on.
    pub fn truncate(&mut self, alloc: &mut dyn Allocator, new_size: usize) -> Result<()> {
        self.arr.truncate(alloc, new_size + 1)
    }

    /// Every element in `[begin, end)`.
    pub fn get_all(&self, alloc: &dyn Allocator, begin: usize, end: usize) -> Result<Vec<Option<i64>>> {
        let null = self.null_value(alloc)?;
        Ok(self
            .arr
            .get_all(alloc, begin + 1, end + 1)?
            .into_iter()
            .map(|v| (v != null).then_some(v))
            .collect())
    }

    /// Reports elements in `[begin, end)` matching `cond` as `base + ndx`.
    ///
    /// A null key matches nulls under `Equal` and non-nulls under
    /// `NotEqual`; under ordering conditions it matches nothing. Null
    /// elements never match a non-null key.
    #[allow(clippy::too_many_arguments)]
    pub fn find_all(
        &self,
        alloc: &dyn Allocator,
        cond: Condition,
        value: Option<i64>,
        begin: usize,
        end: usize,
        base: usize,
        state: &mut QueryState,
    ) -> Result<bool> {
        if begin > end || end > self.len() {
            return Err(StrataError::Invalid("range out of bounds"));
        }
        let null = self.null_value(alloc)?;
        let (cond, key, keep_nulls) = match value {
            None => match cond {
                Condition::Equal => (Condition::Equal, null, true),
                Condition::NotEqual => (Condition::NotEqual, null, false),
                _ => return Ok(true),
            },
            Some(v) => (cond, v, false),
        };
        let mut hits = QueryState::new();
        self.arr
            .find_all(alloc, cond, key, begin + 1, end + 1, 0, &mut hits)?;
        for ndx in hits.into_matches() {
            if !keep_nulls && self.arr.get(alloc, ndx)? == null {
                continue;
            }
            if !state.record(base + ndx - 1) {
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
        value: Option<i64>,
        begin: usize,
        end: usize,
    ) -> Result<Option<usize>> {
        let mut state = QueryState::with_limit(1);
        self.find_all(alloc, cond, value, begin, end, 0, &mut state)?;
        Ok(state.matches().first().copied())
    }

    /// Frees the leaf.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> Result<()> {
        self.arr.destroy(alloc)
    }

    /// Returns the raw value to store for `value`, moving the sentinel first
    /// if `value` would collide with it.
    fn prepare(&mut self, alloc: &mut dyn Allocator, value: Option<i64>) -> Result<i64> {
        let null = self.null_value(alloc)?;
        let Some(v) = value else {
            return Ok(null);
        };
        if self.arr.is_compressed() {
            self.arr.decompress(alloc)?;
        }
        let width = self.arr.width();
        if width == 64 {
            if v == null {
                let fresh = self.pick_free_null(alloc, v)?;
                self.replace_nulls(alloc, null, fresh)?;
            }
            return Ok(v);
        }
        let (lbound, ubound) = self.arr.bounds();
        if v >= lbound && v < ubound {
            return Ok(v);
        }
        let mut new_width = width.max(bit_width(v));
        if new_width < 64 && v == width_bounds(new_width).1 {
            new_width = if new_width == 0 { 1 } else { new_width * 2 };
        }
        let fresh = if new_width == 64 {
            self.pick_free_null(alloc, v)?
        } else {
            width_bounds(new_width).1
        };
        self.replace_nulls(alloc, null, fresh)?;
        Ok(v)
    }

    fn pick_free_null(&self, alloc: &dyn Allocator, incoming: i64) -> Result<i64> {
        let null = self.null_value(alloc)?;
        let mut used: Vec<i64> = self
            .arr
            .get_all(alloc, 1, self.arr.len())?
            .into_iter()
            .filter(|&v| v != null)
            .collect();
        used.push(incoming);
        used.sort_unstable();
        let taken = |c: i64| used.binary_search(&c).is_ok();
        let (min, max) = (used[0], used[used.len() - 1]);
        let candidates = [
            Some(i64::MAX),
            Some(i64::MIN),
            max.checked_add(1),
            min.checked_sub(1),
        ];
        if let Some(c) = candidates.into_iter().flatten().find(|&c| !taken(c)) {
            return Ok(c);
        }
        // Fewer elements than the domain, so a gap exists between neighbours.
        used.windows(2)
            .find(|w| w[1] - w[0] > 1)
            .map(|w| w[0] + 1)
            .ok_or(StrataError::Corruption("no free null sentinel"))
    }

    fn replace_nulls(&mut self, alloc: &mut dyn Allocator, old: i64, fresh: i64) -> Result<()> {
        let nulls: Vec<usize> = self
            .arr
            .get_all(alloc, 1, self.arr.len())?
            .into_iter()
            .enumerate()
            .filter(|&(_, v)| v == old)
            .map(|(i, _)| i + 1)
            .collect();
        self.arr.set(alloc, 0, fresh)?;
        for ndx in &nulls {
            self.arr.set(alloc, *ndx, fresh)?;
        }
        debug!(old, fresh, nulls = nulls.len(), "int_null.sentinel_moved");
        Ok(())
    }
}
