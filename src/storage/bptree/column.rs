use smallvec::SmallVec;
use tracing::debug;

use crate::primitives::slab::Allocator;
use crate::storage::node::{Array, Condition, NodeType, ParentSlot, QueryState};
use crate::types::{Ref, Result, StrataError};

use super::build::{build, tag, untag};
use super::stats::{BptreeStats, BptreeStatsSnapshot};

/// Callback invoked per leaf with the leaf and the index of its first element.
/// Returning false stops the walk.
pub type LeafVisitor<'v> = dyn FnMut(&Array, usize) -> Result<bool> + 'v;

/// Child indices from the root down to a leaf.
type Path = SmallVec<[usize; 8]>;

struct Split {
    right: Ref,
    left_len: usize,
    right_len: usize,
}

/// A sequence of integers stored as a B+-tree of plain leaves.
///
/// Inner nodes hold an offsets slot, the child refs and a tagged element
/// count. The offsets slot is either a tagged per-child count (compact
/// form, every child but the last equally full) or the ref of a plain array
/// of cumulative child ends for all children but the last (general form).
/// Structural edits always rewrite a node in general form.
#[derive(Debug)]
pub struct IntegerColumn {
    root: Array,
    max_bpnode_size: usize,
    stats: BptreeStats,
}

impl IntegerColumn {
    fn check_fan_out(max_bpnode_size: usize) -> Result<()> {
        if max_bpnode_size < 2 {
            return Err(StrataError::Invalid("fan-out must be at least 2"));
        }
        Ok(())
    }

    fn with_root(root: Array, max_bpnode_size: usize) -> Self {
        Self {
            root,
            max_bpnode_size,
            stats: BptreeStats::default(),
        }
    }

    /// Allocates an empty column with the fan-out from the allocator options.
    pub fn create(alloc: &mut dyn Allocator) -> Result<Self> {
        let max_bpnode_size = alloc.options().max_bpnode_size;
        Self::create_with_fan_out(alloc, max_bpnode_size)
    }

    /// Allocates an empty column with an explicit fan-out.
    pub fn create_with_fan_out(alloc: &mut dyn Allocator, max_bpnode_size: usize) -> Result<Self> {
        Self::check_fan_out(max_bpnode_size)?;
        let root = Array::create_empty(alloc, NodeType::Normal, false)?;
        Ok(Self::with_root(root, max_bpnode_size))
    }

    /// Builds a balanced column holding `values`.
    pub fn build(alloc: &mut dyn Allocator, values: &[i64]) -> Result<Self> {
        let max_bpnode_size = alloc.options().max_bpnode_size;
        Self::build_with_fan_out(alloc, values, max_bpnode_size)
    }

    /// [`IntegerColumn::build`] with an explicit fan-out.
    pub fn build_with_fan_out(
        alloc: &mut dyn Allocator,
        values: &[i64],
        max_bpnode_size: usize,
    ) -> Result<Self> {
        let root = build(
            alloc,
            values.len(),
            max_bpnode_size,
            &mut |alloc: &mut dyn Allocator, offset, count| {
                Array::create_from(alloc, NodeType::Normal, &values[offset..offset + count])
            },
        )?;
        Ok(Self::with_root(root, max_bpnode_size))
    }

    /// Builds a balanced column of `total` copies of `value`.
    pub fn filled(alloc: &mut dyn Allocator, total: usize, value: i64) -> Result<Self> {
        let max_bpnode_size = alloc.options().max_bpnode_size;
        Self::filled_with_fan_out(alloc, total, value, max_bpnode_size)
    }

    /// [`IntegerColumn::filled`] with an explicit fan-out.
    pub fn filled_with_fan_out(
        alloc: &mut dyn Allocator,
        total: usize,
        value: i64,
        max_bpnode_size: usize,
    ) -> Result<Self> {
        let root = build(
            alloc,
            total,
            max_bpnode_size,
            &mut |alloc: &mut dyn Allocator, _, count| {
                Array::create(alloc, NodeType::Normal, false, count, value)
            },
        )?;
        Ok(Self::with_root(root, max_bpnode_size))
    }

    /// Attaches to the column rooted at `ref_`, splitting nodes at the
    /// fan-out from the allocator options.
    pub fn from_ref(alloc: &dyn Allocator, ref_: Ref) -> Result<Self> {
        Self::from_ref_with_fan_out(alloc, ref_, alloc.options().max_bpnode_size)
    }

    /// [`IntegerColumn::from_ref`] with an explicit fan-out.
    pub fn from_ref_with_fan_out(
        alloc: &dyn Allocator,
        ref_: Ref,
        max_bpnode_size: usize,
    ) -> Result<Self> {
        Self::check_fan_out(max_bpnode_size)?;
        let root = Array::from_ref(alloc, ref_)?;
        if root.has_refs() && !root.is_inner_bptree_node() {
            return Err(StrataError::Corruption("column root is neither a leaf nor an inner node"));
        }
        Ok(Self::with_root(root, max_bpnode_size))
    }

    /// Sets the slot the root ref is stored in.
    pub fn with_parent(mut self, slot: ParentSlot) -> Self {
        self.root.set_parent(Some(slot));
        self
    }

    /// Ref of the root node.
    pub fn ref_(&self) -> Ref {
        self.root.ref_()
    }

    /// Whether the whole column fits in one leaf.
    pub fn is_leaf(&self) -> bool {
        !self.root.is_inner_bptree_node()
    }

    /// Structural edit counters.
    pub fn stats(&self) -> BptreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of elements.
    pub fn len(&self, alloc: &dyn Allocator) -> Result<usize> {
        node_len(alloc, &self.root)
    }

    /// Returns true when the column holds no elements.
    pub fn is_empty(&self, alloc: &dyn Allocator) -> Result<bool> {
        Ok(self.len(alloc)? == 0)
    }

    fn descend(&self, alloc: &dyn Allocator, ndx: usize) -> Result<(Array, usize, Path)> {
        let mut path = Path::new();
        let (i, mut local) = locate_child(alloc, &self.root, ndx)?;
        path.push(i);
        let mut node = self.root.child(alloc, i + 1)?;
        while node.is_inner_bptree_node() {
            let (i, next) = locate_child(alloc, &node, local)?;
            path.push(i);
            node = node.child(alloc, i + 1)?;
            local = next;
        }
        Ok((node, local, path))
    }

    /// Element `ndx`.
    pub fn get(&self, alloc: &dyn Allocator, ndx: usize) -> Result<i64> {
        if self.is_leaf() {
            return self.root.get(alloc, ndx);
        }
        let (leaf, local, _) = self.descend(alloc, ndx)?;
        leaf.get(alloc, local)
    }

    /// Overwrites element `ndx`, copying every node on the path first.
    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: i64) -> Result<()> {
        if self.is_leaf() {
            return self.root.set(alloc, ndx, value);
        }
        let (_, local, path) = self.descend(alloc, ndx)?;
        self.root.copy_on_write(alloc)?;
        let mut node = self.root.child(alloc, path[0] + 1)?;
        for &i in &path[1..] {
            node.copy_on_write(alloc)?;
            node = node.child(alloc, i + 1)?;
        }
        node.set(alloc, local, value)
    }

    /// Inserts `value` before element `ndx`, splitting full nodes.
    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: i64) -> Result<()> {
        if ndx > self.len(alloc)? {
            return Err(StrataError::Invalid("insert position out of range"));
        }
        let max = self.max_bpnode_size;
        let Some(split) = insert_in(alloc, &mut self.root, ndx, value, max, &self.stats)? else {
            return Ok(());
        };
        let offsets = Array::create_from(alloc, NodeType::Normal, &[to_value(split.left_len)?])?;
        let values = [
            offsets.ref_().to_value(),
            self.root.ref_().to_value(),
            split.right.to_value(),
            tag(split.left_len + split.right_len)?,
        ];
        let mut root = match Array::create_from(alloc, NodeType::InnerBptreeNode, &values) {
            Ok(root) => root,
            Err(err) => {
                offsets.destroy(alloc)?;
                return Err(err);
            }
        };
        root.set_parent(self.root.parent());
        root.update_parent(alloc)?;
        self.root = root;
        self.stats.inc_root_grows();
        debug!(
            root = self.root.ref_().0,
            len = split.left_len + split.right_len,
            "bptree.root.grow"
        );
        Ok(())
    }

    /// Appends `value`.
    pub fn push(&mut self, alloc: &mut dyn Allocator, value: i64) -> Result<()> {
        let len = self.len(alloc)?;
        self.insert(alloc, len, value)
    }

    /// Removes element `ndx`, dropping emptied nodes and collapsing a
    /// single-child root.
    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        if ndx >= self.len(alloc)? {
            return Err(StrataError::Invalid("index out of range"));
        }
        let emptied = erase_in(alloc, &mut self.root, ndx, &self.stats)?;
        if emptied && !self.is_leaf() {
            let mut leaf = Array::create_empty(alloc, NodeType::Normal, false)?;
            leaf.set_parent(self.root.parent());
            leaf.update_parent(alloc)?;
            let old = std::mem::replace(&mut self.root, leaf);
            old.destroy_deep(alloc)?;
        }
        while !self.is_leaf() && self.root.len() == 3 {
            let mut child = self.root.child(alloc, 1)?;
            child.set_parent(self.root.parent());
            let offsets = self.root.get(alloc, 0)?;
            if Ref::is_valid_child(offsets) {
                Array::destroy_deep_ref(alloc, Ref::from_value(offsets))?;
            }
            let old = std::mem::replace(&mut self.root, child);
            old.destroy(alloc)?;
            self.root.update_parent(alloc)?;
            self.stats.inc_root_collapses();
            debug!(root = self.root.ref_().0, "bptree.root.collapse");
        }
        Ok(())
    }

    /// Visits every leaf in order. Returns false if `visit` stopped early.
    pub fn for_each_leaf(&self, alloc: &dyn Allocator, visit: &mut LeafVisitor<'_>) -> Result<bool> {
        walk(alloc, &self.root, 0, 0, usize::MAX, visit)
    }

    /// Reports elements in `[begin, end)` matching `cond` by column index.
    ///
    /// Returns false when `state` reached its limit.
    pub fn find_all(
        &self,
        alloc: &dyn Allocator,
        cond: Condition,
        value: i64,
        begin: usize,
        end: usize,
        state: &mut QueryState,
    ) -> Result<bool> {
        if begin > end || end > self.len(alloc)? {
            return Err(StrataError::Invalid("range out of bounds"));
        }
        if begin == end {
            return Ok(true);
        }
        walk(alloc, &self.root, 0, begin, end, &mut |leaf, start| {
            let from = begin.max(start) - start;
            let to = end.min(start + leaf.len()) - start;
            leaf.find_all(alloc, cond, value, from, to, start, state)
        })
    }

    /// Index of the first element in `[begin, end)` matching `cond`.
    pub fn find_first(
        &self,
        alloc: &dyn Allocator,
        cond: Condition,
        value: i64,
        begin: usize,
        end: usize,
    ) -> Result<Option<usize>> {
        let mut state = QueryState::with_limit(1);
        self.find_all(alloc, cond, value, begin, end, &mut state)?;
        Ok(state.matches().first().copied())
    }

    /// Copies every element out in order.
    pub fn to_vec(&self, alloc: &dyn Allocator) -> Result<Vec<i64>> {
        let mut out = Vec::with_capacity(self.len(alloc)?);
        self.for_each_leaf(alloc, &mut |leaf, _| {
            out.extend(leaf.get_all(alloc, 0, leaf.len())?);
            Ok(true)
        })?;
        Ok(out)
    }

    /// Checks node headers, fan-out and that every inner count matches the
    /// leaves below it. Returns the element count.
    pub fn verify_tree(&self, alloc: &dyn Allocator) -> Result<usize> {
        verify_node(alloc, &self.root, self.max_bpnode_size)
    }

    /// Frees every node of the column.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> Result<()> {
        self.root.destroy_deep(alloc)
    }
}

fn to_value(n: usize) -> Result<i64> {
    i64::try_from(n).map_err(|_| StrataError::Invalid("element count exceeds i64"))
}

fn node_len(alloc: &dyn Allocator, node: &Array) -> Result<usize> {
    if node.is_inner_bptree_node() {
        untag(node.back(alloc)?)
    } else {
        Ok(node.len())
    }
}

fn child_count(node: &Array) -> Result<usize> {
    node.len()
        .checked_sub(2)
        .filter(|&n| n > 0)
        .ok_or(StrataError::Corruption("inner node without children"))
}

/// Child holding element `ndx` and the index within that child.
fn locate_child(alloc: &dyn Allocator, node: &Array, ndx: usize) -> Result<(usize, usize)> {
    let n = child_count(node)?;
    let first = node.get(alloc, 0)?;
    if first & 1 != 0 {
        let per_child = untag(first)?;
        if per_child == 0 {
            return Err(StrataError::Corruption("compact inner node with empty children"));
        }
        let i = (ndx / per_child).min(n - 1);
        return Ok((i, ndx - i * per_child));
    }
    let offsets = node.child(alloc, 0)?;
    let i = offsets.upper_bound(alloc, to_value(ndx)?)?.min(n - 1);
    let start = match i {
        0 => 0,
        _ => untagged_offset(offsets.get(alloc, i - 1)?)?,
    };
    Ok((i, ndx - start))
}

fn untagged_offset(value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| StrataError::Corruption("negative child offset"))
}

fn child_sizes(alloc: &dyn Allocator, node: &Array) -> Result<Vec<usize>> {
    let n = child_count(node)?;
    let total = untag(node.back(alloc)?)?;
    let first = node.get(alloc, 0)?;
    let mut sizes = Vec::with_capacity(n);
    if first & 1 != 0 {
        let per_child = untag(first)?;
        sizes.resize(n - 1, per_child);
    } else {
        let offsets = node.child(alloc, 0)?;
        if offsets.len() != n - 1 {
            return Err(StrataError::Corruption("offsets disagree with child count"));
        }
        let mut prev = 0;
        for end in offsets.get_all(alloc, 0, n - 1)? {
            let end = untagged_offset(end)?;
            sizes.push(
                end.checked_sub(prev)
                    .ok_or(StrataError::Corruption("child offsets are not ascending"))?,
            );
            prev = end;
        }
    }
    let used: usize = sizes.iter().sum();
    sizes.push(
        total
            .checked_sub(used)
            .ok_or(StrataError::Corruption("inner count smaller than its children"))?,
    );
    Ok(sizes)
}

fn cumulative_ends(sizes: &[usize]) -> Result<Vec<i64>> {
    let mut end = 0;
    sizes[..sizes.len() - 1]
        .iter()
        .map(|&size| {
            end += size;
            to_value(end)
        })
        .collect()
}

/// Rewrites a compact inner node with an offsets array.
fn to_general(alloc: &mut dyn Allocator, node: &mut Array, stats: &BptreeStats) -> Result<()> {
    if node.get(alloc, 0)? & 1 == 0 {
        return Ok(());
    }
    let sizes = child_sizes(alloc, node)?;
    let offsets = Array::create_from(alloc, NodeType::Normal, &cumulative_ends(&sizes)?)?;
    if let Err(err) = node.set_as_ref(alloc, 0, offsets.ref_()) {
        offsets.destroy(alloc)?;
        return Err(err);
    }
    stats.inc_compact_conversions();
    Ok(())
}

/// Stores `sizes` into a general-form inner node.
fn write_sizes(alloc: &mut dyn Allocator, node: &mut Array, sizes: &[usize]) -> Result<()> {
    let mut offsets = node.child(alloc, 0)?;
    offsets.clear(alloc)?;
    for end in cumulative_ends(sizes)? {
        offsets.add(alloc, end)?;
    }
    let last = node.len() - 1;
    node.set(alloc, last, tag(sizes.iter().sum())?)
}

/// Allocates a general-form inner node over `children` with the given sizes.
/// Nothing stays allocated when this fails.
pub(super) fn create_inner(
    alloc: &mut dyn Allocator,
    sizes: &[usize],
    children: &[i64],
) -> Result<Array> {
    let ends = cumulative_ends(sizes)?;
    let total = tag(sizes.iter().sum())?;
    let offsets = Array::create_from(alloc, NodeType::Normal, &ends)?;
    let mut values = Vec::with_capacity(children.len() + 2);
    values.push(offsets.ref_().to_value());
    values.extend_from_slice(children);
    values.push(total);
    match Array::create_from(alloc, NodeType::InnerBptreeNode, &values) {
        Ok(node) => Ok(node),
        Err(err) => {
            offsets.destroy(alloc)?;
            Err(err)
        }
    }
}

fn insert_in(
    alloc: &mut dyn Allocator,
    node: &mut Array,
    ndx: usize,
    value: i64,
    max: usize,
    stats: &BptreeStats,
) -> Result<Option<Split>> {
    node.copy_on_write(alloc)?;
    if !node.is_inner_bptree_node() {
        let size = node.len();
        if size < max {
            node.insert(alloc, ndx, value)?;
            return Ok(None);
        }
        let right = if ndx == size {
            Array::create_from(alloc, NodeType::Normal, &[value])?
        } else {
            let moved = node.get_all(alloc, ndx, size)?;
            let right = Array::create_from(alloc, NodeType::Normal, &moved)?;
            node.truncate(alloc, ndx)?;
            node.add(alloc, value)?;
            right
        };
        stats.inc_leaf_splits();
        return Ok(Some(Split {
            right: right.ref_(),
            left_len: node.len(),
            right_len: right.len(),
        }));
    }

    to_general(alloc, node, stats)?;
    let (i, local) = locate_child(alloc, node, ndx)?;
    let mut sizes = child_sizes(alloc, node)?;
    let mut child = node.child(alloc, i + 1)?;
    match insert_in(alloc, &mut child, local, value, max, stats)? {
        None => sizes[i] += 1,
        Some(split) => {
            sizes[i] = split.left_len;
            sizes.insert(i + 1, split.right_len);
            node.insert(alloc, i + 2, split.right.to_value())?;
        }
    }
    if sizes.len() <= max {
        write_sizes(alloc, node, &sizes)?;
        return Ok(None);
    }

    // Appends leave the left node full and start a fresh right node.
    let count = sizes.len();
    let mid = if i + 2 == count { count - 1 } else { count / 2 };
    let moved = node.get_all(alloc, 1 + mid, 1 + count)?;
    let right = match create_inner(alloc, &sizes[mid..], &moved) {
        Ok(right) => right,
        Err(err) => {
            // Keep the extra child; the next insert below this node splits it.
            write_sizes(alloc, node, &sizes)?;
            return Err(err);
        }
    };
    let right_sizes = sizes.split_off(mid);
    node.erase_range(alloc, 1 + mid, 1 + count)?;
    write_sizes(alloc, node, &sizes)?;
    stats.inc_inner_splits();
    Ok(Some(Split {
        right: right.ref_(),
        left_len: sizes.iter().sum(),
        right_len: right_sizes.iter().sum(),
    }))
}

/// Removes element `ndx` below `node`. Returns true when `node` is left empty.
fn erase_in(alloc: &mut dyn Allocator, node: &mut Array, ndx: usize, stats: &BptreeStats) -> Result<bool> {
    if !node.is_inner_bptree_node() {
        node.erase(alloc, ndx)?;
        return Ok(node.is_empty());
    }
    node.copy_on_write(alloc)?;
    to_general(alloc, node, stats)?;
    let (i, local) = locate_child(alloc, node, ndx)?;
    let mut sizes = child_sizes(alloc, node)?;
    let mut child = node.child(alloc, i + 1)?;
    if erase_in(alloc, &mut child, local, stats)? {
        child.destroy_deep(alloc)?;
        node.erase(alloc, i + 1)?;
        sizes.remove(i);
        stats.inc_node_removals();
        if sizes.is_empty() {
            return Ok(true);
        }
    } else {
        sizes[i] -= 1;
    }
    write_sizes(alloc, node, &sizes)?;
    Ok(false)
}

/// Visits the leaves below `node` that overlap `[begin, end)`.
fn walk(
    alloc: &dyn Allocator,
    node: &Array,
    offset: usize,
    begin: usize,
    end: usize,
    visit: &mut LeafVisitor<'_>,
) -> Result<bool> {
    if !node.is_inner_bptree_node() {
        return visit(node, offset);
    }
    let mut start = offset;
    for (i, size) in child_sizes(alloc, node)?.into_iter().enumerate() {
        if start >= end {
            break;
        }
        if start + size > begin {
            let child = node.child(alloc, i + 1)?;
            if !walk(alloc, &child, start, begin, end, visit)? {
                return Ok(false);
            }
        }
        start += size;
    }
    Ok(true)
}

fn verify_node(alloc: &dyn Allocator, node: &Array, max: usize) -> Result<usize> {
    node.verify(alloc)?;
    if !node.is_inner_bptree_node() {
        if node.has_refs() {
            return Err(StrataError::Corruption("column leaf holds refs"));
        }
        if node.len() > max {
            return Err(StrataError::Corruption("leaf exceeds the fan-out"));
        }
        return Ok(node.len());
    }
    if !node.has_refs() {
        return Err(StrataError::Corruption("inner node without refs"));
    }
    let sizes = child_sizes(alloc, node)?;
    if sizes.len() > max {
        return Err(StrataError::Corruption("inner node exceeds the fan-out"));
    }
    for (i, &expected) in sizes.iter().enumerate() {
        let child = node.child(alloc, i + 1)?;
        let actual = verify_node(alloc, &child, max)?;
        if actual != expected {
            return Err(StrataError::Corruption("inner count disagrees with its child"));
        }
        if actual == 0 {
            return Err(StrataError::Corruption("empty child below an inner node"));
        }
    }
    Ok(sizes.iter().sum())
}
