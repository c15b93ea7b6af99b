use tracing::debug;

use crate::primitives::slab::Allocator;
use crate::storage::node::{Array, NodeType};
use crate::types::{Ref, Result, StrataError};

/// Encodes a count as the odd tagged value inner nodes store.
pub(crate) fn tag(count: usize) -> Result<i64> {
    i64::try_from(count)
        .ok()
        .and_then(|c| c.checked_mul(2))
        .and_then(|c| c.checked_add(1))
        .ok_or(StrataError::Invalid("element count does not fit a tagged slot"))
}

/// Decodes an odd tagged value.
pub(crate) fn untag(value: i64) -> Result<usize> {
    if value & 1 == 0 || value < 0 {
        return Err(StrataError::Corruption("expected a tagged count"));
    }
    Ok((value >> 1) as usize)
}

fn destroy_all(alloc: &mut dyn Allocator, refs: &[(Ref, usize)]) -> Result<()> {
    for &(ref_, _) in refs {
        Array::destroy_deep_ref(alloc, ref_)?;
    }
    Ok(())
}

/// Builds a balanced tree holding `total` elements.
///
/// `create_leaf(alloc, offset, count)` must return a leaf holding elements
/// `[offset, offset + count)`. Leaves are filled to `max_bpnode_size`
/// except the last, and inner nodes are written in compact form: every
/// child but the last holds the same element count. A tree of one leaf is
/// returned as that leaf. On failure every node built so far is freed.
pub fn build(
    alloc: &mut dyn Allocator,
    total: usize,
    max_bpnode_size: usize,
    create_leaf: &mut dyn FnMut(&mut dyn Allocator, usize, usize) -> Result<Array>,
) -> Result<Array> {
    if max_bpnode_size < 2 {
        return Err(StrataError::Invalid("fan-out must be at least 2"));
    }
    let mut level: Vec<(Ref, usize)> = Vec::with_capacity(total / max_bpnode_size + 1);
    let mut offset = 0;
    loop {
        let count = max_bpnode_size.min(total - offset);
        match create_leaf(alloc, offset, count) {
            Ok(leaf) => level.push((leaf.ref_(), count)),
            Err(err) => {
                destroy_all(alloc, &level)?;
                return Err(err);
            }
        }
        offset += count;
        if offset >= total {
            break;
        }
    }

    let leaves = level.len();
    let mut height = 1;
    let mut per_child = max_bpnode_size;
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / max_bpnode_size + 1);
        let mut start = 0;
        while start < level.len() {
            let group = &level[start..(start + max_bpnode_size).min(level.len())];
            let node = inner_node(alloc, per_child, group);
            match node {
                Ok(node) => {
                    next.push((node.ref_(), group.iter().map(|&(_, n)| n).sum()));
                    start += group.len();
                }
                Err(err) => {
                    destroy_all(alloc, &next)?;
                    destroy_all(alloc, &level[start..])?;
                    return Err(err);
                }
            }
        }
        level = next;
        per_child = per_child.saturating_mul(max_bpnode_size);
        height += 1;
    }

    let root = Array::from_ref(alloc, level[0].0)?;
    debug!(total, leaves, height, root = root.ref_().0, "bptree.build.complete");
    Ok(root)
}

fn inner_node(alloc: &mut dyn Allocator, per_child: usize, children: &[(Ref, usize)]) -> Result<Array> {
    let total: usize = children.iter().map(|&(_, n)| n).sum();
    let mut values = Vec::with_capacity(children.len() + 2);
    values.push(tag(per_child)?);
    values.extend(children.iter().map(|&(ref_, _)| ref_.to_value()));
    values.push(tag(total)?);
    Array::create_from(alloc, NodeType::InnerBptreeNode, &values)
}
