#![allow(missing_docs)]

use strata::{
    primitives::slab::{Allocator, SlabAlloc},
    storage::{commit, Array, CommitOptions, Condition, NodeType, ParentSlot, QueryState},
    types::{Ref, Result},
    StorageOptions,
};

fn options() -> StorageOptions {
    StorageOptions::default().track_allocations(true)
}

/// Commits `top -> [left, right, 41]` with small plain leaves.
fn committed_tree(alloc: &mut SlabAlloc) -> Result<Ref> {
    let left = Array::create_from(alloc, NodeType::Normal, &[1, 2, 3])?;
    let right = Array::create_from(alloc, NodeType::Normal, &[10, 20])?;
    let top = Array::create_from(
        alloc,
        NodeType::HasRefs,
        &[left.ref_().to_value(), right.ref_().to_value(), 41],
    )?;
    Ok(commit(alloc, top.ref_(), None, CommitOptions::default())?.top_ref)
}

#[test]
fn writes_copy_the_path_and_leave_snapshots_intact() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let old_top = committed_tree(&mut alloc)?;
    let snapshot = alloc.committed_image();

    let mut top = Array::from_ref(&alloc, old_top)?;
    let mut left = top.child(&alloc, 0)?;
    assert!(left.is_read_only(&alloc));

    top.copy_on_write(&mut alloc)?;
    assert_ne!(top.ref_(), old_top);
    left.set_parent(Some(ParentSlot::new(top.ref_(), 0)));
    left.set(&mut alloc, 0, 100)?;
    left.add(&mut alloc, 1 << 40)?;
    assert_eq!(top.get_as_ref(&alloc, 0)?, left.ref_());
    assert_eq!(left.width(), 64);

    let reader = SlabAlloc::attach_buffer(snapshot, options())?;
    let old = Array::from_ref(&reader, reader.top_ref())?;
    assert_eq!(old.child(&reader, 0)?.get_all(&reader, 0, 3)?, vec![1, 2, 3]);

    let report = commit(&mut alloc, top.ref_(), None, CommitOptions::default())?;
    let new_top = Array::from_ref(&alloc, report.top_ref)?;
    assert_eq!(
        new_top.child(&alloc, 0)?.get_all(&alloc, 0, 4)?,
        vec![100, 2, 3, 1 << 40]
    );
    let old_right = Array::from_ref(&reader, reader.top_ref())?.get_as_ref(&reader, 1)?;
    assert_eq!(new_top.get_as_ref(&alloc, 1)?, old_right);
    assert_eq!(new_top.get(&alloc, 2)?, 41);
    Ok(())
}

#[test]
fn clone_and_destroy_deep_cover_whole_subtrees() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let old_top = committed_tree(&mut alloc)?;
    let top = Array::from_ref(&alloc, old_top)?;
    let copy = top.clone_deep(&mut alloc)?;
    assert!(!alloc.is_read_only(copy));

    let copy = Array::from_ref(&alloc, copy)?;
    let right = copy.child(&alloc, 1)?;
    assert!(!right.is_read_only(&alloc));
    assert_eq!(right.get_all(&alloc, 0, 2)?, vec![10, 20]);
    copy.destroy_deep(&mut alloc)?;
    assert!(alloc.is_all_free());

    Array::destroy_deep_ref(&mut alloc, old_top)?;
    let mut freed: Vec<u64> = alloc.read_only_free_chunks().iter().map(|c| c.start).collect();
    freed.sort_unstable();
    assert_eq!(freed.len(), 3);
    assert_eq!(freed[2], old_top.0);
    Ok(())
}

#[test]
fn edits_widen_and_search_after_relocation() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let mut top = Array::create_empty(&mut alloc, NodeType::HasRefs, false)?;
    let leaf = Array::create_empty(&mut alloc, NodeType::Normal, false)?;
    top.add(&mut alloc, leaf.ref_().to_value())?;
    let mut leaf = leaf.with_parent(ParentSlot::new(top.ref_(), 0));

    let mut model = Vec::new();
    for i in 0..300i64 {
        let v = (i * 37) % 101 - 50;
        leaf.add(&mut alloc, v)?;
        model.push(v);
    }
    leaf.insert(&mut alloc, 5, i64::MIN)?;
    model.insert(5, i64::MIN);
    leaf.erase_range(&mut alloc, 100, 120)?;
    model.drain(100..120);
    assert_eq!(top.get_as_ref(&alloc, 0)?, leaf.ref_());
    assert_eq!(leaf.get_all(&alloc, 0, leaf.len())?, model);

    let mut state = QueryState::new();
    leaf.find_all(&alloc, Condition::Less, -45, 0, leaf.len(), 0, &mut state)?;
    let expected: Vec<usize> = (0..model.len()).filter(|&i| model[i] < -45).collect();
    assert_eq!(state.into_matches(), expected);

    top.destroy_deep(&mut alloc)?;
    assert!(alloc.is_all_free());
    Ok(())
}
