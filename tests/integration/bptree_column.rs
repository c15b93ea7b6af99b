#![allow(missing_docs)]

use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata::{
    primitives::slab::{Allocator, SlabAlloc},
    storage::{bptree::IntegerColumn, commit, Array, CommitOptions, Condition, NodeType, QueryState},
    types::Result,
    StorageOptions,
};

fn options() -> StorageOptions {
    StorageOptions::default().track_allocations(true)
}

#[test]
fn default_fan_out_comes_from_options() -> Result<()> {
    let options = StorageOptions::from_toml_str("max_bpnode_size = 8\ntrack_allocations = true")?;
    let mut alloc = SlabAlloc::new(options)?;
    let values: Vec<i64> = (0..100).collect();
    let column = IntegerColumn::build(&mut alloc, &values)?;
    let mut leaves = 0;
    column.for_each_leaf(&alloc, &mut |leaf, offset| {
        assert!(leaf.len() <= 8);
        assert_eq!(leaf.get(&alloc, 0)?, offset as i64);
        leaves += 1;
        Ok(true)
    })?;
    assert_eq!(leaves, 13);

    let mut grown = IntegerColumn::create(&mut alloc)?;
    for v in 0..20 {
        grown.push(&mut alloc, v)?;
    }
    assert!(!grown.is_leaf());
    let mut largest = 0;
    grown.for_each_leaf(&alloc, &mut |leaf, _| {
        largest = largest.max(leaf.len());
        Ok(true)
    })?;
    assert!(largest <= 8);

    let reattached = IntegerColumn::from_ref(&alloc, grown.ref_())?;
    assert_eq!(reattached.to_vec(&alloc)?, (0..20).collect::<Vec<i64>>());
    column.destroy(&mut alloc)?;
    grown.destroy(&mut alloc)?;
    assert!(alloc.is_all_free());
    Ok(())
}

#[test]
fn custom_leaves_through_the_builder() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let root = strata::storage::bptree::build(
        &mut alloc,
        250,
        16,
        &mut |alloc: &mut dyn Allocator, offset, count| {
            let values: Vec<i64> = (offset..offset + count).map(|i| (i * i) as i64).collect();
            Array::create_from(alloc, NodeType::Normal, &values)
        },
    )?;
    let column = IntegerColumn::from_ref_with_fan_out(&alloc, root.ref_(), 16)?;
    assert_eq!(column.len(&alloc)?, 250);
    assert_eq!(column.get(&alloc, 249)?, 249 * 249);
    assert_eq!(column.verify_tree(&alloc)?, 250);
    column.destroy(&mut alloc)?;
    assert!(alloc.is_all_free());
    Ok(())
}

#[test]
fn committed_columns_take_edits_and_recommit() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut model: Vec<i64> = (0..5000).map(|_| rng.gen_range(0..50)).collect();
    let column = IntegerColumn::build_with_fan_out(&mut alloc, &model, 64)?;
    let mut top_ref = commit(&mut alloc, column.ref_(), None, CommitOptions { compress: true })?.top_ref;

    for round in 0..4 {
        let mut column = IntegerColumn::from_ref_with_fan_out(&alloc, top_ref, 64)?;
        let mut positions: Vec<usize> = (0..model.len()).collect();
        positions.shuffle(&mut rng);
        for &at in positions.iter().take(25) {
            let v = rng.gen_range(-10..60);
            column.set(&mut alloc, at, v)?;
            model[at] = v;
        }
        for _ in 0..40 {
            let at = rng.gen_range(0..=model.len());
            column.insert(&mut alloc, at, round)?;
            model.insert(at, round);
        }
        for _ in 0..30 {
            let at = rng.gen_range(0..model.len());
            column.erase(&mut alloc, at)?;
            model.remove(at);
        }
        assert_eq!(column.verify_tree(&alloc)?, model.len());
        top_ref = commit(&mut alloc, column.ref_(), None, CommitOptions { compress: round % 2 == 0 })?
            .top_ref;
    }

    let reader = SlabAlloc::attach_buffer(alloc.committed_image(), options())?;
    let column = IntegerColumn::from_ref_with_fan_out(&reader, reader.top_ref(), 64)?;
    assert_eq!(column.to_vec(&reader)?, model);

    let mut state = QueryState::new();
    column.find_all(&reader, Condition::Less, 0, 100, 4000, &mut state)?;
    let expected: Vec<usize> = (100..4000).filter(|&i| model[i] < 0).collect();
    assert_eq!(state.into_matches(), expected);
    Ok(())
}
