#![allow(missing_docs)]

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata::{
    primitives::slab::SlabAlloc,
    storage::{
        commit,
        node::{Encoding, NodeType},
        Array, CommitOptions, Condition, QueryState,
    },
    types::Result,
    StorageOptions,
};

const CONDITIONS: [Condition; 6] = [
    Condition::Equal,
    Condition::NotEqual,
    Condition::Less,
    Condition::Greater,
    Condition::LessEqual,
    Condition::GreaterEqual,
];

fn matches(values: &[i64], cond: Condition, key: i64, begin: usize, end: usize) -> Vec<usize> {
    (begin..end).filter(|&i| cond.eval(values[i], key)).collect()
}

fn check_search(alloc: &SlabAlloc, node: &Array, values: &[i64], key: i64) -> Result<()> {
    for cond in CONDITIONS {
        for (begin, end) in [(0, values.len()), (3.min(values.len()), values.len() / 2)] {
            let mut state = QueryState::new();
            node.find_all(alloc, cond, key, begin, end, 1000, &mut state)?;
            let expected: Vec<usize> = matches(values, cond, key, begin, end)
                .into_iter()
                .map(|i| i + 1000)
                .collect();
            assert_eq!(state.into_matches(), expected, "{cond:?} {key} [{begin}, {end})");
        }
    }
    Ok(())
}

#[test]
fn every_encoding_searches_like_plain() -> Result<()> {
    let mut alloc = SlabAlloc::new(StorageOptions::default())?;
    let mut rng = ChaCha8Rng::seed_from_u64(0xc0ffee);
    let shapes: Vec<Vec<i64>> = vec![
        (0..200).map(|_| rng.gen_range(-3..4)).collect(),
        (0..200).map(|_| rng.gen_range(1_000_000..1_000_200)).collect(),
        (0..200).map(|i| if i % 3 == 0 { i64::MIN } else { i64::MAX }).collect(),
        (0..200).map(|_| rng.gen::<i64>() >> 20).collect(),
    ];
    for values in &shapes {
        for encoding in [Encoding::Packed, Encoding::Flex, Encoding::Delta] {
            let mut node = Array::create_from(&mut alloc, NodeType::Normal, values)?;
            node.try_encode(&mut alloc, encoding)?;
            assert_eq!(node.encoding(), encoding);
            assert_eq!(node.get_all(&alloc, 0, values.len())?, *values);
            for key in [values[0], values[17], values[100] + 1, i64::MIN, i64::MAX, 0] {
                check_search(&alloc, &node, values, key)?;
            }
            node.destroy(&mut alloc)?;
        }
    }
    Ok(())
}

#[test]
fn edits_on_compressed_nodes_fall_back_to_plain() -> Result<()> {
    let mut alloc = SlabAlloc::new(StorageOptions::default())?;
    let values: Vec<i64> = (0..64).map(|i| 500 + i % 4).collect();
    let mut node = Array::create_from(&mut alloc, NodeType::Normal, &values)?;
    assert!(node.compress(&mut alloc)?);
    assert!(node.is_compressed());

    node.insert(&mut alloc, 10, -9)?;
    assert!(!node.is_compressed());
    let mut expected = values.clone();
    expected.insert(10, -9);
    assert_eq!(node.get_all(&alloc, 0, node.len())?, expected);

    node.compress(&mut alloc)?;
    assert_eq!(node.get_all(&alloc, 0, node.len())?, expected);
    node.decompress(&mut alloc)?;
    assert_eq!(node.encoding(), Encoding::Bits);
    node.destroy(&mut alloc)?;
    Ok(())
}

#[test]
fn committed_compressed_leaves_decompress_on_write() -> Result<()> {
    let mut alloc = SlabAlloc::new(StorageOptions::default())?;
    let values: Vec<i64> = (0..1000).map(|i| (i % 16) * 1_000_000_007).collect();
    let node = Array::create_from(&mut alloc, NodeType::Normal, &values)?;
    let plain_size = node.byte_size();
    let report = commit(&mut alloc, node.ref_(), None, CommitOptions { compress: true })?;
    assert!(report.bytes_written < plain_size);

    let mut node = Array::from_ref(&alloc, report.top_ref)?;
    assert!(node.is_compressed());
    check_search(&alloc, &node, &values, 3_000_000_021)?;
    node.set(&mut alloc, 999, -1)?;
    assert!(!node.is_compressed());
    assert!(!node.is_read_only(&alloc));
    assert_eq!(node.get(&alloc, 999)?, -1);
    assert_eq!(node.get(&alloc, 998)?, values[998]);
    Ok(())
}

proptest! {
    #[test]
    fn chosen_encoding_roundtrips(values in prop::collection::vec(-70_000i64..70_000, 1..300), key in -70_000i64..70_000) {
        let mut alloc = SlabAlloc::new(StorageOptions::default()).unwrap();
        let mut node = Array::create_from(&mut alloc, NodeType::Normal, &values).unwrap();
        node.compress(&mut alloc).unwrap();
        prop_assert_eq!(node.get_all(&alloc, 0, values.len()).unwrap(), values.clone());
        let mut state = QueryState::new();
        node.find_all(&alloc, Condition::GreaterEqual, key, 0, values.len(), 0, &mut state).unwrap();
        prop_assert_eq!(state.into_matches(), matches(&values, Condition::GreaterEqual, key, 0, values.len()));
    }
}
