#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata::{
    primitives::{
        io::StdFileIo,
        slab::{Allocator, CounterMetrics, SlabAlloc},
    },
    storage::{commit, Array, CommitOptions, NodeType},
    types::{Result, StrataError},
    StorageOptions,
};
use tempfile::tempdir;

fn options() -> StorageOptions {
    StorageOptions::default().track_allocations(true)
}

#[test]
fn node_churn_returns_every_byte() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut live: Vec<Array> = Vec::new();
    for _ in 0..500 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let len = rng.gen_range(0..64);
            let value = rng.gen_range(-1_000..1_000);
            live.push(Array::create(&mut alloc, NodeType::Normal, false, len, value)?);
        } else {
            let at = rng.gen_range(0..live.len());
            live.swap_remove(at).destroy(&mut alloc)?;
        }
    }
    alloc.verify()?;
    assert_eq!(alloc.stats().tracked_allocations, Some(live.len()));
    for node in live {
        node.destroy(&mut alloc)?;
    }
    alloc.verify()?;
    assert!(alloc.is_all_free());
    Ok(())
}

#[test]
fn committed_frees_never_reach_the_slab_free_list() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let node = Array::create_from(&mut alloc, NodeType::Normal, &[1, 2, 3])?;
    let report = commit(&mut alloc, node.ref_(), None, CommitOptions::default())?;
    assert!(alloc.is_read_only(report.top_ref));

    let free_before = alloc.stats().free_bytes;
    Array::from_ref(&alloc, report.top_ref)?.destroy(&mut alloc)?;
    assert_eq!(alloc.stats().free_bytes, free_before);
    assert_eq!(alloc.read_only_free_chunks().len(), 1);
    assert_eq!(alloc.read_only_free_chunks()[0].start, report.top_ref.0);
    Ok(())
}

#[test]
fn memory_limit_surfaces_as_out_of_memory() -> Result<()> {
    let mut alloc = SlabAlloc::new(StorageOptions::default().memory_limit(1024))?;
    let mut nodes = Vec::new();
    let err = loop {
        match Array::create(&mut alloc, NodeType::Normal, false, 100, i64::MAX) {
            Ok(node) => nodes.push(node),
            Err(err) => break err,
        }
    };
    assert!(matches!(err, StrataError::OutOfMemory { .. }));
    assert!(!nodes.is_empty());
    assert!(alloc.stats().slab_bytes <= 1024);
    Ok(())
}

#[test]
fn metrics_and_stats_track_a_file_backed_store() -> Result<()> {
    let dir = tempdir()?;
    let io = StdFileIo::open(dir.path().join("slab.strata"))?;
    let metrics = Arc::new(CounterMetrics::default());
    let mut alloc = SlabAlloc::attach_file(&io, options())?.with_metrics(metrics.clone());
    assert_eq!(alloc.baseline(), 24);

    let a = Array::create(&mut alloc, NodeType::Normal, false, 10, 5)?;
    let b = Array::create(&mut alloc, NodeType::Normal, false, 10, 5)?;
    a.destroy(&mut alloc)?;
    assert_eq!(metrics.allocations.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.frees.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.slabs_created.load(Ordering::Relaxed), 1);

    let json = serde_json::to_value(alloc.stats()).map_err(|e| StrataError::Config(e.to_string()))?;
    assert_eq!(json["slab_count"], 1);
    assert_eq!(json["tracked_allocations"], 1);

    commit(&mut alloc, b.ref_(), Some(&io), CommitOptions::default())?;
    let reopened = SlabAlloc::attach_file(&io, options())?;
    assert_eq!(reopened.baseline(), alloc.baseline());
    assert_eq!(Array::from_ref(&reopened, reopened.top_ref())?.get_all(&reopened, 0, 10)?, vec![5; 10]);
    Ok(())
}
