use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::*;
use crate::types::file::FILE_HEADER_LEN;

fn tracked() -> SlabAlloc {
    SlabAlloc::new(StorageOptions::new().track_allocations(true)).unwrap()
}

/// Allocates a block and stamps its size into the header the way nodes do.
fn alloc_node(alloc: &mut SlabAlloc, size: usize) -> Result<MemRef> {
    let mem = alloc.alloc(size)?;
    fixed::put_u24_be(&mut alloc.bytes_mut(mem)?[4..7], size)?;
    Ok(mem)
}

#[test]
fn first_allocation_creates_rounded_slab() -> Result<()> {
    let mut alloc = tracked();
    let base = alloc.baseline();
    assert_eq!(base, FILE_HEADER_LEN as u64);
    let mem = alloc_node(&mut alloc, 64)?;
    assert_eq!(mem.ref_, Ref(base));
    assert_eq!(mem.addr, Addr::Slab { index: 0, offset: 0 });
    assert_eq!(alloc.free_chunks(), &[Chunk::new(base + 64, 192)]);
    assert_eq!(alloc.total_size(), base + 256);
    Ok(())
}

#[test]
fn later_slabs_double_in_size() -> Result<()> {
    let mut alloc = tracked();
    alloc_node(&mut alloc, 64)?;
    let big = alloc_node(&mut alloc, 256)?;
    assert_eq!(big.addr, Addr::Slab { index: 1, offset: 0 });
    let stats = alloc.stats();
    assert_eq!(stats.slab_count, 2);
    assert_eq!(stats.slab_bytes, 256 + 512);
    Ok(())
}

#[test]
fn free_space_is_reused_first_fit() -> Result<()> {
    let mut alloc = tracked();
    let a = alloc_node(&mut alloc, 32)?;
    let b = alloc_node(&mut alloc, 224)?;
    assert!(alloc.free_chunks().is_empty(), "first slab fully used");
    alloc.free(a)?;
    let c = alloc_node(&mut alloc, 16)?;
    assert_eq!(c.ref_, a.ref_);
    let d = alloc_node(&mut alloc, 16)?;
    assert_eq!(d.ref_.0, a.ref_.0 + 16);
    assert_ne!(d.ref_, b.ref_);
    Ok(())
}

#[test]
fn translate_and_bytes_agree() -> Result<()> {
    let mut alloc = tracked();
    let a = alloc_node(&mut alloc, 24)?;
    alloc.bytes_mut(a)?[8..16].copy_from_slice(b"abcdefgh");
    let back = alloc.translate(a.ref_)?;
    assert_eq!(back, a);
    assert_eq!(&alloc.bytes(back)?[8..16], b"abcdefgh");
    assert!(alloc.translate(Ref(alloc.total_size())).is_err());
    assert!(alloc.translate(Ref::NULL).is_err());
    Ok(())
}

#[test]
fn never_coalesces_across_slabs() -> Result<()> {
    let mut alloc = tracked();
    let a = alloc_node(&mut alloc, 256)?;
    let b = alloc_node(&mut alloc, 512)?;
    assert_eq!(a.ref_.0 + 256, b.ref_.0, "slabs are adjacent in ref space");
    alloc.free(a)?;
    alloc.free(b)?;
    assert_eq!(alloc.free_chunks().len(), 2);
    assert!(alloc.is_all_free());
    alloc.verify()?;
    Ok(())
}

#[test]
fn double_free_is_rejected_when_tracking() -> Result<()> {
    let mut alloc = tracked();
    let a = alloc_node(&mut alloc, 16)?;
    alloc.free(a)?;
    let err = alloc.free(a).unwrap_err();
    assert!(matches!(err, StrataError::Invalid(_)));
    Ok(())
}

#[test]
fn memory_limit_reports_out_of_memory() -> Result<()> {
    let mut alloc = SlabAlloc::new(StorageOptions::new().memory_limit(1024))?;
    alloc_node(&mut alloc, 512)?;
    alloc_node(&mut alloc, 256)?;
    let err = alloc.alloc(512).unwrap_err();
    assert!(matches!(err, StrataError::OutOfMemory { requested: 512 }));
    let small = alloc_node(&mut alloc, 256)?;
    assert!(!small.ref_.is_null());
    Ok(())
}

#[test]
fn rejects_unaligned_sizes() {
    let mut alloc = tracked();
    assert!(alloc.alloc(0).is_err());
    assert!(alloc.alloc(12).is_err());
}

#[test]
fn committed_frees_go_to_read_only_list() -> Result<()> {
    let mut image = vec![0u8; FILE_HEADER_LEN + 16];
    FileHeader::new(2).encode(&mut image)?;
    fixed::put_u24_be(&mut image[FILE_HEADER_LEN + 4..], 16)?;
    let mut alloc = SlabAlloc::attach_buffer(image, StorageOptions::new())?;
    let node = alloc.translate(Ref(FILE_HEADER_LEN as u64))?;
    assert!(alloc.is_read_only(node.ref_));
    assert!(alloc.bytes_mut(node).is_err());
    alloc.free(node)?;
    assert_eq!(
        alloc.read_only_free_chunks(),
        &[Chunk::new(FILE_HEADER_LEN as u64, 16)]
    );
    assert!(alloc.free_chunks().is_empty());
    Ok(())
}

#[test]
fn committed_double_free_is_rejected_when_tracking() -> Result<()> {
    let mut image = vec![0u8; FILE_HEADER_LEN + 32];
    FileHeader::new(2).encode(&mut image)?;
    fixed::put_u24_be(&mut image[FILE_HEADER_LEN + 4..], 16)?;
    fixed::put_u24_be(&mut image[FILE_HEADER_LEN + 20..], 16)?;
    let options = StorageOptions::new().track_allocations(true);
    let mut alloc = SlabAlloc::attach_buffer(image, options)?;
    let first = alloc.translate(Ref(FILE_HEADER_LEN as u64))?;
    let second = alloc.translate(Ref(FILE_HEADER_LEN as u64 + 16))?;
    alloc.free(first)?;
    let err = alloc.free(first).unwrap_err();
    assert!(matches!(err, StrataError::Invalid(_)));
    alloc.free(second)?;
    assert_eq!(alloc.read_only_free_chunks().len(), 2);
    assert_eq!(alloc.stats().read_only_free_bytes, 32);

    alloc.reset_free_space_tracking();
    alloc.free(first)?;
    Ok(())
}

#[test]
fn realloc_moves_content() -> Result<()> {
    let mut alloc = tracked();
    let a = alloc_node(&mut alloc, 16)?;
    alloc.bytes_mut(a)?[8..16].copy_from_slice(&42u64.to_le_bytes());
    let b = alloc.realloc(a, 64)?;
    assert_ne!(a.ref_, b.ref_);
    assert_eq!(&alloc.bytes(b)?[8..16], &42u64.to_le_bytes());
    fixed::put_u24_be(&mut alloc.bytes_mut(b)?[4..7], 64)?;
    alloc.free(b)?;
    assert!(alloc.is_all_free());
    Ok(())
}

#[test]
fn rebase_renumbers_slabs_after_new_baseline() -> Result<()> {
    let mut alloc = tracked();
    alloc_node(&mut alloc, 64)?;
    let mut image = vec![0u8; FILE_HEADER_LEN + 64];
    FileHeader::new(2).encode(&mut image)?;
    alloc.rebase(Arc::from(image))?;
    assert_eq!(alloc.baseline(), (FILE_HEADER_LEN + 64) as u64);
    assert!(alloc.is_all_free());
    let mem = alloc_node(&mut alloc, 64)?;
    assert_eq!(mem.ref_.0, alloc.baseline());
    Ok(())
}

#[test]
fn metrics_count_activity() -> Result<()> {
    let counters = Arc::new(CounterMetrics::default());
    let mut alloc = tracked().with_metrics(counters.clone());
    let a = alloc_node(&mut alloc, 8)?;
    alloc.free(a)?;
    assert_eq!(counters.allocations.load(Ordering::Relaxed), 1);
    assert_eq!(counters.bytes_freed.load(Ordering::Relaxed), 8);
    assert_eq!(counters.slabs_created.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn stats_serialize_to_json() -> Result<()> {
    let mut alloc = tracked();
    alloc_node(&mut alloc, 8)?;
    let json = serde_json::to_value(alloc.stats()).unwrap();
    assert_eq!(json["slab_count"], 1);
    assert_eq!(json["tracked_allocations"], 1);
    Ok(())
}

#[test]
fn random_alloc_free_conserves_space() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut alloc = tracked();
    let mut live: BTreeMap<u64, (MemRef, u8)> = BTreeMap::new();
    for step in 0..2_000u32 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=96usize) * 8;
            let mem = alloc_node(&mut alloc, size)?;
            let fill = (step % 251) as u8;
            alloc.bytes_mut(mem)?[8..size].fill(fill);
            assert!(live.insert(mem.ref_.0, (mem, fill)).is_none());
        } else {
            let key = *live.keys().nth(rng.gen_range(0..live.len())).unwrap();
            let (mem, fill) = live.remove(&key).unwrap();
            let size = node_capacity(alloc.bytes(mem)?)?;
            assert!(alloc.bytes(mem)?[8..size].iter().all(|&b| b == fill));
            alloc.free(mem)?;
        }
        if step % 97 == 0 {
            alloc.verify()?;
        }
    }
    for (_, (mem, _)) in live {
        alloc.free(mem)?;
    }
    alloc.verify()?;
    assert!(alloc.is_all_free());
    Ok(())
}
