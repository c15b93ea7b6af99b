#![allow(missing_docs)]

use strata::{
    primitives::slab::SlabAlloc,
    storage::{
        commit,
        leaf::{
            ArrayBacklink, ArrayBigBlobs, ArrayBlob, ArrayIntNull, ArrayObjectId, ArrayStringLong,
            ArrayTimestamp, BacklinkEntry, CascadeState, Timestamp,
        },
        Array, CommitOptions, Condition, NodeType, ParentSlot,
    },
    types::{ColKey, ObjKey, ObjLink, Ref, Result, TableKey},
    StorageOptions,
};

const STRINGS: usize = 0;
const BLOBS: usize = 1;
const IDS: usize = 2;
const INTS: usize = 3;
const TIMES: usize = 4;
const LINKS: usize = 5;

fn options() -> StorageOptions {
    StorageOptions::default().track_allocations(true)
}

fn ts(seconds: i64, nanos: i32) -> Result<Timestamp> {
    Timestamp::new(seconds, nanos)
}

fn oid(byte: u8) -> [u8; 12] {
    let mut id = [byte; 12];
    id[0] = 0x65;
    id
}

/// Builds one leaf of each kind under a has-refs top and commits it.
fn populate(alloc: &mut SlabAlloc, io_compress: bool) -> Result<Ref> {
    let mut strings = ArrayStringLong::create(alloc)?;
    strings.add(alloc, Some("alpha"))?;
    strings.add(alloc, None)?;
    strings.add(alloc, Some(""))?;

    let mut blobs = ArrayBigBlobs::create(alloc)?.with_max_chunk_size(64);
    let big: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    blobs.add(alloc, Some(&big))?;
    blobs.add(alloc, Some(b"tiny"))?;
    blobs.add(alloc, None)?;

    let mut ids = ArrayObjectId::create(alloc)?;
    for i in 0..10u8 {
        let id = oid(i);
        ids.add(alloc, if i % 4 == 1 { None } else { Some(&id) })?;
    }

    let mut ints = ArrayIntNull::create(alloc)?;
    for v in [Some(3), None, Some(-200), Some(i64::MAX), None] {
        ints.add(alloc, v)?;
    }

    let mut times = ArrayTimestamp::create(alloc, true)?;
    times.add(alloc, Some(ts(10, 5)?))?;
    times.add(alloc, None)?;
    times.add(alloc, Some(ts(-3, -999)?))?;

    let mut links = ArrayBacklink::create(alloc, 3)?;
    links.add_backlink(alloc, 0, ObjKey(7))?;
    links.add_backlink(alloc, 2, ObjKey(1))?;
    links.add_backlink(alloc, 2, ObjKey(2))?;
    links.add_backlink(alloc, 2, ObjKey(3))?;

    let refs = [
        strings.ref_(),
        blobs.ref_(),
        ids.ref_(),
        ints.ref_(),
        times.ref_(),
        links.ref_(),
    ];
    let values: Vec<i64> = refs.iter().map(|r| r.to_value()).collect();
    let top = Array::create_from(alloc, NodeType::HasRefs, &values)?;
    let options = CommitOptions {
        compress: io_compress,
    };
    Ok(commit(alloc, top.ref_(), None, options)?.top_ref)
}

fn check_contents(alloc: &SlabAlloc, top: Ref) -> Result<()> {
    let top = Array::from_ref(alloc, top)?;

    let strings = ArrayStringLong::from_ref(alloc, top.get_as_ref(alloc, STRINGS)?)?;
    assert_eq!(strings.len(alloc)?, 3);
    assert_eq!(strings.get(alloc, 0)?, Some("alpha"));
    assert!(strings.is_null(alloc, 1)?);
    assert_eq!(strings.get(alloc, 2)?, Some(""));
    assert_eq!(strings.find_first(alloc, Some(""), 0, 3)?, Some(2));

    let blobs = ArrayBigBlobs::from_ref(alloc, top.get_as_ref(alloc, BLOBS)?)?;
    let big = blobs.get(alloc, 0)?.unwrap_or_default();
    assert_eq!(big.len(), 1000);
    assert_eq!(big[999], (999 % 251) as u8);
    assert_eq!(blobs.get(alloc, 1)?.as_deref(), Some(&b"tiny"[..]));
    assert!(blobs.is_null(alloc, 2)?);

    let ids = ArrayObjectId::from_ref(alloc, top.get_as_ref(alloc, IDS)?)?;
    assert_eq!(ids.len(), 10);
    assert!(ids.is_null(alloc, 5)?);
    assert_eq!(ids.get(alloc, 8)?, Some(oid(8)));
    assert_eq!(ids.find_first(alloc, Some(&oid(6)), 0, 10)?, Some(6));
    assert_eq!(ids.find_first(alloc, None, 2, 10)?, Some(5));

    let ints = ArrayIntNull::from_ref(alloc, top.get_as_ref(alloc, INTS)?)?;
    assert_eq!(
        ints.get_all(alloc, 0, 5)?,
        vec![Some(3), None, Some(-200), Some(i64::MAX), None]
    );
    assert_eq!(ints.find_first(alloc, Condition::Less, Some(0), 0, 5)?, Some(2));
    assert_eq!(ints.find_first(alloc, Condition::Equal, None, 2, 5)?, Some(4));

    let times = ArrayTimestamp::from_ref(alloc, top.get_as_ref(alloc, TIMES)?)?;
    assert!(times.is_nullable());
    assert_eq!(times.get(alloc, 0)?, Some(ts(10, 5)?));
    assert_eq!(times.get(alloc, 1)?, None);
    assert_eq!(
        times.find_first(alloc, Condition::Less, Some(ts(0, 0)?), 0, 3)?,
        Some(2)
    );

    let links = ArrayBacklink::from_ref(alloc, top.get_as_ref(alloc, LINKS)?)?;
    assert_eq!(links.entry(alloc, 0)?, BacklinkEntry::Single(ObjKey(7)));
    assert_eq!(links.entry(alloc, 1)?, BacklinkEntry::Empty);
    assert_eq!(links.get_backlink_count(alloc, 2)?, 3);
    assert_eq!(links.get_backlink(alloc, 2, 1)?, ObjKey(2));
    Ok(())
}

#[test]
fn every_leaf_survives_a_commit() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let top = populate(&mut alloc, false)?;
    check_contents(&alloc, top)?;

    let reader = SlabAlloc::attach_buffer(alloc.committed_image(), options())?;
    check_contents(&reader, reader.top_ref())
}

#[test]
fn compressed_commit_keeps_leaf_semantics() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let top = populate(&mut alloc, true)?;
    check_contents(&alloc, top)
}

#[test]
fn committed_leaves_are_edited_through_their_parent() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let old_top = populate(&mut alloc, false)?;
    let snapshot = alloc.committed_image();

    let mut top = Array::from_ref(&alloc, old_top)?;
    top.copy_on_write(&mut alloc)?;
    let slot = |ndx| ParentSlot::new(top.ref_(), ndx);

    let mut strings =
        ArrayStringLong::from_ref(&alloc, top.get_as_ref(&alloc, STRINGS)?)?.with_parent(slot(STRINGS));
    strings.set(&mut alloc, 1, Some("beta"))?;
    let mut ints =
        ArrayIntNull::from_ref(&alloc, top.get_as_ref(&alloc, INTS)?)?.with_parent(slot(INTS));
    ints.set(&mut alloc, 0, None)?;
    let mut times =
        ArrayTimestamp::from_ref(&alloc, top.get_as_ref(&alloc, TIMES)?)?.with_parent(slot(TIMES));
    times.set(&mut alloc, 1, Some(ts(99, 0)?))?;
    let mut links =
        ArrayBacklink::from_ref(&alloc, top.get_as_ref(&alloc, LINKS)?)?.with_parent(slot(LINKS));
    assert!(!links.remove_backlink(&mut alloc, 2, ObjKey(2))?);

    let report = commit(&mut alloc, top.ref_(), None, CommitOptions::default())?;
    let top = Array::from_ref(&alloc, report.top_ref)?;
    let strings = ArrayStringLong::from_ref(&alloc, top.get_as_ref(&alloc, STRINGS)?)?;
    assert_eq!(strings.get(&alloc, 1)?, Some("beta"));
    let ints = ArrayIntNull::from_ref(&alloc, top.get_as_ref(&alloc, INTS)?)?;
    assert_eq!(ints.get(&alloc, 0)?, None);
    let times = ArrayTimestamp::from_ref(&alloc, top.get_as_ref(&alloc, TIMES)?)?;
    assert_eq!(times.get(&alloc, 1)?, Some(ts(99, 0)?));
    let links = ArrayBacklink::from_ref(&alloc, top.get_as_ref(&alloc, LINKS)?)?;
    assert_eq!(links.origins(&alloc, 2)?.as_slice(), &[ObjKey(1), ObjKey(3)]);

    let reader = SlabAlloc::attach_buffer(snapshot, options())?;
    check_contents(&reader, reader.top_ref())
}

#[derive(Default)]
struct Queue(Vec<(TableKey, ColKey, ObjKey, ObjLink)>);

impl CascadeState for Queue {
    fn enqueue_for_nullification(
        &mut self,
        origin_table: TableKey,
        origin_col: ColKey,
        origin_key: ObjKey,
        target: ObjLink,
    ) {
        self.0.push((origin_table, origin_col, origin_key, target));
    }
}

#[test]
fn deleting_a_target_enqueues_committed_origins() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let top = populate(&mut alloc, true)?;
    let top = Array::from_ref(&alloc, top)?;
    let links = ArrayBacklink::from_ref(&alloc, top.get_as_ref(&alloc, LINKS)?)?;
    let target = ObjLink {
        table: TableKey(4),
        key: ObjKey(2),
    };
    let mut queue = Queue::default();
    links.nullify_fwd_links(&alloc, 2, target, TableKey(9), ColKey(11), &mut queue)?;
    let keys: Vec<ObjKey> = queue.0.iter().map(|entry| entry.2).collect();
    assert_eq!(keys, vec![ObjKey(1), ObjKey(2), ObjKey(3)]);
    assert!(queue.0.iter().all(|e| e.0 == TableKey(9) && e.1 == ColKey(11) && e.3 == target));
    Ok(())
}

#[test]
fn blob_chunk_limit_comes_from_options() -> Result<()> {
    let options = StorageOptions::from_toml_str("max_blob_chunk_size = 16\ntrack_allocations = true")?;
    let mut alloc = SlabAlloc::new(options)?;
    let data: Vec<u8> = (0..100u8).collect();

    let mut blob = ArrayBlob::create(&mut alloc)?;
    blob.append(&mut alloc, &data)?;
    assert!(blob.is_chunked());
    let mut pos = 0;
    let mut runs = Vec::new();
    loop {
        let run = blob.get_at(&alloc, &mut pos)?;
        if run.is_empty() {
            break;
        }
        runs.push(run.len());
    }
    assert_eq!(runs, vec![16, 16, 16, 16, 16, 16, 4]);

    let mut leaf = ArrayBigBlobs::create(&mut alloc)?;
    leaf.add(&mut alloc, Some(&data))?;
    let top = Array::create_from(
        &mut alloc,
        NodeType::HasRefs,
        &[blob.ref_().to_value(), leaf.ref_().to_value()],
    )?;
    let report = commit(&mut alloc, top.ref_(), None, CommitOptions::default())?;

    let top = Array::from_ref(&alloc, report.top_ref)?;
    let leaf = ArrayBigBlobs::from_ref(&alloc, top.get_as_ref(&alloc, 1)?)?;
    assert_eq!(leaf.get(&alloc, 0)?, Some(data.clone()));
    let big = Array::from_ref(&alloc, top.get_as_ref(&alloc, 1)?)?;
    assert!(ArrayBlob::from_ref(&alloc, big.get_as_ref(&alloc, 0)?)?.is_chunked());

    let mut reopened = ArrayBlob::from_ref(&alloc, top.get_as_ref(&alloc, 0)?)?;
    reopened.append(&mut alloc, &[7; 20])?;
    assert_eq!(reopened.blob_size(&alloc)?, 120);
    let mut pos = 96;
    assert_eq!(reopened.get_at(&alloc, &mut pos)?.len(), 16);
    assert_eq!(reopened.get_at(&alloc, &mut pos)?.len(), 8);
    Ok(())
}
