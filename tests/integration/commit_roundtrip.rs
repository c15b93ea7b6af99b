#![allow(missing_docs)]

use strata::{
    primitives::{
        io::{FileIo, StdFileIo},
        slab::SlabAlloc,
    },
    storage::{bptree::IntegerColumn, commit, leaf::ArrayStringLong, Array, CommitOptions, NodeType, ParentSlot},
    types::{
        file::{FileHeader, CURRENT_FORMAT_VERSION, FILE_HEADER_LEN, LEGACY_FORMAT_VERSION},
        Ref, Result, StrataError,
    },
    StorageOptions,
};
use tempfile::tempdir;

fn options() -> StorageOptions {
    StorageOptions::default().track_allocations(true)
}

#[test]
fn reopened_files_see_the_last_commit() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.strata");
    let expected: Vec<i64> = (0..3000).map(|i| i * i - 17).collect();
    {
        let io = StdFileIo::open(&path)?;
        let mut alloc = SlabAlloc::attach_file(&io, options())?;
        let column = IntegerColumn::build_with_fan_out(&mut alloc, &expected[..1000], 100)?;
        let names = ArrayStringLong::create(&mut alloc)?;
        let top = Array::create_from(
            &mut alloc,
            NodeType::HasRefs,
            &[column.ref_().to_value(), names.ref_().to_value()],
        )?;
        commit(&mut alloc, top.ref_(), Some(&io), CommitOptions::default())?;

        let mut top = Array::from_ref(&alloc, alloc.top_ref())?;
        top.copy_on_write(&mut alloc)?;
        let mut column =
            IntegerColumn::from_ref_with_fan_out(&alloc, top.get_as_ref(&alloc, 0)?, 100)?
                .with_parent(ParentSlot::new(top.ref_(), 0));
        for &v in &expected[1000..] {
            column.push(&mut alloc, v)?;
        }
        let mut names = ArrayStringLong::from_ref(&alloc, top.get_as_ref(&alloc, 1)?)?
            .with_parent(ParentSlot::new(top.ref_(), 1));
        names.add(&mut alloc, Some("squares"))?;
        commit(&mut alloc, top.ref_(), Some(&io), CommitOptions { compress: true })?;
    }

    let io = StdFileIo::open(&path)?;
    let alloc = SlabAlloc::attach_file(&io, options())?;
    assert_eq!(alloc.baseline(), io.len()?);
    assert_eq!(alloc.header().format_version(), CURRENT_FORMAT_VERSION);
    let top = Array::from_ref(&alloc, alloc.top_ref())?;
    let column = IntegerColumn::from_ref_with_fan_out(&alloc, top.get_as_ref(&alloc, 0)?, 100)?;
    assert_eq!(column.to_vec(&alloc)?, expected);
    let names = ArrayStringLong::from_ref(&alloc, top.get_as_ref(&alloc, 1)?)?;
    assert_eq!(names.get(&alloc, 0)?, Some("squares"));
    Ok(())
}

#[test]
fn unselected_slot_is_ignored_on_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("torn.strata");
    let io = StdFileIo::open(&path)?;
    let mut alloc = SlabAlloc::attach_file(&io, options())?;
    let first = Array::create_from(&mut alloc, NodeType::Normal, &[1, 2, 3])?;
    let first = commit(&mut alloc, first.ref_(), Some(&io), CommitOptions::default())?.top_ref;
    let second = Array::create_from(&mut alloc, NodeType::Normal, &[4, 5, 6])?;
    let second = commit(&mut alloc, second.ref_(), Some(&io), CommitOptions::default())?.top_ref;

    // Roll the flag back as if the final header write never reached disk.
    let mut raw = vec![0u8; io.len()? as usize];
    io.read_at(0, &mut raw)?;
    let mut header = FileHeader::decode(&raw)?;
    assert_eq!(header.top_refs[header.current_slot()], second);
    header.select(1 - header.current_slot());
    header.encode(&mut raw)?;
    io.write_at(0, &raw[..FILE_HEADER_LEN])?;

    let reopened = SlabAlloc::attach_file(&io, options())?;
    assert_eq!(reopened.top_ref(), first);
    let node = Array::from_ref(&reopened, first)?;
    assert_eq!(node.get_all(&reopened, 0, 3)?, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn legacy_format_version_is_kept_across_commits() -> Result<()> {
    let io = strata::primitives::io::MemFileIo::new();
    let options = options().file_format_version(LEGACY_FORMAT_VERSION);
    let mut alloc = SlabAlloc::attach_file(&io, options)?;
    let node = Array::create_from(&mut alloc, NodeType::Normal, &[9])?;
    commit(&mut alloc, node.ref_(), Some(&io), CommitOptions::default())?;
    let reopened = SlabAlloc::attach_file(&io, StorageOptions::default())?;
    assert_eq!(reopened.header().format_version(), LEGACY_FORMAT_VERSION);
    Ok(())
}

#[test]
fn damaged_images_are_rejected() -> Result<()> {
    let mut alloc = SlabAlloc::new(options())?;
    let node = Array::create_from(&mut alloc, NodeType::Normal, &[1])?;
    let top = commit(&mut alloc, node.ref_(), None, CommitOptions::default())?.top_ref;
    let image = alloc.committed_image().to_vec();

    let mut bad_mnemonic = image.clone();
    bad_mnemonic[16] ^= 0xff;
    assert!(matches!(
        SlabAlloc::attach_buffer(bad_mnemonic, options()),
        Err(StrataError::Corruption(_))
    ));

    let mut short = image.clone();
    short.truncate(top.0 as usize);
    assert!(matches!(
        SlabAlloc::attach_buffer(short, options()),
        Err(StrataError::Corruption(_))
    ));

    let mut unaligned = image;
    unaligned.push(0);
    assert!(matches!(
        SlabAlloc::attach_buffer(unaligned, options()),
        Err(StrataError::Corruption(_))
    ));

    assert_eq!(Ref::NULL, SlabAlloc::new(options())?.top_ref());
    Ok(())
}
