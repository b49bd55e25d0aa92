use crate::*;
use anyhow::Result;
use tempfile::tempdir;

fn write_keys(dir: &std::path::Path, file_id: u32, keys: &[u64]) -> Result<DataFileReader> {
    let mut w = DataFileWriter::create(dir, "m", file_id, RecordLayout::fixed(4), false)?;
    w.set_sync(false);
    for &k in keys {
        w.store_data(k, &[], &(file_id).to_le_bytes())?;
    }
    w.finish_writing()?;
    Ok(DataFileReader::open(w.path())?)
}

#[test]
fn merge_single_file_sorts_keys() -> Result<()> {
    let dir = tempdir()?;
    let r = write_keys(dir.path(), 0, &[30, 10, 20])?;
    let keys: Vec<u64> = MergeIterator::new([&r])?.map(|e| e.key).collect();
    assert_eq!(keys, vec![10, 20, 30]);
    Ok(())
}

#[test]
fn merge_interleaves_files_in_key_order() -> Result<()> {
    let dir = tempdir()?;
    let a = write_keys(dir.path(), 0, &[1, 4, 7])?;
    let b = write_keys(dir.path(), 1, &[2, 5, 8])?;
    let c = write_keys(dir.path(), 2, &[3, 6, 9])?;
    let keys: Vec<u64> = MergeIterator::new([&a, &b, &c])?.map(|e| e.key).collect();
    assert_eq!(keys, (1..=9).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn duplicates_are_yielded_newest_first() -> Result<()> {
    let dir = tempdir()?;
    let old = write_keys(dir.path(), 0, &[5])?;
    let new = write_keys(dir.path(), 1, &[5, 5])?;
    let entries: Vec<MergeEntry> = MergeIterator::new([&old, &new])?.collect();

    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.key == 5));
    assert_eq!(entries[0].source_file_id(), 1);
    assert_eq!(entries[0].location.offset(), 12);
    assert_eq!(entries[1].source_file_id(), 1);
    assert_eq!(entries[1].location.offset(), 0);
    assert_eq!(entries[2].source_file_id(), 0);
    Ok(())
}

#[test]
fn merge_of_nothing_is_empty() {
    let mut it = MergeIterator::from_key_lists(vec![Vec::new(), Vec::new()]);
    assert!(it.next().is_none());
}

#[test]
fn from_key_lists_accepts_unsorted_input() {
    let lists = vec![
        vec![(9, Location::new(0, 0)), (1, Location::new(0, 8))],
        vec![(5, Location::new(1, 0))],
    ];
    let keys: Vec<u64> = MergeIterator::from_key_lists(lists).map(|e| e.key).collect();
    assert_eq!(keys, vec![1, 5, 9]);
}
