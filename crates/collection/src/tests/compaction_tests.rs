use super::helpers::*;
use crate::*;
use anyhow::Result;
use config::{MergePolicy, StoreConfig};
use longlist::LongList;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::tempdir;

/// Wraps a `LongList` and records every relocation batch.
struct RecordingIndex {
    inner: LongList,
    batches: Mutex<Vec<usize>>,
    moves_per_key: Mutex<HashMap<u64, usize>>,
}

impl RecordingIndex {
    fn new(capacity: u64) -> Self {
        Self {
            inner: LongList::new(capacity),
            batches: Mutex::new(Vec::new()),
            moves_per_key: Mutex::new(HashMap::new()),
        }
    }
}

impl LocationIndex for RecordingIndex {
    fn location_of(&self, key: u64) -> Option<Location> {
        self.inner.location_of(key)
    }

    fn relocate(&self, moves: &[Move]) -> Result<()> {
        self.batches.lock().push(moves.len());
        let mut per_key = self.moves_per_key.lock();
        for m in moves {
            *per_key.entry(m.key).or_default() += 1;
        }
        self.inner.relocate(moves)
    }
}

fn open_with(dir: &std::path::Path, config: StoreConfig) -> Result<DataFileCollection> {
    DataFileCollection::open(dir, "test", RecordLayout::variable(), config)
}

#[test]
fn merge_keeps_live_records_and_drops_stale() -> Result<()> {
    let dir = tempdir()?;
    let coll = open_variable(dir.path())?;
    let index = LongList::new(1000);
    write_session(&coll, &index, 0..100, 1, (0, 99))?;
    write_session(&coll, &index, 0..50, 2, (0, 99))?;
    write_session(&coll, &index, 0..10, 3, (0, 99))?;
    assert_eq!(coll.file_count(), 3);

    let report = coll.merge_old_files(&index)?;
    assert_eq!(report.files_merged, 3);
    assert_eq!(report.files_created, 1);
    assert_eq!(report.records_copied, 100);
    assert_eq!(report.records_dropped, 60);
    assert!(report.bytes_after < report.bytes_before);

    assert_eq!(coll.file_count(), 1);
    assert_eq!(count_dfl_files(dir.path()), 1);
    for key in 0..100u64 {
        let version = match key {
            0..=9 => 3,
            10..=49 => 2,
            _ => 1,
        };
        let value = coll.read_data_using_index(&index, key, DataMode::Value)?;
        assert_eq!(value, Some(value_for(key, version)), "key {key}");
    }
    Ok(())
}

#[test]
fn each_moved_record_is_relocated_exactly_once() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig {
        move_batch_size: 7,
        ..test_config()
    };
    let coll = open_with(dir.path(), config)?;
    let index = RecordingIndex::new(1000);
    write_session(&coll, &index.inner, 0..40, 1, (0, 39))?;
    write_session(&coll, &index.inner, 20..40, 2, (0, 39))?;

    let report = coll.merge_old_files(&index)?;
    assert_eq!(report.records_copied, 40);

    let per_key = index.moves_per_key.lock();
    assert_eq!(per_key.len(), 40);
    assert!(per_key.values().all(|&n| n == 1));

    let batches = index.batches.lock();
    assert_eq!(batches.iter().sum::<usize>(), 40);
    assert!(batches.iter().all(|&n| n <= 7));
    assert_eq!(batches.len(), 6);
    Ok(())
}

#[test]
fn deleted_and_out_of_range_keys_are_dropped() -> Result<()> {
    let dir = tempdir()?;
    let coll = open_variable(dir.path())?;
    let index = LongList::new(1000);
    write_session(&coll, &index, 0..100, 1, (0, 99))?;
    index.remove(7);
    // The second session shrinks the valid range to 0..=49.
    write_session(&coll, &index, 0..5, 2, (0, 49))?;

    let report = coll.merge_old_files(&index)?;
    // 0..=49 minus key 7 survive.
    assert_eq!(report.records_copied, 49);
    assert_eq!(report.records_dropped, 105 - 49);

    let mut keys = Vec::new();
    coll.for_each_key(|key, _| keys.push(key))?;
    keys.sort_unstable();
    let expected: Vec<u64> = (0..50).filter(|&k| k != 7).collect();
    assert_eq!(keys, expected);
    Ok(())
}

#[test]
fn too_few_files_is_a_noop() -> Result<()> {
    let dir = tempdir()?;
    let coll = open_variable(dir.path())?;
    let index = LongList::new(100);
    write_session(&coll, &index, 0..10, 1, (0, 9))?;

    let report = coll.merge_old_files(&index)?;
    assert!(report.is_noop());
    assert_eq!(coll.file_count(), 1);
    assert_eq!(coll.files()[0].file_id, 0);
    Ok(())
}

#[test]
fn oldest_files_policy_limits_selection() -> Result<()> {
    let dir = tempdir()?;
    let config = test_config().with_merge_policy(MergePolicy::OldestFiles(2));
    let coll = open_with(dir.path(), config)?;
    let index = LongList::new(100);
    for session in 0..4u64 {
        write_session(&coll, &index, session * 10..session * 10 + 10, 1, (0, 99))?;
    }

    let report = coll.merge_old_files(&index)?;
    assert_eq!(report.files_merged, 2);
    let ids: Vec<u32> = coll.files().iter().map(|m| m.file_id).collect();
    assert_eq!(ids, vec![2, 3, 4]);
    assert!(coll.files()[2].is_merge);
    for key in 0..40u64 {
        assert_eq!(
            coll.read_data_using_index(&index, key, DataMode::Value)?,
            Some(value_for(key, 1))
        );
    }
    Ok(())
}

#[test]
fn smaller_than_policy_skips_big_files() -> Result<()> {
    let dir = tempdir()?;
    let coll = open_with(
        dir.path(),
        test_config().with_merge_policy(MergePolicy::FilesSmallerThan(1000)),
    )?;
    let index = LongList::new(1000);
    write_session(&coll, &index, 0..200, 1, (0, 999))?; // large
    write_session(&coll, &index, 200..202, 1, (0, 999))?;
    write_session(&coll, &index, 202..204, 1, (0, 999))?;

    let report = coll.merge_old_files(&index)?;
    assert_eq!(report.files_merged, 2);
    assert_eq!(coll.file_count(), 2);
    assert_eq!(coll.files()[0].file_id, 0);
    Ok(())
}

#[test]
fn merge_output_rolls_over() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig {
        max_data_file_bytes: 256,
        ..test_config()
    };
    let coll = open_with(dir.path(), config)?;
    let index = LongList::new(1000);
    write_session(&coll, &index, 0..50, 1, (0, 99))?;
    write_session(&coll, &index, 50..100, 1, (0, 99))?;

    let report = coll.merge_old_files(&index)?;
    assert!(report.files_created > 1, "{report:?}");
    for meta in coll.files() {
        assert!(meta.data_size <= 256);
    }
    for key in 0..100u64 {
        assert_eq!(
            coll.read_data_using_index(&index, key, DataMode::Value)?,
            Some(value_for(key, 1))
        );
    }
    Ok(())
}

#[test]
fn merge_and_session_exclude_each_other() -> Result<()> {
    let dir = tempdir()?;
    let coll = open_variable(dir.path())?;
    let index = LongList::new(100);
    write_session(&coll, &index, 0..5, 1, (0, 9))?;
    write_session(&coll, &index, 5..10, 1, (0, 9))?;

    coll.start_writing()?;
    let err = coll.merge_old_files(&index).unwrap_err();
    assert!(err
        .downcast_ref::<DataFileError>()
        .map(DataFileError::is_illegal_state)
        .unwrap_or(false));
    coll.end_writing(0, 9)?;

    // After the failed attempt the collection is usable again.
    coll.merge_old_files(&index)?;
    coll.start_writing()?;
    coll.end_writing(0, 9)?;
    Ok(())
}

#[test]
fn relocation_skips_keys_updated_concurrently() -> Result<()> {
    /// Simulates a writer that moves key 0 while the merge is relocating.
    struct RacingIndex(LongList);

    impl LocationIndex for RacingIndex {
        fn location_of(&self, key: u64) -> Option<Location> {
            self.0.location_of(key)
        }

        fn relocate(&self, moves: &[Move]) -> Result<()> {
            self.0.put(0, Location::new(999, 0).raw())?;
            self.0.relocate(moves)
        }
    }

    let dir = tempdir()?;
    let coll = open_variable(dir.path())?;
    let index = RacingIndex(LongList::new(100));
    write_session(&coll, &index.0, 0..5, 1, (0, 9))?;
    write_session(&coll, &index.0, 5..10, 1, (0, 9))?;

    coll.merge_old_files(&index)?;
    assert_eq!(index.location_of(0), Some(Location::new(999, 0)));
    assert_eq!(index.location_of(1).map(|l| l.file_id()), Some(2));
    Ok(())
}

#[test]
fn readers_see_every_key_during_merge() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let coll = open_variable(dir.path())?;
    let index = LongList::new(10_000);
    for session in 0..10u64 {
        write_session(&coll, &index, session * 100..session * 100 + 100, 1, (0, 999))?;
    }
    // Overwrite half so the merge has stale records to skip.
    write_session(&coll, &index, (0..1000).step_by(2), 2, (0, 999))?;

    let done = AtomicBool::new(false);
    std::thread::scope(|s| -> Result<()> {
        let reader = s.spawn(|| -> Result<u64> {
            let mut passes = 0;
            while !done.load(Ordering::Acquire) || passes == 0 {
                for key in 0..1000u64 {
                    let version = if key % 2 == 0 { 2 } else { 1 };
                    let value = coll.read_data_using_index(&index, key, DataMode::Value)?;
                    assert_eq!(value, Some(value_for(key, version)), "key {key}");
                }
                passes += 1;
            }
            Ok(passes)
        });

        let report = coll.merge_old_files(&index)?;
        done.store(true, Ordering::Release);
        assert_eq!(report.records_copied, 1000);

        let passes = reader.join().expect("reader panicked")?;
        assert!(passes >= 1);
        Ok(())
    })?;
    assert_eq!(coll.file_count(), 1);
    Ok(())
}
