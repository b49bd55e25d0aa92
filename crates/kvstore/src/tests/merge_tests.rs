use super::helpers::*;
use crate::*;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use tempfile::tempdir;

#[test]
fn thousand_keys_ten_sessions_merge_with_concurrent_reader() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 1000)?;
    for session in 0..10u64 {
        let start = session * 100;
        write_session(&store, start..start + 100, 1, (0, start + 99))?;
    }
    assert_eq!(store.collection().file_count(), 10);
    for key in 0..1000u64 {
        assert_eq!(store.get(key)?, Some(value_for(key, 1)));
    }

    let merging = AtomicBool::new(true);
    let passes = AtomicU64::new(0);
    let report = thread::scope(|s| -> Result<MergeReport> {
        let reader = s.spawn(|| -> Result<()> {
            // At least one full pass, then keep going until the merge is done.
            loop {
                for key in 0..1000u64 {
                    let value = store.get(key)?;
                    assert_eq!(value, Some(value_for(key, 1)), "key {}", key);
                }
                passes.fetch_add(1, Ordering::Relaxed);
                if !merging.load(Ordering::Acquire) {
                    return Ok(());
                }
            }
        });
        let report = store.merge();
        merging.store(false, Ordering::Release);
        reader.join().expect("reader panicked")?;
        report
    })?;

    assert_eq!(report.files_merged, 10);
    assert_eq!(report.records_copied, 1000);
    assert_eq!(report.records_dropped, 0);
    assert!(passes.load(Ordering::Relaxed) >= 1);
    assert_eq!(store.collection().file_count(), 1);
    for key in 0..1000u64 {
        assert_eq!(store.get(key)?, Some(value_for(key, 1)));
    }
    assert!(store.verify_index()?.is_consistent());
    Ok(())
}

#[test]
fn merge_drops_overwritten_and_deleted_records() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 200)?;
    write_session(&store, 0..100, 1, (0, 99))?;
    write_session(&store, 0..50, 2, (0, 99))?;
    store.start_writing()?;
    for key in 90..100 {
        store.delete(key)?;
    }
    store.end_writing(0, 99)?;

    let report = store.merge()?;
    assert_eq!(report.records_copied, 90);
    assert_eq!(report.records_dropped, 60);

    for key in 0..100u64 {
        let expected = match key {
            0..=49 => Some(value_for(key, 2)),
            50..=89 => Some(value_for(key, 1)),
            _ => None,
        };
        assert_eq!(store.get(key)?, expected, "key {}", key);
    }
    let check = store.verify_index()?;
    assert!(check.is_consistent());
    assert_eq!(check.unindexed_keys, 0);
    Ok(())
}

#[test]
fn merge_respects_valid_range() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 200)?;
    write_session(&store, 0..100, 1, (0, 99))?;
    write_session(&store, 100..110, 1, (50, 109))?;

    let report = store.merge()?;
    assert_eq!(report.records_copied, 60);
    assert_eq!(report.records_dropped, 50);
    assert_eq!(store.get(49)?, None);
    assert_eq!(store.get(109)?, Some(value_for(109, 1)));
    Ok(())
}

#[test]
fn writes_after_merge_win_over_merged_copies() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 100)?;
    write_session(&store, 0..20, 1, (0, 19))?;
    write_session(&store, 0..10, 2, (0, 19))?;
    store.merge()?;
    write_session(&store, 5..15, 3, (0, 19))?;

    for key in 0..20u64 {
        let version = match key {
            5..=14 => 3,
            0..=4 => 2,
            _ => 1,
        };
        assert_eq!(store.get(key)?, Some(value_for(key, version)));
    }
    assert!(store.verify_index()?.is_consistent());
    Ok(())
}

#[test]
fn merges_racing_sessions_never_lose_committed_records() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 100)?;
    let done = AtomicBool::new(false);

    let writes = |store: &IndexedStore| -> Result<()> {
        for version in 1..=40u64 {
            // A running merge holds the writer role.
            loop {
                match store.start_writing() {
                    Ok(()) => break,
                    Err(e) if is_illegal_state(&e) => thread::yield_now(),
                    Err(e) => return Err(e),
                }
            }
            for key in 0..100u64 {
                store.put(key, &value_for(key, version))?;
            }
            store.end_writing(0, 99)?;
            for key in (0..100u64).step_by(7) {
                assert_eq!(store.get(key)?, Some(value_for(key, version)), "key {}", key);
            }
        }
        Ok(())
    };

    let (written, merges) = thread::scope(|s| {
        let merger = s.spawn(|| {
            let mut merges = 0u64;
            while !done.load(Ordering::Acquire) {
                if let Ok(report) = store.merge() {
                    merges += u64::from(!report.is_noop());
                }
                thread::yield_now();
            }
            merges
        });
        let written = writes(&store);
        done.store(true, Ordering::Release);
        (written, merger.join().expect("merger panicked"))
    });
    written?;

    for key in 0..100u64 {
        assert_eq!(store.get(key)?, Some(value_for(key, 40)));
    }
    let report = store.verify_index()?;
    assert!(report.is_consistent(), "{:?} after {} merges", report, merges);
    Ok(())
}

fn is_illegal_state(err: &anyhow::Error) -> bool {
    err.downcast_ref::<DataFileError>()
        .is_some_and(DataFileError::is_illegal_state)
}
