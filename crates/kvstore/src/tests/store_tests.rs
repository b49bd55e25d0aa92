use super::helpers::*;
use crate::*;
use anyhow::Result;
use tempfile::tempdir;

fn error_kind(e: &anyhow::Error) -> Option<&DataFileError> {
    e.downcast_ref::<DataFileError>()
}

#[test]
fn put_get_round_trip_fixed() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 1000)?;
    write_session(&store, 0..500, 1, (0, 499))?;

    for key in 0..500u64 {
        assert_eq!(store.get(key)?, Some(value_for(key, 1)));
    }
    assert_eq!(store.get(500)?, None);
    assert_eq!(store.get(10_000)?, None);
    assert_eq!(store.len(), 500);
    Ok(())
}

#[test]
fn put_get_round_trip_variable() -> Result<()> {
    let dir = tempdir()?;
    let store = open_variable(dir.path(), 100)?;
    store.start_writing()?;
    for key in 0..100u64 {
        store.put(key, &vec![key as u8; key as usize * 13])?;
    }
    store.end_writing(0, 99)?;

    for key in 0..100u64 {
        assert_eq!(store.get(key)?, Some(vec![key as u8; key as usize * 13]));
    }
    Ok(())
}

#[test]
fn many_sessions_read_like_one() -> Result<()> {
    let dir = tempdir()?;
    let one = open_fixed(&dir.path().join("one"), 1000)?;
    write_session(&one, 0..1000, 1, (0, 999))?;

    let many = open_fixed(&dir.path().join("many"), 1000)?;
    for start in (0..1000u64).step_by(100) {
        write_session(&many, start..start + 100, 1, (0, start + 99))?;
    }
    assert_eq!(many.collection().file_count(), 10);

    for key in (0..1000u64).rev() {
        assert_eq!(one.get(key)?, many.get(key)?);
    }
    Ok(())
}

#[test]
fn session_is_invisible_until_it_ends() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 100)?;
    write_session(&store, 0..10, 1, (0, 9))?;

    store.start_writing()?;
    store.put(5, &value_for(5, 2))?;
    store.put(20, &value_for(20, 2))?;
    store.delete(6)?;
    assert_eq!(store.get(5)?, Some(value_for(5, 1)));
    assert_eq!(store.get(20)?, None);
    assert!(store.contains(6));
    store.end_writing(0, 20)?;

    assert_eq!(store.get(5)?, Some(value_for(5, 2)));
    assert_eq!(store.get(20)?, Some(value_for(20, 2)));
    assert!(!store.contains(6));
    Ok(())
}

#[test]
fn update_overwrites_previous_value() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 100)?;
    write_session(&store, 0..50, 1, (0, 49))?;
    write_session(&store, 10..20, 2, (0, 49))?;

    store.start_writing()?;
    store.put(30, &value_for(30, 3))?;
    store.put(30, &value_for(30, 4))?;
    store.end_writing(0, 49)?;

    assert_eq!(store.get(9)?, Some(value_for(9, 1)));
    assert_eq!(store.get(15)?, Some(value_for(15, 2)));
    assert_eq!(store.get(30)?, Some(value_for(30, 4)));
    Ok(())
}

#[test]
fn narrowing_the_range_drops_keys() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 100)?;
    write_session(&store, 0..50, 1, (0, 49))?;
    write_session(&store, 45..55, 2, (10, 50))?;

    assert_eq!(store.valid_key_range(), (10, 50));
    assert_eq!(store.get(5)?, None);
    assert_eq!(store.get(10)?, Some(value_for(10, 1)));
    assert_eq!(store.get(50)?, Some(value_for(50, 2)));
    assert_eq!(store.get(54)?, None);
    assert_eq!(store.len(), 41);
    Ok(())
}

#[test]
fn hashes_are_stored_with_records() -> Result<()> {
    let dir = tempdir()?;
    let layout = RecordLayout::fixed(VALUE_BYTES as u32).with_hash(32);
    let store = IndexedStore::open(dir.path(), "hashed", layout, 100, test_config())?;
    store.start_writing()?;
    for key in 0..10u64 {
        store.put_with_hash(key, &[key as u8; 32], &value_for(key, 1))?;
    }
    store.end_writing(0, 9)?;

    assert_eq!(store.get_hash(3)?, Some(vec![3u8; 32]));
    assert_eq!(store.get(3)?, Some(value_for(3, 1)));
    assert_eq!(store.get_hash(50)?, None);

    // A record without its hash does not fit the layout.
    store.start_writing()?;
    let err = store.put(1, &value_for(1, 2)).unwrap_err();
    assert!(matches!(error_kind(&err), Some(DataFileError::InvalidArgument(_))));
    store.end_writing(0, 9)?;
    Ok(())
}

#[test]
fn keys_beyond_capacity_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 10)?;
    store.start_writing()?;
    let err = store.put(10, &value_for(10, 1)).unwrap_err();
    assert!(matches!(error_kind(&err), Some(DataFileError::InvalidArgument(_))));
    let err = store.end_writing(0, 10).unwrap_err();
    assert!(matches!(error_kind(&err), Some(DataFileError::InvalidArgument(_))));
    // The session is still open after a rejected range.
    store.end_writing(0, 9)?;
    Ok(())
}

#[test]
fn lifecycle_violations_are_illegal_state() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 10)?;
    let illegal = |r: Result<()>| {
        r.unwrap_err()
            .downcast_ref::<DataFileError>()
            .is_some_and(DataFileError::is_illegal_state)
    };
    assert!(illegal(store.put(1, &value_for(1, 1))));
    assert!(illegal(store.delete(1)));
    assert!(illegal(store.end_writing(0, 9)));

    store.start_writing()?;
    assert!(illegal(store.start_writing()));
    assert!(illegal(store.merge().map(|_| ())));
    assert!(illegal(store.verify_index().map(|_| ())));
    store.end_writing(0, 9)?;
    Ok(())
}

#[test]
fn zero_capacity_is_rejected() {
    let dir = tempdir().unwrap();
    assert!(open_fixed(dir.path(), 0).is_err());
}

#[test]
fn aborted_session_changes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 100)?;
    write_session(&store, 0..10, 1, (0, 99))?;

    store.start_writing()?;
    store.put(3, &value_for(3, 2))?;
    store.delete(4)?;
    store.abort_writing()?;

    assert!(!store.is_writing());
    assert_eq!(store.collection().file_count(), 1);
    assert_eq!(store.get(3)?, Some(value_for(3, 1)));
    assert_eq!(store.get(4)?, Some(value_for(4, 1)));
    assert!(store.abort_writing().is_err());

    write_session(&store, 3..4, 3, (0, 99))?;
    assert_eq!(store.get(3)?, Some(value_for(3, 3)));
    Ok(())
}

#[test]
fn merge_is_rejected_while_a_session_is_committed() -> Result<()> {
    let dir = tempdir()?;
    let store = open_fixed(dir.path(), 100)?;
    write_session(&store, 0..10, 1, (0, 99))?;
    write_session(&store, 0..10, 2, (0, 99))?;

    *store.phase.lock() = Phase::Committing;
    assert!(store.is_writing());
    let err = store.merge().unwrap_err();
    assert!(err
        .downcast_ref::<DataFileError>()
        .is_some_and(DataFileError::is_illegal_state));
    assert!(store.start_writing().is_err());
    *store.phase.lock() = Phase::Idle;

    assert_eq!(store.merge()?.files_merged, 2);
    Ok(())
}
