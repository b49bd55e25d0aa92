//! Restoring and checking the in-memory index.
use anyhow::{bail, Result};
use collection::{DataFileCollection, Location};
use longlist::LongList;
use std::collections::HashSet;
use std::path::Path;

use crate::{IndexedStore, Phase};

/// Outcome of [`IndexedStore::verify_index`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexVerification {
    /// Keys present in the live index.
    pub live_keys: u64,
    /// Live keys whose location differs from the newest record on disk.
    pub mismatched: Vec<u64>,
    /// Keys with records on disk but no index entry: deleted keys whose
    /// records a merge has not dropped yet.
    pub unindexed_keys: u64,
}

impl IndexVerification {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Loads the saved index and replays newer files on top of it, or rebuilds
/// it from every file.
pub(crate) fn restore_index(
    collection: &DataFileCollection,
    path: &Path,
    capacity: u64,
) -> Result<LongList> {
    let name = collection.store_name();
    let (min, max) = collection.valid_key_range();
    if min >= capacity {
        bail!(
            "valid key range of store {} starts at {}, beyond the capacity {}",
            name,
            min,
            capacity
        );
    }
    let max = max.min(capacity - 1);

    let saved = if path.exists() {
        match LongList::load_tagged(path) {
            Ok((list, watermark)) if list.capacity() == capacity => Some((list, watermark)),
            Ok((list, _)) => {
                tracing::warn!(
                    store = %name,
                    capacity = list.capacity(),
                    expected = capacity,
                    "saved index has a different capacity, rebuilding"
                );
                None
            }
            Err(e) => {
                tracing::warn!(store = %name, error = %e, "saved index unreadable, rebuilding");
                None
            }
        }
    } else {
        None
    };
    let rebuild = saved.is_none();
    let (index, first_file) = match saved {
        Some((list, watermark)) => (list, u32::try_from(watermark).unwrap_or(u32::MAX)),
        None => (LongList::new(capacity), 0),
    };
    index.update_valid_range(min, max)?;

    let replayed = replay(collection, &index, first_file)?;
    let dangling = drop_dangling(collection, &index);

    if rebuild && collection.loaded_from_existing_files() {
        tracing::info!(store = %name, records = replayed, keys = index.count(), "index rebuilt from data files");
    } else if replayed > 0 {
        tracing::info!(store = %name, watermark = first_file, records = replayed, "index caught up with newer data files");
    }
    if dangling > 0 {
        tracing::warn!(store = %name, dangling, "dropped index entries pointing to missing files");
    }
    Ok(index)
}

/// Puts every in-range record of files from `first_file` on into `index`,
/// oldest file first, so the newest record of a key wins.
fn replay(collection: &DataFileCollection, index: &LongList, first_file: u32) -> Result<u64> {
    let (min, max) = index.valid_range();
    let mut replayed = 0u64;
    let mut failure = None;
    collection.for_each_key_from(first_file, |key, location| {
        if failure.is_some() || key < min || key > max {
            return;
        }
        match index.put(key, location.raw()) {
            Ok(()) => replayed += 1,
            Err(e) => failure = Some(e),
        }
    })?;
    if let Some(e) = failure {
        return Err(e.into());
    }
    Ok(replayed)
}

fn drop_dangling(collection: &DataFileCollection, index: &LongList) -> usize {
    let live_files: HashSet<u32> = collection.files().iter().map(|m| m.file_id).collect();
    let mut dangling = Vec::new();
    index.for_each(|key, raw| {
        let alive = Location::from_raw(raw).is_some_and(|l| live_files.contains(&l.file_id()));
        if !alive {
            dangling.push((key, raw));
        }
    });
    for (key, raw) in &dangling {
        index.remove_if_equal(*key, *raw);
    }
    dangling.len()
}

impl IndexedStore {
    /// Rebuilds an index from the data files and compares it with the live
    /// one.
    ///
    /// # Errors
    ///
    /// `IllegalState` while a write session or merge is running; I/O
    /// errors from the scan.
    pub fn verify_index(&self) -> Result<IndexVerification> {
        let _guard = self.enter(Phase::Verifying, "verify")?;
        let rebuilt = LongList::new(self.index.capacity());
        let (min, max) = self.index.valid_range();
        rebuilt.update_valid_range(min, max)?;
        replay(&self.collection, &rebuilt, 0)?;

        let mut report = IndexVerification::default();
        self.index.for_each(|key, raw| {
            report.live_keys += 1;
            if rebuilt.get(key) != Some(raw) {
                report.mismatched.push(key);
            }
        });
        rebuilt.for_each(|key, _| {
            if self.index.get(key).is_none() {
                report.unindexed_keys += 1;
            }
        });

        if report.is_consistent() {
            tracing::debug!(store = %self.name, live_keys = report.live_keys, "index verified");
        } else {
            tracing::warn!(
                store = %self.name,
                live_keys = report.live_keys,
                mismatched = report.mismatched.len(),
                "index does not match data files"
            );
        }
        Ok(report)
    }
}
