//! Restoring the bucket directory on open.
//!
//! The directory saved at close covers every data file below the header's
//! watermark. Newer files (later sessions and merge outputs) are replayed on
//! top of it in file id order, so the newest page of every bucket id wins.
//! Without a usable saved directory every file is replayed.
//!
//! Replaying can resurrect pages of overflow ids that were released after
//! the last save, and a saved directory can point into files a merge has
//! since deleted. Both kinds of entries are dropped: the first because no
//! chain links to them any more, the second because a merge only deletes a
//! file after copying its live pages elsewhere.
use anyhow::{bail, Context, Result};
use collection::{DataFileCollection, Location};
use longlist::LongList;
use std::collections::HashSet;
use std::path::Path;

use crate::bucket::NO_NEXT;
use crate::header::MapHeader;
use crate::read::{fetch, Fetch};
use crate::BucketKey;

/// Returns the restored directory and the next unused overflow id.
pub(crate) fn restore_directory<K: BucketKey>(
    collection: &DataFileCollection,
    header: &MapHeader,
    path: &Path,
) -> Result<(LongList, u64)> {
    let name = collection.store_name();
    let saved = if path.exists() {
        match LongList::load_from_file(path) {
            Ok(list) if list.capacity() == header.directory_capacity => Some(list),
            Ok(list) => {
                tracing::warn!(
                    map = %name,
                    capacity = list.capacity(),
                    expected = header.directory_capacity,
                    "saved bucket directory has the wrong capacity, rebuilding"
                );
                None
            }
            Err(e) => {
                tracing::warn!(map = %name, error = %e, "saved bucket directory unreadable, rebuilding");
                None
            }
        }
    } else {
        None
    };

    let rebuild = saved.is_none();
    let (directory, first_file) = match saved {
        Some(list) => (list, header.directory_watermark),
        None => (LongList::new(header.directory_capacity), 0),
    };

    let mut replayed = 0u64;
    let mut failure = None;
    collection.for_each_key_from(first_file, |id, location| {
        if failure.is_some() {
            return;
        }
        match directory.put(id, location.raw()) {
            Ok(()) => replayed += 1,
            Err(e) => failure = Some(e),
        }
    })?;
    if let Some(e) = failure {
        return Err(e).with_context(|| format!("failed to replay bucket files of map {}", name));
    }

    if rebuild || replayed > 0 {
        collect_garbage::<K>(collection, &directory, header.num_buckets)?;
    }

    let mut next_overflow_id = header.next_overflow_id.max(header.num_buckets);
    directory.for_each(|id, _| {
        if id >= next_overflow_id {
            next_overflow_id = id + 1;
        }
    });

    if rebuild {
        tracing::info!(map = %name, pages = replayed, "bucket directory rebuilt from data files");
    } else if replayed > 0 {
        tracing::info!(
            map = %name,
            watermark = header.directory_watermark,
            pages = replayed,
            "bucket directory caught up with newer data files"
        );
    }
    Ok((directory, next_overflow_id))
}

/// Drops entries that point into deleted files or that no chain reaches.
fn collect_garbage<K: BucketKey>(
    collection: &DataFileCollection,
    directory: &LongList,
    num_buckets: u64,
) -> Result<()> {
    let name = collection.store_name();
    let live_files: HashSet<u32> = collection.files().iter().map(|m| m.file_id).collect();
    let mut dangling = Vec::new();
    let mut heads = Vec::new();
    directory.for_each(|id, raw| {
        let alive = Location::from_raw(raw).is_some_and(|l| live_files.contains(&l.file_id()));
        if !alive {
            dangling.push(id);
        } else if id < num_buckets {
            heads.push(id);
        }
    });
    for id in &dangling {
        directory.remove(*id);
    }

    let mut reachable = HashSet::new();
    for head in heads {
        let mut id = head;
        loop {
            let bucket = match fetch::<K>(collection, directory, id)? {
                Fetch::Found(_, bucket) => bucket,
                Fetch::Empty | Fetch::Gone => {
                    bail!("chain {} of map {} is broken at bucket {}", head, name, id)
                }
            };
            if u64::from(bucket.owner) != head {
                bail!(
                    "bucket {} of map {} belongs to chain {}, reached from chain {}",
                    id,
                    name,
                    bucket.owner,
                    head
                );
            }
            if bucket.next == NO_NEXT {
                break;
            }
            id = bucket.next;
            if !reachable.insert(id) {
                bail!("chain {} of map {} loops at bucket {}", head, name, id);
            }
        }
    }

    let mut orphans = Vec::new();
    directory.for_each(|id, _| {
        if id >= num_buckets && !reachable.contains(&id) {
            orphans.push(id);
        }
    });
    for id in &orphans {
        directory.remove(*id);
    }
    if !dangling.is_empty() || !orphans.is_empty() {
        tracing::info!(
            map = %name,
            dangling = dangling.len(),
            orphans = orphans.len(),
            "dropped stale bucket directory entries"
        );
    }
    Ok(())
}
