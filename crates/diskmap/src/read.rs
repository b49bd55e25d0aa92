//! Lookups: walking a bucket chain while a writer may be replacing it.
use anyhow::Result;
use collection::{DataFileCollection, DataFileError, DataMode, Location};
use datafile::data_file_name;
use longlist::LongList;
use std::io;

use crate::bucket::{Bucket, NO_NEXT};
use crate::{illegal_state, BucketKey, DiskHashMap};

/// Result of reading the page a directory entry points to.
pub(crate) enum Fetch<K> {
    /// The directory has no entry for the id.
    Empty,
    /// The entry points into a file that no longer exists.
    Gone,
    Found(Location, Bucket<K>),
}

/// Reads the page of bucket `id` through `directory`.
pub(crate) fn fetch<K: BucketKey>(
    collection: &DataFileCollection,
    directory: &LongList,
    id: u64,
) -> Result<Fetch<K>> {
    let Some(location) = directory.get(id).and_then(Location::from_raw) else {
        return Ok(Fetch::Empty);
    };
    let page = match collection.read_data(location, DataMode::Value) {
        Ok(page) => page,
        Err(e) if is_missing_file(&e) => return Ok(Fetch::Gone),
        Err(e) => return Err(e),
    };
    let bucket = Bucket::decode(&page).map_err(|reason| {
        anyhow::Error::new(DataFileError::Corrupt {
            path: collection
                .dir()
                .join(data_file_name(collection.store_name(), location.file_id())),
            reason: format!("bucket {} at {}: {}", id, location, reason),
        })
    })?;
    Ok(Fetch::Found(location, bucket))
}

fn is_missing_file(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<DataFileError>(),
        Some(DataFileError::Io(io)) if io.kind() == io::ErrorKind::NotFound
    )
}

impl<K: BucketKey> DiskHashMap<K> {
    /// Returns the value stored for `key`, or `not_found`.
    pub fn get(&self, key: &K, not_found: u64) -> Result<u64> {
        Ok(self.get_value(key)?.unwrap_or(not_found))
    }

    /// `true` if `key` has a value.
    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.get_value(key)?.is_some())
    }

    /// Looks `key` up in its bucket chain.
    ///
    /// Only sealed sessions are visible. If the chain is rewritten or
    /// merged while it is being walked, the walk starts over from the head,
    /// up to `read_retries` times.
    ///
    /// # Errors
    ///
    /// `IllegalState` if the chain kept changing for every attempt; I/O and
    /// corruption errors from reading pages.
    pub fn get_value(&self, key: &K) -> Result<Option<u64>> {
        let hash = key.bucket_hash();
        let head = self.bucket_index(hash);
        let retries = self.collection.config().read_retries;

        'walk: for attempt in 0..=retries {
            if attempt > 0 {
                tracing::debug!(map = %self.name, head, attempt, "bucket chain changed, restarting walk");
                std::thread::yield_now();
            }
            let (head_location, mut bucket) =
                match fetch::<K>(&self.collection, &self.directory, head)? {
                    Fetch::Empty => return Ok(None),
                    Fetch::Gone => continue 'walk,
                    Fetch::Found(location, bucket) => (location, bucket),
                };
            let found = loop {
                if u64::from(bucket.owner) != head {
                    continue 'walk;
                }
                if let Some(value) = bucket.find(hash, key) {
                    break Some(value);
                }
                if bucket.next == NO_NEXT {
                    break None;
                }
                match fetch::<K>(&self.collection, &self.directory, bucket.next)? {
                    Fetch::Found(_, next) => bucket = next,
                    Fetch::Empty | Fetch::Gone => continue 'walk,
                }
            };
            // A head that moved means the pages walked may belong to a newer
            // chain than the head that was read.
            if self.directory.get(head) != Some(head_location.raw()) {
                continue 'walk;
            }
            return Ok(found);
        }
        Err(illegal_state(format!(
            "bucket {} of map {} changed during {} consecutive reads",
            head,
            self.name,
            retries + 1
        )))
    }
}
