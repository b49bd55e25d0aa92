//! # Diskmap - a hash map whose buckets live on disk
//!
//! A [`DiskHashMap`] maps fixed-size keys to `u64` values (usually record
//! locations of another store). Only the bucket directory, one `u64`
//! location per bucket id, is kept in memory; the buckets themselves are
//! 4096-byte pages stored in a [`DataFileCollection`].
//!
//! ## Architecture
//!
//! ```text
//!   key ──bucket_hash──► head bucket id = hash & (num_buckets - 1)
//!                               │
//!                               ▼
//!   ┌──────────────── bucket directory (LongList) ───────────────┐
//!   │ id 0 .. num_buckets-1         heads                        │
//!   │ id num_buckets ..             overflow pages               │
//!   └─────────────────────────────┬──────────────────────────────┘
//!                                 │ Location
//!                                 ▼
//!   ┌──────────── bucket collection (<name>_NNNNNN.dfl) ──────────┐
//!   │ [head page] ─next─► [overflow page] ─next─► [overflow page] │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Write sessions
//!
//! Mutations between [`start_writing`](DiskHashMap::start_writing) and
//! [`end_writing`](DiskHashMap::end_writing) are buffered per head bucket.
//! Ending the session rewrites every touched chain into one new data file
//! (overflow pages get fresh ids), seals it, then swaps the directory
//! entries: overflow pages first, the head last, and finally frees the old
//! overflow ids. A reader therefore sees either the old or the new chain of
//! a bucket, and restarts its walk when a page it follows was replaced.
//!
//! ## Files
//!
//! | File                    | Content                                        |
//! |-------------------------|------------------------------------------------|
//! | `<name>.hdhm`           | Geometry and the directory watermark           |
//! | `<name>_buckets.ll`     | Bucket directory saved at close                |
//! | `<name>_NNNNNN.dfl`     | Bucket pages, one record per page              |

mod bucket;
mod header;
mod key;
mod read;
mod recovery;
mod write;

use anyhow::{Context, Result};
use collection::DataFileCollection;
use config::StoreConfig;
use longlist::LongList;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub use bucket::{entries_per_bucket, BUCKET_BYTES};
pub use collection::{DataFileError, MergeReport, RecordLayout};
pub use header::HEADER_MAGIC;
pub use key::{fnv1a_32, BucketKey};

use header::MapHeader;
use write::Session;

/// What the writer role of a map is doing.
pub(crate) enum Phase<K> {
    Idle,
    Writing(Session<K>),
    /// `end_writing` is writing chains and switching the directory.
    Committing,
    Merging,
}

impl<K> Phase<K> {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Writing(_) => "writing",
            Phase::Committing => "committing",
            Phase::Merging => "merging",
        }
    }
}

/// Puts the map back to `Idle` when a commit or merge ends.
pub(crate) struct PhaseGuard<'a, K>(&'a Mutex<Phase<K>>);

impl<K> Drop for PhaseGuard<'_, K> {
    fn drop(&mut self) {
        *self.0.lock() = Phase::Idle;
    }
}

/// Target fill ratio of head buckets for the expected key count.
pub const LOADING_FACTOR: f64 = 0.5;

/// Fewest head buckets a map is created with.
pub const MIN_BUCKETS: u64 = 16;

/// Most head buckets a map can have; bucket hashes are 32 bits wide.
pub const MAX_BUCKETS: u64 = 1 << 31;

/// Hash map from `K` to `u64` with on-disk buckets.
///
/// One writer at a time runs write sessions and merges; any number of
/// threads may call [`get`](DiskHashMap::get) concurrently.
pub struct DiskHashMap<K: BucketKey> {
    name: String,
    collection: DataFileCollection,
    directory: LongList,
    header_path: PathBuf,
    directory_path: PathBuf,
    num_buckets: u64,
    entries_per_bucket: usize,
    next_overflow_id: AtomicU64,
    /// Overflow ids released by earlier sessions.
    free_ids: Mutex<Vec<u64>>,
    phase: Mutex<Phase<K>>,
}

impl<K: BucketKey> DiskHashMap<K> {
    /// Opens the map `name` in `dir`, creating it sized for
    /// `expected_key_count` keys if it does not exist.
    ///
    /// An existing map keeps the geometry recorded in its header. Its
    /// bucket directory is loaded from `<name>_buckets.ll` and brought up
    /// to date from newer data files, or rebuilt from all data files if no
    /// usable directory was saved.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `K` does not fit a bucket page or differs from
    /// the key size the map was created with; `Corrupt` if data files exist
    /// without a header; any error of [`DataFileCollection::open`].
    pub fn open(
        expected_key_count: u64,
        dir: impl AsRef<Path>,
        name: &str,
        config: StoreConfig,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let per_bucket = entries_per_bucket::<K>();
        if per_bucket == 0 {
            return Err(anyhow::Error::new(DataFileError::InvalidArgument(format!(
                "keys of {} bytes do not fit a {} byte bucket",
                K::SERIALIZED_SIZE,
                BUCKET_BYTES
            ))));
        }
        let max_overflow = config.max_overflow_buckets as u64;
        let collection =
            DataFileCollection::open(dir, name, RecordLayout::fixed(BUCKET_BYTES as u32), config)
                .with_context(|| format!("failed to open bucket files of map {}", name))?;

        let header_path = MapHeader::path(dir, name);
        let directory_path = dir.join(format!("{}_buckets.ll", name));
        let header = if header_path.exists() {
            let header = MapHeader::load(&header_path)?;
            if header.key_size as usize != K::SERIALIZED_SIZE
                || header.entries_per_bucket as usize != per_bucket
            {
                return Err(anyhow::Error::new(DataFileError::InvalidArgument(format!(
                    "map {} was created for {} byte keys ({} per bucket), opened with {} byte keys",
                    name,
                    header.key_size,
                    header.entries_per_bucket,
                    K::SERIALIZED_SIZE
                ))));
            }
            header
        } else {
            if collection.loaded_from_existing_files() {
                return Err(anyhow::Error::new(DataFileError::Corrupt {
                    path: header_path,
                    reason: "bucket files exist but the header is missing".to_string(),
                }));
            }
            let num_buckets = bucket_count(expected_key_count, per_bucket);
            let header = MapHeader {
                key_size: K::SERIALIZED_SIZE as u32,
                entries_per_bucket: per_bucket as u32,
                num_buckets,
                directory_capacity: num_buckets
                    .saturating_mul(1 + 2 * max_overflow)
                    .min(u64::MAX >> 1),
                next_overflow_id: num_buckets,
                directory_watermark: 0,
            };
            if directory_path.exists() {
                fs::remove_file(&directory_path).with_context(|| {
                    format!("failed to remove stale directory {}", directory_path.display())
                })?;
            }
            header.save(&header_path)?;
            tracing::info!(
                map = %name,
                num_buckets,
                entries_per_bucket = per_bucket,
                expected_key_count,
                "created disk hash map"
            );
            header
        };

        let (directory, next_overflow_id) =
            recovery::restore_directory::<K>(&collection, &header, &directory_path)?;
        let free_ids = (header.num_buckets..next_overflow_id)
            .filter(|id| directory.get(*id).is_none())
            .collect();

        Ok(Self {
            name: name.to_string(),
            collection,
            directory,
            header_path,
            directory_path,
            num_buckets: header.num_buckets,
            entries_per_bucket: per_bucket,
            next_overflow_id: AtomicU64::new(next_overflow_id),
            free_ids: Mutex::new(free_ids),
            phase: Mutex::new(Phase::Idle),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of head buckets.
    #[must_use]
    pub fn num_buckets(&self) -> u64 {
        self.num_buckets
    }

    #[must_use]
    pub fn entries_per_bucket(&self) -> usize {
        self.entries_per_bucket
    }

    /// Number of sealed bucket files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.collection.file_count()
    }

    /// Overflow pages currently linked into some chain.
    #[must_use]
    pub fn overflow_bucket_count(&self) -> u64 {
        let mut n = 0;
        self.directory.for_each(|id, _| {
            if id >= self.num_buckets {
                n += 1;
            }
        });
        n
    }

    /// `true` from `start_writing` until `end_writing` has switched the
    /// directory over.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Writing(_) | Phase::Committing)
    }

    /// Merges the bucket files according to the configured merge policy,
    /// moving directory entries to the copied pages.
    ///
    /// # Errors
    ///
    /// `IllegalState` while a write session is open or being committed.
    pub fn merge(&self) -> Result<MergeReport> {
        let _guard = {
            let mut phase = self.phase.lock();
            if !matches!(*phase, Phase::Idle) {
                return Err(illegal_state(format!(
                    "cannot merge map {} while {}",
                    self.name,
                    phase.name()
                )));
            }
            *phase = Phase::Merging;
            PhaseGuard(&self.phase)
        };
        self.collection
            .merge_old_files(&self.directory)
            .with_context(|| format!("failed to merge map {}", self.name))
    }

    /// Ends an open session, saves the bucket directory and header, and
    /// closes the bucket files.
    pub fn close(&self) -> Result<()> {
        if matches!(*self.phase.lock(), Phase::Writing(_)) {
            self.end_writing()?;
        }
        let watermark = self.collection.last_file_id().map_or(0, |id| id + 1);
        self.directory
            .write_to_file(&self.directory_path)
            .with_context(|| format!("failed to save directory of map {}", self.name))?;
        let header = MapHeader {
            key_size: K::SERIALIZED_SIZE as u32,
            entries_per_bucket: self.entries_per_bucket as u32,
            num_buckets: self.num_buckets,
            directory_capacity: self.directory.capacity(),
            next_overflow_id: self.next_overflow_id.load(Ordering::Acquire),
            directory_watermark: watermark,
        };
        header.save(&self.header_path)?;
        self.collection.close()?;
        tracing::debug!(map = %self.name, watermark, "disk hash map closed");
        Ok(())
    }

    fn bucket_index(&self, hash: u32) -> u64 {
        u64::from(hash) & (self.num_buckets - 1)
    }
}

impl<K: BucketKey> std::fmt::Debug for DiskHashMap<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskHashMap")
            .field("name", &self.name)
            .field("num_buckets", &self.num_buckets)
            .field("entries_per_bucket", &self.entries_per_bucket)
            .field("files", &self.collection.file_count())
            .finish()
    }
}

/// Head bucket count for `expected` keys: a power of two, at least
/// [`MIN_BUCKETS`], filling heads to [`LOADING_FACTOR`].
fn bucket_count(expected: u64, per_bucket: usize) -> u64 {
    let keys_per_head = (per_bucket as f64 * LOADING_FACTOR).max(1.0);
    let needed = (expected as f64 / keys_per_head).ceil() as u64;
    needed.max(MIN_BUCKETS).next_power_of_two().min(MAX_BUCKETS)
}

pub(crate) fn illegal_state(msg: String) -> anyhow::Error {
    anyhow::Error::new(DataFileError::IllegalState(msg))
}

#[cfg(test)]
mod tests;
