//! # KvStore - in-memory index over a data file collection
//!
//! An [`IndexedStore`] keeps every record in a [`DataFileCollection`] and
//! an in-memory [`LongList`] from key to the record's [`Location`]. A read
//! is one index lookup and one positional read.
//!
//! ## Write Path
//!
//! ```text
//! put(key, value) ──► collection.store_data ──► Location ──► staged
//! delete(key)     ─────────────────────────────────────────► staged
//! end_writing     ──► seal file ──► apply staged updates to the index
//! ```
//!
//! Staged updates only reach the index once the session's file is sealed,
//! so a reader never gets a location inside the file being written. A
//! session that is dropped or aborted before `end_writing` leaves nothing
//! behind: its file is deleted and its staged updates are discarded.
//!
//! ## Persistence
//!
//! The index is saved to `<name>_index.ll` at close, and at the end of every
//! session that deleted keys, together with the id of the first data file
//! it does not cover. On open, the saved index is loaded and newer files
//! are replayed on top of it (newest record wins). Without a usable saved
//! index it is rebuilt from all files.
//!
//! ## Merge
//!
//! [`merge`](IndexedStore::merge) hands the index to
//! [`DataFileCollection::merge_old_files`]; a record is live exactly when
//! the index points at it, and moved records are switched over with a
//! compare-and-swap so that a newer write of the key is never undone.

mod read;
mod recovery;
mod write;

use anyhow::{Context, Result};
use collection::DataFileCollection;
use config::StoreConfig;
use longlist::LongList;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

pub use collection::{DataFileError, Location, MergeReport, RecordLayout};
pub use recovery::IndexVerification;

use write::Staged;

/// What the writer role of a store is doing.
pub(crate) enum Phase {
    Idle,
    Writing(Staged),
    /// `end_writing` is sealing the file and applying staged updates.
    Committing,
    Merging,
    Verifying,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Writing(_) => "writing",
            Phase::Committing => "committing",
            Phase::Merging => "merging",
            Phase::Verifying => "verifying",
        }
    }
}

/// Puts the store back to `Idle` when a commit or merge ends, successfully
/// or not.
pub(crate) struct PhaseGuard<'a>(&'a Mutex<Phase>);

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = Phase::Idle;
    }
}

/// Key-value store with `u64` keys below a fixed capacity and byte values.
///
/// One writer at a time runs write sessions and merges; any number of
/// threads may read concurrently.
pub struct IndexedStore {
    name: String,
    collection: DataFileCollection,
    index: LongList,
    index_path: PathBuf,
    phase: Mutex<Phase>,
}

impl IndexedStore {
    /// Opens the store `name` in `dir` for keys `0..capacity`.
    ///
    /// # Errors
    ///
    /// Any error of [`DataFileCollection::open`], or an I/O error while
    /// restoring the index.
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        layout: RecordLayout,
        capacity: u64,
        config: StoreConfig,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        if capacity == 0 {
            return Err(anyhow::Error::new(DataFileError::InvalidArgument(format!(
                "store {} needs a capacity of at least one key",
                name
            ))));
        }
        let collection = DataFileCollection::open(dir, name, layout, config)?;
        let index_path = dir.join(format!("{}_index.ll", name));
        let index = recovery::restore_index(&collection, &index_path, capacity)
            .with_context(|| format!("failed to restore index of store {}", name))?;

        Ok(Self {
            name: name.to_string(),
            collection,
            index,
            index_path,
            phase: Mutex::new(Phase::Idle),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.index.capacity()
    }

    #[must_use]
    pub fn layout(&self) -> RecordLayout {
        self.collection.layout()
    }

    /// Number of keys with a value. Walks the whole index.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.index.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inclusive key range set by the last completed session.
    #[must_use]
    pub fn valid_key_range(&self) -> (u64, u64) {
        self.index.valid_range()
    }

    /// Location of the current record of `key`, if any.
    #[must_use]
    pub fn location_of(&self, key: u64) -> Option<Location> {
        self.index.get(key).and_then(Location::from_raw)
    }

    /// The collection holding the records.
    #[must_use]
    pub fn collection(&self) -> &DataFileCollection {
        &self.collection
    }

    /// `true` from `start_writing` until `end_writing` has applied the
    /// session to the index.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Writing(_) | Phase::Committing)
    }

    /// Merges data files according to the configured merge policy.
    ///
    /// # Errors
    ///
    /// `IllegalState` while a write session is open or being committed, or
    /// while another merge runs.
    pub fn merge(&self) -> Result<MergeReport> {
        let _guard = self.enter(Phase::Merging, "merge")?;
        self.collection
            .merge_old_files(&self.index)
            .with_context(|| format!("failed to merge store {}", self.name))
    }

    /// Ends an open session over the current key range, saves the index and
    /// closes the collection.
    pub fn close(&self) -> Result<()> {
        if matches!(*self.phase.lock(), Phase::Writing(_)) {
            let (min, max) = self.valid_key_range();
            self.end_writing(min, max)?;
        }
        self.save_index()?;
        self.collection.close()?;
        tracing::debug!(store = %self.name, "indexed store closed");
        Ok(())
    }

    /// Moves an idle store to `next` until the returned guard is dropped.
    pub(crate) fn enter(&self, next: Phase, action: &str) -> Result<PhaseGuard<'_>> {
        let mut phase = self.phase.lock();
        if !matches!(*phase, Phase::Idle) {
            return Err(illegal_state(format!(
                "cannot {} store {} while {}",
                action,
                self.name,
                phase.name()
            )));
        }
        *phase = next;
        Ok(PhaseGuard(&self.phase))
    }

    /// Writes the index together with the first file id it does not cover.
    fn save_index(&self) -> Result<()> {
        let watermark = self
            .collection
            .last_file_id()
            .map_or(0, |id| u64::from(id) + 1);
        self.index
            .write_to_file_tagged(&self.index_path, watermark)
            .with_context(|| format!("failed to save index of store {}", self.name))
    }
}

impl std::fmt::Debug for IndexedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedStore")
            .field("name", &self.name)
            .field("capacity", &self.index.capacity())
            .field("valid_range", &self.index.valid_range())
            .field("files", &self.collection.file_count())
            .finish()
    }
}

pub(crate) fn illegal_state(msg: String) -> anyhow::Error {
    anyhow::Error::new(DataFileError::IllegalState(msg))
}

#[cfg(test)]
mod tests;
