//! # Collection - many data files as one logical key space
//!
//! A [`DataFileCollection`] owns every data file of one store in one
//! directory. New records are appended in write sessions, each session
//! producing one new file. A merge consolidates older files, keeping only
//! the records the caller's index still points at, and moves the index over
//! to the new copies before the old files are deleted.
//!
//! ## Architecture
//!
//! ```text
//!  writer role                         any number of readers
//!      |                                       |
//!      v                                       v
//! ┌──────────────────────────────────────────────────────────┐
//! │                  DATA FILE COLLECTION                    │
//! │                                                          │
//! │ write.rs   start_writing → store_data* → end_writing     │
//! │              (one open file, not yet readable)           │
//! │                                                          │
//! │ read.rs    read_data / read_data_using_index             │
//! │              (lock-free snapshot of sealed files)        │
//! │                                                          │
//! │ compaction.rs  merge_old_files(index)                    │
//! │              copy live → publish → relocate → delete     │
//! │                                                          │
//! │ recovery.rs  drop footer-less files and temp files,      │
//! │              load sealed files, pick the next file id    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                                |
//! |-----------------|--------------------------------------------------------|
//! | [`lib.rs`]      | `DataFileCollection`, `open`, accessors, snapshot, close |
//! | [`recovery`]    | Directory scan, incomplete file cleanup                |
//! | [`write`]       | Write sessions                                         |
//! | [`read`]        | Point reads, retrying index reads, full scans          |
//! | [`compaction`]  | `merge_old_files` and file selection                   |
//! | [`metadata`]    | Persistent valid key range (atomic file ops)           |
//! | [`index`]       | `LocationIndex` callback and its `LongList` impl       |
//!
//! ## State machine
//!
//! ```text
//! Idle ──start_writing──► Writing ──end_writing──► Idle
//! Idle ──merge_old_files──► Merging ──(done)──► Idle
//! ```
//!
//! Writing and merging never overlap; attempting either while the other is
//! running fails with `IllegalState`.

mod compaction;
mod index;
mod metadata;
mod read;
mod recovery;
mod write;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use config::StoreConfig;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub use compaction::MergeReport;
pub use datafile::{
    DataFileError, DataFileMetadata, DataFileReader, DataFileWriter, DataMode, Location, Record,
    RecordLayout, ValueSize, KEY_BYTES,
};
pub use index::{LocationIndex, Move};
pub use metadata::{CollectionMetadata, METADATA_EXTENSION};

/// Sealed files, ordered by ascending file id.
pub(crate) type FileList = Vec<Arc<DataFileReader>>;

/// What the single writer role is currently doing.
pub(crate) enum WriteState {
    Idle,
    Writing(DataFileWriter),
    Merging,
    Closed,
}

impl WriteState {
    fn name(&self) -> &'static str {
        match self {
            WriteState::Idle => "idle",
            WriteState::Writing(_) => "writing",
            WriteState::Merging => "merging",
            WriteState::Closed => "closed",
        }
    }
}

/// A set of data files in one directory that together form one store.
///
/// # Write Path
///
/// 1. [`start_writing`](DataFileCollection::start_writing) creates the next
///    file.
/// 2. [`store_data`](DataFileCollection::store_data) appends records and
///    returns their [`Location`]s.
/// 3. [`end_writing`](DataFileCollection::end_writing) seals the file,
///    persists the valid key range and publishes the file to readers.
///
/// # Read Path
///
/// Readers load the current file list snapshot without locking and read
/// with positional I/O. A file being deleted by a merge stays readable
/// through any snapshot that still holds it.
pub struct DataFileCollection {
    pub(crate) dir: PathBuf,
    pub(crate) store_name: String,
    pub(crate) layout: RecordLayout,
    pub(crate) config: StoreConfig,
    pub(crate) files: ArcSwap<FileList>,
    pub(crate) state: Mutex<WriteState>,
    pub(crate) metadata: Mutex<CollectionMetadata>,
    pub(crate) next_file_id: AtomicU32,
    /// `file_id + 1` of the file currently being written, `0` if none.
    pub(crate) open_file: AtomicU64,
    loaded_from_existing: bool,
    /// Held for the lifetime of the collection; the OS lock is released
    /// when the handle is closed.
    _lock: File,
}

impl DataFileCollection {
    /// Opens the collection `store_name` in `dir`, creating the directory if
    /// needed.
    ///
    /// Takes an exclusive lock on `<store_name>.lock`, removes incomplete
    /// files left by a crash, loads every sealed file and the persisted
    /// valid key range.
    ///
    /// # Errors
    ///
    /// Fails if another process holds the store lock, if the configuration
    /// is invalid, if a sealed file has a different record layout, or on
    /// any I/O failure.
    pub fn open(
        dir: impl AsRef<Path>,
        store_name: &str,
        layout: RecordLayout,
        config: StoreConfig,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        config
            .validate()
            .with_context(|| format!("invalid configuration for store {}", store_name))?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;

        let lock_path = dir.join(format!("{}.lock", store_name));
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!("store {} in {} is locked by another writer", store_name, dir.display())
        })?;

        Self::cleanup_tmp_files(&dir, store_name);
        let (files, max_id) = Self::load_files(&dir, store_name, layout)?;
        let metadata = CollectionMetadata::load_or_create(&dir, store_name)?;
        let loaded_from_existing = !files.is_empty();

        if loaded_from_existing {
            tracing::info!(
                store = %store_name,
                files = files.len(),
                min_valid_key = metadata.min_valid_key,
                max_valid_key = metadata.max_valid_key,
                "loaded existing data files"
            );
        }

        Ok(Self {
            dir,
            store_name: store_name.to_string(),
            layout,
            config,
            files: ArcSwap::from_pointee(files),
            state: Mutex::new(WriteState::Idle),
            metadata: Mutex::new(metadata),
            next_file_id: AtomicU32::new(max_id.map_or(0, |id| id + 1)),
            open_file: AtomicU64::new(0),
            loaded_from_existing,
            _lock: lock,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    #[must_use]
    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of sealed files visible to readers.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.load().len()
    }

    /// Footer metadata of every sealed file, oldest first.
    #[must_use]
    pub fn files(&self) -> Vec<DataFileMetadata> {
        self.files.load().iter().map(|r| r.metadata().clone()).collect()
    }

    /// Id of the newest sealed file, if any.
    #[must_use]
    pub fn last_file_id(&self) -> Option<u32> {
        self.files.load().last().map(|r| r.file_id())
    }

    /// Sum of the on-disk sizes of all sealed files.
    #[must_use]
    pub fn total_file_size(&self) -> u64 {
        self.files.load().iter().map(|r| r.file_size()).sum()
    }

    /// Inclusive key range declared by the last completed write session.
    #[must_use]
    pub fn valid_key_range(&self) -> (u64, u64) {
        let meta = self.metadata.lock();
        (meta.min_valid_key, meta.max_valid_key)
    }

    #[must_use]
    pub fn is_writing(&self) -> bool {
        matches!(*self.state.lock(), WriteState::Writing(_))
    }

    /// `true` if sealed files were found when the collection was opened.
    #[must_use]
    pub fn loaded_from_existing_files(&self) -> bool {
        self.loaded_from_existing
    }

    /// Hard-links every sealed file into `target` and writes the metadata
    /// file there, producing a consistent copy that
    /// [`open`](DataFileCollection::open) can load.
    ///
    /// The write session, if any, is left out. Merges cannot start while a
    /// snapshot is taken.
    pub fn snapshot(&self, target: impl AsRef<Path>) -> Result<()> {
        let target = target.as_ref();
        let state = self.state.lock();
        if matches!(*state, WriteState::Merging | WriteState::Closed) {
            return Err(illegal_state(format!(
                "cannot snapshot store {} while {}",
                self.store_name,
                state.name()
            )));
        }
        fs::create_dir_all(target)
            .with_context(|| format!("failed to create snapshot dir {}", target.display()))?;

        let files = self.files.load_full();
        for reader in files.iter() {
            let name = reader
                .path()
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("data file without a name"))?;
            fs::hard_link(reader.path(), target.join(name)).with_context(|| {
                format!("failed to link {} into snapshot", reader.path().display())
            })?;
        }
        self.metadata.lock().save_to(target, &self.store_name)?;

        tracing::info!(
            store = %self.store_name,
            files = files.len(),
            target = %target.display(),
            "snapshot taken"
        );
        Ok(())
    }

    /// Seals the open write session (if any) using the current valid key
    /// range and persists the metadata. Further writes fail.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, WriteState::Closed) {
            WriteState::Writing(writer) => {
                let (min, max) = self.valid_key_range();
                self.seal_and_publish(writer, min, max)?;
            }
            WriteState::Merging => {
                *state = WriteState::Merging;
                return Err(illegal_state(format!(
                    "cannot close store {} while merging",
                    self.store_name
                )));
            }
            WriteState::Idle | WriteState::Closed => {}
        }
        self.metadata.lock().save_to(&self.dir, &self.store_name)?;
        tracing::debug!(store = %self.store_name, "collection closed");
        Ok(())
    }

    /// Looks up the sealed file `file_id` in the current snapshot.
    pub(crate) fn reader_for(&self, file_id: u32) -> Option<Arc<DataFileReader>> {
        let files = self.files.load();
        files
            .binary_search_by_key(&file_id, |r| r.file_id())
            .ok()
            .map(|i| Arc::clone(&files[i]))
    }

    pub(crate) fn allocate_file_id(&self) -> u32 {
        self.next_file_id.fetch_add(1, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for DataFileCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFileCollection")
            .field("dir", &self.dir)
            .field("store_name", &self.store_name)
            .field("files", &self.file_count())
            .field("next_file_id", &self.next_file_id.load(Ordering::Relaxed))
            .field("state", &self.state.lock().name())
            .finish()
    }
}

/// A session still open on drop was never ended, so its file is deleted
/// rather than sealed. Only [`close`](DataFileCollection::close) seals it.
impl Drop for DataFileCollection {
    fn drop(&mut self) {
        let state = std::mem::replace(self.state.get_mut(), WriteState::Closed);
        if let WriteState::Writing(writer) = state {
            if let Err(e) = self.discard(writer) {
                tracing::warn!(store = %self.store_name, error = %e, "failed to discard open session");
            }
        }
    }
}

pub(crate) fn illegal_state(msg: String) -> anyhow::Error {
    anyhow::Error::new(DataFileError::IllegalState(msg))
}

#[cfg(test)]
mod tests;
