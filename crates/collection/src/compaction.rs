//! Merge: rewrites the live records of older files into new files.
//!
//! Liveness is decided by the caller's index, not by the files: a record is
//! copied only if its key lies in the valid key range and the index still
//! points at exactly that record. Everything else (overwritten versions,
//! deleted keys, keys outside the range) is dropped.
//!
//! Ordering of a merge:
//!
//! 1. claim the selected files (they are no longer available for merging)
//! 2. stream their keys in key order and copy live records into new files,
//!    rolling over at `max_data_file_bytes`
//! 3. seal and publish the new files (readers now see old and new)
//! 4. hand the `(old, new)` moves to the index in bounded batches
//! 5. drop the old files from the snapshot and delete them
use anyhow::{Context, Result};
use config::MergePolicy;
use datafile::{DataFileReader, DataFileWriter, DataMode, Location, MergeIterator};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{illegal_state, DataFileCollection, LocationIndex, Move, WriteState};

/// Outcome of [`DataFileCollection::merge_old_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Files consumed (and deleted) by the merge.
    pub files_merged: usize,
    /// New files written.
    pub files_created: usize,
    /// Live records copied to the new files.
    pub records_copied: u64,
    /// Stale or out-of-range records left behind.
    pub records_dropped: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub duration: Duration,
}

impl MergeReport {
    /// `true` if the merge found too few files and did nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.files_merged == 0
    }
}

/// Puts the collection back to `Idle` when the merge ends, successfully or
/// not, and releases the claim on files that were not deleted.
struct MergeGuard<'a> {
    collection: &'a DataFileCollection,
    claimed: Vec<Arc<DataFileReader>>,
}

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        for reader in &self.claimed {
            reader.set_available_for_merge(true);
        }
        *self.collection.state.lock() = WriteState::Idle;
    }
}

impl DataFileCollection {
    /// Merges the files chosen by the configured [`MergePolicy`].
    ///
    /// `index` decides which records are live and receives the relocations.
    /// Runs synchronously on the caller's thread; concurrent readers keep
    /// working throughout.
    ///
    /// # Errors
    ///
    /// `IllegalState` if a write session is open or another merge is
    /// running. On an I/O error the old files are left in place and the
    /// index keeps pointing at them.
    pub fn merge_old_files(&self, index: &dyn LocationIndex) -> Result<MergeReport> {
        {
            let mut state = self.state.lock();
            if !matches!(*state, WriteState::Idle) {
                return Err(illegal_state(format!(
                    "cannot merge store {} while {}",
                    self.store_name,
                    state.name()
                )));
            }
            *state = WriteState::Merging;
        }
        let mut guard = MergeGuard {
            collection: self,
            claimed: Vec::new(),
        };

        let selected = self.select_files_to_merge();
        if selected.len() < self.config.min_files_to_merge {
            tracing::debug!(
                store = %self.store_name,
                selected = selected.len(),
                min = self.config.min_files_to_merge,
                "not enough files to merge"
            );
            return Ok(MergeReport::default());
        }
        for reader in &selected {
            reader.set_available_for_merge(false);
        }
        guard.claimed = selected.clone();

        let started = Instant::now();
        let bytes_before: u64 = selected.iter().map(|r| r.file_size()).sum();
        tracing::info!(
            store = %self.store_name,
            files = selected.len(),
            bytes = bytes_before,
            "merge started"
        );

        let (min_key, max_key) = self.valid_key_range();
        let mut report = MergeReport {
            files_merged: selected.len(),
            bytes_before,
            ..MergeReport::default()
        };
        let mut outputs: Vec<DataFileWriter> = Vec::new();
        let mut moves: Vec<Move> = Vec::new();

        let merge = MergeIterator::new(selected.iter().map(|r| r.as_ref()))
            .with_context(|| format!("failed to scan files of store {}", self.store_name))?;
        for entry in merge {
            let live = entry.key >= min_key
                && entry.key <= max_key
                && index.location_of(entry.key) == Some(entry.location);
            if !live {
                report.records_dropped += 1;
                continue;
            }
            let source = find_reader(&selected, entry.location)?;
            let raw = source.read_data(entry.location.offset(), DataMode::KeyValue)?;
            let writer = self.output_for(&mut outputs, raw.len() as u64)?;
            let offset = writer.copy_record(&raw)?;
            moves.push(Move {
                key: entry.key,
                old: entry.location,
                new: Location::new(writer.file_id(), offset),
            });
            report.records_copied += 1;
        }

        let mut new_readers = Vec::with_capacity(outputs.len());
        for mut writer in outputs {
            let meta = writer.finish_writing()?;
            report.bytes_after += meta.file_size();
            new_readers.push(Arc::new(DataFileReader::open(writer.path()).with_context(
                || format!("failed to reopen merged file {}", writer.path().display()),
            )?));
        }
        report.files_created = new_readers.len();
        self.publish(new_readers);

        for batch in moves.chunks(self.config.move_batch_size) {
            index
                .relocate(batch)
                .with_context(|| format!("relocation callback failed for store {}", self.store_name))?;
        }

        let merged_ids: HashSet<u32> = selected.iter().map(|r| r.file_id()).collect();
        self.files.rcu(|current| {
            current
                .iter()
                .filter(|r| !merged_ids.contains(&r.file_id()))
                .cloned()
                .collect::<Vec<_>>()
        });
        guard.claimed.clear();
        for reader in &selected {
            if let Err(e) = fs::remove_file(reader.path()) {
                tracing::warn!(
                    store = %self.store_name,
                    path = %reader.path().display(),
                    error = %e,
                    "failed to delete merged data file"
                );
            }
        }

        report.duration = started.elapsed();
        tracing::info!(
            store = %self.store_name,
            files_merged = report.files_merged,
            files_created = report.files_created,
            records_copied = report.records_copied,
            records_dropped = report.records_dropped,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            elapsed_ms = report.duration.as_millis() as u64,
            "merge finished"
        );
        Ok(report)
    }

    /// Files eligible under the merge policy, oldest first.
    fn select_files_to_merge(&self) -> Vec<Arc<DataFileReader>> {
        let files = self.files.load_full();
        let available = files.iter().filter(|r| r.is_available_for_merge()).cloned();
        match self.config.merge_policy {
            MergePolicy::All => available.collect(),
            MergePolicy::OldestFiles(n) => available.take(n).collect(),
            MergePolicy::FilesSmallerThan(limit) => {
                available.filter(|r| r.file_size() < limit).collect()
            }
        }
    }

    /// Returns the output writer for a record of `size` bytes, starting a new
    /// file when the current one would exceed `max_data_file_bytes`.
    fn output_for<'w>(
        &self,
        outputs: &'w mut Vec<DataFileWriter>,
        size: u64,
    ) -> Result<&'w mut DataFileWriter> {
        let roll_over = match outputs.last() {
            None => true,
            Some(w) => {
                w.record_count() > 0 && w.size_estimate() + size > self.config.max_data_file_bytes
            }
        };
        if roll_over {
            let file_id = self.allocate_file_id();
            let mut writer =
                DataFileWriter::create(&self.dir, &self.store_name, file_id, self.layout, true)
                    .with_context(|| {
                        format!("failed to create merge output {} of store {}", file_id, self.store_name)
                    })?;
            writer.set_sync(self.config.sync_on_finish);
            outputs.push(writer);
        }
        outputs
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("merge output missing"))
    }
}

fn find_reader(selected: &[Arc<DataFileReader>], location: Location) -> Result<&DataFileReader> {
    selected
        .binary_search_by_key(&location.file_id(), |r| r.file_id())
        .map(|i| selected[i].as_ref())
        .map_err(|_| anyhow::anyhow!("merge entry {} has no source file", location))
}
