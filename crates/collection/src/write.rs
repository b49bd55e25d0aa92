//! Write sessions: one session appends to one new data file.
use anyhow::{Context, Result};
use datafile::{DataFileMetadata, DataFileReader, DataFileWriter, Location};
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::{illegal_state, DataFileCollection, WriteState};

impl DataFileCollection {
    /// Opens a new data file for writing.
    ///
    /// # Errors
    ///
    /// `IllegalState` if a session is already open, a merge is running or
    /// the collection is closed.
    pub fn start_writing(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, WriteState::Idle) {
            return Err(illegal_state(format!(
                "cannot start writing to store {} while {}",
                self.store_name,
                state.name()
            )));
        }
        let file_id = self.allocate_file_id();
        let mut writer = DataFileWriter::create(
            &self.dir,
            &self.store_name,
            file_id,
            self.layout,
            false,
        )
        .with_context(|| format!("failed to create data file {} of store {}", file_id, self.store_name))?;
        writer.set_sync(self.config.sync_on_finish);
        self.open_file.store(u64::from(file_id) + 1, Ordering::Release);
        *state = WriteState::Writing(writer);

        tracing::debug!(store = %self.store_name, file_id, "write session started");
        Ok(())
    }

    /// Appends a record to the open file and returns its location. The
    /// record becomes readable once the session ends.
    ///
    /// # Errors
    ///
    /// `IllegalState` if no session is open; `InvalidArgument` if the hash
    /// or value does not fit the layout.
    pub fn store_data(&self, key: u64, hash: &[u8], value: &[u8]) -> Result<Location> {
        let mut state = self.state.lock();
        let WriteState::Writing(writer) = &mut *state else {
            return Err(illegal_state(format!(
                "store {} is not in a write session",
                self.store_name
            )));
        };
        let offset = writer.store_data(key, hash, value)?;
        Ok(Location::new(writer.file_id(), offset))
    }

    /// Seals the open file, records `[first_key, last_key]` as the valid key
    /// range and makes the file visible to readers.
    ///
    /// # Errors
    ///
    /// `IllegalState` if no session is open or `first_key > last_key`.
    pub fn end_writing(&self, first_key: u64, last_key: u64) -> Result<DataFileMetadata> {
        if first_key > last_key {
            return Err(illegal_state(format!(
                "invalid key range {}..={} for store {}",
                first_key, last_key, self.store_name
            )));
        }
        let mut state = self.state.lock();
        let writer = match std::mem::replace(&mut *state, WriteState::Idle) {
            WriteState::Writing(writer) => writer,
            other => {
                let name = other.name();
                *state = other;
                return Err(illegal_state(format!(
                    "cannot end writing to store {} while {}",
                    self.store_name, name
                )));
            }
        };
        self.seal_and_publish(writer, first_key, last_key)
    }

    /// Drops the open session: its file is deleted and none of its records
    /// ever become readable.
    ///
    /// # Errors
    ///
    /// `IllegalState` if no session is open.
    pub fn abort_writing(&self) -> Result<()> {
        let mut state = self.state.lock();
        let writer = match std::mem::replace(&mut *state, WriteState::Idle) {
            WriteState::Writing(writer) => writer,
            other => {
                let name = other.name();
                *state = other;
                return Err(illegal_state(format!(
                    "cannot abort writing to store {} while {}",
                    self.store_name, name
                )));
            }
        };
        self.discard(writer)
    }

    /// Deletes the file of an unfinished session.
    pub(crate) fn discard(&self, writer: DataFileWriter) -> Result<()> {
        let path = writer.path().to_path_buf();
        let file_id = writer.file_id();
        let records = writer.record_count();
        drop(writer);
        self.open_file.store(0, Ordering::Release);
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove unfinished {}", path.display()))?;
        tracing::warn!(store = %self.store_name, file_id, records, "write session discarded");
        Ok(())
    }

    /// Finishes `writer`, persists the key range and publishes the file.
    /// Called with the state lock held.
    pub(crate) fn seal_and_publish(
        &self,
        mut writer: DataFileWriter,
        first_key: u64,
        last_key: u64,
    ) -> Result<DataFileMetadata> {
        let meta = writer.finish_writing()?;
        let reader = Arc::new(
            DataFileReader::open(writer.path())
                .with_context(|| format!("failed to reopen sealed {}", writer.path().display()))?,
        );
        {
            let mut md = self.metadata.lock();
            md.min_valid_key = first_key;
            md.max_valid_key = last_key;
            md.save_to(&self.dir, &self.store_name)?;
        }
        self.publish(vec![reader]);
        self.open_file.store(0, Ordering::Release);

        tracing::debug!(
            store = %self.store_name,
            file_id = meta.file_id,
            records = meta.record_count,
            bytes = meta.file_size(),
            "write session ended"
        );
        Ok(meta)
    }

    /// Adds sealed files to the reader snapshot.
    pub(crate) fn publish(&self, readers: Vec<Arc<DataFileReader>>) {
        self.files.rcu(|current| {
            let mut next = (**current).clone();
            next.extend(readers.iter().cloned());
            next.sort_by_key(|r| r.file_id());
            next
        });
    }
}
