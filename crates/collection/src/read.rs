//! Point reads and full scans against the sealed file snapshot.
use anyhow::{Context, Result};
use datafile::{DataFileReader, DataMode, Location, Record};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::{illegal_state, DataFileCollection, DataFileError, LocationIndex};

impl DataFileCollection {
    /// Reads the part of the record at `location` selected by `mode`.
    ///
    /// # Errors
    ///
    /// - `IllegalState` if `location` is in the file of the open write
    ///   session.
    /// - `Io` (`NotFound`) if the file does not exist, for example because a
    ///   merge deleted it.
    pub fn read_data(&self, location: Location, mode: DataMode) -> Result<Vec<u8>> {
        let reader = self.sealed_reader(location)?;
        let data = reader
            .read_data(location.offset(), mode)
            .with_context(|| format!("failed to read {} from store {}", location, self.store_name))?;
        Ok(data)
    }

    /// Reads and decodes the full record at `location`. Same errors as
    /// [`read_data`](DataFileCollection::read_data).
    pub fn read_record(&self, location: Location) -> Result<Record> {
        let reader = self.sealed_reader(location)?;
        let record = reader
            .read_record(location.offset())
            .with_context(|| format!("failed to read {} from store {}", location, self.store_name))?;
        Ok(record)
    }

    /// Looks `key` up in `index` and reads the record it points to.
    ///
    /// If a merge deletes the file between the index lookup and the read,
    /// the index is consulted again, up to `read_retries` times. Returns
    /// `None` if the index has no entry.
    pub fn read_data_using_index(
        &self,
        index: &dyn LocationIndex,
        key: u64,
        mode: DataMode,
    ) -> Result<Option<Vec<u8>>> {
        let retries = self.config.read_retries;
        for attempt in 0..=retries {
            let Some(location) = index.location_of(key) else {
                return Ok(None);
            };
            let Some(reader) = self.reader_for(location.file_id()) else {
                if attempt < retries {
                    tracing::warn!(
                        store = %self.store_name,
                        key,
                        %location,
                        attempt,
                        "data file gone, retrying read through index"
                    );
                    std::thread::yield_now();
                    continue;
                }
                break;
            };
            let data = reader.read_data(location.offset(), mode).with_context(|| {
                format!("failed to read {} from store {}", location, self.store_name)
            })?;
            return Ok(Some(data));
        }
        Err(anyhow::Error::new(DataFileError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "key {} of store {} still points to a missing file after {} retries",
                key, self.store_name, retries
            ),
        ))))
    }

    fn sealed_reader(&self, location: Location) -> Result<Arc<DataFileReader>> {
        let file_id = location.file_id();
        if self.open_file.load(Ordering::Acquire) == u64::from(file_id) + 1 {
            return Err(illegal_state(format!(
                "data file {} of store {} is still being written",
                file_id, self.store_name
            )));
        }
        self.reader_for(file_id).ok_or_else(|| {
            anyhow::Error::new(DataFileError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "data file {} of store {} does not exist (location {})",
                    file_id, self.store_name, location
                ),
            )))
        })
    }

    /// Calls `f(location, record)` for every record of every sealed file,
    /// oldest file first, records in write order.
    pub fn for_each_record<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Location, &Record),
    {
        let files = self.files.load_full();
        for reader in files.iter() {
            for item in reader.iter()? {
                let (location, record) = item
                    .with_context(|| format!("failed to scan {}", reader.path().display()))?;
                f(location, &record);
            }
        }
        Ok(())
    }

    /// Calls `f(key, location)` for every record in files with an id of at
    /// least `first_file_id`, oldest file first. Values are not read.
    pub fn for_each_key_from<F>(&self, first_file_id: u32, mut f: F) -> Result<()>
    where
        F: FnMut(u64, Location),
    {
        let files = self.files.load_full();
        for reader in files.iter().filter(|r| r.file_id() >= first_file_id) {
            let keys = reader
                .scan_keys()
                .with_context(|| format!("failed to scan {}", reader.path().display()))?;
            for (key, location) in keys {
                f(key, location);
            }
        }
        Ok(())
    }

    /// [`for_each_key_from`](DataFileCollection::for_each_key_from) over all
    /// files.
    pub fn for_each_key<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(u64, Location),
    {
        self.for_each_key_from(0, f)
    }
}
