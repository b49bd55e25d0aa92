use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DataFileError, Result};
use crate::format::{
    data_file_name, DataFileMetadata, RecordLayout, ValueSize, KEY_BYTES, MAX_FILE_BYTES,
    MAX_FILE_ID,
};

/// Appends records to a new data file and seals it with a footer.
///
/// The file is created at its final path. Records become readable by
/// [`DataFileReader`](crate::DataFileReader) only after
/// [`finish_writing`](DataFileWriter::finish_writing) has written the
/// footer; a file left without a footer is treated as a crashed write and
/// removed on recovery.
pub struct DataFileWriter {
    path: PathBuf,
    file: BufWriter<File>,
    meta: DataFileMetadata,
    /// Bytes written to the data section so far.
    offset: u64,
    finished: bool,
    sync: bool,
}

impl DataFileWriter {
    /// Creates `<dir>/<store_name>_<file_id>.dfl`.
    ///
    /// # Errors
    ///
    /// Fails with [`DataFileError::Io`] if the file already exists and with
    /// [`DataFileError::InvalidArgument`] if `file_id` cannot be encoded in a
    /// [`Location`](crate::Location).
    pub fn create(
        dir: &Path,
        store_name: &str,
        file_id: u32,
        layout: RecordLayout,
        is_merge: bool,
    ) -> Result<Self> {
        if file_id > MAX_FILE_ID {
            return Err(DataFileError::InvalidArgument(format!(
                "file id {} exceeds maximum {}",
                file_id, MAX_FILE_ID
            )));
        }
        let path = dir.join(data_file_name(store_name, file_id));
        let raw = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        let created_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        tracing::debug!(path = %path.display(), file_id, is_merge, "data file created");

        Ok(Self {
            path,
            file: BufWriter::new(raw),
            meta: DataFileMetadata {
                file_id,
                created_ms,
                record_count: 0,
                min_key: u64::MAX,
                max_key: 0,
                data_size: 0,
                layout,
                is_merge,
            },
            offset: 0,
            finished: false,
            sync: true,
        })
    }

    /// Controls whether [`finish_writing`](DataFileWriter::finish_writing)
    /// fsyncs the file. Defaults to `true`.
    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    /// Appends one record and returns its byte offset in the data section.
    ///
    /// # Errors
    ///
    /// - [`DataFileError::IllegalState`] if the file is already sealed.
    /// - [`DataFileError::InvalidArgument`] if `hash` or `value` do not match
    ///   the layout, or the record would grow the file past
    ///   [`MAX_FILE_BYTES`].
    pub fn store_data(&mut self, key: u64, hash: &[u8], value: &[u8]) -> Result<u64> {
        self.ensure_writable()?;
        let layout = self.meta.layout;
        if hash.len() != layout.hash_size as usize {
            return Err(DataFileError::InvalidArgument(format!(
                "hash has {} bytes, layout expects {}",
                hash.len(),
                layout.hash_size
            )));
        }
        match layout.value_size {
            ValueSize::Fixed(n) if value.len() != n as usize => {
                return Err(DataFileError::InvalidArgument(format!(
                    "value has {} bytes, layout expects {}",
                    value.len(),
                    n
                )));
            }
            ValueSize::Variable if value.len() > u32::MAX as usize - 1 => {
                return Err(DataFileError::InvalidArgument(format!(
                    "value of {} bytes is too large",
                    value.len()
                )));
            }
            _ => {}
        }
        let size = layout.record_size(value.len());
        self.ensure_room(size)?;

        let offset = self.offset;
        self.file.write_u64::<LittleEndian>(key)?;
        self.file.write_all(hash)?;
        if layout.value_size == ValueSize::Variable {
            self.file.write_u32::<LittleEndian>(value.len() as u32)?;
        }
        self.file.write_all(value)?;
        self.record_written(key, size);
        Ok(offset)
    }

    /// Appends a record that is already in on-disk form, as returned by a
    /// [`DataMode::KeyValue`](crate::DataMode::KeyValue) read of a file with
    /// the same layout. Returns the record's new offset.
    ///
    /// # Errors
    ///
    /// Same as [`store_data`](DataFileWriter::store_data); additionally the
    /// record must be at least [`KEY_BYTES`] long.
    pub fn copy_record(&mut self, raw: &[u8]) -> Result<u64> {
        self.ensure_writable()?;
        let layout = self.meta.layout;
        if (raw.len() as u64) < layout.header_size() {
            return Err(DataFileError::InvalidArgument(format!(
                "raw record of {} bytes is shorter than the record header",
                raw.len()
            )));
        }
        if let Some(stride) = layout.fixed_record_size() {
            if raw.len() as u64 != stride {
                return Err(DataFileError::InvalidArgument(format!(
                    "raw record has {} bytes, layout expects {}",
                    raw.len(),
                    stride
                )));
            }
        }
        let size = raw.len() as u64;
        self.ensure_room(size)?;

        let mut key_bytes = [0u8; KEY_BYTES as usize];
        key_bytes.copy_from_slice(&raw[..KEY_BYTES as usize]);
        let key = u64::from_le_bytes(key_bytes);

        let offset = self.offset;
        self.file.write_all(raw)?;
        self.record_written(key, size);
        Ok(offset)
    }

    /// Writes the footer, flushes and (optionally) fsyncs. After this the
    /// file is immutable and readable.
    ///
    /// # Errors
    ///
    /// Returns [`DataFileError::IllegalState`] if called twice.
    pub fn finish_writing(&mut self) -> Result<DataFileMetadata> {
        self.ensure_writable()?;
        self.finished = true;
        self.meta.data_size = self.offset;
        self.meta.write_footer(&mut self.file)?;
        self.file.flush()?;
        if self.sync {
            self.file.get_ref().sync_all()?;
            // Make the directory entry durable too.
            if let Some(parent) = self.path.parent() {
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }
        tracing::debug!(
            path = %self.path.display(),
            records = self.meta.record_count,
            bytes = self.meta.file_size(),
            "data file sealed"
        );
        Ok(self.meta.clone())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn file_id(&self) -> u32 {
        self.meta.file_id
    }

    #[must_use]
    pub fn layout(&self) -> RecordLayout {
        self.meta.layout
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.meta.record_count
    }

    /// Bytes written so far, excluding the footer.
    #[must_use]
    pub fn size_estimate(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.finished {
            return Err(DataFileError::IllegalState(format!(
                "data file {} is already sealed",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn ensure_room(&self, size: u64) -> Result<()> {
        if self.offset + size > MAX_FILE_BYTES {
            return Err(DataFileError::InvalidArgument(format!(
                "record of {} bytes does not fit in {} (at offset {})",
                size,
                self.path.display(),
                self.offset
            )));
        }
        Ok(())
    }

    fn record_written(&mut self, key: u64, size: u64) {
        self.offset += size;
        self.meta.record_count += 1;
        self.meta.min_key = self.meta.min_key.min(key);
        self.meta.max_key = self.meta.max_key.max(key);
    }
}

impl std::fmt::Debug for DataFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFileWriter")
            .field("path", &self.path)
            .field("records", &self.meta.record_count)
            .field("bytes", &self.offset)
            .field("finished", &self.finished)
            .finish()
    }
}
