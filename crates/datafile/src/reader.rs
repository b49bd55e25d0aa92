use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

use crate::error::{DataFileError, Result};
use crate::format::{
    DataFileMetadata, DataMode, Location, RecordLayout, ValueSize, FOOTER_BYTES, KEY_BYTES,
};

/// Returns `true` if `path` is a sealed data file with a valid footer.
#[must_use]
pub fn is_complete<P: AsRef<Path>>(path: P) -> bool {
    DataFileReader::open(path).is_ok()
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: u64,
    /// Content hash; empty when the layout has `hash_size == 0`.
    pub hash: Vec<u8>,
    pub value: Vec<u8>,
}

/// Random access reader over a sealed data file.
///
/// Reads use positional I/O on a shared handle, so any number of threads
/// can read through `&self` without locking.
pub struct DataFileReader {
    path: PathBuf,
    file: File,
    meta: DataFileMetadata,
    available_for_merge: AtomicBool,
}

impl DataFileReader {
    /// Opens a sealed file and validates its footer.
    ///
    /// # Errors
    ///
    /// Returns [`DataFileError::Corrupt`] if the file is shorter than a
    /// footer, the magic or CRC does not match, or the recorded data size
    /// disagrees with the file length. This is how a file whose writer
    /// never finished is recognised.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_BYTES {
            return Err(DataFileError::corrupt(
                &path,
                format!("file of {} bytes is too small to hold a footer", file_len),
            ));
        }
        let mut footer = vec![0u8; FOOTER_BYTES as usize];
        read_at(&file, &mut footer, file_len - FOOTER_BYTES)?;
        let meta = DataFileMetadata::read_footer(&path, &footer, file_len)?;

        Ok(Self {
            path,
            file,
            meta,
            available_for_merge: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn metadata(&self) -> &DataFileMetadata {
        &self.meta
    }

    #[must_use]
    pub fn file_id(&self) -> u32 {
        self.meta.file_id
    }

    #[must_use]
    pub fn layout(&self) -> RecordLayout {
        self.meta.layout
    }

    /// Size of the file on disk, footer included.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.meta.file_size()
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.meta.record_count
    }

    /// `false` once a merge has claimed this file.
    #[must_use]
    pub fn is_available_for_merge(&self) -> bool {
        self.available_for_merge.load(Ordering::Acquire)
    }

    pub fn set_available_for_merge(&self, available: bool) {
        self.available_for_merge.store(available, Ordering::Release);
    }

    /// Location of the record at `offset` in this file.
    #[must_use]
    pub fn location(&self, offset: u64) -> Location {
        Location::new(self.meta.file_id, offset)
    }

    /// Reads the part of the record at `offset` selected by `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`DataFileError::InvalidArgument`] if `offset` lies outside
    /// the data section and [`DataFileError::Corrupt`] if the record runs
    /// past it.
    pub fn read_data(&self, offset: u64, mode: DataMode) -> Result<Vec<u8>> {
        let (header, value_len) = self.read_header(offset)?;
        match mode {
            DataMode::Key => Ok(header[..KEY_BYTES as usize].to_vec()),
            DataMode::Value => {
                let mut value = vec![0u8; value_len];
                read_at(&self.file, &mut value, offset + header.len() as u64)?;
                Ok(value)
            }
            DataMode::KeyValue => {
                let mut raw = header;
                let header_len = raw.len();
                raw.resize(header_len + value_len, 0);
                read_at(&self.file, &mut raw[header_len..], offset + header_len as u64)?;
                Ok(raw)
            }
        }
    }

    /// Reads and decodes the full record at `offset`.
    pub fn read_record(&self, offset: u64) -> Result<Record> {
        let raw = self.read_data(offset, DataMode::KeyValue)?;
        Ok(self.decode(&raw))
    }

    /// Reads only the key stored at `offset`.
    pub fn read_key(&self, offset: u64) -> Result<u64> {
        let (header, _) = self.read_header(offset)?;
        Ok(key_of(&header))
    }

    /// Reads only the hash stored at `offset`.
    pub fn read_hash(&self, offset: u64) -> Result<Vec<u8>> {
        let (header, _) = self.read_header(offset)?;
        let end = KEY_BYTES as usize + self.meta.layout.hash_size as usize;
        Ok(header[KEY_BYTES as usize..end].to_vec())
    }

    /// Splits a raw record (as returned by [`DataMode::KeyValue`]) into its
    /// parts.
    #[must_use]
    pub fn decode(&self, raw: &[u8]) -> Record {
        let hash_end = KEY_BYTES as usize + self.meta.layout.hash_size as usize;
        let value_start = self.meta.layout.header_size() as usize;
        Record {
            key: key_of(raw),
            hash: raw[KEY_BYTES as usize..hash_end].to_vec(),
            value: raw[value_start..].to_vec(),
        }
    }

    /// Returns `(key, location)` for every record in write order, without
    /// reading values.
    pub fn scan_keys(&self) -> Result<Vec<(u64, Location)>> {
        let layout = self.meta.layout;
        let mut out = Vec::with_capacity(self.meta.record_count as usize);
        let mut r = BufReader::new(PositionalReader::new(self.file.try_clone()?));
        let mut offset = 0u64;
        while offset < self.meta.data_size {
            let key = r.read_u64::<LittleEndian>()?;
            r.seek_relative(i64::from(layout.hash_size))?;
            let value_len = match layout.value_size {
                ValueSize::Fixed(n) => u64::from(n),
                ValueSize::Variable => u64::from(r.read_u32::<LittleEndian>()?),
            };
            let size = layout.header_size() + value_len;
            if offset + size > self.meta.data_size {
                return Err(DataFileError::corrupt(
                    &self.path,
                    format!("record at offset {} runs past the data section", offset),
                ));
            }
            r.seek_relative(value_len as i64)?;
            out.push((key, self.location(offset)));
            offset += size;
        }
        Ok(out)
    }

    /// Sequential iterator over every record in write order.
    pub fn iter(&self) -> Result<DataFileIterator> {
        Ok(DataFileIterator {
            reader: BufReader::new(PositionalReader::new(self.file.try_clone()?)),
            path: self.path.clone(),
            file_id: self.meta.file_id,
            layout: self.meta.layout,
            data_size: self.meta.data_size,
            offset: 0,
        })
    }

    /// Reads the record header at `offset`, returning it and the value length.
    fn read_header(&self, offset: u64) -> Result<(Vec<u8>, usize)> {
        let layout = self.meta.layout;
        let header_len = layout.header_size();
        if offset + header_len > self.meta.data_size {
            return Err(DataFileError::InvalidArgument(format!(
                "offset {} is outside the data section of {} ({} bytes)",
                offset,
                self.path.display(),
                self.meta.data_size
            )));
        }
        let mut header = vec![0u8; header_len as usize];
        read_at(&self.file, &mut header, offset)?;
        let value_len = match layout.value_size {
            ValueSize::Fixed(n) => n as usize,
            ValueSize::Variable => {
                let mut len = &header[header.len() - 4..];
                len.read_u32::<LittleEndian>()? as usize
            }
        };
        if offset + header_len + value_len as u64 > self.meta.data_size {
            return Err(DataFileError::corrupt(
                &self.path,
                format!("record at offset {} runs past the data section", offset),
            ));
        }
        Ok((header, value_len))
    }
}

impl std::fmt::Debug for DataFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFileReader")
            .field("path", &self.path)
            .field("file_id", &self.meta.file_id)
            .field("records", &self.meta.record_count)
            .field("available_for_merge", &self.is_available_for_merge())
            .finish()
    }
}

/// Iterator over the records of one file, yielding `(location, record)`.
///
/// Holds its own buffered handle; created by [`DataFileReader::iter`].
pub struct DataFileIterator {
    reader: BufReader<PositionalReader>,
    path: PathBuf,
    file_id: u32,
    layout: RecordLayout,
    data_size: u64,
    offset: u64,
}

impl DataFileIterator {
    fn read_next(&mut self) -> Result<(Location, Record)> {
        let key = self.reader.read_u64::<LittleEndian>()?;
        let mut hash = vec![0u8; self.layout.hash_size as usize];
        self.reader.read_exact(&mut hash)?;
        let value_len = match self.layout.value_size {
            ValueSize::Fixed(n) => n as usize,
            ValueSize::Variable => self.reader.read_u32::<LittleEndian>()? as usize,
        };
        let size = self.layout.record_size(value_len);
        if self.offset + size > self.data_size {
            return Err(DataFileError::corrupt(
                &self.path,
                format!("record at offset {} runs past the data section", self.offset),
            ));
        }
        let mut value = vec![0u8; value_len];
        self.reader.read_exact(&mut value)?;

        let loc = Location::new(self.file_id, self.offset);
        self.offset += size;
        Ok((loc, Record { key, hash, value }))
    }
}

impl Iterator for DataFileIterator {
    type Item = Result<(Location, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data_size {
            return None;
        }
        let item = self.read_next();
        if item.is_err() {
            // Stop after the first error.
            self.offset = self.data_size;
        }
        Some(item)
    }
}

/// Sequential reader over a cloned handle that keeps its own cursor.
///
/// Cloned handles share the OS file offset, so every read goes through
/// positional I/O instead of moving it.
struct PositionalReader {
    file: File,
    pos: u64,
}

impl PositionalReader {
    fn new(file: File) -> Self {
        Self { file, pos: 0 }
    }
}

impl Read for PositionalReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        #[cfg(unix)]
        let n = self.file.read_at(buf, self.pos)?;
        #[cfg(windows)]
        let n = self.file.seek_read(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for PositionalReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.file.metadata()?.len().checked_add_signed(d),
        };
        self.pos = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        Ok(self.pos)
    }
}

fn key_of(raw: &[u8]) -> u64 {
    let mut key = [0u8; KEY_BYTES as usize];
    key.copy_from_slice(&raw[..KEY_BYTES as usize]);
    u64::from_le_bytes(key)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
