//! # LongList - a concurrent index from `u64` to `u64`
//!
//! A dense array of atomic `u64` slots addressed by index, used as the
//! in-memory key-to-location index of the ledger stores. Memory is
//! allocated in chunks on first write, so a list with a large capacity and
//! few used indexes stays small.
//!
//! The value `0` means "no entry" and can never be stored. Every operation
//! takes `&self`; a single index is updated atomically and
//! [`put_if_equal`](LongList::put_if_equal) is a compare-and-swap.
//!
//! ## File format
//!
//! ```text
//! [magic: u32 "LLS1"][capacity: u64][size: u64][min_valid: u64][max_valid: u64]
//! [tag: u64]
//! [value: u64] * size
//! [crc32: u32]   (over everything in front of it)
//! ```
//!
//! The tag is an opaque number saved atomically with the values, e.g. the
//! first data file the saved index does not cover.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use thiserror::Error;

/// Magic number of a persisted list (ASCII "LLS1").
pub const LONG_LIST_MAGIC: u32 = 0x4C4C_5331;

/// Number of slots allocated together.
pub const CHUNK_LEN: u64 = 1 << 16;

/// The value that marks an empty slot.
pub const EMPTY: u64 = 0;

#[derive(Debug, Error)]
pub enum LongListError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("index {index} is outside the valid range {min}..={max}")]
    IndexOutOfRange { index: u64, min: u64, max: u64 },

    #[error("the value 0 cannot be stored")]
    ZeroValue,

    #[error("corrupt long list file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, LongListError>;

/// Chunked, lazily allocated array of atomic `u64` values.
pub struct LongList {
    chunks: Box<[OnceLock<Box<[AtomicU64]>>]>,
    capacity: u64,
    /// One past the highest index ever written.
    size: AtomicU64,
    min_valid: AtomicU64,
    max_valid: AtomicU64,
}

impl LongList {
    /// Creates an empty list that can hold indexes `0..capacity`.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        let capacity = capacity.max(1);
        let chunk_count = capacity.div_ceil(CHUNK_LEN) as usize;
        let chunks = (0..chunk_count).map(|_| OnceLock::new()).collect();
        Self {
            chunks,
            capacity,
            size: AtomicU64::new(0),
            min_valid: AtomicU64::new(0),
            max_valid: AtomicU64::new(capacity - 1),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// One past the highest index that was ever written.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Inclusive range of indexes currently accepted.
    #[must_use]
    pub fn valid_range(&self) -> (u64, u64) {
        (
            self.min_valid.load(Ordering::Acquire),
            self.max_valid.load(Ordering::Acquire),
        )
    }

    /// Returns the value at `index`, or `None` if the slot is empty or out of
    /// range.
    #[must_use]
    pub fn get(&self, index: u64) -> Option<u64> {
        if !self.in_range(index) {
            return None;
        }
        let value = self.slot(index)?.load(Ordering::Acquire);
        (value != EMPTY).then_some(value)
    }

    /// Like [`get`](LongList::get) with a default for missing entries.
    #[must_use]
    pub fn get_or(&self, index: u64, default: u64) -> u64 {
        self.get(index).unwrap_or(default)
    }

    /// Stores `value` at `index`.
    ///
    /// # Errors
    ///
    /// [`LongListError::ZeroValue`] for `value == 0` and
    /// [`LongListError::IndexOutOfRange`] outside the valid range.
    pub fn put(&self, index: u64, value: u64) -> Result<()> {
        if value == EMPTY {
            return Err(LongListError::ZeroValue);
        }
        self.check_range(index)?;
        self.slot_or_alloc(index).store(value, Ordering::Release);
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Stores `new` at `index` only if the slot currently holds `old`
    /// (`0` = empty). Returns whether the swap happened.
    pub fn put_if_equal(&self, index: u64, old: u64, new: u64) -> Result<bool> {
        if new == EMPTY {
            return Err(LongListError::ZeroValue);
        }
        self.check_range(index)?;
        let swapped = self
            .slot_or_alloc(index)
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.size.fetch_max(index + 1, Ordering::AcqRel);
        }
        Ok(swapped)
    }

    /// Clears `index`, returning the previous value.
    pub fn remove(&self, index: u64) -> Option<u64> {
        if index >= self.capacity {
            return None;
        }
        let old = self.slot(index)?.swap(EMPTY, Ordering::AcqRel);
        (old != EMPTY).then_some(old)
    }

    /// Clears `index` only if it currently holds `expected`.
    pub fn remove_if_equal(&self, index: u64, expected: u64) -> bool {
        if index >= self.capacity || expected == EMPTY {
            return false;
        }
        match self.slot(index) {
            Some(slot) => slot
                .compare_exchange(expected, EMPTY, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    /// Narrows (or widens) the accepted index range and clears every entry
    /// outside it.
    ///
    /// # Errors
    ///
    /// [`LongListError::IndexOutOfRange`] if `min > max` or `max` is beyond
    /// the capacity.
    pub fn update_valid_range(&self, min: u64, max: u64) -> Result<()> {
        if min > max || max >= self.capacity {
            return Err(LongListError::IndexOutOfRange {
                index: max,
                min: 0,
                max: self.capacity - 1,
            });
        }
        self.min_valid.store(min, Ordering::Release);
        self.max_valid.store(max, Ordering::Release);

        let size = self.size();
        for index in (0..min.min(size)).chain(max.saturating_add(1)..size) {
            if let Some(slot) = self.slot(index) {
                slot.store(EMPTY, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Calls `f(index, value)` for every non-empty slot in index order.
    pub fn for_each<F: FnMut(u64, u64)>(&self, mut f: F) {
        let size = self.size();
        for (chunk_no, chunk) in self.chunks.iter().enumerate() {
            let base = chunk_no as u64 * CHUNK_LEN;
            if base >= size {
                break;
            }
            let Some(chunk) = chunk.get() else { continue };
            for (i, slot) in chunk.iter().enumerate() {
                let value = slot.load(Ordering::Acquire);
                if value != EMPTY {
                    f(base + i as u64, value);
                }
            }
        }
    }

    /// Number of non-empty slots. Walks the whole list.
    #[must_use]
    pub fn count(&self) -> u64 {
        let mut n = 0;
        self.for_each(|_, _| n += 1);
        n
    }

    /// Writes the list to `path` atomically (temp file, fsync, rename).
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        self.write_to_file_tagged(path, 0)
    }

    /// Like [`write_to_file`](LongList::write_to_file), storing `tag` in
    /// the header.
    pub fn write_to_file_tagged(&self, path: &Path, tag: u64) -> Result<()> {
        let tmp = tmp_path(path);
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut w = CrcWriter::new(BufWriter::new(file));
            let (min, max) = self.valid_range();
            let size = self.size();
            w.write_u32::<LittleEndian>(LONG_LIST_MAGIC)?;
            w.write_u64::<LittleEndian>(self.capacity)?;
            w.write_u64::<LittleEndian>(size)?;
            w.write_u64::<LittleEndian>(min)?;
            w.write_u64::<LittleEndian>(max)?;
            w.write_u64::<LittleEndian>(tag)?;
            for index in 0..size {
                let value = self.slot(index).map_or(EMPTY, |s| s.load(Ordering::Acquire));
                w.write_u64::<LittleEndian>(value)?;
            }
            let crc = w.crc.clone().finalize();
            w.inner.write_u32::<LittleEndian>(crc)?;
            w.inner.flush()?;
            w.inner.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        tracing::debug!(path = %path.display(), size = self.size(), "long list saved");
        Ok(())
    }

    /// Loads a list written by [`write_to_file`](LongList::write_to_file).
    ///
    /// # Errors
    ///
    /// [`LongListError::Corrupt`] on a bad magic, truncated body or CRC
    /// mismatch.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Self::load_tagged(path).map(|(list, _)| list)
    }

    /// Loads a list and the tag it was saved with.
    pub fn load_tagged(path: &Path) -> Result<(Self, u64)> {
        let corrupt = |reason: String| LongListError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut r = CrcReader::new(BufReader::new(file));

        let magic = r.read_u32::<LittleEndian>()?;
        if magic != LONG_LIST_MAGIC {
            return Err(corrupt(format!("bad magic {:#010x}", magic)));
        }
        let capacity = r.read_u64::<LittleEndian>()?;
        let size = r.read_u64::<LittleEndian>()?;
        let min = r.read_u64::<LittleEndian>()?;
        let max = r.read_u64::<LittleEndian>()?;
        let tag = r.read_u64::<LittleEndian>()?;
        let expected_len = 4 + 8 * 5 + size.saturating_mul(8) + 4;
        if size > capacity || len != expected_len {
            return Err(corrupt(format!(
                "size {} does not match file length {}",
                size, len
            )));
        }

        // `size` is bounded by the file length; `capacity` is trusted only
        // once the checksum matches.
        let mut values = Vec::with_capacity(size as usize);
        for _ in 0..size {
            values.push(r.read_u64::<LittleEndian>()?);
        }
        let actual = r.crc.clone().finalize();
        let stored = r.inner.read_u32::<LittleEndian>()?;
        if actual != stored {
            return Err(corrupt(format!(
                "CRC32 mismatch: expected {:#010x}, got {:#010x}",
                stored, actual
            )));
        }

        let list = LongList::new(capacity);
        for (index, value) in (0u64..).zip(values) {
            if value != EMPTY {
                list.slot_or_alloc(index).store(value, Ordering::Relaxed);
            }
        }
        list.size.store(size, Ordering::Release);
        if min <= max && max < capacity {
            list.min_valid.store(min, Ordering::Release);
            list.max_valid.store(max, Ordering::Release);
        }
        Ok((list, tag))
    }

    fn in_range(&self, index: u64) -> bool {
        let (min, max) = self.valid_range();
        index >= min && index <= max
    }

    fn check_range(&self, index: u64) -> Result<()> {
        if self.in_range(index) {
            Ok(())
        } else {
            let (min, max) = self.valid_range();
            Err(LongListError::IndexOutOfRange { index, min, max })
        }
    }

    fn slot(&self, index: u64) -> Option<&AtomicU64> {
        let chunk = self.chunks.get((index / CHUNK_LEN) as usize)?.get()?;
        chunk.get((index % CHUNK_LEN) as usize)
    }

    fn slot_or_alloc(&self, index: u64) -> &AtomicU64 {
        let chunk = self.chunks[(index / CHUNK_LEN) as usize]
            .get_or_init(|| (0..CHUNK_LEN).map(|_| AtomicU64::new(EMPTY)).collect());
        &chunk[(index % CHUNK_LEN) as usize]
    }
}

impl std::fmt::Debug for LongList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongList")
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .field("valid_range", &self.valid_range())
            .finish()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

struct CrcWriter<W: Write> {
    inner: W,
    crc: Crc32,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
        }
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct CrcReader<R: Read> {
    inner: R,
    crc: Crc32,
}

impl<R: Read> CrcReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
        }
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }
}
