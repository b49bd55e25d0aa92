//! Data file binary format: record layout, locations, footer helpers and
//! file naming.
//!
//! ## Footer (61 bytes)
//!
//! ```text
//! [file_id: u32][created_ms: u64][record_count: u64][min_key: u64][max_key: u64]
//! [data_size: u64][hash_size: u32][value_size: u32][flags: u8][crc32: u32][magic: u32]
//! ```
//!
//! `value_size == u32::MAX` marks a variable value layout. Bit 0 of `flags`
//! is set for files produced by a merge.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;

use crate::error::{DataFileError, Result};

/// Magic number identifying a sealed data file (ASCII "DFL1").
pub const DATA_FILE_MAGIC: u32 = 0x4446_4C31;

/// Size of the footer in bytes.
pub const FOOTER_BYTES: u64 = 4 + 8 + 8 + 8 + 8 + 8 + 4 + 4 + 1 + 4 + 4;

/// Extension of sealed and in-progress data files.
pub const DATA_FILE_EXTENSION: &str = "dfl";

/// Every record starts with its key index.
pub const KEY_BYTES: u64 = 8;

/// Number of low bits of a [`Location`] holding the byte offset.
pub const OFFSET_BITS: u32 = 40;

/// Largest data section a single file may hold (1 TiB).
pub const MAX_FILE_BYTES: u64 = 1 << OFFSET_BITS;

/// Largest file id that can still be encoded in a [`Location`].
pub const MAX_FILE_ID: u32 = (1 << (64 - OFFSET_BITS)) - 2;

const OFFSET_MASK: u64 = MAX_FILE_BYTES - 1;
const VARIABLE_VALUE_SIZE: u32 = u32::MAX;
const VALUE_LEN_BYTES: u64 = 4;
const FLAG_MERGE: u8 = 0b0000_0001;

/// A 64-bit logical address of a record: which file and where in it.
///
/// Locations are only valid while the file they reference exists. After a
/// merge deletes that file, every old location into it is dead.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location(u64);

impl Location {
    /// Encodes `(file_id, offset)`.
    ///
    /// # Panics
    ///
    /// Panics if `file_id > MAX_FILE_ID` or `offset >= MAX_FILE_BYTES`; the
    /// writer refuses to produce either.
    #[must_use]
    pub fn new(file_id: u32, offset: u64) -> Self {
        assert!(file_id <= MAX_FILE_ID, "file id {} out of range", file_id);
        assert!(offset < MAX_FILE_BYTES, "offset {} out of range", offset);
        Location(((u64::from(file_id) + 1) << OFFSET_BITS) | offset)
    }

    /// Reinterprets a raw value produced by [`raw`](Location::raw).
    ///
    /// Returns `None` for `0`, which never names a record.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw >> OFFSET_BITS == 0 {
            None
        } else {
            Some(Location(raw))
        }
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn file_id(self) -> u32 {
        ((self.0 >> OFFSET_BITS) - 1) as u32
    }

    #[must_use]
    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location(file={}, offset={})", self.file_id(), self.offset())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file_id(), self.offset())
    }
}

/// Which part of a record a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    /// The 8-byte little-endian key index.
    Key,
    /// The value bytes only.
    Value,
    /// The whole record exactly as stored on disk (key, hash, length
    /// prefix if any, value). Merge copies records in this form.
    KeyValue,
}

/// Size of the value part of each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSize {
    /// Every value has exactly this many bytes.
    Fixed(u32),
    /// Each record carries a `u32` length prefix.
    Variable,
}

/// Shape of the records of a file. All records in a file share a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    /// Bytes of caller-supplied content hash stored after the key (0 = none).
    pub hash_size: u32,
    pub value_size: ValueSize,
}

impl RecordLayout {
    #[must_use]
    pub fn fixed(value_size: u32) -> Self {
        Self {
            hash_size: 0,
            value_size: ValueSize::Fixed(value_size),
        }
    }

    #[must_use]
    pub fn variable() -> Self {
        Self {
            hash_size: 0,
            value_size: ValueSize::Variable,
        }
    }

    #[must_use]
    pub fn with_hash(mut self, hash_size: u32) -> Self {
        self.hash_size = hash_size;
        self
    }

    /// Bytes in front of the value: key, hash and the optional length prefix.
    #[must_use]
    pub fn header_size(&self) -> u64 {
        let len_prefix = match self.value_size {
            ValueSize::Fixed(_) => 0,
            ValueSize::Variable => VALUE_LEN_BYTES,
        };
        KEY_BYTES + u64::from(self.hash_size) + len_prefix
    }

    /// Full size of a record holding `value_len` value bytes.
    #[must_use]
    pub fn record_size(&self, value_len: usize) -> u64 {
        self.header_size() + value_len as u64
    }

    /// Stride between records for fixed layouts, `None` for variable ones.
    #[must_use]
    pub fn fixed_record_size(&self) -> Option<u64> {
        match self.value_size {
            ValueSize::Fixed(n) => Some(self.header_size() + u64::from(n)),
            ValueSize::Variable => None,
        }
    }

    pub(crate) fn encoded_value_size(&self) -> u32 {
        match self.value_size {
            ValueSize::Fixed(n) => n,
            ValueSize::Variable => VARIABLE_VALUE_SIZE,
        }
    }

    pub(crate) fn from_encoded(hash_size: u32, value_size: u32) -> Self {
        Self {
            hash_size,
            value_size: if value_size == VARIABLE_VALUE_SIZE {
                ValueSize::Variable
            } else {
                ValueSize::Fixed(value_size)
            },
        }
    }
}

/// Everything the footer records about a sealed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileMetadata {
    /// Creation-ordered identifier, unique within a collection.
    pub file_id: u32,
    /// Wall clock creation time in milliseconds since the Unix epoch.
    pub created_ms: u64,
    pub record_count: u64,
    /// Smallest key written (`u64::MAX` for an empty file).
    pub min_key: u64,
    /// Largest key written (`0` for an empty file).
    pub max_key: u64,
    /// Bytes of the data section (the footer starts here).
    pub data_size: u64,
    pub layout: RecordLayout,
    /// `true` if the file was produced by a merge.
    pub is_merge: bool,
}

impl DataFileMetadata {
    /// Total size of the file on disk, footer included.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.data_size + FOOTER_BYTES
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Serializes the footer (body, CRC and magic) to `w`.
    pub(crate) fn write_footer<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut body = Vec::with_capacity(FOOTER_BYTES as usize);
        body.write_u32::<LittleEndian>(self.file_id)?;
        body.write_u64::<LittleEndian>(self.created_ms)?;
        body.write_u64::<LittleEndian>(self.record_count)?;
        body.write_u64::<LittleEndian>(self.min_key)?;
        body.write_u64::<LittleEndian>(self.max_key)?;
        body.write_u64::<LittleEndian>(self.data_size)?;
        body.write_u32::<LittleEndian>(self.layout.hash_size)?;
        body.write_u32::<LittleEndian>(self.layout.encoded_value_size())?;
        body.write_u8(if self.is_merge { FLAG_MERGE } else { 0 })?;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        body.write_u32::<LittleEndian>(hasher.finalize())?;
        body.write_u32::<LittleEndian>(DATA_FILE_MAGIC)?;
        w.write_all(&body)
    }

    /// Parses a footer from the last [`FOOTER_BYTES`] of a file of
    /// `file_len` bytes. `path` is only used for error messages.
    pub(crate) fn read_footer(path: &Path, bytes: &[u8], file_len: u64) -> Result<Self> {
        if bytes.len() as u64 != FOOTER_BYTES {
            return Err(DataFileError::corrupt(path, "short footer"));
        }
        let body_len = bytes.len() - 8;
        let mut tail = &bytes[body_len..];
        let stored_crc = tail.read_u32::<LittleEndian>()?;
        let magic = tail.read_u32::<LittleEndian>()?;
        if magic != DATA_FILE_MAGIC {
            return Err(DataFileError::corrupt(
                path,
                format!("missing footer (magic {:#010x})", magic),
            ));
        }

        let mut hasher = Crc32::new();
        hasher.update(&bytes[..body_len]);
        let actual_crc = hasher.finalize();
        if actual_crc != stored_crc {
            return Err(DataFileError::corrupt(
                path,
                format!(
                    "footer CRC32 mismatch: expected {:#010x}, got {:#010x}",
                    stored_crc, actual_crc
                ),
            ));
        }

        let mut r = &bytes[..body_len];
        let file_id = r.read_u32::<LittleEndian>()?;
        let created_ms = r.read_u64::<LittleEndian>()?;
        let record_count = r.read_u64::<LittleEndian>()?;
        let min_key = r.read_u64::<LittleEndian>()?;
        let max_key = r.read_u64::<LittleEndian>()?;
        let data_size = r.read_u64::<LittleEndian>()?;
        let hash_size = r.read_u32::<LittleEndian>()?;
        let value_size = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u8()?;

        if data_size + FOOTER_BYTES != file_len {
            return Err(DataFileError::corrupt(
                path,
                format!(
                    "data size {} does not match file length {}",
                    data_size, file_len
                ),
            ));
        }

        Ok(Self {
            file_id,
            created_ms,
            record_count,
            min_key,
            max_key,
            data_size,
            layout: RecordLayout::from_encoded(hash_size, value_size),
            is_merge: flags & FLAG_MERGE != 0,
        })
    }
}

/// Returns the file name for `file_id` in the store `store_name`:
/// `<store_name>_<file_id:06>.dfl`.
#[must_use]
pub fn data_file_name(store_name: &str, file_id: u32) -> String {
    format!("{}_{:06}.{}", store_name, file_id, DATA_FILE_EXTENSION)
}

/// Parses a name produced by [`data_file_name`], returning the file id if
/// the name belongs to `store_name`.
#[must_use]
pub fn parse_data_file_name(store_name: &str, file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(store_name)?.strip_prefix('_')?;
    let digits = rest.strip_suffix(DATA_FILE_EXTENSION)?.strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
