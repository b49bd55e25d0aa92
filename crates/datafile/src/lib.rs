//! # Datafile - append-only record files
//!
//! The unit of storage beneath every ledger store. A data file is written
//! once by a single writer, sealed with a footer, and from then on is
//! read-only until a merge deletes it.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA SECTION (records in write order)                          │
//! │                                                               │
//! │ key (u64) | hash (hash_size bytes) | [val_len (u32)] | value  │
//! │                                                               │
//! │ val_len is only present when the layout declares variable     │
//! │ sized values; fixed layouts use a constant record stride.     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 61 bytes)                                  │
//! │                                                               │
//! │ file_id (u32) | created_ms (u64) | record_count (u64)         │
//! │ min_key (u64) | max_key (u64) | data_size (u64)               │
//! │ hash_size (u32) | value_size (u32) | flags (u8)               │
//! │ crc32 (u32) | magic (u32) "DFL1"                              │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The CRC32 covers every footer byte in
//! front of it. A file whose footer is missing or fails the CRC was never
//! sealed: its writer crashed before `finish_writing` returned.
//!
//! ## Locations
//!
//! A record is addressed by a [`Location`]: `((file_id + 1) << 40) | offset`.
//! Raw value `0` therefore never names a record and can be used as an
//! "absent" sentinel by in-memory indexes.

mod error;
mod format;
mod merge;
mod reader;
mod writer;

pub use error::{DataFileError, Result};
pub use format::{
    data_file_name, parse_data_file_name, DataFileMetadata, DataMode, Location, RecordLayout,
    ValueSize, DATA_FILE_EXTENSION, DATA_FILE_MAGIC, FOOTER_BYTES, KEY_BYTES, MAX_FILE_BYTES,
    MAX_FILE_ID, OFFSET_BITS,
};
pub use merge::{MergeEntry, MergeIterator};
pub use reader::{is_complete, DataFileIterator, DataFileReader, Record};
pub use writer::DataFileWriter;

#[cfg(test)]
mod tests;
