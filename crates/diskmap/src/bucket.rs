//! On-disk bucket pages.
//!
//! ```text
//! [owner: u32][entry_count: u32][next_bucket_id: u64]
//! [key_hash: u32][value: u64][key: K::SERIALIZED_SIZE bytes] * entry_count
//! [zero padding up to BUCKET_BYTES]
//! ```
//!
//! `owner` is the id of the head bucket of the chain the page belongs to,
//! so a reader that follows a stale `next_bucket_id` into a page that was
//! reused by another chain can tell.

use byteorder::{ByteOrder, LittleEndian};

use crate::BucketKey;

/// Size of every bucket page.
pub const BUCKET_BYTES: usize = 4096;

pub(crate) const BUCKET_HEADER_BYTES: usize = 4 + 4 + 8;

/// `next_bucket_id` of the last page of a chain.
pub(crate) const NO_NEXT: u64 = u64::MAX;

/// Bytes taken by one entry of a bucket holding `K` keys.
pub(crate) fn entry_bytes<K: BucketKey>() -> usize {
    4 + 8 + K::SERIALIZED_SIZE
}

/// Number of entries that fit in one page for `K` keys.
#[must_use]
pub fn entries_per_bucket<K: BucketKey>() -> usize {
    (BUCKET_BYTES - BUCKET_HEADER_BYTES) / entry_bytes::<K>()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry<K> {
    pub hash: u32,
    pub value: u64,
    pub key: K,
}

/// One decoded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Bucket<K> {
    pub owner: u32,
    pub next: u64,
    pub entries: Vec<Entry<K>>,
}

impl<K: BucketKey> Bucket<K> {
    pub fn find(&self, hash: u32, key: &K) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.hash == hash && e.key == *key)
            .map(|e| e.value)
    }

    /// Decodes a page, returning a description of the problem if the page
    /// is malformed.
    pub fn decode(page: &[u8]) -> Result<Self, String> {
        if page.len() != BUCKET_BYTES {
            return Err(format!("bucket page has {} bytes", page.len()));
        }
        let owner = LittleEndian::read_u32(&page[0..4]);
        let count = LittleEndian::read_u32(&page[4..8]) as usize;
        let next = LittleEndian::read_u64(&page[8..16]);
        if count > entries_per_bucket::<K>() {
            return Err(format!(
                "bucket of chain {} claims {} entries, at most {} fit",
                owner,
                count,
                entries_per_bucket::<K>()
            ));
        }
        let mut entries = Vec::with_capacity(count);
        let mut pos = BUCKET_HEADER_BYTES;
        for _ in 0..count {
            entries.push(Entry {
                hash: LittleEndian::read_u32(&page[pos..pos + 4]),
                value: LittleEndian::read_u64(&page[pos + 4..pos + 12]),
                key: K::deserialize(&page[pos + 12..pos + 12 + K::SERIALIZED_SIZE]),
            });
            pos += entry_bytes::<K>();
        }
        Ok(Self {
            owner,
            next,
            entries,
        })
    }
}

/// Serializes one page of the chain owned by head bucket `owner`.
pub(crate) fn encode_page<K: BucketKey>(owner: u32, next: u64, entries: &[Entry<K>]) -> Vec<u8> {
    let mut page = vec![0u8; BUCKET_BYTES];
    LittleEndian::write_u32(&mut page[0..4], owner);
    LittleEndian::write_u32(&mut page[4..8], entries.len() as u32);
    LittleEndian::write_u64(&mut page[8..16], next);
    let mut pos = BUCKET_HEADER_BYTES;
    for entry in entries {
        LittleEndian::write_u32(&mut page[pos..pos + 4], entry.hash);
        LittleEndian::write_u64(&mut page[pos + 4..pos + 12], entry.value);
        entry
            .key
            .serialize(&mut page[pos + 12..pos + 12 + K::SERIALIZED_SIZE]);
        pos += entry_bytes::<K>();
    }
    page
}
