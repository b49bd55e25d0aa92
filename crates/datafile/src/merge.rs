//! K-way merge over the keys of several data files.
//!
//! Produces every `(key, location)` of every input in ascending key order.
//! Records of one key are yielded newest first: higher file id, then higher
//! offset within a file. Nothing is deduplicated here; the caller decides
//! which copy of a key is live by asking its index.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::format::Location;
use crate::reader::DataFileReader;

/// One record produced by [`MergeIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeEntry {
    pub key: u64,
    pub location: Location,
}

impl MergeEntry {
    #[must_use]
    pub fn source_file_id(&self) -> u32 {
        self.location.file_id()
    }
}

/// A pending record from one source. Only key and location live in the
/// heap; the record body is read later by whoever consumes the entry.
struct HeapEntry {
    key: u64,
    location: Location,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.location == other.location
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: smallest key on top, and for equal keys the largest
        // location (newest file, latest offset).
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.location.cmp(&other.location))
    }
}

/// Merges the key lists of several files into one sorted stream.
pub struct MergeIterator {
    sources: Vec<std::vec::IntoIter<(u64, Location)>>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergeIterator {
    /// Scans the keys of every reader and primes the heap.
    ///
    /// Values are not read; memory use is one `(u64, Location)` pair per
    /// record across all inputs.
    pub fn new<'a, I>(readers: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a DataFileReader>,
    {
        let mut lists = Vec::new();
        for reader in readers {
            lists.push(reader.scan_keys()?);
        }
        Ok(Self::from_key_lists(lists))
    }

    /// Builds a merge over arbitrary `(key, location)` lists. Each list is
    /// sorted here, so callers may pass them in write order.
    #[must_use]
    pub fn from_key_lists(lists: Vec<Vec<(u64, Location)>>) -> Self {
        let mut sources = Vec::with_capacity(lists.len());
        let mut heap = BinaryHeap::with_capacity(lists.len());
        for (i, mut list) in lists.into_iter().enumerate() {
            list.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
            let mut iter = list.into_iter();
            if let Some((key, location)) = iter.next() {
                heap.push(HeapEntry {
                    key,
                    location,
                    source: i,
                });
            }
            sources.push(iter);
        }
        Self { sources, heap }
    }
}

impl Iterator for MergeIterator {
    type Item = MergeEntry;

    fn next(&mut self) -> Option<MergeEntry> {
        let top = self.heap.pop()?;
        if let Some((key, location)) = self.sources[top.source].next() {
            self.heap.push(HeapEntry {
                key,
                location,
                source: top.source,
            });
        }
        Some(MergeEntry {
            key: top.key,
            location: top.location,
        })
    }
}
