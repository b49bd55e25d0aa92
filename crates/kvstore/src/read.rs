//! Lock-free point reads.
use anyhow::Result;
use collection::{DataMode, KEY_BYTES};

use crate::IndexedStore;

impl IndexedStore {
    /// Returns the value of `key`, or `None` if it has none.
    ///
    /// A read racing a merge that deletes the file it was about to read
    /// looks the key up again, up to `read_retries` times.
    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>> {
        if key >= self.index.capacity() {
            return Ok(None);
        }
        self.collection
            .read_data_using_index(&self.index, key, DataMode::Value)
    }

    /// Returns the content hash stored with the current record of `key`.
    /// Empty for layouts without a hash.
    pub fn get_hash(&self, key: u64) -> Result<Option<Vec<u8>>> {
        if key >= self.index.capacity() {
            return Ok(None);
        }
        let hash_size = self.collection.layout().hash_size as usize;
        let raw = self
            .collection
            .read_data_using_index(&self.index, key, DataMode::KeyValue)?;
        Ok(raw.map(|raw| {
            let start = KEY_BYTES as usize;
            raw[start..start + hash_size].to_vec()
        }))
    }

    /// `true` if `key` has a value. Does not touch the disk.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.index.get(key).is_some()
    }
}
