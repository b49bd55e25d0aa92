//! Write sessions with staged index updates.
use anyhow::Result;
use collection::{DataFileError, Location};
use std::collections::BTreeMap;

use crate::{illegal_state, IndexedStore, Phase, PhaseGuard};

/// Index changes of the open session; `None` deletes the key.
#[derive(Default)]
pub(crate) struct Staged {
    updates: BTreeMap<u64, Option<Location>>,
    deletes: usize,
}

impl IndexedStore {
    /// Opens a write session.
    ///
    /// # Errors
    ///
    /// `IllegalState` if a session is already open or a merge is running.
    pub fn start_writing(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        if !matches!(*phase, Phase::Idle) {
            return Err(illegal_state(format!(
                "cannot start writing to store {} while {}",
                self.name,
                phase.name()
            )));
        }
        self.collection.start_writing()?;
        *phase = Phase::Writing(Staged::default());
        Ok(())
    }

    /// Writes `value` for `key`. Visible to readers after
    /// [`end_writing`](IndexedStore::end_writing).
    ///
    /// # Errors
    ///
    /// `IllegalState` outside a session; `InvalidArgument` if `key` is not
    /// below the capacity or the value does not fit the layout.
    pub fn put(&self, key: u64, value: &[u8]) -> Result<()> {
        self.put_with_hash(key, &[], value)
    }

    /// Writes `value` and its caller-computed content `hash` for `key`.
    pub fn put_with_hash(&self, key: u64, hash: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let mut phase = self.phase.lock();
        let Phase::Writing(staged) = &mut *phase else {
            return Err(illegal_state(format!(
                "store {} is not in a write session",
                self.name
            )));
        };
        let location = self.collection.store_data(key, hash, value)?;
        staged.updates.insert(key, Some(location));
        Ok(())
    }

    /// Removes `key` when the session ends.
    pub fn delete(&self, key: u64) -> Result<()> {
        self.check_key(key)?;
        let mut phase = self.phase.lock();
        let Phase::Writing(staged) = &mut *phase else {
            return Err(illegal_state(format!(
                "store {} is not in a write session",
                self.name
            )));
        };
        staged.updates.insert(key, None);
        staged.deletes += 1;
        Ok(())
    }

    /// Seals the session's file, makes `[min_valid_key, max_valid_key]` the
    /// valid key range and applies the staged updates to the index.
    ///
    /// Keys outside the new range are dropped from the index, including
    /// ones written in this session. If the session deleted keys the index
    /// is saved so the deletes survive a restart.
    ///
    /// # Errors
    ///
    /// `IllegalState` if no session is open; `InvalidArgument` for an empty
    /// range or one reaching beyond the capacity.
    pub fn end_writing(&self, min_valid_key: u64, max_valid_key: u64) -> Result<()> {
        if min_valid_key > max_valid_key || max_valid_key >= self.index.capacity() {
            return Err(anyhow::Error::new(DataFileError::InvalidArgument(format!(
                "invalid key range {}..={} for store {} with capacity {}",
                min_valid_key,
                max_valid_key,
                self.name,
                self.index.capacity()
            ))));
        }
        let staged = {
            let mut phase = self.phase.lock();
            match std::mem::replace(&mut *phase, Phase::Committing) {
                Phase::Writing(staged) => staged,
                other => {
                    let name = other.name();
                    *phase = other;
                    return Err(illegal_state(format!(
                        "cannot end writing to store {} while {}",
                        self.name, name
                    )));
                }
            }
        };
        // Merges stay locked out until the index reflects the sealed file.
        let _guard = PhaseGuard(&self.phase);
        let meta = self.collection.end_writing(min_valid_key, max_valid_key)?;
        self.index.update_valid_range(min_valid_key, max_valid_key)?;

        let mut out_of_range = 0usize;
        for (key, update) in staged.updates {
            if key < min_valid_key || key > max_valid_key {
                out_of_range += 1;
                continue;
            }
            match update {
                Some(location) => self.index.put(key, location.raw())?,
                None => {
                    self.index.remove(key);
                }
            }
        }
        if staged.deletes > 0 {
            self.save_index()?;
        }

        tracing::debug!(
            store = %self.name,
            file_id = meta.file_id,
            records = meta.record_count,
            deletes = staged.deletes,
            out_of_range,
            "indexed store session ended"
        );
        Ok(())
    }

    /// Drops the open session. Its records are deleted with its file and
    /// none of its puts or deletes reach the index.
    ///
    /// # Errors
    ///
    /// `IllegalState` if no session is open.
    pub fn abort_writing(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        let Phase::Writing(staged) = &*phase else {
            return Err(illegal_state(format!(
                "store {} is not in a write session",
                self.name
            )));
        };
        let discarded = staged.updates.len();
        *phase = Phase::Idle;
        self.collection.abort_writing()?;
        tracing::debug!(store = %self.name, discarded, "indexed store session aborted");
        Ok(())
    }

    fn check_key(&self, key: u64) -> Result<()> {
        if key >= self.index.capacity() {
            return Err(anyhow::Error::new(DataFileError::InvalidArgument(format!(
                "key {} is beyond the capacity {} of store {}",
                key,
                self.index.capacity(),
                self.name
            ))));
        }
        Ok(())
    }
}
