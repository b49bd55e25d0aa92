//! The index seam between a collection and the structure that owns keys.
use anyhow::Result;
use datafile::Location;
use longlist::LongList;

/// One record moved by a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub key: u64,
    pub old: Location,
    pub new: Location,
}

/// The caller's key-to-location index, as seen by a merge.
///
/// A merge copies a record only if [`location_of`](LocationIndex::location_of)
/// returns that record's location, then hands the copies to
/// [`relocate`](LocationIndex::relocate) before deleting the old files.
/// `relocate` must only apply a move while the key still maps to
/// `move.old`; a concurrent update of the key wins.
pub trait LocationIndex: Sync {
    fn location_of(&self, key: u64) -> Option<Location>;

    fn relocate(&self, moves: &[Move]) -> Result<()>;
}

impl LocationIndex for LongList {
    fn location_of(&self, key: u64) -> Option<Location> {
        self.get(key).and_then(Location::from_raw)
    }

    fn relocate(&self, moves: &[Move]) -> Result<()> {
        for m in moves {
            self.put_if_equal(m.key, m.old.raw(), m.new.raw())?;
        }
        Ok(())
    }
}
