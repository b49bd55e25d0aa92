//! Write sessions: buffered mutations, applied chain by chain at the end.
use anyhow::{bail, Result};
use collection::Location;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use crate::bucket::{encode_page, Entry, NO_NEXT};
use crate::read::{fetch, Fetch};
use crate::{illegal_state, BucketKey, DiskHashMap, Phase, PhaseGuard};

/// Buffered mutations keyed by head bucket id, in call order per bucket.
pub(crate) type Session<K> = BTreeMap<u64, Vec<Pending<K>>>;

pub(crate) struct Pending<K> {
    hash: u32,
    op: Op<K>,
}

enum Op<K> {
    Put { key: K, value: u64 },
    PutIfEqual { key: K, old: u64, new: u64 },
    Delete { key: K },
}

/// A chain after its mutations were applied, before it is written.
struct Rewrite<K> {
    head: u64,
    old_overflow: Vec<u64>,
    entries: Vec<Entry<K>>,
}

/// Where a rewritten chain landed.
struct Written {
    head: (u64, Location),
    overflow: Vec<(u64, Location)>,
    old_overflow: Vec<u64>,
}

impl<K: BucketKey> DiskHashMap<K> {
    /// Opens a write session.
    ///
    /// # Errors
    ///
    /// `IllegalState` if a session is already open or a merge is running.
    pub fn start_writing(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        if !matches!(*phase, Phase::Idle) {
            return Err(illegal_state(format!(
                "cannot start writing to map {} while {}",
                self.name,
                phase.name()
            )));
        }
        self.collection.start_writing()?;
        *phase = Phase::Writing(Session::new());
        Ok(())
    }

    /// Sets `key` to `value`.
    pub fn put(&self, key: K, value: u64) -> Result<()> {
        let hash = key.bucket_hash();
        self.push(hash, Op::Put { key, value })
    }

    /// Sets `key` to `new` if, when the session ends, it holds `old`.
    /// Otherwise the mutation is skipped.
    pub fn put_if_equal(&self, key: K, old: u64, new: u64) -> Result<()> {
        let hash = key.bucket_hash();
        self.push(hash, Op::PutIfEqual { key, old, new })
    }

    /// Removes `key`. Deleting a missing key is a no-op.
    pub fn delete(&self, key: K) -> Result<()> {
        let hash = key.bucket_hash();
        self.push(hash, Op::Delete { key })
    }

    fn push(&self, hash: u32, op: Op<K>) -> Result<()> {
        let mut phase = self.phase.lock();
        let Phase::Writing(pending) = &mut *phase else {
            return Err(illegal_state(format!(
                "map {} is not in a write session",
                self.name
            )));
        };
        pending
            .entry(self.bucket_index(hash))
            .or_default()
            .push(Pending { hash, op });
        Ok(())
    }

    /// Applies the session's mutations and makes them visible to readers.
    ///
    /// Every touched chain is rewritten into one new data file. Once the
    /// file is sealed the directory is switched over, overflow pages first
    /// and each head last, and the replaced overflow ids are released.
    ///
    /// # Errors
    ///
    /// `IllegalState` if no session is open, or if a chain would need more
    /// than `max_overflow_buckets` overflow pages. If any chain cannot be
    /// planned or written, the session's file is deleted and none of its
    /// mutations are applied, now or after a restart.
    pub fn end_writing(&self) -> Result<()> {
        let pending = {
            let mut phase = self.phase.lock();
            match std::mem::replace(&mut *phase, Phase::Committing) {
                Phase::Writing(pending) => pending,
                other => {
                    let name = other.name();
                    *phase = other;
                    return Err(illegal_state(format!(
                        "cannot end writing to map {} while {}",
                        self.name, name
                    )));
                }
            }
        };
        // Merges stay locked out until the directory points at the new pages.
        let _guard = PhaseGuard(&self.phase);
        let last_id = self.directory.capacity() - 1;

        let written = match self.plan(pending).and_then(|rewrites| self.write_chains(&rewrites)) {
            Ok(written) => written,
            Err(e) => {
                if let Err(abort) = self.collection.abort_writing() {
                    tracing::warn!(map = %self.name, error = %abort, "failed to discard aborted session");
                }
                return Err(e);
            }
        };
        let meta = self.collection.end_writing(0, last_id)?;

        let mut freed = Vec::new();
        for chain in &written {
            for (id, location) in &chain.overflow {
                self.directory.put(*id, location.raw())?;
            }
            self.directory.put(chain.head.0, chain.head.1.raw())?;
            for old in &chain.old_overflow {
                self.directory.remove(*old);
            }
            freed.extend_from_slice(&chain.old_overflow);
        }
        self.free_ids.lock().extend(freed);

        tracing::debug!(
            map = %self.name,
            file_id = meta.file_id,
            chains = written.len(),
            pages = meta.record_count,
            "hash map session ended"
        );
        Ok(())
    }

    /// Loads each touched chain and applies its mutations in order.
    fn plan(&self, pending: Session<K>) -> Result<Vec<Rewrite<K>>> {
        let max_overflow = self.collection.config().max_overflow_buckets;
        let mut rewrites = Vec::with_capacity(pending.len());
        let mut skipped = 0usize;
        for (head, mutations) in pending {
            let (old_overflow, mut entries) = self.load_chain(head)?;
            for m in mutations {
                if !apply(&mut entries, m) {
                    skipped += 1;
                }
            }
            let overflow = self.page_count(entries.len()) - 1;
            if overflow > max_overflow {
                return Err(illegal_state(format!(
                    "bucket {} of map {} needs {} overflow buckets, the limit is {}",
                    head, self.name, overflow, max_overflow
                )));
            }
            rewrites.push(Rewrite {
                head,
                old_overflow,
                entries,
            });
        }
        if skipped > 0 {
            tracing::debug!(map = %self.name, skipped, "conditional updates or deletes had no effect");
        }
        Ok(rewrites)
    }

    /// Returns the overflow ids and all entries of the chain at `head`.
    pub(crate) fn load_chain(&self, head: u64) -> Result<(Vec<u64>, Vec<Entry<K>>)> {
        let mut overflow = Vec::new();
        let mut entries = Vec::new();
        let mut id = head;
        loop {
            match fetch::<K>(&self.collection, &self.directory, id)? {
                Fetch::Found(_, bucket) => {
                    if u64::from(bucket.owner) != head {
                        bail!(
                            "bucket {} of map {} belongs to chain {}, reached from chain {}",
                            id,
                            self.name,
                            bucket.owner,
                            head
                        );
                    }
                    entries.extend(bucket.entries);
                    if bucket.next == NO_NEXT {
                        break;
                    }
                    if overflow.len() as u64 >= self.directory.capacity() {
                        bail!("chain {} of map {} loops", head, self.name);
                    }
                    id = bucket.next;
                    overflow.push(id);
                }
                Fetch::Empty if id == head => break,
                Fetch::Empty | Fetch::Gone => {
                    bail!("chain {} of map {} is broken at bucket {}", head, self.name, id)
                }
            }
        }
        Ok((overflow, entries))
    }

    /// Writes every chain; on failure the overflow ids taken so far are
    /// released again.
    fn write_chains(&self, rewrites: &[Rewrite<K>]) -> Result<Vec<Written>> {
        let mut taken = Vec::new();
        let result = self.write_chains_with(rewrites, &mut taken);
        if result.is_err() {
            self.free_ids.lock().extend(taken);
        }
        result
    }

    fn write_chains_with(&self, rewrites: &[Rewrite<K>], taken: &mut Vec<u64>) -> Result<Vec<Written>> {
        let mut written = Vec::with_capacity(rewrites.len());
        for rewrite in rewrites {
            let pages = self.page_count(rewrite.entries.len());
            let mut ids = Vec::with_capacity(pages);
            ids.push(rewrite.head);
            for _ in 1..pages {
                let id = self.allocate_overflow_id()?;
                taken.push(id);
                ids.push(id);
            }
            let mut chunks: Vec<&[Entry<K>]> =
                rewrite.entries.chunks(self.entries_per_bucket).collect();
            if chunks.is_empty() {
                chunks.push(&[]);
            }

            let mut locations = Vec::with_capacity(pages);
            for (i, chunk) in chunks.into_iter().enumerate() {
                let next = ids.get(i + 1).copied().unwrap_or(NO_NEXT);
                let page = encode_page(rewrite.head as u32, next, chunk);
                let location = self.collection.store_data(ids[i], &[], &page)?;
                locations.push((ids[i], location));
            }
            let head = locations.remove(0);
            written.push(Written {
                head,
                overflow: locations,
                old_overflow: rewrite.old_overflow.clone(),
            });
        }
        Ok(written)
    }

    /// Pages needed for `entries` entries; an empty chain keeps its head.
    fn page_count(&self, entries: usize) -> usize {
        entries.div_ceil(self.entries_per_bucket).max(1)
    }

    fn allocate_overflow_id(&self) -> Result<u64> {
        if let Some(id) = self.free_ids.lock().pop() {
            return Ok(id);
        }
        let id = self.next_overflow_id.fetch_add(1, Ordering::AcqRel);
        if id >= self.directory.capacity() {
            self.next_overflow_id.fetch_sub(1, Ordering::AcqRel);
            return Err(illegal_state(format!(
                "map {} has no free overflow bucket ids left",
                self.name
            )));
        }
        Ok(id)
    }
}

/// Applies one mutation; returns `false` if it changed nothing.
fn apply<K: BucketKey>(entries: &mut Vec<Entry<K>>, pending: Pending<K>) -> bool {
    let Pending { hash, op } = pending;
    let slot = |entries: &[Entry<K>], key: &K| {
        entries
            .iter()
            .position(|e| e.hash == hash && e.key == *key)
    };
    match op {
        Op::Put { key, value } => {
            match slot(entries.as_slice(), &key) {
                Some(i) => entries[i].value = value,
                None => entries.push(Entry { hash, value, key }),
            }
            true
        }
        Op::PutIfEqual { key, old, new } => match slot(entries.as_slice(), &key) {
            Some(i) if entries[i].value == old => {
                entries[i].value = new;
                true
            }
            _ => false,
        },
        Op::Delete { key } => match slot(entries.as_slice(), &key) {
            Some(i) => {
                entries.remove(i);
                true
            }
            None => false,
        },
    }
}
