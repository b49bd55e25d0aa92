use crate::*;
use anyhow::Result;
use config::StoreConfig;
use std::path::Path;

pub const VALUE_BYTES: usize = 52;

pub fn test_config() -> StoreConfig {
    StoreConfig {
        sync_on_finish: false,
        ..StoreConfig::default()
    }
}

/// A 52-byte value that starts with the key and the version, padded with
/// digest-like bytes derived from both.
pub fn value_for(key: u64, version: u64) -> Vec<u8> {
    let mut v = Vec::with_capacity(VALUE_BYTES);
    v.extend_from_slice(&key.to_le_bytes());
    v.extend_from_slice(&version.to_le_bytes());
    let mut x = key.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ version;
    while v.len() < VALUE_BYTES {
        x = x.rotate_left(7).wrapping_add(0x2545_F491);
        v.push(x as u8);
    }
    v
}

pub fn open_fixed(dir: &Path, capacity: u64) -> Result<IndexedStore> {
    IndexedStore::open(
        dir,
        "ledger",
        RecordLayout::fixed(VALUE_BYTES as u32),
        capacity,
        test_config(),
    )
}

pub fn open_variable(dir: &Path, capacity: u64) -> Result<IndexedStore> {
    IndexedStore::open(dir, "blobs", RecordLayout::variable(), capacity, test_config())
}

/// One session writing `value_for(key, version)` for each key.
pub fn write_session(
    store: &IndexedStore,
    keys: impl IntoIterator<Item = u64>,
    version: u64,
    range: (u64, u64),
) -> Result<()> {
    store.start_writing()?;
    for key in keys {
        store.put(key, &value_for(key, version))?;
    }
    store.end_writing(range.0, range.1)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
