use crate::*;
use anyhow::Result;
use config::StoreConfig;
use std::path::Path;

pub fn test_config() -> StoreConfig {
    StoreConfig {
        sync_on_finish: false,
        read_retries: 50,
        ..StoreConfig::default()
    }
}

pub fn open_map(dir: &Path, expected: u64) -> Result<DiskHashMap<u64>> {
    DiskHashMap::open(expected, dir, "map", test_config())
}

/// A key whose every instance hashes to the same bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Colliding(pub u64);

impl BucketKey for Colliding {
    const SERIALIZED_SIZE: usize = 8;

    fn serialize(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.0.to_le_bytes());
    }

    fn deserialize(bytes: &[u8]) -> Self {
        Colliding(u64::deserialize(bytes))
    }

    fn bucket_hash(&self) -> u32 {
        3
    }
}

pub fn open_colliding(dir: &Path, config: StoreConfig) -> Result<DiskHashMap<Colliding>> {
    DiskHashMap::open(100, dir, "collide", config)
}

/// A key that lands in head bucket `.0` of a map with more than `.0` buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placed(pub u32, pub u64);

impl BucketKey for Placed {
    const SERIALIZED_SIZE: usize = 12;

    fn serialize(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.0.to_le_bytes());
        out[4..].copy_from_slice(&self.1.to_le_bytes());
    }

    fn deserialize(bytes: &[u8]) -> Self {
        let mut bucket = [0u8; 4];
        bucket.copy_from_slice(&bytes[..4]);
        Placed(u32::from_le_bytes(bucket), u64::deserialize(&bytes[4..]))
    }

    fn bucket_hash(&self) -> u32 {
        self.0
    }
}

/// Runs one session putting `key -> value(key)` for every key.
pub fn put_session(
    map: &DiskHashMap<u64>,
    keys: impl IntoIterator<Item = u64>,
    value: impl Fn(u64) -> u64,
) -> Result<()> {
    map.start_writing()?;
    for key in keys {
        map.put(key, value(key))?;
    }
    map.end_writing()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
